use chrono::{DateTime, Utc};
use harbor_core::model::{CveAllowlist, Project, ScanReportRef, Severity};
use harbor_core::{Error, Result};

/// Refuse a pull when the artifact's latest scan found vulnerabilities at or
/// above the project threshold. CVEs on the project allow-list, or on the
/// system allow-list when the project reuses it, are ignored. Unscanned
/// artifacts pass.
pub fn evaluate(
    project: &Project,
    report: Option<&ScanReportRef>,
    system: &CveAllowlist,
    now: DateTime<Utc>,
) -> Result<()> {
    if !project.metadata.prevent_vulnerable {
        return Ok(());
    }
    let Some(report) = report else {
        return Ok(());
    };
    let reuse_system = project.metadata.reuse_sys_cve_allowlist;
    let worst = report.worst_severity(|cve| {
        project.cve_allowlist.allows(cve, now) || (reuse_system && system.allows(cve, now))
    });
    let threshold = project.metadata.severity;
    if worst == Severity::None || worst < threshold {
        return Ok(());
    }
    Err(Error::forbidden(format!(
        "artifact has {worst:?} vulnerabilities; project {} refuses pulls at {threshold:?} or above",
        project.name
    ))
    .with_code("DENIED"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::{ProjectMetadata, Vulnerability};
    use harbor_core::Digest;

    fn project(threshold: Severity, allowlist: &[&str]) -> Project {
        Project {
            id: 1,
            name: "lib".into(),
            owner: "admin".into(),
            metadata: ProjectMetadata {
                prevent_vulnerable: true,
                severity: threshold,
                ..ProjectMetadata::default()
            },
            cve_allowlist: CveAllowlist {
                items: allowlist.iter().map(|s| (*s).to_owned()).collect(),
                expires_at: None,
            },
            created: Utc::now(),
            deleted: false,
        }
    }

    fn report(findings: &[(&str, Severity)]) -> ScanReportRef {
        ScanReportRef {
            digest: Digest::sha256(b"image"),
            scanner: "trivy".into(),
            vulnerabilities: findings
                .iter()
                .map(|(id, severity)| Vulnerability {
                    id: (*id).into(),
                    severity: *severity,
                })
                .collect(),
            completed: Utc::now(),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let scan = report(&[("CVE-1", Severity::High)]);
        let none = CveAllowlist::default();
        assert!(evaluate(&project(Severity::High, &[]), Some(&scan), &none, Utc::now()).is_err());
        assert!(evaluate(&project(Severity::Critical, &[]), Some(&scan), &none, Utc::now()).is_ok());
    }

    #[test]
    fn allowlists_and_unscanned() {
        let scan = report(&[("CVE-1", Severity::Critical), ("CVE-2", Severity::Low)]);
        let none = CveAllowlist::default();
        assert!(evaluate(&project(Severity::High, &["CVE-1"]), Some(&scan), &none, Utc::now()).is_ok());

        let system = CveAllowlist {
            items: vec!["CVE-1".into()],
            expires_at: None,
        };
        assert!(evaluate(&project(Severity::High, &[]), Some(&scan), &system, Utc::now()).is_ok());
        assert!(evaluate(&project(Severity::High, &[]), None, &none, Utc::now()).is_ok());
    }
}
