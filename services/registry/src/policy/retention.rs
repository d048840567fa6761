//! Tag retention.
//!
//! A project's retention policy is a list of rules; an artifact survives a
//! sweep when any enabled rule retains it. Accessories, index children and
//! artifacts with an immutable tag are never candidates.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use harbor_core::identity::Subject;
use harbor_core::model::{
    Artifact, ArtifactId, Project, RetentionAction, RetentionRule, RetentionSelector,
};
use harbor_core::store::Store;
use harbor_core::{Digest, ErrorKind, Reference, RepositoryName, Result};
use harbor_replication::{parse_cron, spawn_cron};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PolicyGates;
use crate::artifact::ArtifactController;

/// An artifact considered by a sweep.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Repository path without the project.
    pub repository: String,
    /// The artifact.
    pub artifact: Artifact,
    /// Its tags.
    pub tags: Vec<String>,
}

fn selects(rule: &RetentionRule, candidate: &Candidate) -> bool {
    let mut untagged_selector = false;
    let mut tag_selectors = Vec::new();
    for selector in &rule.selectors {
        match selector {
            RetentionSelector::RepoMatch(pattern) => {
                if !pattern.matches(&candidate.repository) {
                    return false;
                }
            }
            RetentionSelector::Untagged => untagged_selector = true,
            other => tag_selectors.push(other),
        }
    }
    if candidate.tags.is_empty() {
        return untagged_selector;
    }
    tag_selectors.is_empty()
        || candidate.tags.iter().any(|tag| {
            tag_selectors.iter().all(|selector| match selector {
                RetentionSelector::TagMatch(pattern) => pattern.matches(tag),
                RetentionSelector::TagExclude(pattern) => !pattern.matches(tag),
                _ => true,
            })
        })
}

/// Artifacts that at least one enabled rule retains.
pub fn retained(rules: &[RetentionRule], candidates: &[Candidate], now: DateTime<Utc>) -> HashSet<ArtifactId> {
    let mut keep = HashSet::new();
    for rule in rules.iter().filter(|rule| !rule.disabled) {
        let mut selected: Vec<&Candidate> = candidates.iter().filter(|c| selects(rule, c)).collect();
        match rule.action {
            RetentionAction::LatestPushed { count } => {
                selected.sort_by(|a, b| b.artifact.push_time.cmp(&a.artifact.push_time));
                keep.extend(selected.iter().take(count).map(|c| c.artifact.id));
            }
            RetentionAction::PushedWithinDays { days } => {
                let since = now - Duration::days(i64::from(days));
                keep.extend(
                    selected
                        .iter()
                        .filter(|c| c.artifact.push_time >= since)
                        .map(|c| c.artifact.id),
                );
            }
            RetentionAction::PulledWithinDays { days } => {
                let since = now - Duration::days(i64::from(days));
                keep.extend(
                    selected
                        .iter()
                        .filter(|c| c.artifact.pull_time.is_some_and(|t| t >= since))
                        .map(|c| c.artifact.id),
                );
            }
        }
    }
    keep
}

/// One artifact a sweep removed, or would remove.
#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    /// Full repository path.
    pub repository: String,
    /// Manifest digest.
    pub digest: Digest,
    /// Tags it carried.
    pub tags: Vec<String>,
}

/// Result of sweeping one project.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Project name.
    pub project: String,
    /// Nothing was deleted.
    pub dry_run: bool,
    /// Artifacts considered.
    pub candidates: usize,
    /// Artifacts removed.
    pub removed: Vec<Removal>,
}

/// Applies retention policies.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    controller: ArtifactController,
    gates: PolicyGates,
    delete_untagged: bool,
}

impl RetentionSweeper {
    /// A sweeper deleting through `controller`.
    pub fn new(
        store: Arc<dyn Store>,
        controller: ArtifactController,
        gates: PolicyGates,
        delete_untagged: bool,
    ) -> Self {
        RetentionSweeper {
            store,
            controller,
            gates,
            delete_untagged,
        }
    }

    async fn candidates(&self, project: &Project) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for repo in self.store.list_repositories(Some(project.id)).await? {
            let name = RepositoryName::new(repo.name.clone())?;
            'artifacts: for artifact in self.store.list_artifacts(repo.id).await? {
                if self.store.accessory_for(artifact.id).await?.is_some()
                    || !self.store.parents_of(artifact.id).await?.is_empty()
                {
                    continue;
                }
                let tags: Vec<String> = self
                    .store
                    .tags_of(artifact.id)
                    .await?
                    .into_iter()
                    .map(|tag| tag.name)
                    .collect();
                for tag in &tags {
                    if self.gates.is_protected(project, &name, tag).await? {
                        continue 'artifacts;
                    }
                }
                candidates.push(Candidate {
                    repository: name.within_project().to_owned(),
                    artifact,
                    tags,
                });
            }
        }
        Ok(candidates)
    }

    /// Sweep `project` by its retention policy. A dry run only reports.
    #[tracing::instrument(skip(self, project), fields(project = %project.name))]
    pub async fn sweep(&self, project: &Project, dry_run: bool) -> Result<SweepReport> {
        let mut report = SweepReport {
            project: project.name.clone(),
            dry_run,
            candidates: 0,
            removed: Vec::new(),
        };
        let Some(policy_id) = project.metadata.retention_id else {
            return Ok(report);
        };
        let policy = self.store.get_retention_policy(policy_id).await?;
        if policy.rules.iter().all(|rule| rule.disabled) {
            return Ok(report);
        }

        let candidates = self.candidates(project).await?;
        report.candidates = candidates.len();
        let keep = retained(&policy.rules, &candidates, Utc::now());

        for candidate in candidates {
            if keep.contains(&candidate.artifact.id) {
                continue;
            }
            if candidate.tags.is_empty() && !self.delete_untagged {
                continue;
            }
            if !dry_run {
                let repository = RepositoryName::new(candidate.artifact.repository_name.clone())?;
                let reference = Reference::Digest(candidate.artifact.digest.clone());
                match self
                    .controller
                    .delete(project, &repository, &reference, &Subject::Anonymous)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Immutable | ErrorKind::Conflict) => {
                        tracing::debug!(digest = %candidate.artifact.digest, error = %err, "Skipped retention candidate");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            report.removed.push(Removal {
                repository: candidate.artifact.repository_name,
                digest: candidate.artifact.digest,
                tags: candidate.tags,
            });
        }
        tracing::info!(removed = report.removed.len(), dry_run, "Retention sweep finished");
        Ok(report)
    }

    /// Sweep every project with a retention policy.
    pub async fn sweep_all(&self) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::new();
        for project in self.store.list_projects().await? {
            if project.metadata.retention_id.is_none() {
                continue;
            }
            match self.sweep(&project, false).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    tracing::warn!(project = %project.name, error = %err, "Retention sweep failed")
                }
            }
        }
        Ok(reports)
    }

    /// Sweep every project on `cron` until `cancel` fires.
    pub fn spawn(self, cron: &str, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let schedule = parse_cron(cron)?;
        Ok(spawn_cron(schedule, cancel, move || {
            let sweeper = self.clone();
            async move {
                if let Err(err) = sweeper.sweep_all().await {
                    tracing::warn!(error = %err, "Retention sweep failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::ArtifactType;
    use harbor_core::pattern::Pattern;

    fn candidate(id: ArtifactId, tags: &[&str], pushed_days_ago: i64) -> Candidate {
        Candidate {
            repository: "web".into(),
            artifact: Artifact {
                id,
                project_id: 1,
                repository_id: 1,
                repository_name: "lib/web".into(),
                digest: Digest::sha256(&id.to_be_bytes()),
                manifest_media_type: harbor_core::media::OCI_MANIFEST.into(),
                media_type: harbor_core::media::OCI_CONFIG.into(),
                artifact_type: ArtifactType::Image,
                size: 1,
                icon: None,
                annotations: Default::default(),
                extra_attrs: serde_json::Value::Null,
                push_time: Utc::now() - Duration::days(pushed_days_ago),
                pull_time: None,
                pull_count: 0,
            },
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    fn rule(selectors: Vec<RetentionSelector>, action: RetentionAction) -> RetentionRule {
        RetentionRule {
            disabled: false,
            selectors,
            action,
        }
    }

    #[test]
    fn latest_pushed_keeps_newest() {
        let candidates = vec![
            candidate(1, &["v1"], 3),
            candidate(2, &["v2"], 2),
            candidate(3, &["v3"], 1),
        ];
        let rules = vec![rule(Vec::new(), RetentionAction::LatestPushed { count: 2 })];
        let keep = retained(&rules, &candidates, Utc::now());
        assert_eq!(keep, HashSet::from([2, 3]));
    }

    #[test]
    fn untagged_needs_its_selector() {
        let candidates = vec![candidate(1, &[], 0), candidate(2, &["v1"], 0)];
        let tagged_only = vec![rule(Vec::new(), RetentionAction::PushedWithinDays { days: 7 })];
        assert_eq!(retained(&tagged_only, &candidates, Utc::now()), HashSet::from([2]));

        let with_untagged = vec![rule(
            vec![RetentionSelector::Untagged],
            RetentionAction::PushedWithinDays { days: 7 },
        )];
        assert_eq!(retained(&with_untagged, &candidates, Utc::now()), HashSet::from([1, 2]));
    }

    #[test]
    fn tag_and_repository_selectors() {
        let candidates = vec![candidate(1, &["release-1"], 30), candidate(2, &["dev-1"], 30)];
        let rules = vec![rule(
            vec![
                RetentionSelector::RepoMatch(Pattern::new("web").unwrap()),
                RetentionSelector::TagMatch(Pattern::new("release-*").unwrap()),
            ],
            RetentionAction::LatestPushed { count: 10 },
        )];
        assert_eq!(retained(&rules, &candidates, Utc::now()), HashSet::from([1]));

        let excluding = vec![rule(
            vec![RetentionSelector::TagExclude(Pattern::new("release-*").unwrap())],
            RetentionAction::LatestPushed { count: 10 },
        )];
        assert_eq!(retained(&excluding, &candidates, Utc::now()), HashSet::from([2]));
    }

    #[test]
    fn disabled_rules_keep_nothing() {
        let candidates = vec![candidate(1, &["v1"], 0)];
        let mut disabled = rule(Vec::new(), RetentionAction::LatestPushed { count: 5 });
        disabled.disabled = true;
        assert!(retained(&[disabled], &candidates, Utc::now()).is_empty());
    }
}
