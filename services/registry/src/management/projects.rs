//! Projects and the policy attached to them.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use harbor_core::model::{
    CveAllowlist, ImmutableRule, Label, LabelScope, NewProject, Project, ProjectMetadata,
    RetentionPolicy, RetentionRule, Role, Severity,
};
use harbor_core::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    lookup_project, paged, require, require_admin, require_sysadmin, Operator, Paging,
};
use crate::access::PULL;
use crate::api::AppState;
use crate::error::RegistryResult;

pub(super) async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "components": [{"name": "core", "status": "healthy"}],
    }))
}

/// A project as the API presents it; metadata values are strings.
#[derive(Debug, Serialize)]
pub(super) struct ProjectView {
    project_id: i64,
    name: String,
    owner_name: String,
    creation_time: DateTime<Utc>,
    metadata: BTreeMap<&'static str, String>,
    cve_allowlist: CveAllowlist,
    repo_count: usize,
}

fn severity_name(severity: Severity) -> &'static str {
    match severity {
        Severity::None => "none",
        Severity::Unknown => "unknown",
        Severity::Negligible => "negligible",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> Result<Severity> {
    let severity = match raw.to_ascii_lowercase().as_str() {
        "none" => Severity::None,
        "unknown" => Severity::Unknown,
        "negligible" => Severity::Negligible,
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => return Err(Error::invalid(format!("unknown severity {raw:?}"))),
    };
    Ok(severity)
}

fn metadata_view(metadata: &ProjectMetadata) -> BTreeMap<&'static str, String> {
    let mut view = BTreeMap::from([
        ("public", metadata.public.to_string()),
        ("auto_scan", metadata.auto_scan.to_string()),
        ("prevent_vul", metadata.prevent_vulnerable.to_string()),
        ("severity", severity_name(metadata.severity).to_owned()),
        ("enable_content_trust_cosign", metadata.require_signature.to_string()),
        ("reuse_sys_cve_allowlist", metadata.reuse_sys_cve_allowlist.to_string()),
    ]);
    if let Some(id) = metadata.retention_id {
        view.insert("retention_id", id.to_string());
    }
    view
}

fn flag(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::String(raw) => raw
            .parse()
            .map_err(|_| Error::invalid(format!("metadata {key} must be true or false"))),
        _ => Err(Error::invalid(format!("metadata {key} must be true or false"))),
    }
}

/// Apply Harbor style string metadata. Unknown keys are ignored.
fn apply_metadata(metadata: &mut ProjectMetadata, fields: &BTreeMap<String, Value>) -> Result<()> {
    for (key, value) in fields {
        match key.as_str() {
            "public" => metadata.public = flag(key, value)?,
            "auto_scan" => metadata.auto_scan = flag(key, value)?,
            "prevent_vul" => metadata.prevent_vulnerable = flag(key, value)?,
            "enable_content_trust_cosign" => metadata.require_signature = flag(key, value)?,
            "reuse_sys_cve_allowlist" => metadata.reuse_sys_cve_allowlist = flag(key, value)?,
            "severity" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| Error::invalid("metadata severity must be a string"))?;
                metadata.severity = parse_severity(raw)?;
            }
            _ => tracing::debug!(key, "Ignoring unknown project metadata"),
        }
    }
    Ok(())
}

fn validate_project_name(name: &str) -> Result<()> {
    let valid = (1..=255).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid project name {name:?}")))
    }
}

async fn view(state: &AppState, project: Project) -> Result<ProjectView> {
    let repo_count = state.store.list_repositories(Some(project.id)).await?.len();
    Ok(ProjectView {
        project_id: project.id,
        metadata: metadata_view(&project.metadata),
        name: project.name,
        owner_name: project.owner,
        creation_time: project.created,
        cve_allowlist: project.cve_allowlist,
        repo_count,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ProjectFilter {
    name: Option<String>,
    public: Option<bool>,
}

pub(super) async fn list_projects(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Query(filter): Query<ProjectFilter>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    let mut visible = Vec::new();
    for project in state.store.list_projects().await? {
        if project.deleted {
            continue;
        }
        if let Some(name) = &filter.name {
            if !project.name.contains(name.as_str()) {
                continue;
            }
        }
        if filter.public.is_some_and(|public| public != project.is_public()) {
            continue;
        }
        if state.access.project_actions(&operator, &project).await?.is_empty() {
            continue;
        }
        visible.push(project);
    }
    visible.sort_by(|a, b| a.name.cmp(&b.name));
    let total = visible.len();
    let mut page = Vec::new();
    for project in paging.slice(visible) {
        page.push(view(&state, project).await?);
    }
    Ok(paged("/api/v2.0/projects", paging, total, page))
}

#[derive(Debug, Deserialize)]
pub(super) struct ProjectRequest {
    #[serde(alias = "name")]
    project_name: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    /// Bytes; negative means unlimited.
    #[serde(default)]
    storage_limit: Option<i64>,
    #[serde(default)]
    cve_allowlist: Option<CveAllowlist>,
}

pub(super) async fn create_project(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(request): Json<ProjectRequest>,
) -> RegistryResult<Response> {
    let Some(principal) = operator.principal() else {
        return Err(Error::unauthorized("authentication required").into());
    };
    let name = request
        .project_name
        .ok_or_else(|| Error::invalid("project_name is required"))?;
    validate_project_name(&name)?;

    let mut metadata = ProjectMetadata::default();
    apply_metadata(&mut metadata, &request.metadata)?;
    let storage_limit = request
        .storage_limit
        .and_then(|limit| u64::try_from(limit).ok());
    let project = state
        .store
        .create_project(NewProject {
            name,
            owner: principal.username.clone(),
            metadata,
            storage_limit,
        })
        .await?;
    state
        .store
        .set_member(project.id, &principal.username, Role::ProjectAdmin)
        .await?;
    if let Some(allowlist) = request.cve_allowlist {
        state.store.set_project_allowlist(project.id, allowlist).await?;
    }
    tracing::info!(project = %project.name, owner = %principal.username, "Created project");

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/api/v2.0/projects/{}", project.id))],
    )
        .into_response())
}

pub(super) async fn get_project(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> RegistryResult<Json<ProjectView>> {
    let project = lookup_project(&state, &key).await?;
    require(&state, &operator, &project, PULL).await?;
    Ok(Json(view(&state, project).await?))
}

pub(super) async fn update_project(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<ProjectRequest>,
) -> RegistryResult<StatusCode> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let mut metadata = project.metadata.clone();
    apply_metadata(&mut metadata, &request.metadata)?;
    state.store.update_project_metadata(project.id, metadata).await?;
    if let Some(allowlist) = request.cve_allowlist {
        state.store.set_project_allowlist(project.id, allowlist).await?;
    }
    state.gates.cache().invalidate(project.id);
    Ok(StatusCode::OK)
}

pub(super) async fn delete_project(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> RegistryResult<StatusCode> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    state.store.delete_project(project.id).await?;
    state.gates.cache().invalidate(project.id);
    tracing::info!(project = %project.name, operator = %operator, "Deleted project");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct MemberUser {
    username: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct MemberRequest {
    role_id: u8,
    member_user: MemberUser,
}

fn role_of(id: u8) -> Result<Role> {
    match id {
        1 => Ok(Role::ProjectAdmin),
        2 => Ok(Role::Developer),
        3 => Ok(Role::Guest),
        4 => Ok(Role::Maintainer),
        5 => Ok(Role::LimitedGuest),
        _ => Err(Error::invalid(format!("unknown role id {id}"))),
    }
}

pub(super) async fn add_member(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<MemberRequest>,
) -> RegistryResult<StatusCode> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let role = role_of(request.role_id)?;
    state
        .identity
        .lookup(&request.member_user.username)
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::Unauthorized => Error::not_found(format!(
                "user {} not found",
                request.member_user.username
            )),
            _ => err,
        })?;
    state
        .store
        .set_member(project.id, &request.member_user.username, role)
        .await?;
    Ok(StatusCode::CREATED)
}

pub(super) async fn list_immutable_rules(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> RegistryResult<Json<Vec<ImmutableRule>>> {
    let project = lookup_project(&state, &key).await?;
    require(&state, &operator, &project, PULL).await?;
    Ok(Json(state.store.list_immutable_rules(project.id).await?))
}

pub(super) async fn create_immutable_rule(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(rule): Json<ImmutableRule>,
) -> RegistryResult<Response> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let rule = state
        .store
        .create_immutable_rule(ImmutableRule {
            id: 0,
            project_id: project.id,
            ..rule
        })
        .await?;
    state.gates.cache().invalidate(project.id);
    let location = format!(
        "/api/v2.0/projects/{}/immutabletagrules/{}",
        project.id, rule.id
    );
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(rule)).into_response())
}

pub(super) async fn delete_immutable_rule(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((key, id)): Path<(String, i64)>,
) -> RegistryResult<StatusCode> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let owned = state
        .store
        .list_immutable_rules(project.id)
        .await?
        .iter()
        .any(|rule| rule.id == id);
    if !owned {
        return Err(Error::not_found(format!("immutable rule {id} not found")).into());
    }
    state.store.delete_immutable_rule(id).await?;
    state.gates.cache().invalidate(project.id);
    Ok(StatusCode::OK)
}

pub(super) async fn get_retention(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> RegistryResult<Json<RetentionPolicy>> {
    let project = lookup_project(&state, &key).await?;
    require(&state, &operator, &project, PULL).await?;
    let id = project.metadata.retention_id.ok_or_else(|| {
        Error::not_found(format!("project {} has no retention policy", project.name))
    })?;
    Ok(Json(state.store.get_retention_policy(id).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct RetentionRequest {
    rules: Vec<RetentionRule>,
}

pub(super) async fn put_retention(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<RetentionRequest>,
) -> RegistryResult<Json<RetentionPolicy>> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let policy = state
        .store
        .put_retention_policy(RetentionPolicy {
            id: project.metadata.retention_id.unwrap_or(0),
            project_id: project.id,
            rules: request.rules,
        })
        .await?;
    if project.metadata.retention_id != Some(policy.id) {
        let metadata = ProjectMetadata {
            retention_id: Some(policy.id),
            ..project.metadata.clone()
        };
        state.store.update_project_metadata(project.id, metadata).await?;
    }
    Ok(Json(policy))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct RetentionRun {
    dry_run: bool,
}

pub(super) async fn run_retention(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(run): Query<RetentionRun>,
) -> RegistryResult<Response> {
    let project = lookup_project(&state, &key).await?;
    require_admin(&state, &operator, &project).await?;
    let report = state.retention.sweep(&project, run.dry_run).await?;
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

pub(super) async fn get_quota(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> RegistryResult<Json<harbor_core::model::Quota>> {
    let project = lookup_project(&state, &key).await?;
    require(&state, &operator, &project, PULL).await?;
    Ok(Json(state.store.get_quota(project.id).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct QuotaRequest {
    /// Bytes; negative means unlimited.
    hard: i64,
}

pub(super) async fn set_quota(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<QuotaRequest>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    let project = lookup_project(&state, &key).await?;
    let hard = u64::try_from(request.hard).ok();
    state.store.set_quota_limit(project.id, hard).await?;
    tracing::info!(project = %project.name, ?hard, "Quota limit changed");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct LabelRequest {
    name: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    description: String,
    /// `g` for global, `p` for project.
    scope: String,
    #[serde(default)]
    project_id: Option<i64>,
}

pub(super) async fn create_label(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(request): Json<LabelRequest>,
) -> RegistryResult<Response> {
    let (scope, project_id) = match (request.scope.as_str(), request.project_id) {
        ("g", _) => {
            require_sysadmin(&operator)?;
            (LabelScope::Global, None)
        }
        ("p", Some(id)) => {
            let project = state.store.get_project(id).await?;
            require_admin(&state, &operator, &project).await?;
            (LabelScope::Project, Some(id))
        }
        ("p", None) => return Err(Error::invalid("project labels need a project_id").into()),
        (other, _) => return Err(Error::invalid(format!("unknown label scope {other:?}")).into()),
    };
    let label = state
        .store
        .create_label(Label {
            id: 0,
            name: request.name,
            color: request.color,
            description: request.description,
            scope,
            project_id,
        })
        .await?;
    let location = format!("/api/v2.0/labels/{}", label.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(label)).into_response())
}

pub(super) async fn get_system_allowlist(
    Operator(operator): Operator,
    State(state): State<AppState>,
) -> RegistryResult<Json<CveAllowlist>> {
    if operator.principal().is_none() {
        return Err(Error::unauthorized("authentication required").into());
    }
    Ok(Json(state.store.system_allowlist().await?))
}

pub(super) async fn set_system_allowlist(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(allowlist): Json<CveAllowlist>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    state.store.set_system_allowlist(allowlist).await?;
    state.gates.cache().invalidate_system();
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_metadata() {
        let mut metadata = ProjectMetadata::default();
        let fields: BTreeMap<String, Value> = serde_json::from_value(json!({
            "public": "true",
            "prevent_vul": true,
            "severity": "High",
            "enable_content_trust_cosign": "false",
            "something_new": "x",
        }))
        .unwrap();
        apply_metadata(&mut metadata, &fields).unwrap();
        assert!(metadata.public);
        assert!(metadata.prevent_vulnerable);
        assert_eq!(metadata.severity, Severity::High);
        assert!(!metadata.require_signature);

        let view = metadata_view(&metadata);
        assert_eq!(view["public"], "true");
        assert_eq!(view["severity"], "high");
        assert!(!view.contains_key("retention_id"));
    }

    #[test]
    fn bad_metadata_is_refused() {
        let mut metadata = ProjectMetadata::default();
        let fields: BTreeMap<String, Value> =
            serde_json::from_value(json!({"public": "yes"})).unwrap();
        assert!(apply_metadata(&mut metadata, &fields).is_err());
        let fields: BTreeMap<String, Value> =
            serde_json::from_value(json!({"severity": "apocalyptic"})).unwrap();
        assert!(apply_metadata(&mut metadata, &fields).is_err());
    }

    #[test]
    fn project_names() {
        for name in ["library", "team-a", "a.b_c", "0day"] {
            assert!(validate_project_name(name).is_ok(), "{name}");
        }
        for name in ["", "Library", "-lead", "a/b", "spa ce"] {
            assert!(validate_project_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn member_roles() {
        assert_eq!(role_of(1).unwrap(), Role::ProjectAdmin);
        assert_eq!(role_of(4).unwrap(), Role::Maintainer);
        assert!(role_of(9).is_err());
    }
}
