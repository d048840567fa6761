//! Repositories, artifacts, tags, labels, scan results and icons.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use harbor_core::identity::Subject;
use harbor_core::model::{LabelId, Project, ScanReportRef, Vulnerability};
use harbor_core::{Digest, Error, ErrorKind, Reference, RepositoryName, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{lookup_project, paged, repository_path, require, require_sysadmin, Operator, Paging};
use crate::access::{DELETE, PULL, PUSH};
use crate::api::AppState;
use crate::artifact::{ArtifactQuery, ArtifactView};
use crate::error::RegistryResult;

/// Path of a repository's artifact listing, with the name encoded twice.
fn artifacts_path(project: &Project, repository: &RepositoryName) -> String {
    format!(
        "/api/v2.0/projects/{}/repositories/{}/artifacts",
        project.name,
        repository.within_project().replace('/', "%252F")
    )
}

/// Resolve the project and repository of a path, checking `action`.
async fn target(
    state: &AppState,
    operator: &Subject,
    project: &str,
    repository: &str,
    action: &str,
) -> Result<(Project, RepositoryName)> {
    let project = lookup_project(state, project).await?;
    require(state, operator, &project, action).await?;
    let repository = repository_path(&project, repository)?;
    Ok((project, repository))
}

pub(super) async fn list_repositories(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    let project = lookup_project(&state, &project).await?;
    require(&state, &operator, &project, PULL).await?;
    let mut repositories = state.store.list_repositories(Some(project.id)).await?;
    repositories.sort_by(|a, b| a.name.cmp(&b.name));
    let total = repositories.len();
    let path = format!("/api/v2.0/projects/{}/repositories", project.name);
    Ok(paged(&path, paging, total, paging.slice(repositories)))
}

/// Delete every artifact of a repository, then the repository itself.
pub(super) async fn delete_repository(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    let (project, name) = target(&state, &operator, &project, &repository, DELETE).await?;
    let repo = state.store.get_repository(name.as_str()).await?;
    for artifact in state.store.list_artifacts(repo.id).await? {
        // Children and accessories go with their parents.
        if state.store.accessory_for(artifact.id).await?.is_some()
            || !state.store.parents_of(artifact.id).await?.is_empty()
        {
            continue;
        }
        let reference = Reference::Digest(artifact.digest);
        match state
            .artifacts
            .delete(&project, &name, &reference, &operator)
            .await
        {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    state.store.delete_repository(repo.id).await?;
    tracing::info!(repository = %name, operator = %operator, "Deleted repository");
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ArtifactFilter {
    q: Option<String>,
}

pub(super) async fn list_artifacts(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository)): Path<(String, String)>,
    Query(filter): Query<ArtifactFilter>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    let (project, name) = target(&state, &operator, &project, &repository, PULL).await?;
    let query: ArtifactQuery = filter.q.as_deref().unwrap_or_default().parse()?;
    let (items, total) = state
        .artifacts
        .list(&name, &query, paging.page(), paging.page_size())
        .await?;
    Ok(paged(&artifacts_path(&project, &name), paging, total, items))
}

pub(super) async fn get_artifact(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference)): Path<(String, String, String)>,
) -> RegistryResult<Json<ArtifactView>> {
    let (_, name) = target(&state, &operator, &project, &repository, PULL).await?;
    let reference: Reference = reference.parse()?;
    let artifact = state.artifacts.resolve(&name, &reference).await?;
    Ok(Json(state.artifacts.view(artifact).await?))
}

pub(super) async fn delete_artifact(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference)): Path<(String, String, String)>,
) -> RegistryResult<StatusCode> {
    let (project, name) = target(&state, &operator, &project, &repository, DELETE).await?;
    let reference: Reference = reference.parse()?;
    state
        .artifacts
        .delete(&project, &name, &reference, &operator)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct TagRequest {
    name: String,
}

pub(super) async fn create_tag(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference)): Path<(String, String, String)>,
    Json(request): Json<TagRequest>,
) -> RegistryResult<Response> {
    let (project, name) = target(&state, &operator, &project, &repository, PUSH).await?;
    let reference: Reference = reference.parse()?;
    state
        .artifacts
        .create_tag(&project, &name, &reference, &request.name, &operator)
        .await?;
    let location = format!(
        "{}/{}/tags/{}",
        artifacts_path(&project, &name),
        reference,
        request.name
    );
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

pub(super) async fn delete_tag(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference, tag)): Path<(String, String, String, String)>,
) -> RegistryResult<StatusCode> {
    let (project, name) = target(&state, &operator, &project, &repository, DELETE).await?;
    let reference: Reference = reference.parse()?;
    let artifact = state.artifacts.resolve(&name, &reference).await?;
    let bound = state
        .store
        .tags_of(artifact.id)
        .await?
        .iter()
        .any(|existing| existing.name == tag);
    if !bound {
        return Err(Error::not_found(format!("tag {tag} is not on {reference}")).into());
    }
    state
        .artifacts
        .delete_tag(&project, &name, &tag, &operator)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct LabelRef {
    id: LabelId,
}

pub(super) async fn add_label(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference)): Path<(String, String, String)>,
    Json(label): Json<LabelRef>,
) -> RegistryResult<StatusCode> {
    let (_, name) = target(&state, &operator, &project, &repository, PUSH).await?;
    let reference: Reference = reference.parse()?;
    let artifact = state.artifacts.resolve(&name, &reference).await?;
    state.artifacts.add_label(&artifact, label.id).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn remove_label(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference, label)): Path<(String, String, String, LabelId)>,
) -> RegistryResult<StatusCode> {
    let (_, name) = target(&state, &operator, &project, &repository, PUSH).await?;
    let reference: Reference = reference.parse()?;
    let artifact = state.artifacts.resolve(&name, &reference).await?;
    state.artifacts.remove_label(&artifact, label).await?;
    Ok(StatusCode::OK)
}

/// A finished scan, reported by a scanner integration.
#[derive(Debug, Deserialize)]
pub(super) struct ScanRequest {
    scanner: String,
    #[serde(default)]
    vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    completed: Option<DateTime<Utc>>,
}

pub(super) async fn record_scan(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path((project, repository, reference)): Path<(String, String, String)>,
    Json(scan): Json<ScanRequest>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    let (project, name) = target(&state, &operator, &project, &repository, PULL).await?;
    let reference: Reference = reference.parse()?;
    let artifact = state.artifacts.resolve(&name, &reference).await?;
    let report = ScanReportRef {
        digest: artifact.digest.clone(),
        scanner: scan.scanner,
        vulnerabilities: scan.vulnerabilities,
        completed: scan.completed.unwrap_or_else(Utc::now),
    };
    state
        .artifacts
        .record_scan(&project, &artifact, report, &operator)
        .await?;
    Ok(StatusCode::CREATED)
}

pub(super) async fn get_icon(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> RegistryResult<Json<Value>> {
    let digest: Digest = digest.parse().map_err(Error::from)?;
    let icon = state.artifacts.icons().get(&digest).await?;
    Ok(Json(json!({
        "content-type": icon.content_type,
        "content": STANDARD.encode(&icon.content),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::{CveAllowlist, ProjectMetadata};

    #[test]
    fn listing_paths_double_encode() {
        let project = Project {
            id: 7,
            name: "library".into(),
            owner: "admin".into(),
            metadata: ProjectMetadata::default(),
            cve_allowlist: CveAllowlist::default(),
            created: Utc::now(),
            deleted: false,
        };
        let name = RepositoryName::new("library/team/web").unwrap();
        assert_eq!(
            artifacts_path(&project, &name),
            "/api/v2.0/projects/library/repositories/team%252Fweb/artifacts"
        );
    }
}
