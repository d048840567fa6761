//! The `/api/v2.0` management routes.
//!
//! Projects, artifacts, policies, replication and hook state. Callers
//! authenticate with HTTP Basic or a bearer token from the token service;
//! anonymous callers only see public projects.

mod artifacts;
mod projects;
mod replication;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use harbor_core::identity::{Credentials, Principal, Subject};
use harbor_core::model::{Project, Role};
use harbor_core::{Error, ErrorKind, RepositoryName, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::error::RegistryError;

const X_TOTAL_COUNT: HeaderName = HeaderName::from_static("x-total-count");
const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(projects::health))
        // Projects
        .route("/projects", get(projects::list_projects).post(projects::create_project))
        .route(
            "/projects/{project}",
            get(projects::get_project)
                .put(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/projects/{project}/members",
            post(projects::add_member),
        )
        .route(
            "/projects/{project}/immutabletagrules",
            get(projects::list_immutable_rules).post(projects::create_immutable_rule),
        )
        .route(
            "/projects/{project}/immutabletagrules/{id}",
            delete(projects::delete_immutable_rule),
        )
        .route(
            "/projects/{project}/retention",
            get(projects::get_retention).put(projects::put_retention),
        )
        .route(
            "/projects/{project}/retention/executions",
            post(projects::run_retention),
        )
        .route(
            "/projects/{project}/quota",
            get(projects::get_quota).put(projects::set_quota),
        )
        .route("/labels", post(projects::create_label))
        .route(
            "/system/CVEAllowlist",
            get(projects::get_system_allowlist).put(projects::set_system_allowlist),
        )
        // Repositories and artifacts
        .route("/projects/{project}/repositories", get(artifacts::list_repositories))
        .route(
            "/projects/{project}/repositories/{repository}",
            delete(artifacts::delete_repository),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts",
            get(artifacts::list_artifacts),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}",
            get(artifacts::get_artifact).delete(artifacts::delete_artifact),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}/tags",
            post(artifacts::create_tag),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}/tags/{tag}",
            delete(artifacts::delete_tag),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}/labels",
            post(artifacts::add_label),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}/labels/{label}",
            delete(artifacts::remove_label),
        )
        .route(
            "/projects/{project}/repositories/{repository}/artifacts/{reference}/scan",
            post(artifacts::record_scan),
        )
        .route("/icons/{digest}", get(artifacts::get_icon))
        // Replication
        .route(
            "/registries",
            get(replication::list_registries).post(replication::create_registry),
        )
        .route("/registries/{id}", get(replication::get_registry))
        .route("/registries/{id}/health", get(replication::registry_health))
        .route("/replication/adapters", get(replication::list_adapters))
        .route(
            "/replication/policies",
            get(replication::list_policies).post(replication::create_policy),
        )
        .route(
            "/replication/policies/{id}",
            get(replication::get_policy)
                .put(replication::update_policy)
                .delete(replication::delete_policy),
        )
        .route(
            "/replication/executions",
            get(replication::list_executions).post(replication::start_execution),
        )
        .route(
            "/replication/executions/{id}",
            get(replication::get_execution).patch(replication::stop_execution),
        )
        .route(
            "/replication/executions/{id}/tasks",
            get(replication::list_tasks),
        )
        .route("/hooks/executions", get(replication::list_hook_executions))
        .fallback(not_found)
}

async fn not_found() -> RegistryError {
    Error::not_found("no such management endpoint")
        .with_code("NOT_FOUND")
        .into()
}

/// Whoever is calling a management route.
#[derive(Debug, Clone)]
pub(crate) struct Operator(pub(crate) Subject);

impl FromRequestParts<AppState> for Operator {
    type Rejection = RegistryError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(Operator(Subject::Anonymous));
        };
        let raw = value
            .to_str()
            .map_err(|_| Error::unauthorized("malformed authorization header"))?;
        if let Some(token) = raw.strip_prefix("Bearer ") {
            let claims = state.tokens.verify(token.trim())?;
            let principal = match state.identity.lookup(&claims.sub).await {
                Ok(principal) => principal,
                Err(_) => Principal {
                    username: claims.sub,
                    sysadmin: false,
                },
            };
            return Ok(Operator(Subject::User(principal)));
        }
        let credentials = Credentials::from_basic_header(value)?;
        Ok(Operator(state.identity.resolve(&credentials).await?))
    }
}

fn denied(operator: &Subject) -> Error {
    match operator {
        Subject::Anonymous => Error::unauthorized("authentication required"),
        Subject::User(principal) => Error::forbidden(format!(
            "{} is not allowed to perform this operation",
            principal.username
        )),
    }
}

/// Refuse anyone but system administrators.
pub(crate) fn require_sysadmin(operator: &Subject) -> Result<()> {
    if operator.is_sysadmin() {
        Ok(())
    } else {
        Err(denied(operator))
    }
}

/// Refuse callers without `action` on `project`. Projects the caller cannot
/// even read are reported as missing.
pub(crate) async fn require(state: &AppState, operator: &Subject, project: &Project, action: &str) -> Result<()> {
    let held = state.access.project_actions(operator, project).await?;
    if held.contains(&action) {
        return Ok(());
    }
    if held.is_empty() && !matches!(operator, Subject::Anonymous) {
        return Err(Error::not_found(format!("project {} not found", project.name)));
    }
    Err(denied(operator))
}

/// Refuse anyone but system administrators and project admins.
pub(crate) async fn require_admin(state: &AppState, operator: &Subject, project: &Project) -> Result<()> {
    if operator.is_sysadmin() {
        return Ok(());
    }
    if let Some(principal) = operator.principal() {
        let role = state.store.member_role(project.id, &principal.username).await?;
        if role == Some(Role::ProjectAdmin) {
            return Ok(());
        }
    }
    Err(denied(operator))
}

/// Find a project by name, or by numeric id.
pub(crate) async fn lookup_project(state: &AppState, key: &str) -> Result<Project> {
    match state.store.get_project_by_name(key).await {
        Ok(project) => Ok(project),
        Err(err) if err.kind() == ErrorKind::NotFound => match key.parse() {
            Ok(id) => state
                .store
                .get_project(id)
                .await
                .and_then(|project| {
                    if project.deleted {
                        Err(Error::not_found(format!("project {key} not found")))
                    } else {
                        Ok(project)
                    }
                }),
            Err(_) => Err(err),
        },
        Err(err) => Err(err),
    }
}

/// Repository names in paths are percent-encoded twice, so `a/b` arrives
/// as `a%252Fb` and leaves the path extractor as `a%2Fb`.
pub(crate) fn repository_path(project: &Project, raw: &str) -> Result<RepositoryName> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::invalid("repository name is not valid UTF-8").with_code("NAME_INVALID"))?;
    RepositoryName::new(format!("{}/{}", project.name, decoded))
}

/// `page` and `page_size` query parameters.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(default)]
pub(crate) struct Paging {
    page: Option<usize>,
    page_size: Option<usize>,
}

impl Paging {
    pub(crate) fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Apply to an in-memory listing.
    pub(crate) fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let start = (self.page() - 1).saturating_mul(self.page_size());
        items.into_iter().skip(start).take(self.page_size()).collect()
    }
}

/// A listing page with `X-Total-Count` and, when more remain, a `Link` to
/// the next page.
pub(crate) fn paged<T: Serialize>(path: &str, paging: Paging, total: usize, items: Vec<T>) -> Response {
    let mut response = Json(items).into_response();
    let headers = response.headers_mut();
    headers.insert(X_TOTAL_COUNT, HeaderValue::from(total));
    if paging.page() * paging.page_size() < total {
        let link = format!(
            "<{path}?page={}&page_size={}>; rel=\"next\"",
            paging.page() + 1,
            paging.page_size()
        );
        if let Ok(link) = HeaderValue::try_from(link) {
            headers.insert(header::LINK, link);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harbor_core::model::{CveAllowlist, ProjectMetadata};

    fn project() -> Project {
        Project {
            id: 1,
            name: "library".into(),
            owner: "admin".into(),
            metadata: ProjectMetadata::default(),
            cve_allowlist: CveAllowlist::default(),
            created: Utc::now(),
            deleted: false,
        }
    }

    #[test]
    fn repository_names_are_decoded_twice() {
        let name = repository_path(&project(), "team%2Fweb").unwrap();
        assert_eq!(name.as_str(), "library/team/web");
        let name = repository_path(&project(), "nginx").unwrap();
        assert_eq!(name.as_str(), "library/nginx");
    }

    #[test]
    fn paging_defaults_and_bounds() {
        let paging = Paging::default();
        assert_eq!((paging.page(), paging.page_size()), (1, DEFAULT_PAGE_SIZE));
        let paging = Paging {
            page: Some(0),
            page_size: Some(1000),
        };
        assert_eq!((paging.page(), paging.page_size()), (1, MAX_PAGE_SIZE));

        let paging = Paging {
            page: Some(2),
            page_size: Some(2),
        };
        assert_eq!(paging.slice(vec![1, 2, 3, 4, 5]), vec![3, 4]);
    }

    #[test]
    fn pages_link_to_the_next() {
        let paging = Paging {
            page: Some(1),
            page_size: Some(2),
        };
        let response = paged("/api/v2.0/projects", paging, 3, vec![1, 2]);
        assert_eq!(response.headers()[X_TOTAL_COUNT], "3");
        assert_eq!(
            response.headers()[header::LINK],
            "</api/v2.0/projects?page=2&page_size=2>; rel=\"next\""
        );
        let response = paged("/api/v2.0/projects", paging, 2, vec![1, 2]);
        assert!(response.headers().get(header::LINK).is_none());
    }

    #[test]
    fn anonymous_denials_ask_for_credentials() {
        assert_eq!(denied(&Subject::Anonymous).kind(), ErrorKind::Unauthorized);
        let user = Subject::User(Principal {
            username: "bob".into(),
            sysadmin: false,
        });
        assert_eq!(denied(&user).kind(), ErrorKind::Forbidden);
        assert!(require_sysadmin(&user).is_err());
    }
}
