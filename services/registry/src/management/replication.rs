//! Registry endpoints, replication policies and executions, and hook
//! delivery state. All of it is reserved to system administrators.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use harbor_core::model::{
    Execution, ExecutionId, HookExecution, PolicyId, RegistryEndpoint, RegistryId,
    ReplicationPolicy, Task, TriggerSource,
};
use harbor_core::{Error, Secret};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{paged, require_sysadmin, Operator, Paging};
use crate::api::AppState;
use crate::error::RegistryResult;

const REDACTED: &str = "*****";

fn created(location: String) -> Response {
    (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
}

fn redact(mut endpoint: RegistryEndpoint) -> RegistryEndpoint {
    if let Some(credential) = endpoint.credential.as_mut() {
        credential.access_secret = Secret::new(REDACTED);
    }
    endpoint
}

pub(super) async fn list_registries(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    let registries: Vec<_> = state
        .store
        .list_registries()
        .await?
        .into_iter()
        .map(redact)
        .collect();
    let total = registries.len();
    Ok(paged("/api/v2.0/registries", paging, total, paging.slice(registries)))
}

pub(super) async fn get_registry(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<RegistryId>,
) -> RegistryResult<Json<RegistryEndpoint>> {
    require_sysadmin(&operator)?;
    Ok(Json(redact(state.store.get_registry(id).await?)))
}

pub(super) async fn create_registry(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(mut endpoint): Json<RegistryEndpoint>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    if endpoint.name.trim().is_empty() {
        return Err(Error::invalid("registry name must not be empty").into());
    }
    if !state
        .replication
        .adapter_types()
        .contains(&endpoint.registry_type.as_str())
    {
        return Err(Error::invalid(format!(
            "adapter type {:?} is not enabled",
            endpoint.registry_type
        ))
        .with_code("UNSUPPORTED")
        .into());
    }
    Url::parse(&endpoint.url)
        .map_err(|err| Error::invalid(format!("registry url {:?}: {err}", endpoint.url)))?;
    endpoint.id = 0;
    let endpoint = state.store.create_registry(endpoint).await?;
    tracing::info!(registry = endpoint.id, name = %endpoint.name, kind = %endpoint.registry_type, "Added registry");
    Ok(created(format!("/api/v2.0/registries/{}", endpoint.id)))
}

pub(super) async fn registry_health(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<RegistryId>,
) -> RegistryResult<Json<Value>> {
    require_sysadmin(&operator)?;
    let health = state.replication.health_check(id).await?;
    Ok(Json(json!({ "status": health })))
}

pub(super) async fn list_adapters(
    Operator(operator): Operator,
    State(state): State<AppState>,
) -> RegistryResult<Json<Vec<String>>> {
    require_sysadmin(&operator)?;
    Ok(Json(
        state
            .replication
            .adapter_types()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    ))
}

pub(super) async fn list_policies(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    let policies = state.store.list_replication_policies().await?;
    let total = policies.len();
    Ok(paged(
        "/api/v2.0/replication/policies",
        paging,
        total,
        paging.slice(policies),
    ))
}

pub(super) async fn get_policy(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<PolicyId>,
) -> RegistryResult<Json<ReplicationPolicy>> {
    require_sysadmin(&operator)?;
    Ok(Json(state.store.get_replication_policy(id).await?))
}

pub(super) async fn create_policy(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(mut policy): Json<ReplicationPolicy>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    policy.id = 0;
    state.replication.validate_policy(&policy).await?;
    let policy = state.store.create_replication_policy(policy).await?;
    state.scheduler.schedule(&policy)?;
    tracing::info!(policy = policy.id, name = %policy.name, "Created replication policy");
    Ok(created(format!("/api/v2.0/replication/policies/{}", policy.id)))
}

pub(super) async fn update_policy(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<PolicyId>,
    Json(mut policy): Json<ReplicationPolicy>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    state.store.get_replication_policy(id).await?;
    policy.id = id;
    state.replication.validate_policy(&policy).await?;
    state.store.update_replication_policy(policy.clone()).await?;
    state.scheduler.schedule(&policy)?;
    Ok(StatusCode::OK)
}

pub(super) async fn delete_policy(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<PolicyId>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    state.scheduler.unschedule(id);
    state.store.delete_replication_policy(id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ExecutionFilter {
    policy_id: Option<PolicyId>,
}

pub(super) async fn list_executions(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Query(filter): Query<ExecutionFilter>,
    Query(paging): Query<Paging>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    let mut executions = state.store.list_executions(filter.policy_id).await?;
    executions.sort_by(|a, b| b.id.cmp(&a.id));
    let total = executions.len();
    Ok(paged(
        "/api/v2.0/replication/executions",
        paging,
        total,
        paging.slice(executions),
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct StartRequest {
    policy_id: PolicyId,
}

pub(super) async fn start_execution(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> RegistryResult<Response> {
    require_sysadmin(&operator)?;
    let execution = state
        .replication
        .start(request.policy_id, TriggerSource::Manual)
        .await?;
    tracing::info!(policy = request.policy_id, execution, operator = %operator, "Started replication");
    Ok(created(format!("/api/v2.0/replication/executions/{execution}")))
}

pub(super) async fn get_execution(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> RegistryResult<Json<Execution>> {
    require_sysadmin(&operator)?;
    Ok(Json(state.replication.execution(id).await?))
}

pub(super) async fn stop_execution(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> RegistryResult<StatusCode> {
    require_sysadmin(&operator)?;
    state.replication.stop(id).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn list_tasks(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> RegistryResult<Json<Vec<Task>>> {
    require_sysadmin(&operator)?;
    state.replication.execution(id).await?;
    Ok(Json(state.replication.tasks(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct HookFilter {
    subscriber: Option<String>,
}

pub(super) async fn list_hook_executions(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Query(filter): Query<HookFilter>,
) -> RegistryResult<Json<Vec<HookExecution>>> {
    require_sysadmin(&operator)?;
    Ok(Json(
        state
            .store
            .list_hook_executions(filter.subscriber.as_deref())
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::RegistryCredential;

    #[test]
    fn secrets_are_redacted() {
        let endpoint = RegistryEndpoint {
            id: 3,
            name: "hub".into(),
            registry_type: "docker-hub".into(),
            url: "https://hub.docker.com".into(),
            credential: Some(RegistryCredential {
                access_key: "bob".into(),
                access_secret: Secret::new("hunter2"),
            }),
            insecure: false,
        };
        let view = serde_json::to_value(redact(endpoint)).unwrap();
        assert_eq!(view["credential"]["access_key"], "bob");
        assert_eq!(view["credential"]["access_secret"], REDACTED);
    }
}
