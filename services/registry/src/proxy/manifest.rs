//! Manifests, tags, the catalog and referrers.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use harbor_core::manifest::Descriptor;
use harbor_core::media::OCI_INDEX;
use harbor_core::{Error, ErrorKind, Reference};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    empty, next_link, parse_digest, project_of, query, repository_name, with_headers, Context,
    DOCKER_CONTENT_DIGEST, OCI_FILTERS_APPLIED, OCI_SUBJECT,
};
use crate::access::PULL;
use crate::artifact::{pull_event, ManifestPush};
use crate::error::RegistryResult;
use crate::token::REGISTRY;

#[derive(Debug, Default, Deserialize)]
struct Page {
    n: Option<usize>,
    last: Option<String>,
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

pub(super) async fn catalog(ctx: &Context, raw_query: Option<&str>) -> RegistryResult<Response> {
    let page: Page = query(raw_query)?;
    let state = &ctx.state;
    let everything = ctx.caller.subject.is_sysadmin()
        || ctx.caller.may(state, REGISTRY, "catalog", "*").await?;

    let mut names = Vec::new();
    for repo in ctx.deadline.run(state.store.list_repositories(None)).await? {
        if let Some(last) = &page.last {
            if repo.name.as_str() <= last.as_str() {
                continue;
            }
        }
        if everything || state.access.can(&ctx.caller.subject, &repo.name, PULL).await? {
            names.push(repo.name);
        }
    }
    names.sort();

    let mut headers = Vec::new();
    if let Some(n) = page.n {
        if names.len() > n {
            names.truncate(n);
            if let Some(last) = names.last() {
                headers.push(next_link("/v2/_catalog", Some(n), last));
            }
        }
    }
    let response = Json(Catalog { repositories: names }).into_response();
    Ok(with_headers(response, headers))
}

pub(super) async fn tags(ctx: &Context, repository: &str, raw_query: Option<&str>) -> RegistryResult<Response> {
    let page: Page = query(raw_query)?;
    let name = repository_name(repository)?;
    project_of(ctx, &name).await?;
    let listed = ctx
        .deadline
        .run(
            ctx.state
                .backend
                .list_tags(name.as_str(), page.last.as_deref(), page.n),
        )
        .await?;

    let headers: Vec<(HeaderName, String)> = listed
        .next
        .iter()
        .map(|next| next_link(&format!("/v2/{name}/tags/list"), page.n, next))
        .collect();
    let response = Json(TagList {
        name: name.to_string(),
        tags: listed.tags,
    })
    .into_response();
    Ok(with_headers(response, headers))
}

pub(super) async fn get(ctx: &Context, repository: &str, reference: &str, head: bool) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let reference: Reference = reference.parse()?;
    let project = project_of(ctx, &name).await?;
    let state = &ctx.state;

    let artifact = ctx.deadline.run(state.artifacts.resolve(&name, &reference)).await?;
    if !head {
        ctx.deadline
            .run(state.gates.check_pull(&project, &artifact, reference.tag().is_some()))
            .await?;
    }
    let manifest = ctx
        .deadline
        .run(state.backend.get_manifest(name.as_str(), &artifact.digest))
        .await?;

    let headers = vec![
        (header::CONTENT_TYPE, manifest.media_type.clone()),
        (header::CONTENT_LENGTH, manifest.bytes.len().to_string()),
        (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
        (header::ETAG, format!("\"{}\"", manifest.digest)),
    ];
    if head {
        let response = (StatusCode::OK, Body::empty()).into_response();
        return Ok(with_headers(response, headers));
    }

    state
        .events
        .publish(pull_event(
            &project,
            &artifact,
            reference.tag(),
            &ctx.caller.subject,
        ))
        .await;
    let response = (StatusCode::OK, Body::from(manifest.bytes)).into_response();
    Ok(with_headers(response, headers))
}

pub(super) async fn put(ctx: &Context, repository: &str, reference: &str, request: Request) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let reference: Reference = reference.parse()?;
    let project = project_of(ctx, &name).await?;
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let limit = ctx.state.config.registry.max_manifest_size;
    let bytes = axum::body::to_bytes(request.into_body(), limit.saturating_add(1))
        .await
        .map_err(|err| {
            Error::invalid(format!("manifest body unreadable or larger than {limit} bytes"))
                .with_code("MANIFEST_INVALID")
                .with_source(err)
        })?;

    let push = ManifestPush {
        project,
        repository: name.clone(),
        reference,
        content_type,
        bytes,
    };
    let outcome = ctx
        .deadline
        .run(ctx.state.artifacts.push_manifest(push, &ctx.caller.subject))
        .await?;

    let mut headers = vec![
        (header::LOCATION, format!("/v2/{name}/manifests/{}", outcome.digest)),
        (DOCKER_CONTENT_DIGEST, outcome.digest.to_string()),
    ];
    if let Some(subject) = outcome.subject {
        headers.push((OCI_SUBJECT, subject.to_string()));
    }
    empty(StatusCode::CREATED, headers)
}

pub(super) async fn delete(ctx: &Context, repository: &str, reference: &str) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let reference: Reference = reference.parse()?;
    let project = project_of(ctx, &name).await?;
    ctx.deadline
        .run(
            ctx.state
                .artifacts
                .delete(&project, &name, &reference, &ctx.caller.subject),
        )
        .await?;
    empty(StatusCode::ACCEPTED, Vec::new())
}

#[derive(Debug, Default, Deserialize)]
struct ReferrersQuery {
    #[serde(rename = "artifactType")]
    artifact_type: Option<String>,
}

pub(super) async fn referrers(
    ctx: &Context,
    repository: &str,
    digest: &str,
    raw_query: Option<&str>,
) -> RegistryResult<Response> {
    let filter: ReferrersQuery = query(raw_query)?;
    let name = repository_name(repository)?;
    let digest = parse_digest(digest)?;
    project_of(ctx, &name).await?;

    let manifests: Vec<Descriptor> = match ctx
        .state
        .artifacts
        .resolve(&name, &Reference::Digest(digest))
        .await
    {
        Ok(subject) => ctx
            .deadline
            .run(ctx.state.store.accessories_of(subject.id))
            .await?
            .into_iter()
            .filter(|accessory| match &filter.artifact_type {
                Some(wanted) => accessory.artifact_type.as_deref() == Some(wanted.as_str()),
                None => true,
            })
            .map(|accessory| Descriptor {
                media_type: accessory.media_type,
                digest: accessory.digest,
                size: accessory.size,
                platform: None,
                artifact_type: accessory.artifact_type,
                annotations: accessory.annotations,
                urls: Vec::new(),
            })
            .collect(),
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    let index = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": manifests,
    });
    let mut headers = vec![(header::CONTENT_TYPE, OCI_INDEX.to_owned())];
    if filter.artifact_type.is_some() {
        headers.push((OCI_FILTERS_APPLIED, "artifactType".to_owned()));
    }
    Ok(with_headers(Json(index).into_response(), headers))
}
