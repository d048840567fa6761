//! Blob upload sessions, monolithic uploads and cross-repository mounts.
//!
//! Quota is reserved before bytes are committed: the declared size for
//! monolithic uploads, and the bytes already received plus the final chunk
//! when a session completes. Blobs the repository already links are never
//! charged twice.

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use blob_store::{Reader, UploadSession};
use harbor_core::model::{Project, ReservationId};
use harbor_core::{Digest, Error, RepositoryName, Result};
use serde::Deserialize;
use uuid::Uuid;

use super::{
    body_reader, content_length, empty, parse_digest, project_of, query, repository_name, Context,
    DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID,
};
use crate::access::PULL;
use crate::error::RegistryResult;
use crate::token::REPOSITORY;

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

fn session_id(raw: &str) -> Result<Uuid> {
    raw.parse().map_err(|_| {
        Error::not_found(format!("upload {raw} not found")).with_code("BLOB_UPLOAD_UNKNOWN")
    })
}

fn session_headers(name: &RepositoryName, session: &UploadSession) -> Vec<(HeaderName, String)> {
    vec![
        (header::LOCATION, format!("/v2/{name}/blobs/uploads/{}", session.id)),
        (header::RANGE, format!("0-{}", session.offset.saturating_sub(1))),
        (DOCKER_UPLOAD_UUID, session.id.to_string()),
    ]
}

fn committed(name: &RepositoryName, digest: &Digest) -> RegistryResult<Response> {
    empty(
        StatusCode::CREATED,
        vec![
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
}

async fn linked(ctx: &Context, name: &RepositoryName, digest: &Digest) -> bool {
    ctx.state.backend.stat_blob(name.as_str(), digest).await.is_ok()
}

async fn reserve(ctx: &Context, project: &Project, size: u64, already_linked: bool) -> Result<Option<ReservationId>> {
    if already_linked {
        return Ok(None);
    }
    ctx.state
        .gates
        .reserve(project, size, &ctx.caller.subject)
        .await
}

/// Charge a committed blob. When the stored size differs from what was
/// reserved the reservation is redone, and a refusal unlinks the blob.
#[allow(clippy::too_many_arguments)]
async fn charge(
    ctx: &Context,
    project: &Project,
    name: &RepositoryName,
    digest: &Digest,
    size: u64,
    reserved: u64,
    reservation: Option<ReservationId>,
    already_linked: bool,
) -> Result<()> {
    let gates = &ctx.state.gates;
    if already_linked {
        return Ok(());
    }
    let reservation = if size == reserved {
        reservation
    } else {
        gates.release(reservation).await;
        match gates.reserve(project, size, &ctx.caller.subject).await {
            Ok(reservation) => reservation,
            Err(err) => {
                if let Err(unlink) = ctx.state.backend.delete_blob(name.as_str(), digest).await {
                    tracing::warn!(%digest, error = %unlink, "Could not unlink refused blob");
                }
                return Err(err);
            }
        }
    };
    gates.settle(project, digest, size, reservation).await
}

pub(super) async fn start(ctx: &Context, repository: &str, request: Request) -> RegistryResult<Response> {
    let params: UploadQuery = query(request.uri().query())?;
    let name = repository_name(repository)?;
    let project = project_of(ctx, &name).await?;

    if let (Some(mount), Some(from)) = (&params.mount, &params.from) {
        let digest = parse_digest(mount)?;
        if mount_from(ctx, &project, &name, &digest, from).await? {
            return committed(&name, &digest);
        }
    }

    if let Some(digest) = &params.digest {
        let digest = parse_digest(digest)?;
        let declared = content_length(request.headers()).unwrap_or(0);
        let already_linked = linked(ctx, &name, &digest).await;
        let reservation = reserve(ctx, &project, declared, already_linked).await?;
        let mut reader = body_reader(request.into_body());
        let size = match ctx
            .deadline
            .run(ctx.state.backend.put_blob(name.as_str(), &digest, &mut reader))
            .await
        {
            Ok(size) => size,
            Err(err) => {
                ctx.state.gates.release(reservation).await;
                return Err(err.into());
            }
        };
        charge(ctx, &project, &name, &digest, size, declared, reservation, already_linked).await?;
        tracing::debug!(repository = %name, %digest, size, "Monolithic upload stored");
        return committed(&name, &digest);
    }

    let session = ctx
        .deadline
        .run(ctx.state.backend.start_upload(name.as_str()))
        .await?;
    empty(StatusCode::ACCEPTED, session_headers(&name, &session))
}

/// Link `digest` from `from` when the caller may pull it there. `false`
/// means the client should upload instead.
async fn mount_from(
    ctx: &Context,
    project: &Project,
    name: &RepositoryName,
    digest: &Digest,
    from: &str,
) -> Result<bool> {
    let Ok(source) = RepositoryName::new(from) else {
        return Ok(false);
    };
    if !ctx.caller.may(&ctx.state, REPOSITORY, source.as_str(), PULL).await? {
        tracing::debug!(from = %source, "Mount source not readable, falling back to upload");
        return Ok(false);
    }
    let backend = &ctx.state.backend;
    let size = match backend.stat_blob(source.as_str(), digest).await {
        Ok(size) => size,
        Err(err) if err.kind() == blob_store::StorageErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let already_linked = linked(ctx, name, digest).await;
    let reservation = reserve(ctx, project, size, already_linked).await?;
    if let Err(err) = backend
        .mount_blob(source.as_str(), name.as_str(), digest)
        .await
    {
        ctx.state.gates.release(reservation).await;
        return Err(err.into());
    }
    charge(ctx, project, name, digest, size, size, reservation, already_linked).await?;
    tracing::debug!(from = %source, to = %name, %digest, "Blob mounted");
    Ok(true)
}

fn chunk_start(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || Error::invalid("malformed Content-Range").with_code("BLOB_UPLOAD_INVALID");
    let value = value.to_str().map_err(|_| invalid())?;
    let value = value.trim().trim_start_matches("bytes ").trim_start_matches("bytes=");
    let (start, _) = value.split_once('-').ok_or_else(invalid)?;
    start.trim().parse().map(Some).map_err(|_| invalid())
}

pub(super) async fn patch(ctx: &Context, repository: &str, id: &str, request: Request) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let id = session_id(id)?;
    project_of(ctx, &name).await?;
    let start = chunk_start(request.headers())?;
    let mut reader = body_reader(request.into_body());
    let session = ctx
        .deadline
        .run(
            ctx.state
                .backend
                .append_upload(name.as_str(), id, start, &mut reader),
        )
        .await?;
    empty(StatusCode::ACCEPTED, session_headers(&name, &session))
}

pub(super) async fn complete(ctx: &Context, repository: &str, id: &str, request: Request) -> RegistryResult<Response> {
    let params: UploadQuery = query(request.uri().query())?;
    let name = repository_name(repository)?;
    let id = session_id(id)?;
    let project = project_of(ctx, &name).await?;
    let digest = params
        .digest
        .as_deref()
        .ok_or_else(|| Error::invalid("digest parameter is required").with_code("DIGEST_INVALID"))
        .and_then(parse_digest)?;

    let backend = &ctx.state.backend;
    let session = ctx
        .deadline
        .run(backend.upload_status(name.as_str(), id))
        .await?;
    let expected = session.offset + content_length(request.headers()).unwrap_or(0);
    let already_linked = linked(ctx, &name, &digest).await;
    let reservation = reserve(ctx, &project, expected, already_linked).await?;

    let mut reader = body_reader(request.into_body());
    let tail: &mut Reader<'_> = &mut reader;
    let outcome = match ctx
        .deadline
        .run(backend.complete_upload(name.as_str(), id, &digest, Some(tail)))
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            ctx.state.gates.release(reservation).await;
            return Err(err.into());
        }
    };
    if outcome.fresh {
        charge(ctx, &project, &name, &digest, outcome.size, expected, reservation, already_linked).await?;
        tracing::debug!(repository = %name, %digest, size = outcome.size, "Upload completed");
    } else {
        ctx.state.gates.release(reservation).await;
    }
    committed(&name, &digest)
}

pub(super) async fn status(ctx: &Context, repository: &str, id: &str) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let id = session_id(id)?;
    let session = ctx
        .deadline
        .run(ctx.state.backend.upload_status(name.as_str(), id))
        .await?;
    empty(StatusCode::NO_CONTENT, session_headers(&name, &session))
}

pub(super) async fn cancel(ctx: &Context, repository: &str, id: &str) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let id = session_id(id)?;
    ctx.deadline
        .run(ctx.state.backend.cancel_upload(name.as_str(), id))
        .await?;
    empty(StatusCode::NO_CONTENT, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use harbor_core::ErrorKind;

    #[test]
    fn content_range_start() {
        let mut headers = HeaderMap::new();
        assert_eq!(chunk_start(&headers).unwrap(), None);
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("1024-2047"));
        assert_eq!(chunk_start(&headers).unwrap(), Some(1024));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("junk"));
        assert_eq!(
            chunk_start(&headers).unwrap_err().code(),
            Some("BLOB_UPLOAD_INVALID")
        );
    }

    #[test]
    fn unknown_sessions() {
        let err = session_id("not-a-uuid").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), Some("BLOB_UPLOAD_UNKNOWN"));
    }
}
