//! Blob reads and deletes.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use blob_store::ByteRange;
use harbor_core::{Error, Result};
use tokio_util::io::ReaderStream;

use super::{empty, parse_digest, project_of, repository_name, with_headers, Context, DOCKER_CONTENT_DIGEST};
use crate::error::RegistryResult;

/// Parse a single `Range: bytes=a-b` (or `bytes=a-`) header.
fn parse_range(headers: &HeaderMap) -> Result<Option<ByteRange>> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let invalid = || Error::invalid("only a single bytes=start-end range is supported").with_code("BLOB_RANGE_INVALID");
    let spec = value
        .to_str()
        .ok()
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .ok_or_else(invalid)?;
    let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().map_err(|_| invalid())?),
    };
    Ok(Some(ByteRange { start, end }))
}

pub(super) async fn get(
    ctx: &Context,
    repository: &str,
    digest: &str,
    headers: &HeaderMap,
    head: bool,
) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let digest = parse_digest(digest)?;
    project_of(ctx, &name).await?;
    let backend = &ctx.state.backend;

    if head {
        let size = ctx.deadline.run(backend.stat_blob(name.as_str(), &digest)).await?;
        let response = (StatusCode::OK, Body::empty()).into_response();
        return Ok(with_headers(
            response,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
                (header::CONTENT_LENGTH, size.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_owned()),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
        ));
    }

    let range = parse_range(headers)?;
    let stream = ctx
        .deadline
        .run(backend.get_blob(name.as_str(), &digest, range))
        .await?;
    let mut response_headers = vec![
        (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
        (header::CONTENT_LENGTH, stream.length.to_string()),
        (header::ACCEPT_RANGES, "bytes".to_owned()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
    ];
    let status = if range.is_some() {
        let last = (stream.offset + stream.length).saturating_sub(1);
        response_headers.push((
            header::CONTENT_RANGE,
            format!("bytes {}-{last}/{}", stream.offset, stream.size),
        ));
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let body = Body::from_stream(ReaderStream::new(stream.reader));
    Ok(with_headers((status, body).into_response(), response_headers))
}

pub(super) async fn delete(ctx: &Context, repository: &str, digest: &str) -> RegistryResult<Response> {
    let name = repository_name(repository)?;
    let digest = parse_digest(digest)?;
    let project = project_of(ctx, &name).await?;
    ctx.deadline
        .run(ctx.state.artifacts.delete_blob(&project, &name, &digest))
        .await?;
    empty(StatusCode::ACCEPTED, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn range(value: &str) -> Result<Option<ByteRange>> {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        parse_range(&headers)
    }

    #[test]
    fn byte_ranges() {
        assert_eq!(range("bytes=0-9").unwrap(), Some(ByteRange { start: 0, end: Some(9) }));
        assert_eq!(range("bytes=5-").unwrap(), Some(ByteRange { start: 5, end: None }));
        assert_eq!(parse_range(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn unsupported_ranges() {
        for value in ["bytes=-5", "items=0-1", "bytes=0-1,4-5", "bytes=a-b"] {
            let err = range(value).unwrap_err();
            assert_eq!(err.code(), Some("BLOB_RANGE_INVALID"), "{value}");
        }
    }
}
