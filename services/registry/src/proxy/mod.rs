//! The Distribution v2 registry surface.
//!
//! Every `/v2` path is classified into a [`Route`], authenticated, and then
//! dispatched by method. Repository names may contain any number of path
//! segments, so routing is done here rather than by the axum path matcher.

use std::io;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use harbor_core::model::Project;
use harbor_core::{Digest, Error, ErrorKind, RepositoryName, Result};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::io::StreamReader;

use crate::api::AppState;
use crate::error::{error_body, RegistryResult};
use crate::middleware::Deadline;

mod auth;
mod blob;
mod manifest;
mod route;
mod upload;

pub(crate) use self::auth::Caller;
pub(crate) use self::route::Route;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub(crate) const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
pub(crate) const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

/// Routes for `/v2`.
pub(crate) fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v2", any(dispatch))
        .route("/v2/", any(dispatch))
        .route("/v2/{*path}", any(dispatch))
        .layer(from_fn_with_state(state, auth::authenticate))
        .layer(from_fn(route::classify))
}

/// What a handler needs besides the request itself.
#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub(crate) state: AppState,
    pub(crate) caller: Caller,
    pub(crate) deadline: Deadline,
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let route = request
        .extensions()
        .get::<Route>()
        .cloned()
        .unwrap_or(Route::Unknown);
    let Some(caller) = request.extensions().get::<Caller>().cloned() else {
        return crate::error::RegistryError::from(
            Error::not_found("unknown registry endpoint").with_code("NOT_FOUND"),
        )
        .into_response();
    };
    let deadline = request
        .extensions()
        .get::<Deadline>()
        .copied()
        .unwrap_or_else(|| Deadline::after(state.config.registry.request_timeout));
    let ctx = Context {
        state,
        caller,
        deadline,
    };

    let method = request.method().clone();
    let result = match (route, method) {
        (Route::Base, Method::GET | Method::HEAD) => Ok(Json(json!({})).into_response()),
        (Route::Catalog, Method::GET) => manifest::catalog(&ctx, request.uri().query()).await,
        (Route::Tags { repository }, Method::GET) => {
            manifest::tags(&ctx, &repository, request.uri().query()).await
        }
        (Route::Manifest { repository, reference }, Method::GET) => {
            manifest::get(&ctx, &repository, &reference, false).await
        }
        (Route::Manifest { repository, reference }, Method::HEAD) => {
            manifest::get(&ctx, &repository, &reference, true).await
        }
        (Route::Manifest { repository, reference }, Method::PUT) => {
            manifest::put(&ctx, &repository, &reference, request).await
        }
        (Route::Manifest { repository, reference }, Method::DELETE) => {
            manifest::delete(&ctx, &repository, &reference).await
        }
        (Route::Referrers { repository, digest }, Method::GET) => {
            manifest::referrers(&ctx, &repository, &digest, request.uri().query()).await
        }
        (Route::Blob { repository, digest }, Method::GET) => {
            blob::get(&ctx, &repository, &digest, request.headers(), false).await
        }
        (Route::Blob { repository, digest }, Method::HEAD) => {
            blob::get(&ctx, &repository, &digest, request.headers(), true).await
        }
        (Route::Blob { repository, digest }, Method::DELETE) => {
            blob::delete(&ctx, &repository, &digest).await
        }
        (Route::Upload { repository, session: None }, Method::POST) => {
            upload::start(&ctx, &repository, request).await
        }
        (Route::Upload { repository, session: Some(id) }, Method::GET) => {
            upload::status(&ctx, &repository, &id).await
        }
        (Route::Upload { repository, session: Some(id) }, Method::PATCH) => {
            upload::patch(&ctx, &repository, &id, request).await
        }
        (Route::Upload { repository, session: Some(id) }, Method::PUT) => {
            upload::complete(&ctx, &repository, &id, request).await
        }
        (Route::Upload { repository, session: Some(id) }, Method::DELETE) => {
            upload::cancel(&ctx, &repository, &id).await
        }
        (_, method) => return unsupported(&method),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

fn unsupported(method: &Method) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::CONTENT_TYPE, "application/json")],
        error_body(
            "UNSUPPORTED",
            &format!("{method} is not supported on this endpoint"),
            None,
        ),
    )
        .into_response()
}

pub(crate) fn repository_name(raw: &str) -> Result<RepositoryName> {
    RepositoryName::new(raw)
}

pub(crate) fn parse_digest(raw: &str) -> Result<Digest> {
    Ok(raw.parse()?)
}

/// The project owning `repository`.
pub(crate) async fn project_of(ctx: &Context, repository: &RepositoryName) -> Result<Project> {
    match ctx
        .deadline
        .run(ctx.state.store.get_project_by_name(repository.project()))
        .await
    {
        Ok(project) => Ok(project),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::not_found(format!(
            "repository {repository} not known to registry"
        ))
        .with_code("NAME_UNKNOWN")),
        Err(err) => Err(err),
    }
}

/// Parse the query string into `T`.
pub(crate) fn query<T: DeserializeOwned + Default>(raw: Option<&str>) -> Result<T> {
    match raw {
        None | Some("") => Ok(T::default()),
        Some(raw) => serde_urlencoded::from_str(raw)
            .map_err(|err| Error::invalid(format!("invalid query: {err}")).with_source(err)),
    }
}

/// A request body read as a byte stream.
pub(crate) type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

pub(crate) fn body_reader(body: Body) -> BodyReader {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other).boxed())
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Set `headers` on `response`, replacing any already present.
pub(crate) fn with_headers<I>(mut response: Response, headers: I) -> Response
where
    I: IntoIterator<Item = (HeaderName, String)>,
{
    for (name, value) in headers {
        match HeaderValue::try_from(value) {
            Ok(value) => {
                response.headers_mut().insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "Dropped unencodable header value"),
        }
    }
    response
}

/// `Link` header pointing at the next page of a listing.
pub(crate) fn next_link(path: &str, n: Option<usize>, last: &str) -> (HeaderName, String) {
    let last: String = url::form_urlencoded::byte_serialize(last.as_bytes()).collect();
    let link = match n {
        Some(n) => format!("<{path}?n={n}&last={last}>; rel=\"next\""),
        None => format!("<{path}?last={last}>; rel=\"next\""),
    };
    (header::LINK, link)
}

/// An empty response with `status` and `headers`.
pub(crate) fn empty(status: StatusCode, headers: Vec<(HeaderName, String)>) -> RegistryResult<Response> {
    let response = (status, Body::empty()).into_response();
    Ok(with_headers(
        response,
        headers
            .into_iter()
            .chain([(header::CONTENT_LENGTH, "0".to_owned())]),
    ))
}
