//! Sending requests.
//!
//! [`Transport`] is the seam between the registry client and the network:
//! [`ReqwestTransport`] talks HTTP, [`crate::mock::MockTransport`] answers
//! from a route table.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, TryStreamExt as _};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Empty, Full, StreamBody};

use crate::error::{BoxError, ClientError};

/// Request and response body.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// A body holding `bytes`.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body with no content.
pub fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// A body streaming `stream`.
pub fn stream<S, E>(stream: S) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    StreamBody::new(
        stream
            .map_ok(Frame::data)
            .map_err(|err: E| -> BoxError { err.into() }),
    )
    .boxed_unsync()
}

/// Collect a body into memory.
pub async fn collect(body: Body) -> Result<Bytes, ClientError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(ClientError::Transport)
}

/// Sends one HTTP request.
#[async_trait::async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Send `request` and return the response head with a streaming body.
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>, ClientError>;
}

/// [`Transport`] over a `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// A transport verifying TLS unless `insecure`.
    pub fn new(insecure: bool, connect_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("harbor-registry-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ClientError::Transport(Box::new(err)))?;
        Ok(ReqwestTransport { client })
    }
}

fn classify(error: reqwest::Error) -> ClientError {
    if error.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Transport(Box::new(error))
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>, ClientError> {
        let (parts, body) = request.into_parts();
        let explicit_length = parts.headers.contains_key(http::header::CONTENT_LENGTH);
        let mut builder = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers);

        match http_body::Body::size_hint(&body).exact() {
            Some(0) if !explicit_length => {}
            Some(length) if !explicit_length => {
                builder = builder
                    .header(http::header::CONTENT_LENGTH, length)
                    .body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
            _ => {
                builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
        }

        let response = builder.send().await.map_err(classify)?;
        let response: http::Response<reqwest::Body> = response.into();
        Ok(response.map(|body| body.map_err(|err| Box::new(err) as BoxError).boxed_unsync()))
    }
}
