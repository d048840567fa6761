//! In-process stand-in for a remote registry.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;

use crate::error::ClientError;
use crate::transport::{collect, full, Body, Transport};

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Method.
    pub method: Method,
    /// Full URI, including the query.
    pub uri: Uri,
    /// Headers.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Value of a query parameter.
    pub fn query(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.uri.query().unwrap_or_default().as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Value of a header, as a string.
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl MockResponse {
    /// A response with `status` and no body.
    pub fn new(status: StatusCode) -> Self {
        MockResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// `200 OK`.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Add a header.
    ///
    /// # Panics
    ///
    /// If `name` or `value` is not valid in a header.
    pub fn header(mut self, name: &str, value: impl AsRef<str>) -> Self {
        let name = http::HeaderName::from_bytes(name.as_bytes()).expect("mock header name");
        let value = value.as_ref().parse().expect("mock header value");
        self.headers.append(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON body.
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("content-type", "application/json")
            .body(value.to_string())
    }
}

type Handler = Arc<dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> bool {
        if &self.method != method {
            return false;
        }
        match self.path.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.path == path,
        }
    }
}

/// [`Transport`] answering from a table of routes keyed by method and path.
///
/// A path ending in `*` matches any path with that prefix. Later routes take
/// precedence, so a test can override a default. Unmatched requests get a
/// Distribution style `404`.
#[derive(Default, Clone)]
pub struct MockTransport {
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("routes", &self.routes.lock().len())
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}

impl MockTransport {
    /// A mock with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method path` with a fixed response.
    pub fn respond(&self, method: Method, path: &str, response: MockResponse) -> &Self {
        self.on(method, path, move |_| response.clone())
    }

    /// Answer `method path` by calling `handler`.
    pub fn on<F>(&self, method: Method, path: &str, handler: F) -> &Self
    where
        F: Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
    {
        self.routes.lock().push(Route {
            method,
            path: path.to_owned(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Requests received for `method path`.
    pub fn requests_to(&self, method: &Method, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| &request.method == method && request.uri.path() == path)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>, ClientError> {
        let (parts, body) = request.into_parts();
        let recorded = RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: collect(body).await?,
        };
        self.requests.lock().push(recorded.clone());

        let handler = self
            .routes
            .lock()
            .iter()
            .rev()
            .find(|route| route.matches(&recorded.method, recorded.uri.path()))
            .map(|route| route.handler.clone());

        let response = match handler {
            Some(handler) => handler(&recorded),
            None => MockResponse::new(StatusCode::NOT_FOUND).json(&serde_json::json!({
                "errors": [{"code": "NOT_FOUND", "message": format!("no route for {}", recorded.uri.path())}]
            })),
        };

        let mut builder = http::Response::builder().status(response.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(response.headers);
        }
        builder
            .body(full(response.body))
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::empty;

    #[tokio::test]
    async fn later_routes_win_and_requests_are_recorded() {
        let mock = MockTransport::new();
        mock.respond(Method::GET, "/v2/*", MockResponse::new(StatusCode::UNAUTHORIZED));
        mock.respond(Method::GET, "/v2/", MockResponse::ok().body("{}"));

        let request = http::Request::get("https://registry.test/v2/?n=1")
            .body(empty())
            .unwrap();
        let response = mock.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = http::Request::get("https://registry.test/v2/library/tags/list")
            .body(empty())
            .unwrap();
        let response = mock.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query("n").as_deref(), Some("1"));
    }
}
