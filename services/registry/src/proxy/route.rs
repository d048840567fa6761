//! Classifies `/v2` request paths.

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

use crate::access::{DELETE, PULL, PUSH};

/// What a `/v2` request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// `/v2/`
    Base,
    /// `/v2/_catalog`
    Catalog,
    /// `/v2/<name>/tags/list`
    Tags { repository: String },
    /// `/v2/<name>/manifests/<reference>`
    Manifest { repository: String, reference: String },
    /// `/v2/<name>/blobs/<digest>`
    Blob { repository: String, digest: String },
    /// `/v2/<name>/blobs/uploads/` and `/v2/<name>/blobs/uploads/<uuid>`
    Upload {
        repository: String,
        session: Option<String>,
    },
    /// `/v2/<name>/referrers/<digest>`
    Referrers { repository: String, digest: String },
    /// Anything else.
    Unknown,
}

impl Route {
    pub(crate) fn classify(path: &str) -> Route {
        let Some(rest) = path.strip_prefix("/v2") else {
            return Route::Unknown;
        };
        if !rest.is_empty() && !rest.starts_with('/') {
            return Route::Unknown;
        }
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return Route::Base;
        }
        if rest == "_catalog" {
            return Route::Catalog;
        }
        if let Some(repository) = rest.strip_suffix("/tags/list") {
            return named(repository, |repository| Route::Tags { repository });
        }
        if let Some(repository) = rest
            .strip_suffix("/blobs/uploads/")
            .or_else(|| rest.strip_suffix("/blobs/uploads"))
        {
            return named(repository, |repository| Route::Upload {
                repository,
                session: None,
            });
        }
        let Some((head, last)) = rest.rsplit_once('/') else {
            return Route::Unknown;
        };
        if last.is_empty() {
            return Route::Unknown;
        }
        let last = last.to_owned();
        if let Some(repository) = head.strip_suffix("/blobs/uploads") {
            named(repository, |repository| Route::Upload {
                repository,
                session: Some(last),
            })
        } else if let Some(repository) = head.strip_suffix("/manifests") {
            named(repository, |repository| Route::Manifest {
                repository,
                reference: last,
            })
        } else if let Some(repository) = head.strip_suffix("/blobs") {
            named(repository, |repository| Route::Blob {
                repository,
                digest: last,
            })
        } else if let Some(repository) = head.strip_suffix("/referrers") {
            named(repository, |repository| Route::Referrers {
                repository,
                digest: last,
            })
        } else {
            Route::Unknown
        }
    }

    /// Repository the route addresses.
    pub(crate) fn repository(&self) -> Option<&str> {
        match self {
            Route::Tags { repository }
            | Route::Manifest { repository, .. }
            | Route::Blob { repository, .. }
            | Route::Upload { repository, .. }
            | Route::Referrers { repository, .. } => Some(repository),
            Route::Base | Route::Catalog | Route::Unknown => None,
        }
    }

    /// Repository action `method` needs on this route.
    pub(crate) fn action(&self, method: &Method) -> Option<&'static str> {
        self.repository()?;
        let action = match (self, method) {
            (_, &Method::GET | &Method::HEAD) => PULL,
            (Route::Manifest { .. } | Route::Blob { .. }, &Method::DELETE) => DELETE,
            _ => PUSH,
        };
        Some(action)
    }
}

fn named(repository: &str, route: impl FnOnce(String) -> Route) -> Route {
    if repository.is_empty() {
        Route::Unknown
    } else {
        route(repository.to_owned())
    }
}

/// Attach the [`Route`] of the request path.
pub(crate) async fn classify(mut request: Request, next: Next) -> Response {
    let route = Route::classify(request.uri().path());
    request.extensions_mut().insert(route);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_paths() {
        assert_eq!(Route::classify("/v2/"), Route::Base);
        assert_eq!(Route::classify("/v2"), Route::Base);
        assert_eq!(Route::classify("/v2/_catalog"), Route::Catalog);
        assert_eq!(
            Route::classify("/v2/library/nginx/tags/list"),
            Route::Tags {
                repository: "library/nginx".into()
            }
        );
        assert_eq!(
            Route::classify("/v2/a/b/c/manifests/latest"),
            Route::Manifest {
                repository: "a/b/c".into(),
                reference: "latest".into()
            }
        );
        assert_eq!(
            Route::classify("/v2/lib/web/blobs/sha256:abc"),
            Route::Blob {
                repository: "lib/web".into(),
                digest: "sha256:abc".into()
            }
        );
        assert_eq!(
            Route::classify("/v2/lib/web/referrers/sha256:abc"),
            Route::Referrers {
                repository: "lib/web".into(),
                digest: "sha256:abc".into()
            }
        );
    }

    #[test]
    fn upload_paths() {
        for path in ["/v2/lib/web/blobs/uploads/", "/v2/lib/web/blobs/uploads"] {
            assert_eq!(
                Route::classify(path),
                Route::Upload {
                    repository: "lib/web".into(),
                    session: None
                }
            );
        }
        assert_eq!(
            Route::classify("/v2/lib/web/blobs/uploads/1234"),
            Route::Upload {
                repository: "lib/web".into(),
                session: Some("1234".into())
            }
        );
    }

    #[test]
    fn unknown_paths() {
        for path in ["/v2x", "/api/v2.0/projects", "/v2/lib/web", "/v2/manifests/latest", "/v2/lib/web/manifests/"] {
            assert_eq!(Route::classify(path), Route::Unknown, "{path}");
        }
    }

    #[test]
    fn actions() {
        let manifest = Route::classify("/v2/lib/web/manifests/latest");
        assert_eq!(manifest.action(&Method::HEAD), Some(PULL));
        assert_eq!(manifest.action(&Method::PUT), Some(PUSH));
        assert_eq!(manifest.action(&Method::DELETE), Some(DELETE));
        let upload = Route::classify("/v2/lib/web/blobs/uploads/1234");
        assert_eq!(upload.action(&Method::DELETE), Some(PUSH));
        assert_eq!(Route::Catalog.action(&Method::GET), None);
    }
}
