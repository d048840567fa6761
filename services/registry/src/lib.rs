//! # Harbor registry
//!
//! The request-facing half of the registry access plane: the token service,
//! the Distribution v2 proxy, the artifact controller, the policy gates and
//! the `/api/v2.0` management routes.
//!
//! ## Example
//!
//! ```no_run
//! use harbor_registry::{Config, RegistryBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new(Config::default()).build()?;
//! registry.start().await?;
//! let app = registry.router();
//!
//! // Use the router with axum or any tower-compatible server
//! # drop(app);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
mod management;
mod middleware;
pub mod policy;
mod proxy;
pub mod token;

pub use api::{Registry, RegistryBuilder};
pub use config::Config;
pub use error::{RegistryError, RegistryResult};
