//! # Replication
//!
//! Copies artifacts between the local registry and remote registries.
//!
//! A [`ReplicationEngine`] runs stored policies: it lists the source through
//! an [`Adapter`], narrows the listing with the policy's filters, plans one
//! task per artifact reference and runs the tasks on a [`JobExecutor`].
//! Policies start by hand, from a cron [`Scheduler`], or from registry
//! events through the [`EventTrigger`].

pub mod adapter;
mod engine;
pub mod executor;
pub mod filter;
pub mod plan;
mod scheduler;
mod throttle;
pub mod transfer;
mod trigger;

pub use self::adapter::{Adapter, AdapterInfo, AdapterRegistry, Health, MemoryAdapter, Resource};
pub use self::engine::{EngineBuilder, ReplicationEngine};
pub use self::executor::{Job, JobExecutor, WorkerPool};
pub use self::scheduler::{parse_cron, spawn_cron, Scheduler};
pub use self::throttle::throttle;
pub use self::trigger::{resource_of, EventTrigger};
