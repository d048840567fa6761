//! Entities of the registry access plane.
//!
//! Rows reference each other by id or digest, never by pointer: the
//! artifact graph is an arena of rows plus edge tables.

mod artifact;
mod hook;
mod policy;
mod project;
mod replication;

pub use self::artifact::*;
pub use self::hook::*;
pub use self::policy::*;
pub use self::project::*;
pub use self::replication::*;
