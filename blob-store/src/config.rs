use std::sync::Arc;

#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::driver::Driver;
#[cfg(feature = "local")]
use crate::local::LocalDriver;
use crate::memory::MemoryDriver;
use crate::store::BlobStore;

/// Which driver stores registry content.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum StorageConfig {
    /// Keep everything in memory.
    #[default]
    Memory,

    /// Store under a local directory.
    #[cfg(feature = "local")]
    Local {
        /// Root directory.
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Build the configured driver.
    #[tracing::instrument]
    pub fn build(&self) -> Arc<dyn Driver> {
        match self {
            StorageConfig::Memory => Arc::new(MemoryDriver::new()),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => Arc::new(LocalDriver::new(path.clone())),
        }
    }

    /// Build a [`BlobStore`] over the configured driver.
    pub fn store(&self) -> BlobStore {
        BlobStore::new(self.build())
    }
}
