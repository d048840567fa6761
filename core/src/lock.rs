//! Per-artifact locks serialising artifact graph mutations.
//!
//! Locks are keyed by `sha256(repo|digest)`. Holders of several locks take
//! them in digest-lexicographic order.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest as _, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::digest::Digest;

type Key = [u8; 32];

fn key(repository: &str, digest: &Digest) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(repository.as_bytes());
    hasher.update(b"|");
    hasher.update(digest.to_string().as_bytes());
    hasher.finalize().into()
}

/// Process-wide table of per-digest async mutexes.
#[derive(Clone, Default)]
pub struct DigestLocks {
    locks: Arc<DashMap<Key, Arc<Mutex<()>>>>,
}

impl fmt::Debug for DigestLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestLocks")
            .field("held", &self.locks.len())
            .finish()
    }
}

impl DigestLocks {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a single artifact.
    pub async fn lock(&self, repository: &str, digest: &Digest) -> DigestGuard {
        let key = key(repository, digest);
        let mutex = self.locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        DigestGuard {
            key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Lock several artifacts of one repository in digest order.
    pub async fn lock_many<'a, I>(&self, repository: &str, digests: I) -> Vec<DigestGuard>
    where
        I: IntoIterator<Item = &'a Digest>,
    {
        let mut ordered: Vec<&Digest> = digests.into_iter().collect();
        ordered.sort_by_key(|d| d.to_string());
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for digest in ordered {
            guards.push(self.lock(repository, digest).await);
        }
        guards
    }

    /// Number of lock entries currently allocated.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no locks are allocated.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock; released on drop.
pub struct DigestGuard {
    key: Key,
    locks: Arc<DashMap<Key, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for DigestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestGuard")
            .field("key", &hex::encode(self.key))
            .finish()
    }
}

impl Drop for DigestGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table itself still references the mutex: nobody waits on it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_digest_is_exclusive() {
        let locks = DigestLocks::new();
        let digest = Digest::sha256(b"a");

        let first = locks.lock("p/r", &digest).await;
        let contender = {
            let locks = locks.clone();
            let digest = digest.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("p/r", &digest).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(first);
        contender.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_repositories_do_not_contend() {
        let locks = DigestLocks::new();
        let digest = Digest::sha256(b"a");
        let _a = locks.lock("p/a", &digest).await;
        let _b = locks.lock("p/b", &digest).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn lock_many_dedups() {
        let locks = DigestLocks::new();
        let a = Digest::sha256(b"a");
        let b = Digest::sha256(b"b");
        let guards = locks.lock_many("p/r", [&b, &a, &b]).await;
        assert_eq!(guards.len(), 2);
    }
}
