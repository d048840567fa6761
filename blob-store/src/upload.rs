//! Chunked blob upload sessions.
//!
//! A session moves `Init → Open → Closing → Committed | Aborted`. Appends are
//! only accepted while `Open`; completing hashes everything received and
//! either commits the bytes as a blob or aborts the session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use harbor_core::digest::{Algorithm, Hasher};
use harbor_core::Digest;
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadState {
    /// Allocated, storage not yet prepared.
    Init,
    /// Accepting chunks.
    Open,
    /// Verifying the final digest.
    Closing,
    /// Bytes committed as a blob.
    Committed,
    /// Cancelled or failed verification.
    Aborted,
}

impl UploadState {
    /// Whether the session can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Committed | UploadState::Aborted)
    }
}

/// Externally visible view of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSession {
    /// Session id, used in the `Location` URL.
    pub id: Uuid,
    /// Repository the upload targets.
    pub repository: String,
    /// State.
    pub state: UploadState,
    /// Bytes received so far.
    pub offset: u64,
    /// When the session was opened.
    pub started: DateTime<Utc>,
    /// Digest of the committed blob.
    pub digest: Option<Digest>,
}

/// Result of committing an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Blob digest.
    pub digest: Digest,
    /// Blob size.
    pub size: u64,
    /// Whether this call performed the commit, as opposed to repeating an
    /// earlier one.
    pub fresh: bool,
}

#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) session: UploadSession,
    pub(crate) hasher: Hasher,
}

pub(crate) type SharedEntry = Arc<tokio::sync::Mutex<SessionEntry>>;

/// How long finished sessions are remembered for idempotent retries.
const KEEP_FINISHED: i64 = 60 * 60;

#[derive(Debug, Default)]
pub(crate) struct Sessions {
    entries: parking_lot::Mutex<HashMap<Uuid, SharedEntry>>,
}

impl Sessions {
    pub(crate) fn open(&self, repository: &str) -> SharedEntry {
        let id = Uuid::new_v4();
        let session = UploadSession {
            id,
            repository: repository.to_owned(),
            state: UploadState::Init,
            offset: 0,
            started: Utc::now(),
            digest: None,
        };
        let entry = Arc::new(tokio::sync::Mutex::new(SessionEntry {
            session,
            // Uploads completing with a sha512 digest are re-hashed.
            hasher: Hasher::new(Algorithm::Sha256),
        }));

        let mut entries = self.entries.lock();
        self.expire(&mut entries);
        entries.insert(id, entry.clone());
        entry
    }

    pub(crate) fn get(&self, id: &Uuid) -> Option<SharedEntry> {
        self.entries.lock().get(id).cloned()
    }

    fn expire(&self, entries: &mut HashMap<Uuid, SharedEntry>) {
        let cutoff = Utc::now() - Duration::seconds(KEEP_FINISHED);
        entries.retain(|_, entry| match entry.try_lock() {
            Ok(guard) => !(guard.session.state.is_terminal() && guard.session.started < cutoff),
            Err(_) => true,
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
