//! Archive of reset sessions
//!
//! `reset` starts a fresh session; the discarded one lands here together
//! with a digest of its transcript so later tampering is detectable.

use crate::conversation::Session;
use crate::models::{SessionStatus, Turn};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub final_status: SessionStatus,
    pub corrupted: bool,
    pub turns: Arc<Vec<Turn>>,
    pub transcript_hash: String,
}

const DEFAULT_CAPACITY: usize = 1000;

/// In-memory archive storage, bounded; the oldest record goes first
pub struct SessionArchive {
    records: Arc<RwLock<HashMap<Uuid, ArchivedSession>>>,
    capacity: usize,
}

impl SessionArchive {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Archive a session, returning its id
    pub async fn store(&self, session: Session) -> Result<Uuid> {
        let turns = session.snapshot();
        let record = ArchivedSession {
            session_id: session.id(),
            started_at: session.created_at(),
            archived_at: Utc::now(),
            final_status: session.status(),
            corrupted: session.is_corrupted(),
            transcript_hash: compute_transcript_hash(&turns),
            turns: Arc::new(turns),
        };

        let session_id = record.session_id;
        let mut records = self.records.write().await;
        records.insert(session_id, record);

        while records.len() > self.capacity {
            let oldest = records
                .values()
                .filter(|r| r.session_id != session_id)
                .min_by_key(|r| r.archived_at)
                .map(|r| r.session_id);
            match oldest {
                Some(id) => {
                    debug!(session_id = %id, "Archive full, dropping oldest session");
                    records.remove(&id);
                }
                None => break,
            }
        }

        Ok(session_id)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Option<ArchivedSession>> {
        let records = self.records.read().await;
        Ok(records.get(&session_id).cloned())
    }

    /// Archived session ids, oldest first
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .values()
            .map(|record| (record.session_id, record.archived_at))
            .collect();
        items.sort_by_key(|(_, archived_at)| *archived_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Verify a record's transcript still matches its hash
    pub async fn verify_integrity(&self, session_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        if let Some(record) = records.get(&session_id) {
            Ok(compute_transcript_hash(&record.turns) == record.transcript_hash)
        } else {
            Ok(false)
        }
    }
}

impl Default for SessionArchive {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA256 of the serialized transcript, streamed straight into the hasher
pub fn compute_transcript_hash(turns: &[Turn]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), turns).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
