//! Hash-chained action journal for runtime events.
//!
//! Every decision the runtime makes (privacy filtering, planning, skill
//! outcomes, cache traffic, alerts) lands here as a [`JournalEntry`] whose
//! SHA-256 hash covers the canonical JSON of the entry and the previous
//! entry's hash. Tampering with any persisted entry breaks `verify()`.
//!
//! Appends also fan out over a broadcast channel so chain followers (chat
//! streaming, dashboards) can subscribe without blocking the writer; a slow
//! subscriber loses the oldest buffered entries, never the runtime.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Hash of the (non-existent) entry before index 0.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Buffered entries per subscriber before the oldest are dropped.
const CHAIN_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("journal integrity failure at index {index}: stored hash does not match recomputed hash")]
    Integrity { index: u64 },
    #[error("journal chain broken at index {index}: prev_hash does not match preceding entry")]
    ChainBroken { index: u64 },
}

mod canonical_time {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Single signed event inside the action journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub index: u64,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(with = "canonical_time")]
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl JournalEntry {
    fn new(index: u64, event: &str, payload: serde_json::Value, prev_hash: String) -> Self {
        let mut entry = Self {
            index,
            event: event.to_string(),
            payload,
            timestamp: Utc::now(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// SHA-256 over the canonical JSON of the 5-field record.
    ///
    /// Canonical form: object keys deeply sorted (the default `serde_json`
    /// map representation), timestamps as RFC 3339 strings with microsecond
    /// precision, numbers and booleans in their JSON forms.
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "index": self.index,
            "event": self.event,
            "payload": self.payload,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "prev_hash": self.prev_hash,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Maintains the hash-chained log of runtime decisions.
///
/// The entry list sits behind a mutex so components holding an
/// `Arc<ActionJournal>` (sandbox, IoT bridge, skill store) can append from
/// `&self`; the index remains dense because assignment happens under the
/// same lock (single-writer discipline).
#[derive(Debug)]
pub struct ActionJournal {
    entries: Mutex<Vec<JournalEntry>>,
    chain_tx: broadcast::Sender<JournalEntry>,
}

impl Default for ActionJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionJournal {
    pub fn new() -> Self {
        let (chain_tx, _) = broadcast::channel(CHAIN_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(Vec::new()),
            chain_tx,
        }
    }

    /// Appends an event. Infallible: only local state is touched.
    pub fn append(&self, event: &str, payload: serde_json::Value) -> JournalEntry {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let prev_hash = entries
            .last()
            .map(|entry| entry.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let entry = JournalEntry::new(entries.len() as u64, event, payload, prev_hash);
        entries.push(entry.clone());
        drop(entries);
        tracing::debug!(target: "kolibri::journal", event = %event, index = entry.index, "journal append");
        // Non-blocking fan-out; no subscribers is fine.
        let _ = self.chain_tx.send(entry.clone());
        entry
    }

    /// Subscribes to the live chain. Lagging receivers drop the oldest
    /// buffered entries rather than back-pressuring the writer.
    pub fn subscribe(&self) -> broadcast::Receiver<JournalEntry> {
        self.chain_tx.subscribe()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<JournalEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].to_vec()
    }

    /// Verifies the full hash chain for tamper detection.
    pub fn verify(&self) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut prev_hash = GENESIS_HASH.to_string();
        for entry in entries.iter() {
            if entry.prev_hash != prev_hash {
                return false;
            }
            if entry.compute_hash() != entry.hash {
                return false;
            }
            prev_hash = entry.hash.clone();
        }
        true
    }

    /// Best-effort JSONL persistence with parent-directory creation.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), JournalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Loads a persisted chain, rejecting the file on any hash mismatch.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut entries: Vec<JournalEntry> = Vec::new();
        let mut prev_hash = GENESIS_HASH.to_string();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let entry: JournalEntry = serde_json::from_str(line)?;
            if entry.prev_hash != prev_hash {
                return Err(JournalError::ChainBroken { index: entry.index });
            }
            if entry.compute_hash() != entry.hash {
                return Err(JournalError::Integrity { index: entry.index });
            }
            prev_hash = entry.hash.clone();
            entries.push(entry);
        }
        let journal = Self::new();
        *journal.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries;
        Ok(journal)
    }

    pub fn to_json(&self) -> Result<String, JournalError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(serde_json::to_string_pretty(&*entries)?)
    }
}
