use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger backend error: {0}")]
    Backend(String),
    #[error("malformed ledger entry {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Hash-per-key store with optional expiry, shaped after the redis commands
/// the deletion ledger needs.
///
/// Writing an existing key keeps its expiry, as `HSET` does.
pub trait LedgerKv: Send + Sync + 'static {
    fn hset_all(&self, key: &str, fields: Fields) -> Result<(), LedgerError>;
    fn hgetall(&self, key: &str) -> Result<Option<Fields>, LedgerError>;
    fn del(&self, key: &str) -> Result<bool, LedgerError>;
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LedgerError>;
    /// Remaining lifetime; `None` when the key is missing or has no expiry.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, LedgerError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, LedgerError>;
}

#[derive(Debug)]
struct Entry {
    fields: Fields,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemLedgerKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemLedgerKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the map with expired entries already evicted.
    fn live(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, LedgerError> {
        let mut entries = self.entries.lock().map_err(|_| LedgerError::Poisoned)?;
        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(entries)
    }
}

impl LedgerKv for MemLedgerKv {
    fn hset_all(&self, key: &str, fields: Fields) -> Result<(), LedgerError> {
        let mut entries = self.live()?;
        match entries.get_mut(key) {
            Some(entry) => entry.fields.extend(fields),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        fields,
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<Option<Fields>, LedgerError> {
        Ok(self.live()?.get(key).map(|e| e.fields.clone()))
    }

    fn del(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.live()?.remove(key).is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LedgerError> {
        let mut entries = self.live()?;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, LedgerError> {
        let now = Instant::now();
        Ok(self
            .live()?
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, LedgerError> {
        let mut keys: Vec<String> = self
            .live()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
