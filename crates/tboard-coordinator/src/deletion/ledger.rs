//! Deletion progress ledger on top of a [`LedgerKv`].
//!
//! Active tickets live under `run:delete:{id}`, tickets whose deletion gave up
//! under `run:delete_failed:{id}`. A run has at most one of the two.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tboard_core::deletion::{DeletionState, DeletionTicket, FailedDeletionTicket};
use tboard_core::types::RunId;
use tboard_store::kv::Fields;
use tboard_store::{LedgerError, LedgerKv};

pub const ACTIVE_PREFIX: &str = "run:delete:";
pub const FAILED_PREFIX: &str = "run:delete_failed:";

pub fn active_key(run_id: RunId) -> String {
    format!("{ACTIVE_PREFIX}{run_id}")
}

pub fn failed_key(run_id: RunId) -> String {
    format!("{FAILED_PREFIX}{run_id}")
}

/// Everything a ledger subscriber needs to render the deletion view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    /// Newest first; ties put `DELETING` ahead of `TO_DELETE` ahead of `DELETED`.
    pub active: Vec<DeletionTicket>,
    /// Newest first.
    pub failed: Vec<FailedDeletionTicket>,
}

#[derive(Clone)]
pub struct DeletionLedger {
    kv: Arc<dyn LedgerKv>,
}

impl DeletionLedger {
    pub fn new(kv: Arc<dyn LedgerKv>) -> Self {
        Self { kv }
    }

    pub fn put(&self, ticket: &DeletionTicket) -> Result<(), LedgerError> {
        let mut fields = common_fields(
            ticket.run_id,
            &ticket.name,
            ticket.created_at_ms,
            ticket.success_ratio,
            &ticket.owner,
            ticket.record_time_ms,
        );
        fields.insert("state".to_string(), ticket.state.as_str().to_string());
        self.kv.hset_all(&active_key(ticket.run_id), fields)
    }

    pub fn get(&self, run_id: RunId) -> Result<Option<DeletionTicket>, LedgerError> {
        let key = active_key(run_id);
        self.kv
            .hgetall(&key)?
            .map(|fields| parse_active(&key, &fields))
            .transpose()
    }

    pub fn expire(&self, run_id: RunId, ttl: Duration) -> Result<bool, LedgerError> {
        self.kv.expire(&active_key(run_id), ttl)
    }

    /// Replaces the active ticket with a failed one. The failed entry is
    /// written first so the run never vanishes from the ledger.
    pub fn move_to_failed(&self, ticket: &FailedDeletionTicket) -> Result<(), LedgerError> {
        let fields = common_fields(
            ticket.run_id,
            &ticket.name,
            ticket.created_at_ms,
            ticket.success_ratio,
            &ticket.owner,
            ticket.record_time_ms,
        );
        self.kv.hset_all(&failed_key(ticket.run_id), fields)?;
        self.kv.del(&active_key(ticket.run_id))?;
        Ok(())
    }

    pub fn get_failed(&self, run_id: RunId) -> Result<Option<FailedDeletionTicket>, LedgerError> {
        let key = failed_key(run_id);
        self.kv
            .hgetall(&key)?
            .map(|fields| parse_failed(&key, &fields))
            .transpose()
    }

    pub fn remove_failed(&self, run_id: RunId) -> Result<bool, LedgerError> {
        self.kv.del(&failed_key(run_id))
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let mut active = Vec::new();
        for key in self.kv.keys_with_prefix(ACTIVE_PREFIX)? {
            if let Some(fields) = self.kv.hgetall(&key)? {
                active.push(parse_active(&key, &fields)?);
            }
        }
        let mut failed = Vec::new();
        for key in self.kv.keys_with_prefix(FAILED_PREFIX)? {
            if let Some(fields) = self.kv.hgetall(&key)? {
                failed.push(parse_failed(&key, &fields)?);
            }
        }
        active.sort_by_key(|t| (Reverse(t.record_time_ms), t.state.priority(), t.run_id));
        failed.sort_by_key(|t| (Reverse(t.record_time_ms), t.run_id));
        Ok(LedgerSnapshot { active, failed })
    }
}

fn common_fields(
    run_id: RunId,
    name: &str,
    created_at_ms: u64,
    success_ratio: Option<f64>,
    owner: &str,
    record_time_ms: u64,
) -> Fields {
    let mut fields = Fields::new();
    fields.insert("id".to_string(), run_id.to_string());
    fields.insert("name".to_string(), name.to_string());
    fields.insert("created_at".to_string(), created_at_ms.to_string());
    fields.insert(
        "success_ratio".to_string(),
        success_ratio.map(|r| r.to_string()).unwrap_or_default(),
    );
    fields.insert("owner".to_string(), owner.to_string());
    fields.insert("record_time".to_string(), record_time_ms.to_string());
    fields
}

fn field<'a>(key: &str, fields: &'a Fields, name: &str) -> Result<&'a str, LedgerError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| LedgerError::Malformed {
            key: key.to_string(),
            reason: format!("missing field {name}"),
        })
}

fn number(key: &str, fields: &Fields, name: &str) -> Result<u64, LedgerError> {
    field(key, fields, name)?
        .parse()
        .map_err(|e| LedgerError::Malformed {
            key: key.to_string(),
            reason: format!("{name}: {e}"),
        })
}

fn ratio(key: &str, fields: &Fields) -> Result<Option<f64>, LedgerError> {
    let raw = field(key, fields, "success_ratio")?;
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|e| LedgerError::Malformed {
        key: key.to_string(),
        reason: format!("success_ratio: {e}"),
    })
}

fn parse_active(key: &str, fields: &Fields) -> Result<DeletionTicket, LedgerError> {
    let state: DeletionState =
        field(key, fields, "state")?
            .parse()
            .map_err(|e| LedgerError::Malformed {
                key: key.to_string(),
                reason: format!("{e}"),
            })?;
    Ok(DeletionTicket {
        run_id: RunId(number(key, fields, "id")?),
        name: field(key, fields, "name")?.to_string(),
        created_at_ms: number(key, fields, "created_at")?,
        success_ratio: ratio(key, fields)?,
        owner: field(key, fields, "owner")?.to_string(),
        state,
        record_time_ms: number(key, fields, "record_time")?,
    })
}

fn parse_failed(key: &str, fields: &Fields) -> Result<FailedDeletionTicket, LedgerError> {
    Ok(FailedDeletionTicket {
        run_id: RunId(number(key, fields, "id")?),
        name: field(key, fields, "name")?.to_string(),
        created_at_ms: number(key, fields, "created_at")?,
        success_ratio: ratio(key, fields)?,
        owner: field(key, fields, "owner")?.to_string(),
        record_time_ms: number(key, fields, "record_time")?,
    })
}
