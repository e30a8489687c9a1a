//! Append-only audit trail of workflow transitions
//!
//! One event per transition (plus one per logically-skipped stage on the
//! streamlined path). Events are written inside the same transaction as
//! the transition itself, so a failed transition leaves zero events.
//! Each event's public id is the sha256 of its encoded body; replaying a
//! stale one-time action link can be checked against the recorded chain.
use std::sync::Arc;

use chrono::Utc;
use sled::Db;
use sled::transaction::TransactionalTree;

use crate::error::WorkflowError;
use crate::store::{self, TxResult, abort, keys};
use crate::types::{Action, RequestStatus, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    #[n(0)]
    pub seq: u64,
    /// sha256 over the encoded event body. Serves as the public event id
    /// returned to callers.
    #[n(1)]
    pub event_hash: String,
    #[n(2)]
    pub request_id: String,
    #[n(3)]
    pub action: Action,
    /// None for the creation event.
    #[n(4)]
    pub from_status: Option<RequestStatus>,
    #[n(5)]
    pub to_status: RequestStatus,
    #[n(6)]
    pub actor: String,
    #[n(7)]
    pub at: TimeStamp<Utc>,
    #[n(8)]
    pub notes: Option<String>,
    /// True for the stages a streamlined creation logically skipped.
    #[n(9)]
    pub synthetic: bool,
}

/// Append one event. The sequence number and content hash are assigned
/// here; the caller provides everything else.
pub(crate) fn tx_append_event(
    tree: &TransactionalTree,
    request_id: &str,
    action: Action,
    from_status: Option<RequestStatus>,
    to_status: RequestStatus,
    actor: &str,
    at: &TimeStamp<Utc>,
    notes: Option<String>,
    synthetic: bool,
) -> TxResult<AuditEvent> {
    let seq = store::tx_next_seq(tree, keys::AUDIT_SEQ)?;
    let mut event = AuditEvent {
        seq,
        event_hash: String::new(),
        request_id: request_id.to_string(),
        action,
        from_status,
        to_status,
        actor: actor.to_string(),
        at: at.clone(),
        notes,
        synthetic,
    };
    let body =
        minicbor::to_vec(&event).map_err(|e| abort(WorkflowError::Storage(e.to_string())))?;
    event.event_hash = sha256::digest(&body);
    store::tx_put(tree, keys::audit(seq), &event)?;
    Ok(event)
}

/// Read access to the trail. Append goes through `tx_append_event` only,
/// inside a workflow transaction; nothing here mutates.
pub struct AuditLog {
    db: Arc<Db>,
}

impl AuditLog {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Every event ever written, in append order.
    pub fn all(&self) -> Result<Vec<AuditEvent>, WorkflowError> {
        store::scan_prefix(&self.db, keys::AUDIT_PREFIX)
    }

    /// The full chain for one request, in append order. This is the
    /// maker-verifier-authorizer history a reviewer reconstructs.
    pub fn events_for(&self, request_id: &str) -> Result<Vec<AuditEvent>, WorkflowError> {
        let all = self.all()?;
        Ok(all
            .into_iter()
            .filter(|e| e.request_id == request_id)
            .collect())
    }

    /// Look an event up by its public hash id.
    pub fn find_by_hash(&self, event_hash: &str) -> Result<Option<AuditEvent>, WorkflowError> {
        let all = self.all()?;
        Ok(all.into_iter().find(|e| e.event_hash == event_hash))
    }
}
