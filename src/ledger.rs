//! Quantity ledger: reservations, deductions, restorations
//!
//! Every quantity change is an immutable `LedgerEntry`; the materialized
//! `InventoryItem` counters are updated in the same transaction that
//! appends the entry, so the sum of entry deltas always equals the
//! counters. Availability is re-read inside the transaction at call time,
//! never trusted from the caller, which is what keeps concurrent
//! reservations from overselling.
use std::sync::Arc;

use chrono::Utc;
use sled::Db;
use sled::transaction::TransactionalTree;

use crate::error::WorkflowError;
use crate::request::{InventoryItem, LineItem, WorkflowRequest};
use crate::store::{self, TxResult, abort, keys};
use crate::types::{ReturnCondition, TimeStamp};

/// Why a ledger entry exists.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerReason {
    /// Stock arriving at the warehouse.
    #[n(0)]
    StockReceipt,
    /// Quantity earmarked for a request; physical stock untouched.
    #[n(1)]
    Reserve,
    /// Reservation converted into stock leaving the shelf.
    #[n(2)]
    ReleaseDeduct,
    /// Returned stock going back on the shelf.
    #[n(3)]
    Restore,
    /// Zero-delta record for lost/damaged/consumed stock: the deduction
    /// is permanent but the trail stays complete.
    #[n(4)]
    WriteOff,
    /// Reservation released without ever being deducted.
    #[n(5)]
    CancelReservation,
}

/// Immutable record of one quantity movement. `on_hand_delta` sums to the
/// item's physical count, `reserved_delta` to its reservation total.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub item_ref: String,
    #[n(2)]
    pub on_hand_delta: i64,
    #[n(3)]
    pub reserved_delta: i64,
    #[n(4)]
    pub reason: LedgerReason,
    #[n(5)]
    pub request_id: Option<String>,
    #[n(6)]
    pub line_id: Option<String>,
    #[n(7)]
    pub at: TimeStamp<Utc>,
}

/// Outcome of an idempotent deduct call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Applied,
    /// Second call for the same line: no-op, no new entry.
    AlreadyDeducted,
}

/// Outcome of an idempotent restore call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Applied,
    /// Line already reported back (or never deducted): no-op.
    NothingToRestore,
}

fn tx_load_item(tree: &TransactionalTree, item_ref: &str) -> TxResult<InventoryItem> {
    store::tx_get(tree, &keys::item(item_ref))?
        .ok_or_else(|| abort(WorkflowError::NotFound(format!("inventory item {item_ref}"))))
}

fn tx_append_entry(tree: &TransactionalTree, mut entry: LedgerEntry) -> TxResult<u64> {
    let seq = store::tx_next_seq(tree, keys::LEDGER_SEQ)?;
    entry.seq = seq;
    store::tx_put(tree, keys::ledger(seq), &entry)?;
    tracing::debug!(
        item = %entry.item_ref,
        reason = ?entry.reason,
        on_hand_delta = entry.on_hand_delta,
        reserved_delta = entry.reserved_delta,
        "ledger entry appended"
    );
    Ok(seq)
}

/// Reserve `qty` against live headroom. Aborts the surrounding
/// transaction with `InsufficientQuantity` when headroom is short.
pub(crate) fn tx_reserve(
    tree: &TransactionalTree,
    item_ref: &str,
    qty: u32,
    request_id: &str,
    line_id: Option<&str>,
    at: &TimeStamp<Utc>,
) -> TxResult<()> {
    let mut item = tx_load_item(tree, item_ref)?;
    if u64::from(qty) > item.headroom() {
        return Err(abort(WorkflowError::InsufficientQuantity {
            item: item_ref.to_string(),
            requested: u64::from(qty),
            available: item.headroom(),
        }));
    }
    item.reserved += u64::from(qty);
    store::tx_put(tree, keys::item(item_ref), &item)?;
    tx_append_entry(
        tree,
        LedgerEntry {
            seq: 0,
            item_ref: item_ref.to_string(),
            on_hand_delta: 0,
            reserved_delta: i64::from(qty),
            reason: LedgerReason::Reserve,
            request_id: Some(request_id.to_string()),
            line_id: line_id.map(str::to_string),
            at: at.clone(),
        },
    )?;
    Ok(())
}

/// Convert a line's reservation into a physical deduction. Idempotent:
/// a line that already deducted is a no-op with no new entry.
pub(crate) fn tx_deduct(
    tree: &TransactionalTree,
    line: &mut LineItem,
    qty: u32,
    request_id: &str,
    at: &TimeStamp<Utc>,
) -> TxResult<DeductOutcome> {
    if line.quantity_deducted > 0 {
        return Ok(DeductOutcome::AlreadyDeducted);
    }
    if qty > line.quantity_reserved {
        return Err(abort(WorkflowError::InsufficientQuantity {
            item: line.item_ref.clone(),
            requested: u64::from(qty),
            available: u64::from(line.quantity_reserved),
        }));
    }

    let mut item = tx_load_item(tree, &line.item_ref)?;
    item.on_hand = item.on_hand.saturating_sub(u64::from(qty));
    item.reserved = item.reserved.saturating_sub(u64::from(qty));
    store::tx_put(tree, keys::item(&line.item_ref), &item)?;

    line.quantity_deducted = qty;
    line.quantity_reserved -= qty;

    tx_append_entry(
        tree,
        LedgerEntry {
            seq: 0,
            item_ref: line.item_ref.clone(),
            on_hand_delta: -i64::from(qty),
            reserved_delta: -i64::from(qty),
            reason: LedgerReason::ReleaseDeduct,
            request_id: Some(request_id.to_string()),
            line_id: Some(line.line_id.clone()),
            at: at.clone(),
        },
    )?;
    Ok(DeductOutcome::Applied)
}

/// Close a line out with its return condition. Good condition puts the
/// quantity back on the shelf; Damaged/Lost/Consumed restore nothing but
/// still write a zero-delta entry. Idempotent per line.
pub(crate) fn tx_restore(
    tree: &TransactionalTree,
    line: &mut LineItem,
    qty: u32,
    condition: ReturnCondition,
    request_id: &str,
    at: &TimeStamp<Utc>,
) -> TxResult<RestoreOutcome> {
    if line.quantity_deducted == 0 || line.return_condition.is_some() {
        return Ok(RestoreOutcome::NothingToRestore);
    }
    if qty > line.outstanding() {
        return Err(abort(WorkflowError::Validation(format!(
            "cannot return {qty} of line {}: only {} outstanding",
            line.line_id,
            line.outstanding()
        ))));
    }

    let restored = if condition.restores_stock() { qty } else { 0 };
    if restored > 0 {
        let mut item = tx_load_item(tree, &line.item_ref)?;
        item.on_hand += u64::from(restored);
        store::tx_put(tree, keys::item(&line.item_ref), &item)?;
    }

    line.quantity_returned += qty;
    line.return_condition = Some(condition);

    tx_append_entry(
        tree,
        LedgerEntry {
            seq: 0,
            item_ref: line.item_ref.clone(),
            on_hand_delta: i64::from(restored),
            reserved_delta: 0,
            reason: if restored > 0 {
                LedgerReason::Restore
            } else {
                LedgerReason::WriteOff
            },
            request_id: Some(request_id.to_string()),
            line_id: Some(line.line_id.clone()),
            at: at.clone(),
        },
    )?;
    Ok(RestoreOutcome::Applied)
}

/// Release a line's reservation that never became a deduction. Returns
/// the quantity freed (zero for a no-op).
pub(crate) fn tx_cancel_reservation(
    tree: &TransactionalTree,
    line: &mut LineItem,
    request_id: &str,
    at: &TimeStamp<Utc>,
) -> TxResult<u32> {
    let freed = line.quantity_reserved;
    if freed == 0 {
        return Ok(0);
    }

    let mut item = tx_load_item(tree, &line.item_ref)?;
    item.reserved = item.reserved.saturating_sub(u64::from(freed));
    store::tx_put(tree, keys::item(&line.item_ref), &item)?;

    line.quantity_reserved = 0;

    tx_append_entry(
        tree,
        LedgerEntry {
            seq: 0,
            item_ref: line.item_ref.clone(),
            on_hand_delta: 0,
            reserved_delta: -i64::from(freed),
            reason: LedgerReason::CancelReservation,
            request_id: Some(request_id.to_string()),
            line_id: Some(line.line_id.clone()),
            at: at.clone(),
        },
    )?;
    Ok(freed)
}

/// Put everything still out in the field back on the shelf (supervisory
/// cancel after release). Returns the quantity restored.
pub(crate) fn tx_restore_outstanding(
    tree: &TransactionalTree,
    line: &mut LineItem,
    request_id: &str,
    at: &TimeStamp<Utc>,
) -> TxResult<u32> {
    if line.return_condition.is_some() {
        return Ok(0);
    }
    let outstanding = line.outstanding();
    if outstanding == 0 {
        return Ok(0);
    }

    let mut item = tx_load_item(tree, &line.item_ref)?;
    item.on_hand += u64::from(outstanding);
    store::tx_put(tree, keys::item(&line.item_ref), &item)?;

    line.quantity_returned += outstanding;
    line.return_condition = Some(ReturnCondition::Good);

    tx_append_entry(
        tree,
        LedgerEntry {
            seq: 0,
            item_ref: line.item_ref.clone(),
            on_hand_delta: i64::from(outstanding),
            reserved_delta: 0,
            reason: LedgerReason::Restore,
            request_id: Some(request_id.to_string()),
            line_id: Some(line.line_id.clone()),
            at: at.clone(),
        },
    )?;
    Ok(outstanding)
}

/// Standalone ledger API over the shared database. The workflow service
/// uses the `tx_*` primitives inside its own transactions; this struct
/// exposes the same operations as single-call transactions for direct
/// inventory management and for exercising the ledger in isolation.
pub struct QuantityLedger {
    db: Arc<Db>,
}

impl QuantityLedger {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Make an item known to the ledger. Fails if the reference is taken.
    pub fn register_item(&self, item: &InventoryItem) -> Result<(), WorkflowError> {
        store::run_tx(&self.db, |tx| {
            if store::tx_get::<InventoryItem>(tx, &keys::item(&item.item_ref))?.is_some() {
                return Err(abort(WorkflowError::Validation(format!(
                    "item {} already registered",
                    item.item_ref
                ))));
            }
            store::tx_put(tx, keys::item(&item.item_ref), item)?;
            Ok(())
        })
    }

    /// Book incoming stock.
    pub fn stock_receipt(&self, item_ref: &str, qty: u64) -> Result<(), WorkflowError> {
        if qty == 0 {
            return Err(WorkflowError::Validation(
                "stock receipt quantity must be positive".into(),
            ));
        }
        let at = TimeStamp::new();
        store::run_tx(&self.db, |tx| {
            let mut item = tx_load_item(tx, item_ref)?;
            item.on_hand += qty;
            store::tx_put(tx, keys::item(item_ref), &item)?;
            tx_append_entry(
                tx,
                LedgerEntry {
                    seq: 0,
                    item_ref: item_ref.to_string(),
                    on_hand_delta: qty as i64,
                    reserved_delta: 0,
                    reason: LedgerReason::StockReceipt,
                    request_id: None,
                    line_id: None,
                    at: at.clone(),
                },
            )?;
            Ok(())
        })?;
        tracing::info!(item = %item_ref, qty, "stock receipt booked");
        Ok(())
    }

    pub fn item(&self, item_ref: &str) -> Result<InventoryItem, WorkflowError> {
        store::get(&self.db, &keys::item(item_ref))?
            .ok_or_else(|| WorkflowError::NotFound(format!("inventory item {item_ref}")))
    }

    /// Physical stock on the shelf.
    pub fn available(&self, item_ref: &str) -> Result<u64, WorkflowError> {
        Ok(self.item(item_ref)?.on_hand)
    }

    /// What a new reservation may still claim.
    pub fn headroom(&self, item_ref: &str) -> Result<u64, WorkflowError> {
        Ok(self.item(item_ref)?.headroom())
    }

    /// Reserve against live headroom, serialized with every other writer.
    pub fn reserve(&self, item_ref: &str, qty: u32, request_id: &str) -> Result<(), WorkflowError> {
        if qty == 0 {
            return Err(WorkflowError::Validation(
                "reservation quantity must be positive".into(),
            ));
        }
        let at = TimeStamp::new();
        store::run_tx(&self.db, |tx| {
            tx_reserve(tx, item_ref, qty, request_id, None, &at)
        })
    }

    /// Deduct a stored line item. Idempotent.
    pub fn deduct(&self, line_id: &str, qty: u32) -> Result<DeductOutcome, WorkflowError> {
        let at = TimeStamp::new();
        store::run_tx(&self.db, |tx| {
            let (request_id, mut req) = tx_load_line_owner(tx, line_id)?;
            let line = req
                .line_mut(line_id)
                .ok_or_else(|| abort(WorkflowError::NotFound(format!("line item {line_id}"))))?;
            let outcome = tx_deduct(tx, line, qty, &request_id, &at)?;
            store::tx_put(tx, keys::request(&request_id), &req)?;
            Ok(outcome)
        })
    }

    /// Restore (close out) a stored line item. Idempotent.
    pub fn restore(
        &self,
        line_id: &str,
        qty: u32,
        condition: ReturnCondition,
    ) -> Result<RestoreOutcome, WorkflowError> {
        let at = TimeStamp::new();
        store::run_tx(&self.db, |tx| {
            let (request_id, mut req) = tx_load_line_owner(tx, line_id)?;
            let line = req
                .line_mut(line_id)
                .ok_or_else(|| abort(WorkflowError::NotFound(format!("line item {line_id}"))))?;
            let outcome = tx_restore(tx, line, qty, condition, &request_id, &at)?;
            store::tx_put(tx, keys::request(&request_id), &req)?;
            Ok(outcome)
        })
    }

    /// Release every reservation of a request that was never deducted.
    pub fn cancel_reservation(&self, request_id: &str) -> Result<(), WorkflowError> {
        let at = TimeStamp::new();
        store::run_tx(&self.db, |tx| {
            let mut req: WorkflowRequest = store::tx_get(tx, &keys::request(request_id))?
                .ok_or_else(|| {
                    abort(WorkflowError::NotFound(format!("request {request_id}")))
                })?;
            for line in &mut req.line_items {
                tx_cancel_reservation(tx, line, request_id, &at)?;
            }
            store::tx_put(tx, keys::request(request_id), &req)?;
            Ok(())
        })
    }

    /// Entries touching one item, in append order.
    pub fn entries_for_item(&self, item_ref: &str) -> Result<Vec<LedgerEntry>, WorkflowError> {
        let all: Vec<LedgerEntry> = store::scan_prefix(&self.db, keys::LEDGER_PREFIX)?;
        Ok(all.into_iter().filter(|e| e.item_ref == item_ref).collect())
    }

    /// Entries linked to one request, in append order.
    pub fn entries_for_request(&self, request_id: &str) -> Result<Vec<LedgerEntry>, WorkflowError> {
        let all: Vec<LedgerEntry> = store::scan_prefix(&self.db, keys::LEDGER_PREFIX)?;
        Ok(all
            .into_iter()
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .collect())
    }
}

fn tx_load_line_owner(
    tree: &TransactionalTree,
    line_id: &str,
) -> TxResult<(String, WorkflowRequest)> {
    let request_id: String = store::tx_get(tree, &keys::line_index(line_id))?
        .ok_or_else(|| abort(WorkflowError::NotFound(format!("line item {line_id}"))))?;
    let req = store::tx_get(tree, &keys::request(&request_id))?
        .ok_or_else(|| abort(WorkflowError::NotFound(format!("request {request_id}"))))?;
    Ok((request_id, req))
}
