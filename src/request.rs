//! Workflow request, line item and inventory records
use chrono::Utc;

use crate::types::{
    Action, Criticality, EntityKind, RequestStatus, ReturnCondition, TimeStamp,
};

/// One request moving through the maker-verifier-authorizer chain.
///
/// A standalone request carries a single line item and no `batch_ref`; a
/// batch carries several line items under one reference and advances them
/// together. Requests are never hard-deleted, they only reach a terminal
/// status.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub entity_kind: EntityKind,
    #[n(2)]
    pub criticality: Criticality,
    #[n(3)]
    pub status: RequestStatus,
    #[n(4)]
    pub initiator: String,
    /// Who physically holds the stock after Release/Borrow. Only this
    /// identity (or the operational role) may Return.
    #[n(5)]
    pub custodian: Option<String>,
    #[n(6)]
    pub batch_ref: Option<String>,
    #[n(7)]
    pub expected_return: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    /// Actor, timestamp and notes for every stage reached, in order.
    #[n(9)]
    pub stages: Vec<StageRecord>,
    #[n(10)]
    pub line_items: Vec<LineItem>,
}

/// Per-stage record kept on the request itself, mirroring the audit trail
/// for quick chain reconstruction without a log scan.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct StageRecord {
    #[n(0)]
    pub action: Action,
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub at: TimeStamp<Utc>,
    #[n(3)]
    pub notes: Option<String>,
    /// True for the stages a streamlined creation logically skipped.
    #[n(4)]
    pub synthetic: bool,
}

/// One inventory line inside a request.
///
/// Invariants: `quantity_deducted <= quantity_requested` and
/// `quantity_returned <= quantity_deducted`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LineItem {
    #[n(0)]
    pub line_id: String,
    #[n(1)]
    pub item_ref: String,
    #[n(2)]
    pub quantity_requested: u32,
    #[n(3)]
    pub quantity_reserved: u32,
    #[n(4)]
    pub quantity_deducted: u32,
    #[n(5)]
    pub quantity_returned: u32,
    #[n(6)]
    pub return_condition: Option<ReturnCondition>,
}

impl LineItem {
    pub fn new(item_ref: impl Into<String>, quantity: u32) -> Self {
        Self {
            line_id: crate::utils::mint("line_"),
            item_ref: item_ref.into(),
            quantity_requested: quantity,
            quantity_reserved: 0,
            quantity_deducted: 0,
            quantity_returned: 0,
            return_condition: None,
        }
    }

    /// Units out in the field and not yet accounted for by a return.
    pub fn outstanding(&self) -> u32 {
        self.quantity_deducted.saturating_sub(self.quantity_returned)
    }

    /// A line is closed once its return data is recorded, or if nothing
    /// was ever deducted for it.
    pub fn is_closed(&self) -> bool {
        self.quantity_deducted == 0 || self.return_condition.is_some()
    }

    pub fn invariants_hold(&self) -> bool {
        self.quantity_deducted <= self.quantity_requested
            && self.quantity_returned <= self.quantity_deducted
    }
}

impl WorkflowRequest {
    pub fn new(
        entity_kind: EntityKind,
        criticality: Criticality,
        initiator: impl Into<String>,
        line_items: Vec<LineItem>,
    ) -> Self {
        Self {
            request_id: crate::utils::mint("req_"),
            entity_kind,
            criticality,
            status: RequestStatus::Draft,
            initiator: initiator.into(),
            custodian: None,
            batch_ref: None,
            expected_return: None,
            created_at: TimeStamp::new(),
            stages: vec![],
            line_items,
        }
    }

    pub fn line(&self, line_id: &str) -> Option<&LineItem> {
        self.line_items.iter().find(|l| l.line_id == line_id)
    }

    pub fn line_mut(&mut self, line_id: &str) -> Option<&mut LineItem> {
        self.line_items.iter_mut().find(|l| l.line_id == line_id)
    }

    pub fn record_stage(
        &mut self,
        action: Action,
        actor: impl Into<String>,
        notes: Option<String>,
        synthetic: bool,
        at: TimeStamp<Utc>,
    ) {
        self.stages.push(StageRecord {
            action,
            actor: actor.into(),
            at,
            notes,
            synthetic,
        });
    }

    /// The actor recorded for the most recent occurrence of `action`.
    pub fn stage_actor(&self, action: Action) -> Option<&str> {
        self.stages
            .iter()
            .rev()
            .find(|s| s.action == action)
            .map(|s| s.actor.as_str())
    }

    /// All deducted lines have reported back.
    pub fn all_lines_closed(&self) -> bool {
        self.line_items.iter().all(LineItem::is_closed)
    }

    /// Derived flag, never persisted: stock is out past its expected
    /// return date. Does not block any legal transition.
    pub fn is_overdue(&self, now: TimeStamp<Utc>) -> bool {
        match &self.expected_return {
            Some(expected) => self.status.is_in_custody() && *expected < now,
            None => false,
        }
    }
}

/// Materialized inventory counters for one stock item. The append-only
/// ledger is the source of truth; these counters are kept consistent with
/// it inside the same transaction that writes each entry.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct InventoryItem {
    #[n(0)]
    pub item_ref: String,
    #[n(1)]
    pub name: String,
    /// Withdrawal batches accept only consumable items.
    #[n(2)]
    pub consumable: bool,
    /// Unit cost in minor currency units, feeds the criticality policy.
    #[n(3)]
    pub unit_cost: u64,
    #[n(4)]
    pub on_hand: u64,
    #[n(5)]
    pub reserved: u64,
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, consumable: bool, unit_cost: u64) -> Self {
        Self {
            item_ref: crate::utils::mint("item_"),
            name: name.into(),
            consumable,
            unit_cost,
            on_hand: 0,
            reserved: 0,
        }
    }

    /// Quantity a new reservation may still claim.
    pub fn headroom(&self) -> u64 {
        self.on_hand.saturating_sub(self.reserved)
    }
}

/// The one canonical criticality classifier.
///
/// The tracked processes historically disagreed on what made a request
/// critical (cost threshold vs. item category); this policy takes the
/// union of both signals. Callers with a fixed business rule can bypass
/// it by pinning criticality at submission.
#[derive(Debug, Clone, Copy)]
pub struct CriticalityPolicy {
    /// Unit cost at or above this is critical.
    pub cost_threshold: u64,
    /// Non-consumable capital equipment is critical regardless of cost.
    pub capital_override: bool,
}

impl Default for CriticalityPolicy {
    fn default() -> Self {
        Self {
            cost_threshold: 50_000,
            capital_override: true,
        }
    }
}

impl CriticalityPolicy {
    pub fn classify_item(&self, item: &InventoryItem) -> Criticality {
        if item.unit_cost >= self.cost_threshold {
            return Criticality::Critical;
        }
        if self.capital_override && !item.consumable {
            return Criticality::Critical;
        }
        Criticality::Basic
    }

    /// A request is as critical as its most critical line.
    pub fn classify<'a>(
        &self,
        items: impl IntoIterator<Item = &'a InventoryItem>,
    ) -> Criticality {
        for item in items {
            if self.classify_item(item) == Criticality::Critical {
                return Criticality::Critical;
            }
        }
        Criticality::Basic
    }
}
