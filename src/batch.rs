//! Batch coordination: all-or-nothing creation, shared progression
//!
//! A batch is one request carrying several line items under a shared
//! reference; a standalone request is the same thing with one line and
//! no reference. Creation pre-validates every line before anything is
//! persisted and runs entirely inside one transaction, so a failing line
//! means zero requests and zero ledger entries.
use chrono::Utc;

use crate::audit;
use crate::error::WorkflowError;
use crate::guard;
use crate::ledger;
use crate::machine;
use crate::request::{InventoryItem, LineItem, WorkflowRequest};
use crate::service::WorkflowService;
use crate::store::{self, abort, keys};
use crate::types::{Action, Criticality, EntityKind, RequestStatus, Role, TimeStamp};

/// Hard cap on line items per batch.
pub const MAX_BATCH_LINES: usize = 50;

#[derive(Debug, Clone)]
pub struct NewLine {
    pub item_ref: String,
    pub quantity: u32,
}

/// Everything needed to create a request or batch.
#[derive(Debug, Clone)]
pub struct Submission {
    pub entity_kind: EntityKind,
    /// None lets the criticality policy classify from the items.
    pub criticality: Option<Criticality>,
    pub initiator: String,
    pub role: Role,
    pub notes: Option<String>,
    pub expected_return: Option<TimeStamp<Utc>>,
    /// Park in Draft instead of entering the verification queue.
    pub as_draft: bool,
    /// Take the streamlined Basic path: create and release in one call.
    pub streamline: bool,
    pub lines: Vec<NewLine>,
}

impl Submission {
    /// Start a submission draft; add lines and options by chaining.
    pub fn new(entity_kind: EntityKind, initiator: impl Into<String>, role: Role) -> Self {
        Self {
            entity_kind,
            criticality: None,
            initiator: initiator.into(),
            role,
            notes: None,
            expected_return: None,
            as_draft: false,
            streamline: false,
            lines: vec![],
        }
    }
    pub fn line(mut self, item_ref: impl Into<String>, quantity: u32) -> Self {
        self.lines.push(NewLine {
            item_ref: item_ref.into(),
            quantity,
        });
        self
    }
    pub fn pin_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = Some(criticality);
        self
    }
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
    pub fn expected_return(mut self, at: TimeStamp<Utc>) -> Self {
        self.expected_return = Some(at);
        self
    }
    pub fn as_draft(mut self) -> Self {
        self.as_draft = true;
        self
    }
    pub fn streamlined(mut self) -> Self {
        self.streamline = true;
        self
    }
}

pub struct BatchCoordinator<'a> {
    svc: &'a WorkflowService,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(svc: &'a WorkflowService) -> Self {
        Self { svc }
    }

    /// Create a request or batch. Shape checks run before storage is
    /// touched; item checks and reservations run inside one transaction,
    /// so the first offending line aborts the whole creation.
    pub fn submit(&self, submission: Submission) -> Result<WorkflowRequest, WorkflowError> {
        // admission gate sits in front of everything
        if let Some(limiter) = &self.svc.limiter {
            limiter.check(&submission.initiator)?;
        }

        if submission.lines.is_empty() {
            return Err(WorkflowError::Validation(
                "a submission needs at least one line item".into(),
            ));
        }
        if submission.lines.len() > MAX_BATCH_LINES {
            return Err(WorkflowError::Validation(format!(
                "batch of {} lines exceeds the cap of {MAX_BATCH_LINES}",
                submission.lines.len()
            )));
        }
        for line in &submission.lines {
            if line.quantity == 0 {
                return Err(WorkflowError::Validation(format!(
                    "quantity for item {} must be positive",
                    line.item_ref
                )));
            }
        }
        // creation rights do not depend on criticality
        if submission.role != Role::Admin
            && !guard::granted_roles(submission.entity_kind, Criticality::Basic, Action::Create)
                .contains(&submission.role)
        {
            return Err(WorkflowError::PermissionDenied {
                action: Action::Create,
                status: RequestStatus::Draft,
            });
        }

        // mint ids and the record skeleton outside the transaction so
        // retries reuse them
        let at = TimeStamp::new();
        let line_items: Vec<LineItem> = submission
            .lines
            .iter()
            .map(|l| LineItem::new(l.item_ref.clone(), l.quantity))
            .collect();
        let mut template = WorkflowRequest::new(
            submission.entity_kind,
            submission.criticality.unwrap_or(Criticality::Basic),
            submission.initiator.clone(),
            line_items,
        );
        template.created_at = at.clone();
        template.expected_return = submission.expected_return.clone();
        if submission.lines.len() > 1 {
            template.batch_ref = Some(crate::utils::mint("batch_"));
        }

        let (req, events) = store::run_tx(&self.svc.db, |tx| {
            let mut req = template.clone();
            let request_id = req.request_id.clone();

            // pre-check every line before any mutation
            let mut items: Vec<InventoryItem> = Vec::with_capacity(req.line_items.len());
            for line in &req.line_items {
                let item: InventoryItem = store::tx_get(tx, &keys::item(&line.item_ref))?
                    .ok_or_else(|| {
                        abort(WorkflowError::NotFound(format!(
                            "inventory item {}",
                            line.item_ref
                        )))
                    })?;
                if req.entity_kind == EntityKind::Withdrawal && !item.consumable {
                    return Err(abort(WorkflowError::Validation(format!(
                        "item {} is not consumable and cannot be withdrawn",
                        line.item_ref
                    ))));
                }
                if u64::from(line.quantity_requested) > item.headroom() {
                    return Err(abort(WorkflowError::InsufficientQuantity {
                        item: line.item_ref.clone(),
                        requested: u64::from(line.quantity_requested),
                        available: item.headroom(),
                    }));
                }
                items.push(item);
            }

            req.criticality = submission
                .criticality
                .unwrap_or_else(|| self.svc.policy.classify(items.iter()));

            if submission.streamline && !guard::can_streamline(submission.role, req.criticality) {
                return Err(abort(WorkflowError::PermissionDenied {
                    action: Action::Create,
                    status: RequestStatus::Draft,
                }));
            }

            // reserve every line; re-validates live headroom, which also
            // covers the same item appearing on several lines
            for line in &mut req.line_items {
                ledger::tx_reserve(
                    tx,
                    &line.item_ref,
                    line.quantity_requested,
                    &request_id,
                    Some(&line.line_id),
                    &at,
                )?;
                line.quantity_reserved = line.quantity_requested;
            }
            for line in &req.line_items {
                store::tx_put(tx, keys::line_index(&line.line_id), &request_id)?;
            }

            let mut events = Vec::new();

            if submission.as_draft {
                req.status = RequestStatus::Draft;
                req.record_stage(
                    Action::Create,
                    submission.initiator.as_str(),
                    submission.notes.clone(),
                    false,
                    at.clone(),
                );
                events.push(audit::tx_append_event(
                    tx,
                    &request_id,
                    Action::Create,
                    None,
                    RequestStatus::Draft,
                    &submission.initiator,
                    &at,
                    submission.notes.clone(),
                    false,
                )?);
            } else if submission.streamline {
                // the streamlined row of the transition table: create in
                // Draft, release straight out of it, synthetic audit
                // entries for every logically-skipped stage
                req.status = RequestStatus::Draft;
                req.record_stage(
                    Action::Create,
                    submission.initiator.as_str(),
                    submission.notes.clone(),
                    false,
                    at.clone(),
                );
                events.push(audit::tx_append_event(
                    tx,
                    &request_id,
                    Action::Create,
                    None,
                    RequestStatus::Draft,
                    &submission.initiator,
                    &at,
                    submission.notes.clone(),
                    false,
                )?);

                let plan = machine::plan(
                    req.entity_kind,
                    req.criticality,
                    Action::Release,
                    RequestStatus::Draft,
                )
                .map_err(abort)?;

                let mut cursor = RequestStatus::Draft;
                for skipped in plan.synthetic {
                    let next = machine::result_status(req.entity_kind, *skipped).unwrap_or(plan.to);
                    req.record_stage(*skipped, submission.initiator.as_str(), None, true, at.clone());
                    events.push(audit::tx_append_event(
                        tx,
                        &request_id,
                        *skipped,
                        Some(cursor),
                        next,
                        &submission.initiator,
                        &at,
                        None,
                        true,
                    )?);
                    cursor = next;
                }

                for line in &mut req.line_items {
                    let qty = line.quantity_reserved;
                    ledger::tx_deduct(tx, line, qty, &request_id, &at)?;
                }
                req.custodian = Some(submission.initiator.clone());
                req.record_stage(Action::Release, submission.initiator.as_str(), None, false, at.clone());
                events.push(audit::tx_append_event(
                    tx,
                    &request_id,
                    Action::Release,
                    Some(cursor),
                    plan.to,
                    &submission.initiator,
                    &at,
                    None,
                    false,
                )?);
                req.status = plan.to;
            } else {
                // created directly in the verification queue
                req.status = RequestStatus::PendingVerification;
                req.record_stage(
                    Action::Create,
                    submission.initiator.as_str(),
                    submission.notes.clone(),
                    false,
                    at.clone(),
                );
                events.push(audit::tx_append_event(
                    tx,
                    &request_id,
                    Action::Create,
                    None,
                    RequestStatus::PendingVerification,
                    &submission.initiator,
                    &at,
                    submission.notes.clone(),
                    false,
                )?);
            }

            store::tx_put(tx, keys::request(&req.request_id), &req)?;
            Ok((req, events))
        })?;

        tracing::info!(
            request = %req.request_id,
            batch = ?req.batch_ref,
            kind = ?req.entity_kind,
            criticality = ?req.criticality,
            status = ?req.status,
            lines = req.line_items.len(),
            "request created"
        );
        for event in &events {
            self.svc.notifier.notify(event);
        }

        Ok(req)
    }
}
