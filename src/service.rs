//! Service layer API for workflow operations
//!
//! Every action follows the same shape: load the request, plan the
//! transition, check permission, run the ledger side effect, persist the
//! new status and append audit events — all inside one transaction.
//! External collaborators (notifications, incidents) are invoked only
//! after the transaction commits.
use std::sync::Arc;

use sled::Db;

use crate::audit::{self, AuditEvent, AuditLog};
use crate::batch::{BatchCoordinator, Submission};
use crate::error::{ErrorKind, WorkflowError};
use crate::guard;
use crate::ledger::{self, QuantityLedger, RestoreOutcome};
use crate::limiter::RateLimiter;
use crate::machine::{self, LedgerEffect};
use crate::request::{CriticalityPolicy, WorkflowRequest};
use crate::store::{self, abort, keys};
use crate::types::{Action, RequestStatus, ReturnCondition, Role, TimeStamp};

/// Receives every committed audit event. The external notification
/// system hangs off this seam; the core never composes message bodies.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &AuditEvent);
}

/// Default collaborator: drop the events.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &AuditEvent) {}
}

/// Damaged or lost stock coming back becomes one of these, handed to the
/// external incident process per affected line.
#[derive(Debug, Clone)]
pub struct IncidentReport {
    pub request_id: String,
    pub line_id: String,
    pub item_ref: String,
    pub condition: ReturnCondition,
    pub quantity: u32,
    pub reported_by: String,
}

pub trait IncidentSink: Send + Sync {
    fn raise(&self, incident: &IncidentReport) -> anyhow::Result<()>;
}

/// Default collaborator: accept and discard.
pub struct NoopIncidentSink;

impl IncidentSink for NoopIncidentSink {
    fn raise(&self, _incident: &IncidentReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One line of a return call: how much of the line is being accounted
/// for and in what condition.
#[derive(Debug, Clone)]
pub struct ReturnLine {
    pub line_id: String,
    pub quantity: u32,
    pub condition: ReturnCondition,
}

/// What a return call accomplished. Incident failures are isolated per
/// line and never roll back the committed return.
#[derive(Debug)]
pub struct ReturnReport {
    /// The request reached `Returned` (every deducted line closed).
    pub fully_returned: bool,
    pub lines: Vec<(String, RestoreOutcome)>,
    pub incidents: Vec<IncidentReport>,
    /// Lines whose incident hand-off failed, with the failure text.
    pub incident_failures: Vec<(String, String)>,
}

/// The uniform action envelope of the external interface.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: Action,
    pub request_id: String,
    pub actor: String,
    pub role: Role,
    pub notes: Option<String>,
    /// Who takes custody on Release/Borrow; defaults to the initiator.
    pub custodian: Option<String>,
    /// Per-line mutations, required for Return.
    pub returns: Vec<ReturnLine>,
}

#[derive(Debug)]
pub struct ActionOutcome {
    pub success: bool,
    pub new_status: Option<RequestStatus>,
    pub error: Option<ErrorKind>,
    pub message: String,
    pub audit_event_id: Option<String>,
}

pub struct WorkflowService {
    pub(crate) db: Arc<Db>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) incidents: Arc<dyn IncidentSink>,
    pub(crate) policy: CriticalityPolicy,
    pub(crate) limiter: Option<RateLimiter>,
}

impl WorkflowService {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            notifier: Arc::new(NoopNotifier),
            incidents: Arc::new(NoopIncidentSink),
            policy: CriticalityPolicy::default(),
            limiter: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_incident_sink(mut self, incidents: Arc<dyn IncidentSink>) -> Self {
        self.incidents = incidents;
        self
    }

    pub fn with_policy(mut self, policy: CriticalityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Direct ledger handle over the same database.
    pub fn ledger(&self) -> QuantityLedger {
        QuantityLedger::new(Arc::clone(&self.db))
    }

    /// Read handle on the audit trail.
    pub fn audit(&self) -> AuditLog {
        AuditLog::new(Arc::clone(&self.db))
    }

    /// Load a request by id.
    pub fn request(&self, request_id: &str) -> Result<WorkflowRequest, WorkflowError> {
        store::get(&self.db, &keys::request(request_id))?
            .ok_or_else(|| WorkflowError::NotFound(format!("request {request_id}")))
    }

    /// Create a request (standalone or batch). Pre-validates every line
    /// before anything persists; see `BatchCoordinator`.
    pub fn submit_request(&self, submission: Submission) -> Result<WorkflowRequest, WorkflowError> {
        BatchCoordinator::new(self).submit(submission)
    }

    /// Move a draft into the verification queue.
    pub fn submit(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Submit, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn verify(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Verify, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn approve(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Approve, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    /// Hand stock over: deducts every line and records the custodian.
    pub fn release(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        custodian: Option<String>,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(
            request_id,
            Action::Release,
            actor,
            role,
            notes,
            custodian,
            &[],
        )
        .map(|(req, _)| req)
    }

    pub fn dispatch(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Dispatch, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn receive(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Receive, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn complete(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Complete, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn cancel(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Cancel, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    pub fn decline(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        notes: Option<String>,
    ) -> Result<WorkflowRequest, WorkflowError> {
        self.perform(request_id, Action::Decline, actor, role, notes, None, &[])
            .map(|(req, _)| req)
    }

    /// Book a return. Inherently partial: each line reports its own
    /// quantity and condition; damaged/lost lines raise incidents after
    /// commit without blocking their siblings.
    pub fn return_items(
        &self,
        request_id: &str,
        actor: &str,
        role: Role,
        returns: Vec<ReturnLine>,
        notes: Option<String>,
    ) -> Result<(WorkflowRequest, ReturnReport), WorkflowError> {
        if returns.is_empty() {
            return Err(WorkflowError::Validation(
                "a return must name at least one line item".into(),
            ));
        }
        for r in &returns {
            if r.quantity == 0 {
                return Err(WorkflowError::Validation(format!(
                    "return quantity for line {} must be positive",
                    r.line_id
                )));
            }
        }

        let (req, outcomes) = self.perform(
            request_id,
            Action::Return,
            actor,
            role,
            notes,
            None,
            &returns,
        )?;

        // incidents are raised after the committed return; a sink failure
        // on one line must not affect any other line
        let mut incidents = Vec::new();
        let mut incident_failures = Vec::new();
        for r in &returns {
            if !r.condition.raises_incident() {
                continue;
            }
            let Some(line) = req.line(&r.line_id) else {
                continue;
            };
            let report = IncidentReport {
                request_id: req.request_id.clone(),
                line_id: r.line_id.clone(),
                item_ref: line.item_ref.clone(),
                condition: r.condition,
                quantity: r.quantity,
                reported_by: actor.to_string(),
            };
            match self.incidents.raise(&report) {
                Ok(()) => incidents.push(report),
                Err(e) => {
                    tracing::warn!(
                        request = %req.request_id,
                        line = %r.line_id,
                        error = %e,
                        "incident hand-off failed, return stands"
                    );
                    incident_failures.push((r.line_id.clone(), e.to_string()));
                }
            }
        }

        let report = ReturnReport {
            fully_returned: req.status == RequestStatus::Returned,
            lines: outcomes,
            incidents,
            incident_failures,
        };
        Ok((req, report))
    }

    /// The uniform envelope: same inputs and outputs for every action.
    pub fn dispatch_action(&self, call: ActionRequest) -> ActionOutcome {
        let result = match call.action {
            Action::Create => Err(WorkflowError::Validation(
                "creation goes through submit_request, not the action envelope".into(),
            )),
            Action::Return => self
                .return_items(
                    &call.request_id,
                    &call.actor,
                    call.role,
                    call.returns.clone(),
                    call.notes.clone(),
                )
                .map(|(req, _)| req),
            _ => self
                .perform(
                    &call.request_id,
                    call.action,
                    &call.actor,
                    call.role,
                    call.notes.clone(),
                    call.custodian.clone(),
                    &[],
                )
                .map(|(req, _)| req),
        };

        match result {
            Ok(req) => ActionOutcome {
                success: true,
                new_status: Some(req.status),
                error: None,
                message: format!("{:?} applied", call.action),
                audit_event_id: self.last_event_id(&req.request_id),
            },
            Err(e) => ActionOutcome {
                success: false,
                new_status: None,
                error: Some(e.kind()),
                message: e.to_string(),
                audit_event_id: None,
            },
        }
    }

    fn last_event_id(&self, request_id: &str) -> Option<String> {
        self.audit()
            .events_for(request_id)
            .ok()
            .and_then(|events| events.last().map(|e| e.event_hash.clone()))
    }

    /// Plan, guard, mutate, audit — one transaction. Returns the updated
    /// request and, for returns, the per-line outcomes.
    fn perform(
        &self,
        request_id: &str,
        action: Action,
        actor: &str,
        role: Role,
        notes: Option<String>,
        custodian: Option<String>,
        returns: &[ReturnLine],
    ) -> Result<(WorkflowRequest, Vec<(String, RestoreOutcome)>), WorkflowError> {
        let at = TimeStamp::new();

        let (req, events, outcomes) = store::run_tx(&self.db, |tx| {
            let mut req: WorkflowRequest = store::tx_get(tx, &keys::request(request_id))?
                .ok_or_else(|| {
                    abort(WorkflowError::NotFound(format!("request {request_id}")))
                })?;

            let plan = match machine::plan(req.entity_kind, req.criticality, action, req.status)
            {
                Ok(plan) => plan,
                Err(e) => {
                    // a replayed one-time action link lands here: the
                    // state already moved to where this action would go
                    if machine::result_status(req.entity_kind, action) == Some(req.status) {
                        return Err(abort(WorkflowError::AlreadyProcessed(format!(
                            "request {request_id} is already {:?}",
                            req.status
                        ))));
                    }
                    return Err(abort(e));
                }
            };

            if !guard::can_perform(role, actor, action, &req) {
                return Err(abort(WorkflowError::PermissionDenied {
                    action,
                    status: req.status,
                }));
            }
            // the streamlined jump needs the combined create+release grant
            if !plan.synthetic.is_empty() && !guard::can_streamline(role, req.criticality) {
                return Err(abort(WorkflowError::PermissionDenied {
                    action,
                    status: req.status,
                }));
            }

            let mut outcomes: Vec<(String, RestoreOutcome)> = Vec::new();
            match plan.effect {
                LedgerEffect::None => {}
                LedgerEffect::DeductAll => {
                    for line in &mut req.line_items {
                        let qty = line.quantity_reserved;
                        if qty > 0 {
                            ledger::tx_deduct(tx, line, qty, request_id, &at)?;
                        }
                    }
                    req.custodian = Some(
                        custodian
                            .clone()
                            .unwrap_or_else(|| req.initiator.clone()),
                    );
                }
                LedgerEffect::RestorePerLine => {
                    for r in returns {
                        let line = req.line_mut(&r.line_id).ok_or_else(|| {
                            abort(WorkflowError::NotFound(format!(
                                "line item {} on request {request_id}",
                                r.line_id
                            )))
                        })?;
                        let outcome =
                            ledger::tx_restore(tx, line, r.quantity, r.condition, request_id, &at)?;
                        outcomes.push((r.line_id.clone(), outcome));
                    }
                }
                LedgerEffect::CancelReservation => {
                    for line in &mut req.line_items {
                        ledger::tx_cancel_reservation(tx, line, request_id, &at)?;
                    }
                }
                LedgerEffect::RestoreOutstanding => {
                    for line in &mut req.line_items {
                        ledger::tx_restore_outstanding(tx, line, request_id, &at)?;
                        ledger::tx_cancel_reservation(tx, line, request_id, &at)?;
                    }
                }
            }

            let mut events = Vec::new();

            // synthetic entries walk the skipped stages so the trail
            // reads the same as a full chain
            let mut cursor = plan.from;
            for skipped in plan.synthetic {
                let next = machine::result_status(req.entity_kind, *skipped)
                    .unwrap_or(plan.to);
                req.record_stage(*skipped, actor, None, true, at.clone());
                events.push(audit::tx_append_event(
                    tx,
                    request_id,
                    *skipped,
                    Some(cursor),
                    next,
                    actor,
                    &at,
                    None,
                    true,
                )?);
                cursor = next;
            }

            // a partial return leaves the request in custody; it only
            // reaches Returned once every deducted line has closed
            let new_status = if action == Action::Return && !req.all_lines_closed() {
                req.status
            } else {
                plan.to
            };

            req.record_stage(action, actor, notes.clone(), false, at.clone());
            events.push(audit::tx_append_event(
                tx,
                request_id,
                action,
                Some(cursor),
                new_status,
                actor,
                &at,
                notes.clone(),
                false,
            )?);

            req.status = new_status;
            store::tx_put(tx, keys::request(request_id), &req)?;

            Ok((req, events, outcomes))
        })?;

        tracing::info!(
            request = %request_id,
            action = ?action,
            from = ?events.first().and_then(|e| e.from_status),
            to = ?req.status,
            actor = %actor,
            "workflow transition applied"
        );
        for event in &events {
            self.notifier.notify(event);
        }

        Ok((req, outcomes))
    }
}
