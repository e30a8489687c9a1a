//! Workflow state machine
//!
//! One transition table keyed by `(entity_kind, criticality)`. Both the
//! full maker-verifier-authorizer chain and the streamlined Basic path
//! are rows of the same table: streamlining is the `Release` row
//! accepting `Draft` as a source, not a parallel code path. Planning is
//! pure; the service applies a plan inside a storage transaction so that
//! check-then-act is atomic.
use crate::error::WorkflowError;
use crate::types::{Action, Criticality, EntityKind, RequestStatus};

/// Ledger side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// No quantity movement.
    None,
    /// Deduct every line's reserved quantity. Fires at Release/Borrow.
    DeductAll,
    /// Apply the caller's per-line return mutations.
    RestorePerLine,
    /// Release reservations that were never deducted.
    CancelReservation,
    /// Put all outstanding deducted stock back (cancel after release).
    RestoreOutstanding,
}

/// A planned transition: where it goes, what the ledger does, and which
/// logically-skipped stages need synthetic audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub action: Action,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub effect: LedgerEffect,
    /// Stages the streamlined path skipped. One audit entry is written
    /// per element so the trail stays order-complete.
    pub synthetic: &'static [Action],
}

const PRE_RELEASE: &[RequestStatus] = &[
    RequestStatus::Draft,
    RequestStatus::PendingVerification,
    RequestStatus::PendingApproval,
    RequestStatus::Approved,
];
// every non-terminal state past release, Received included: cancel stays
// available until the request actually terminates
const POST_RELEASE: &[RequestStatus] = &[
    RequestStatus::Released,
    RequestStatus::Borrowed,
    RequestStatus::InTransit,
    RequestStatus::Received,
];
const STREAMLINE_SKIPPED: &[Action] = &[Action::Submit, Action::Verify, Action::Approve];

/// Where released stock lands for each process.
pub fn release_target(kind: EntityKind) -> RequestStatus {
    match kind {
        EntityKind::BorrowedTool => RequestStatus::Borrowed,
        _ => RequestStatus::Released,
    }
}

fn release_sources(criticality: Criticality) -> &'static [RequestStatus] {
    match criticality {
        // critical requests walk the full chain, no shortcuts
        Criticality::Critical => &[RequestStatus::Approved],
        // the streamlined row: Basic may release straight out of Draft
        Criticality::Basic => &[RequestStatus::Approved, RequestStatus::Draft],
    }
}

fn return_sources(kind: EntityKind) -> &'static [RequestStatus] {
    match kind {
        EntityKind::Withdrawal | EntityKind::GenericRequest => &[RequestStatus::Released],
        EntityKind::BorrowedTool => &[RequestStatus::Borrowed],
        // a transfer can bounce before or during the in-transit leg
        EntityKind::Transfer => &[RequestStatus::Released, RequestStatus::InTransit],
    }
}

/// Resolve `action` from `from` against the transition table.
///
/// Fails with `InvalidTransition` when the current state is not a listed
/// source. A failed plan never mutates anything; the service runs plan
/// and mutation under one transaction so the state cannot move between
/// the check and the act.
pub fn plan(
    kind: EntityKind,
    criticality: Criticality,
    action: Action,
    from: RequestStatus,
) -> Result<TransitionPlan, WorkflowError> {
    let illegal = || WorkflowError::InvalidTransition {
        action,
        status: from,
    };

    if from.is_terminal() {
        return Err(illegal());
    }

    let (sources, to, effect): (&[RequestStatus], RequestStatus, LedgerEffect) =
        match (kind, action) {
            (_, Action::Submit) => (
                &[RequestStatus::Draft],
                RequestStatus::PendingVerification,
                LedgerEffect::None,
            ),
            (_, Action::Verify) => (
                &[RequestStatus::PendingVerification],
                RequestStatus::PendingApproval,
                LedgerEffect::None,
            ),
            (_, Action::Approve) => (
                &[RequestStatus::PendingApproval],
                RequestStatus::Approved,
                LedgerEffect::None,
            ),
            (k, Action::Release) => (
                release_sources(criticality),
                release_target(k),
                LedgerEffect::DeductAll,
            ),
            (EntityKind::Transfer, Action::Dispatch) => (
                &[RequestStatus::Released],
                RequestStatus::InTransit,
                LedgerEffect::None,
            ),
            (EntityKind::Transfer, Action::Receive) => (
                &[RequestStatus::InTransit],
                RequestStatus::Received,
                LedgerEffect::None,
            ),
            (EntityKind::Transfer, Action::Complete) => (
                &[RequestStatus::Received],
                RequestStatus::Completed,
                LedgerEffect::None,
            ),
            (EntityKind::Withdrawal | EntityKind::GenericRequest, Action::Complete) => (
                &[RequestStatus::Released],
                RequestStatus::Completed,
                LedgerEffect::None,
            ),
            (k, Action::Return) => (
                return_sources(k),
                RequestStatus::Returned,
                LedgerEffect::RestorePerLine,
            ),
            (_, Action::Cancel) if from.is_pre_release() => (
                PRE_RELEASE,
                RequestStatus::Cancelled,
                LedgerEffect::CancelReservation,
            ),
            (_, Action::Cancel) => (
                POST_RELEASE,
                RequestStatus::Cancelled,
                LedgerEffect::RestoreOutstanding,
            ),
            (_, Action::Decline) => (
                &[
                    RequestStatus::PendingVerification,
                    RequestStatus::PendingApproval,
                ],
                RequestStatus::Declined,
                LedgerEffect::CancelReservation,
            ),
            // Create is not a transition, and Dispatch/Receive/Complete
            // have no meaning for the remaining kinds
            _ => return Err(illegal()),
        };

    if !sources.contains(&from) {
        return Err(illegal());
    }

    let synthetic: &'static [Action] =
        if action == Action::Release && from == RequestStatus::Draft {
            STREAMLINE_SKIPPED
        } else {
            &[]
        };

    Ok(TransitionPlan {
        action,
        from,
        to,
        effect,
        synthetic,
    })
}

/// The state `action` would land in if it succeeded, regardless of the
/// current state. Used to tell a replayed one-time action link
/// (`AlreadyProcessed`) apart from a genuinely illegal request.
pub fn result_status(kind: EntityKind, action: Action) -> Option<RequestStatus> {
    match (kind, action) {
        (_, Action::Submit) => Some(RequestStatus::PendingVerification),
        (_, Action::Verify) => Some(RequestStatus::PendingApproval),
        (_, Action::Approve) => Some(RequestStatus::Approved),
        (k, Action::Release) => Some(release_target(k)),
        (EntityKind::Transfer, Action::Dispatch) => Some(RequestStatus::InTransit),
        (EntityKind::Transfer, Action::Receive) => Some(RequestStatus::Received),
        (
            EntityKind::Transfer | EntityKind::Withdrawal | EntityKind::GenericRequest,
            Action::Complete,
        ) => Some(RequestStatus::Completed),
        (_, Action::Return) => Some(RequestStatus::Returned),
        (_, Action::Cancel) => Some(RequestStatus::Cancelled),
        (_, Action::Decline) => Some(RequestStatus::Declined),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_chain_runs_in_order() {
        let k = EntityKind::BorrowedTool;
        let c = Criticality::Critical;

        let p = plan(k, c, Action::Submit, RequestStatus::Draft).unwrap();
        assert_eq!(p.to, RequestStatus::PendingVerification);

        let p = plan(k, c, Action::Verify, RequestStatus::PendingVerification).unwrap();
        assert_eq!(p.to, RequestStatus::PendingApproval);

        let p = plan(k, c, Action::Approve, RequestStatus::PendingApproval).unwrap();
        assert_eq!(p.to, RequestStatus::Approved);

        let p = plan(k, c, Action::Release, RequestStatus::Approved).unwrap();
        assert_eq!(p.to, RequestStatus::Borrowed);
        assert_eq!(p.effect, LedgerEffect::DeductAll);
        assert!(p.synthetic.is_empty());
    }

    #[test]
    fn critical_cannot_skip_stages() {
        let k = EntityKind::BorrowedTool;
        let c = Criticality::Critical;

        assert!(plan(k, c, Action::Release, RequestStatus::Draft).is_err());
        assert!(plan(k, c, Action::Approve, RequestStatus::PendingVerification).is_err());
        assert!(plan(k, c, Action::Verify, RequestStatus::Approved).is_err());
    }

    #[test]
    fn streamlined_release_from_draft_carries_synthetic_stages() {
        let p = plan(
            EntityKind::BorrowedTool,
            Criticality::Basic,
            Action::Release,
            RequestStatus::Draft,
        )
        .unwrap();

        assert_eq!(p.to, RequestStatus::Borrowed);
        assert_eq!(p.effect, LedgerEffect::DeductAll);
        assert_eq!(
            p.synthetic,
            &[Action::Submit, Action::Verify, Action::Approve]
        );
    }

    #[test]
    fn release_lands_per_kind() {
        for (kind, expected) in [
            (EntityKind::Withdrawal, RequestStatus::Released),
            (EntityKind::BorrowedTool, RequestStatus::Borrowed),
            (EntityKind::Transfer, RequestStatus::Released),
            (EntityKind::GenericRequest, RequestStatus::Released),
        ] {
            let p = plan(kind, Criticality::Critical, Action::Release, RequestStatus::Approved)
                .unwrap();
            assert_eq!(p.to, expected);
        }
    }

    #[test]
    fn transfer_walks_the_transit_leg() {
        let k = EntityKind::Transfer;
        let c = Criticality::Critical;

        let p = plan(k, c, Action::Dispatch, RequestStatus::Released).unwrap();
        assert_eq!(p.to, RequestStatus::InTransit);

        let p = plan(k, c, Action::Receive, RequestStatus::InTransit).unwrap();
        assert_eq!(p.to, RequestStatus::Received);

        let p = plan(k, c, Action::Complete, RequestStatus::Received).unwrap();
        assert_eq!(p.to, RequestStatus::Completed);

        // the transit actions mean nothing to the other kinds
        assert!(plan(
            EntityKind::Withdrawal,
            c,
            Action::Dispatch,
            RequestStatus::Released
        )
        .is_err());
    }

    #[test]
    fn cancel_effect_depends_on_release() {
        let k = EntityKind::Withdrawal;
        let c = Criticality::Critical;

        let p = plan(k, c, Action::Cancel, RequestStatus::PendingApproval).unwrap();
        assert_eq!(p.effect, LedgerEffect::CancelReservation);

        let p = plan(k, c, Action::Cancel, RequestStatus::Released).unwrap();
        assert_eq!(p.effect, LedgerEffect::RestoreOutstanding);
    }

    #[test]
    fn terminal_states_are_dead_ends() {
        for terminal in [
            RequestStatus::Completed,
            RequestStatus::Returned,
            RequestStatus::Cancelled,
            RequestStatus::Declined,
        ] {
            for action in [
                Action::Submit,
                Action::Verify,
                Action::Approve,
                Action::Release,
                Action::Return,
                Action::Cancel,
                Action::Decline,
            ] {
                assert!(
                    plan(EntityKind::BorrowedTool, Criticality::Basic, action, terminal).is_err(),
                    "{action:?} should be illegal from {terminal:?}"
                );
            }
        }
    }
}
