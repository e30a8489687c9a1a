//! Permission guard: one table, no scattered role checks
//!
//! Pure lookups over a static role-grant table plus the two ownership
//! escapes (initiator cancel, custodian return). Evaluated before every
//! state-changing call; never mutates anything itself.
use crate::request::WorkflowRequest;
use crate::types::{Action, Criticality, EntityKind, Role};

const MAKERS: &[Role] = &[Role::Warehouseman, Role::SiteWorker, Role::ProjectManager];
const VERIFIERS_CRITICAL: &[Role] = &[Role::ProjectManager];
const VERIFIERS_BASIC: &[Role] = &[Role::ProjectManager, Role::Warehouseman];
const APPROVERS_CRITICAL: &[Role] = &[Role::AssetDirector];
const APPROVERS_BASIC: &[Role] = &[Role::AssetDirector, Role::ProjectManager];
const OPERATIONS: &[Role] = &[Role::Warehouseman];
const RECEIVERS: &[Role] = &[Role::Warehouseman, Role::ProjectManager];
const SUPERVISORS: &[Role] = &[Role::ProjectManager, Role::AssetDirector];

/// Roles statically authorized for an action, before ownership escapes.
pub fn granted_roles(
    kind: EntityKind,
    criticality: Criticality,
    action: Action,
) -> &'static [Role] {
    match action {
        Action::Create | Action::Submit => MAKERS,
        Action::Verify => match criticality {
            Criticality::Critical => VERIFIERS_CRITICAL,
            Criticality::Basic => VERIFIERS_BASIC,
        },
        Action::Approve => match criticality {
            Criticality::Critical => APPROVERS_CRITICAL,
            Criticality::Basic => APPROVERS_BASIC,
        },
        Action::Release | Action::Dispatch => OPERATIONS,
        // transfers are received and closed out at the destination project
        Action::Receive | Action::Complete => match kind {
            EntityKind::Transfer => RECEIVERS,
            _ => OPERATIONS,
        },
        Action::Return => OPERATIONS,
        // cancel is ownership/supervision driven, see can_perform
        Action::Cancel => &[],
        Action::Decline => SUPERVISORS,
    }
}

/// `true` if `actor` acting as `role` may perform `action` on the request
/// in its current state. State *legality* belongs to the state machine;
/// this answers only who is allowed to ask.
pub fn can_perform(role: Role, actor: &str, action: Action, req: &WorkflowRequest) -> bool {
    if role == Role::Admin {
        return true;
    }

    match action {
        // initiator may pull a request back any time before stock moves;
        // supervisors may cancel anything not yet terminal.
        Action::Cancel => {
            if req.status.is_terminal() {
                return false;
            }
            if SUPERVISORS.contains(&role) {
                return true;
            }
            actor == req.initiator && req.status.is_pre_release()
        }

        // only whoever holds the stock, or the warehouse itself, can
        // book a return, and only while stock is actually out.
        Action::Return => {
            if !req.status.is_in_custody() {
                return false;
            }
            if req.custodian.as_deref() == Some(actor) {
                return true;
            }
            granted_roles(req.entity_kind, req.criticality, action).contains(&role)
        }

        // drafts are submitted by the maker that owns them
        Action::Submit => {
            actor == req.initiator
                && granted_roles(req.entity_kind, req.criticality, action).contains(&role)
        }

        // separation of duties on the critical path: the verifier must
        // not be the initiator, the approver must be a third identity.
        Action::Verify if req.criticality == Criticality::Critical => {
            granted_roles(req.entity_kind, req.criticality, action).contains(&role)
                && actor != req.initiator
        }
        Action::Approve if req.criticality == Criticality::Critical => {
            granted_roles(req.entity_kind, req.criticality, action).contains(&role)
                && actor != req.initiator
                && req.stage_actor(Action::Verify) != Some(actor)
        }

        _ => granted_roles(req.entity_kind, req.criticality, action).contains(&role),
    }
}

/// Whether this role may use the streamlined create-and-release path:
/// the combined Create+Release step needs both capabilities in one role,
/// and only Basic criticality qualifies.
pub fn can_streamline(role: Role, criticality: Criticality) -> bool {
    if role == Role::Admin {
        return true;
    }
    criticality == Criticality::Basic && MAKERS.contains(&role) && OPERATIONS.contains(&role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::LineItem;
    use crate::types::{RequestStatus, TimeStamp};

    fn critical_tool_request() -> WorkflowRequest {
        let mut req = WorkflowRequest::new(
            EntityKind::BorrowedTool,
            Criticality::Critical,
            "user_maker",
            vec![LineItem::new("item_drill", 1)],
        );
        req.status = RequestStatus::PendingVerification;
        req
    }

    #[test]
    fn admin_bypasses_everything() {
        let req = critical_tool_request();
        for action in [
            Action::Verify,
            Action::Approve,
            Action::Release,
            Action::Cancel,
            Action::Decline,
        ] {
            assert!(can_perform(Role::Admin, "user_root", action, &req));
        }
    }

    #[test]
    fn verifier_must_differ_from_initiator() {
        let req = critical_tool_request();
        assert!(can_perform(
            Role::ProjectManager,
            "user_pm",
            Action::Verify,
            &req
        ));
        // same identity as the maker, even with the verifier role
        assert!(!can_perform(
            Role::ProjectManager,
            "user_maker",
            Action::Verify,
            &req
        ));
    }

    #[test]
    fn approver_must_be_a_third_identity() {
        let mut req = critical_tool_request();
        req.record_stage(Action::Verify, "user_pm", None, false, TimeStamp::new());
        req.status = RequestStatus::PendingApproval;

        assert!(can_perform(
            Role::AssetDirector,
            "user_director",
            Action::Approve,
            &req
        ));
        assert!(!can_perform(
            Role::AssetDirector,
            "user_pm",
            Action::Approve,
            &req
        ));
        assert!(!can_perform(
            Role::AssetDirector,
            "user_maker",
            Action::Approve,
            &req
        ));
    }

    #[test]
    fn initiator_cancel_window_closes_at_release() {
        let mut req = critical_tool_request();
        assert!(can_perform(
            Role::Warehouseman,
            "user_maker",
            Action::Cancel,
            &req
        ));

        req.status = RequestStatus::Borrowed;
        assert!(!can_perform(
            Role::Warehouseman,
            "user_maker",
            Action::Cancel,
            &req
        ));
        // but a supervisor still can
        assert!(can_perform(
            Role::ProjectManager,
            "user_pm",
            Action::Cancel,
            &req
        ));

        req.status = RequestStatus::Returned;
        assert!(!can_perform(
            Role::ProjectManager,
            "user_pm",
            Action::Cancel,
            &req
        ));
    }

    #[test]
    fn return_requires_custody() {
        let mut req = critical_tool_request();
        req.status = RequestStatus::Borrowed;
        req.custodian = Some("user_borrower".into());

        assert!(can_perform(
            Role::SiteWorker,
            "user_borrower",
            Action::Return,
            &req
        ));
        // warehouse can always book a return
        assert!(can_perform(
            Role::Warehouseman,
            "user_wh",
            Action::Return,
            &req
        ));
        // a stranger cannot
        assert!(!can_perform(
            Role::SiteWorker,
            "user_other",
            Action::Return,
            &req
        ));

        // nothing to return while still pending
        req.status = RequestStatus::PendingApproval;
        assert!(!can_perform(
            Role::SiteWorker,
            "user_borrower",
            Action::Return,
            &req
        ));
    }

    #[test]
    fn streamlining_is_basic_only() {
        assert!(can_streamline(Role::Warehouseman, Criticality::Basic));
        assert!(!can_streamline(Role::Warehouseman, Criticality::Critical));
        assert!(!can_streamline(Role::AssetDirector, Criticality::Basic));
        // makers without release rights still need the full chain
        assert!(!can_streamline(Role::SiteWorker, Criticality::Basic));
    }
}
