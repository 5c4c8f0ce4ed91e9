//! Turn "this grant shouldn't exist" into the request that actually gets rid
//! of it.

use std::fmt::Display;

use uuid::Uuid;

use crate::{
    grants::{ExistingGrant, GrantStatus},
    remote::{Cancellation, Removal},
};

/// How an unwanted grant is taken away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteAction {
    /// Revoke a live grant through an admin-removal request
    Remove(Removal),
    /// Cancel a request that never went live
    Cancel(Cancellation),
}

impl DeleteAction {
    /// Whether this is a cancellation
    pub fn is_cancel(&self) -> bool {
        matches!(self, DeleteAction::Cancel(_))
    }
}

impl Display for DeleteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteAction::Remove(r) => write!(f, "remove schedule {}", r.schedule_id),
            DeleteAction::Cancel(c) => write!(f, "cancel request {}", c.request_name),
        }
    }
}

/// Pick removal or cancellation based on the grant's remote status.
///
/// Only a provisioned grant has a live schedule to remove. Anything else is
/// a request that hasn't finished, and the only thing to do with it is
/// cancel it by name.
pub fn resolve_delete(existing: &ExistingGrant) -> DeleteAction {
    match existing.status {
        GrantStatus::Provisioned => DeleteAction::Remove(Removal {
            request_id: Uuid::new_v4(),
            kind: existing.kind,
            target: existing.target.to_owned(),
            schedule_id: existing.id.to_owned(),
            principal_id: existing.principal_id.to_owned(),
            principal_kind: existing.principal_kind,
            role_definition_id: existing.role_definition_id.to_owned(),
        }),
        GrantStatus::Accepted
        | GrantStatus::PendingEvaluation
        | GrantStatus::Granted
        | GrantStatus::Denied
        | GrantStatus::PendingProvisioning
        | GrantStatus::PendingRevocation
        | GrantStatus::Revoked
        | GrantStatus::Canceled
        | GrantStatus::Failed
        | GrantStatus::PendingApprovalProvisioning
        | GrantStatus::PendingApproval
        | GrantStatus::FailedAsResourceIsLocked
        | GrantStatus::PendingAdminDecision
        | GrantStatus::AdminApproved
        | GrantStatus::AdminDenied
        | GrantStatus::TimedOut
        | GrantStatus::ProvisioningStarted
        | GrantStatus::Invalid
        | GrantStatus::PendingScheduleCreation
        | GrantStatus::ScheduleCreated
        | GrantStatus::PendingExternalProvisioning => DeleteAction::Cancel(Cancellation {
            kind: existing.kind,
            target: existing.target.to_owned(),
            request_name: existing.request_name.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        grants::{GrantKind, Target},
        test_util::existing,
    };

    fn with_status(status: GrantStatus) -> ExistingGrant {
        let mut grant = existing(
            "schedule-1",
            GrantKind::Eligible,
            "u1",
            "r1",
            Target::scope("/subscriptions/sub1"),
        );
        grant.request_name = "request-1".to_owned();
        grant.status = status;
        grant
    }

    #[test]
    fn provisioned_grants_are_removed_by_schedule() {
        match resolve_delete(&with_status(GrantStatus::Provisioned)) {
            DeleteAction::Remove(r) => {
                assert_eq!(r.schedule_id, "schedule-1");
                assert_eq!(r.principal_id, "u1");
                assert_eq!(r.role_definition_id, "r1");
            }
            other => panic!("expected a removal, got {other:?}"),
        }
    }

    #[test]
    fn pending_approval_is_cancelled_by_request_name() {
        let action = resolve_delete(&with_status(GrantStatus::PendingApproval));
        assert!(action.is_cancel());
        assert_eq!(
            action,
            DeleteAction::Cancel(Cancellation {
                kind: GrantKind::Eligible,
                target: Target::scope("/subscriptions/sub1"),
                request_name: "request-1".to_owned(),
            })
        );
    }

    #[test]
    fn routing_is_exhaustive_and_exclusive() {
        for status in GrantStatus::all() {
            let action = resolve_delete(&with_status(*status));
            assert_eq!(
                action.is_cancel(),
                !status.is_provisioned(),
                "status {status} routed to {action}"
            );
        }
    }

    #[test]
    fn removals_get_fresh_request_ids() {
        let grant = with_status(GrantStatus::Provisioned);
        match (resolve_delete(&grant), resolve_delete(&grant)) {
            (DeleteAction::Remove(a), DeleteAction::Remove(b)) => {
                assert_ne!(a.request_id, b.request_id)
            }
            _ => panic!("expected removals"),
        }
    }
}
