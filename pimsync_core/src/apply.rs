//! Carry out a plan against the remote service

use std::fmt::Display;

use anyhow::{Context, Result};

use crate::{
    diff::DeleteAction,
    grants::GrantKind,
    logging::info,
    plan::Plan,
    remote::RemoteMutator,
};

/// What an apply run did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    /// Policies replaced
    pub policies_updated: usize,
    /// Grants created
    pub created: usize,
    /// Schedules changed
    pub updated: usize,
    /// Live grants removed
    pub removed: usize,
    /// Pending requests cancelled
    pub cancelled: usize,
}

impl ApplySummary {
    /// Total number of changes made
    pub fn total(&self) -> usize {
        self.policies_updated + self.created + self.updated + self.removed + self.cancelled
    }
}

impl Display for ApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} changes: {} policies updated, {} created, {} updated, {} removed, {} cancelled",
            self.total(),
            self.policies_updated,
            self.created,
            self.updated,
            self.removed,
            self.cancelled
        )
    }
}

/// Issue every change in the plan, one at a time.
///
/// Policies go first, then active grants, then eligible grants; within each
/// kind, creates come before updates and updates before deletes. The first
/// failure stops the run. Nothing already applied is rolled back: planning
/// again from fresh remote state picks up whatever is left.
pub async fn apply_plan(plan: &Plan, mutator: &impl RemoteMutator) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    for update in &plan.policy_updates {
        info!("updating policy for {} at {}", update.role_name, update.target);
        mutator.update_policy(update).await.with_context(|| {
            format!(
                "updating policy for {} at {}",
                update.role_name, update.target
            )
        })?;
        summary.policies_updated += 1;
    }

    for kind in [GrantKind::Active, GrantKind::Eligible] {
        for create in plan.creates.iter().filter(|c| c.grant.kind == kind) {
            let g = &create.grant;
            info!(
                "creating {kind} grant of {} to {} at {}",
                g.role_name, g.principal_name, g.target
            );
            mutator
                .submit_schedule_request(&create.request)
                .await
                .with_context(|| {
                    format!(
                        "creating {kind} grant of {} to {} at {}",
                        g.role_name, g.principal_name, g.target
                    )
                })?;
            summary.created += 1;
        }

        if kind.supports_schedule_updates() {
            for update in plan.updates.iter().filter(|u| u.grant.kind == kind) {
                let g = &update.grant;
                info!(
                    "updating {kind} grant of {} to {} at {}",
                    g.role_name, g.principal_name, g.target
                );
                mutator
                    .submit_schedule_request(&update.request)
                    .await
                    .with_context(|| {
                        format!(
                            "updating {kind} grant of {} to {} at {}",
                            g.role_name, g.principal_name, g.target
                        )
                    })?;
                summary.updated += 1;
            }
        }

        for delete in plan.deletes.iter().filter(|d| d.existing.kind == kind) {
            let description = format!(
                "{kind} grant of {} to {} at {}",
                delete.role_name, delete.principal_name, delete.existing.target
            );
            match &delete.action {
                DeleteAction::Remove(removal) => {
                    info!("removing {description}");
                    mutator
                        .request_removal(removal)
                        .await
                        .with_context(|| format!("removing {description}"))?;
                    summary.removed += 1;
                }
                DeleteAction::Cancel(cancellation) => {
                    info!("cancelling pending {description}");
                    mutator
                        .cancel_request(cancellation)
                        .await
                        .with_context(|| format!("cancelling pending {description}"))?;
                    summary.cancelled += 1;
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::{
        cache::{CachedReader, RunCache},
        config::DesiredState,
        grants::{GrantStatus, PrincipalKind, Target},
        permissions::AccessMode,
        plan::build_plan,
        test_util::{existing, grant, FakeRemote},
        ReconcileError,
    };

    const SUB1: &str = "/subscriptions/sub1";

    fn remote() -> FakeRemote {
        FakeRemote::new()
            .with_owner_caller(SUB1)
            .with_user("u1", "alice@contoso.com")
            .with_user("u2", "bob@contoso.com")
            .with_group("g1", "grp-a")
            .with_role(SUB1, "r-reader", "Reader")
            .with_role(SUB1, "r-owner", "Owner")
    }

    async fn plan_for(remote: &FakeRemote, desired: &DesiredState, mode: AccessMode) -> Result<Plan> {
        let mut cache = RunCache::new();
        let mut reader = CachedReader::new(remote, &mut cache);
        build_plan(desired, &mut reader, mode).await
    }

    fn desired() -> DesiredState {
        let mut state = DesiredState::default();
        state.managed_targets.insert(Target::scope(SUB1));
        let mut eligible = grant(
            "grp-a",
            PrincipalKind::Group,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        );
        eligible.end = Some(datetime!(2030-01-01 0:00 UTC));
        state.grants = vec![
            eligible,
            grant(
                "alice@contoso.com",
                PrincipalKind::User,
                "Owner",
                Target::scope(SUB1),
                GrantKind::Active,
            ),
        ];
        state
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() -> Result<()> {
        let mut pending = existing("req-9", GrantKind::Eligible, "u2", "r-reader", Target::scope(SUB1));
        pending.status = GrantStatus::PendingApproval;
        pending.request_name = "req-9".to_owned();
        let remote = remote()
            .with_existing(existing(
                "s-old",
                GrantKind::Active,
                "u2",
                "r-owner",
                Target::scope(SUB1),
            ))
            .with_existing(pending);

        let desired = desired();
        let plan = plan_for(&remote, &desired, AccessMode::Apply).await?;
        assert_eq!(plan.creates.len(), 2);
        assert_eq!(plan.deletes.len(), 2);

        let summary = apply_plan(&plan, &remote).await?;
        assert_eq!(summary.created, 2);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.cancelled, 1);

        let again = plan_for(&remote, &desired, AccessMode::Apply).await?;
        assert!(again.is_empty(), "second plan was not empty:\n{again}");
        Ok(())
    }

    #[tokio::test]
    async fn items_are_applied_in_order() -> Result<()> {
        let remote = remote()
            .with_existing(existing(
                "s-active",
                GrantKind::Active,
                "u2",
                "r-owner",
                Target::scope(SUB1),
            ))
            .with_existing(existing(
                "s-eligible",
                GrantKind::Eligible,
                "u2",
                "r-reader",
                Target::scope(SUB1),
            ));

        let plan = plan_for(&remote, &desired(), AccessMode::Apply).await?;
        apply_plan(&plan, &remote).await?;

        assert_eq!(
            remote.mutation_log(),
            vec![
                "assign active Owner alice@contoso.com".to_owned(),
                "remove active s-active".to_owned(),
                "assign eligible Reader grp-a".to_owned(),
                "remove eligible s-eligible".to_owned(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn failures_stop_the_run_and_rerun_finishes_it() -> Result<()> {
        let remote = remote();
        let desired = desired();
        let plan = plan_for(&remote, &desired, AccessMode::Apply).await?;

        remote.fail_next("submit_schedule_request");
        let err = apply_plan(&plan, &remote).await.unwrap_err();
        assert!(format!("{err:#}").contains("creating active grant"));
        assert!(remote.mutation_log().is_empty());

        let resumed = plan_for(&remote, &desired, AccessMode::Apply).await?;
        assert_eq!(resumed.creates.len(), 2);
        apply_plan(&resumed, &remote).await?;
        assert!(plan_for(&remote, &desired, AccessMode::Apply).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn permission_denial_happens_before_any_mutation() -> Result<()> {
        let remote = FakeRemote::new()
            .with_reader_caller(SUB1)
            .with_group("g1", "grp-a")
            .with_user("u1", "alice@contoso.com")
            .with_role(SUB1, "r-reader", "Reader")
            .with_role(SUB1, "r-owner", "Owner");

        // reading is fine
        plan_for(&remote, &desired(), AccessMode::Plan).await?;

        let err = plan_for(&remote, &desired(), AccessMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::PermissionDenied { mode: AccessMode::Apply, .. })
        ));
        assert!(remote.mutation_log().is_empty());
        assert_eq!(remote.calls("list_existing_grants"), 2);
        Ok(())
    }
}
