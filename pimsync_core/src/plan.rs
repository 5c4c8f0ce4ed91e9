//! Build the set of changes that would bring the remote service in line with
//! configuration.

use std::{collections::BTreeMap, fmt::Display};

use anyhow::Result;
use colored::Colorize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{
    cache::CachedReader,
    config::DesiredState,
    diff::{match_grants, resolve_delete, DeleteAction, ResolvedNames},
    grants::{ExistingGrant, Grant, GrantKind, Target},
    log_runtime,
    logging::debug,
    permissions::{check_permissions, AccessMode},
    policy::{build_desired_rules, default_template, diff_policy, resolve_rulesets, PolicyUpdate},
    remote::{RemoteReader, RequestAction, ScheduleRequest},
};

/// A grant to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCreate {
    /// The desired grant
    pub grant: Grant,
    /// The request that creates it
    pub request: ScheduleRequest,
}

/// A schedule to change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpdate {
    /// The desired grant
    pub grant: Grant,
    /// What's there now
    pub existing: ExistingGrant,
    /// The request that changes it
    pub request: ScheduleRequest,
}

/// A grant to take away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelete {
    /// What's there now
    pub existing: ExistingGrant,
    /// Resolved principal name, for display
    pub principal_name: String,
    /// Resolved role name, for display
    pub role_name: String,
    /// Removal or cancellation
    pub action: DeleteAction,
}

/// Everything one run would change. Plans are never persisted; each run
/// builds a fresh one from current configuration and remote state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Grants to create
    pub creates: Vec<PlannedCreate>,
    /// Schedules to change
    pub updates: Vec<PlannedUpdate>,
    /// Grants to remove or requests to cancel
    pub deletes: Vec<PlannedDelete>,
    /// Policies to replace
    pub policy_updates: Vec<PolicyUpdate>,
}

impl Plan {
    /// Whether the plan changes nothing
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.policy_updates.is_empty()
    }

    /// Total number of changes
    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len() + self.policy_updates.len()
    }
}

fn fmt_date(date: &Option<OffsetDateTime>) -> String {
    match date {
        Some(d) => d.format(&Rfc3339).unwrap_or_else(|_| d.to_string()),
        None => "none".to_owned(),
    }
}

impl Display for PlannedCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = &self.grant;
        let mut text = format!(
            "+ {} grant: {} ({}) as {} @ {}\n",
            g.kind, g.principal_name, g.principal_kind, g.role_name, g.target
        )
        .green()
        .to_string();
        if g.start.is_some() {
            text += format!("    start: {}\n", fmt_date(&g.start)).as_str();
        }
        if g.end.is_some() {
            text += format!("    end: {}\n", fmt_date(&g.end)).as_str();
        }
        write!(f, "{text}")
    }
}

impl Display for PlannedUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = &self.grant;
        let mut text = format!(
            "{}{} ({}) as {} @ {}\n",
            format!("~ {} grant: ", g.kind).yellow(),
            g.principal_name.yellow(),
            g.principal_kind,
            g.role_name,
            g.target
        );
        let existing_start = self.existing.start;
        if g.start.is_some() && g.start != existing_start {
            text += format!(
                "    start: {} -> {}\n",
                fmt_date(&existing_start),
                fmt_date(&g.start)
            )
            .yellow()
            .to_string()
            .as_str();
        }
        if g.end != self.existing.end {
            text += format!(
                "    end: {} -> {}\n",
                fmt_date(&self.existing.end),
                fmt_date(&g.end)
            )
            .yellow()
            .to_string()
            .as_str();
        }
        write!(f, "{text}")
    }
}

impl Display for PlannedDelete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let e = &self.existing;
        let text = format!(
            "- {} grant: {} ({}) as {} @ {}\n    {} [{}]\n",
            e.kind, self.principal_name, e.principal_kind, self.role_name, e.target, self.action, e.status
        )
        .red();
        write!(f, "{text}")
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes found");
        }
        for update in &self.policy_updates {
            writeln!(f, "{update}")?;
        }
        for create in &self.creates {
            writeln!(f, "{create}")?;
        }
        for update in &self.updates {
            writeln!(f, "{update}")?;
        }
        for delete in &self.deletes {
            writeln!(f, "{delete}")?;
        }
        Ok(())
    }
}

/// Compare desired state with the remote service and work out what to do.
///
/// Nothing is changed remotely. Every read goes through the run's cache.
pub async fn build_plan<R: RemoteReader>(
    desired: &DesiredState,
    reader: &mut CachedReader<'_, R>,
    mode: AccessMode,
) -> Result<Plan> {
    desired.validate()?;

    log_runtime!(
        "checking permissions",
        check_permissions(reader, &desired.managed_targets, mode).await?
    );

    let existing = log_runtime!("listing existing grants", {
        let mut existing = Vec::new();
        for target in &desired.managed_targets {
            existing.extend(reader.existing_grants(target).await?);
        }
        existing
    });
    debug!(
        "found {} existing grants across {} targets",
        existing.len(),
        desired.managed_targets.len()
    );

    let names = log_runtime!("resolving names", resolve_names(&existing, reader).await?);
    let matched = match_grants(&desired.grants, &existing, &names)?;
    debug!(
        "{} to create, {} to update, {} to delete, {} unchanged",
        matched.creates.len(),
        matched.updates.len(),
        matched.deletes.len(),
        matched.unchanged.len()
    );

    let mut plan = Plan::default();

    for grant in matched.creates {
        let principal_id = reader
            .principal_id(grant.principal_kind, &grant.principal_name)
            .await?;
        let role = reader
            .find_role_definition(&grant.target, &grant.role_name)
            .await?;
        let request = ScheduleRequest {
            request_id: Uuid::new_v4(),
            kind: grant.kind,
            action: RequestAction::AdminAssign,
            target: grant.target.to_owned(),
            principal_id,
            principal_kind: grant.principal_kind,
            role_definition_id: role.id,
            start: grant.start,
            end: grant.end,
            justification: grant.justification.to_owned(),
            target_schedule_id: None,
        };
        plan.creates.push(PlannedCreate { grant, request });
    }

    for (grant, existing) in matched.updates {
        let request = ScheduleRequest {
            request_id: Uuid::new_v4(),
            kind: grant.kind,
            action: RequestAction::AdminUpdate,
            target: grant.target.to_owned(),
            principal_id: existing.principal_id.to_owned(),
            principal_kind: existing.principal_kind,
            role_definition_id: existing.role_definition_id.to_owned(),
            // The remote side's start stands unless configuration pins one
            start: grant.start.or(existing.start),
            end: grant.end,
            justification: grant.justification.to_owned(),
            target_schedule_id: Some(existing.id.to_owned()),
        };
        plan.updates.push(PlannedUpdate {
            grant,
            existing,
            request,
        });
    }

    for unmatched in matched.deletes {
        plan.deletes.push(PlannedDelete {
            action: resolve_delete(&unmatched.existing),
            existing: unmatched.existing,
            principal_name: unmatched.principal_name,
            role_name: unmatched.role_name,
        });
    }

    plan.policy_updates = log_runtime!(
        "diffing policies",
        plan_policies(desired, reader).await?
    );

    Ok(plan)
}

async fn resolve_names<R: RemoteReader>(
    existing: &[ExistingGrant],
    reader: &mut CachedReader<'_, R>,
) -> Result<ResolvedNames> {
    let mut names = ResolvedNames::default();
    for grant in existing {
        let principal = reader.principal_name(&grant.principal_id).await?;
        names.insert_principal(grant.principal_id.to_owned(), principal);
        let role = reader
            .role_definition(&grant.target, &grant.role_definition_id)
            .await?;
        names.insert_role(grant.role_definition_id.to_owned(), role.name);
    }
    Ok(names)
}

/// Policies are managed for every (target, role) that has eligible grants
async fn plan_policies<R: RemoteReader>(
    desired: &DesiredState,
    reader: &mut CachedReader<'_, R>,
) -> Result<Vec<PolicyUpdate>> {
    // (target, lowercased role) -> (role name as configured, grant ruleset)
    let mut pairs: BTreeMap<(Target, String), (&str, Option<&str>)> = BTreeMap::new();
    for grant in desired
        .grants
        .iter()
        .filter(|g| g.kind == GrantKind::Eligible)
    {
        let entry = pairs
            .entry((grant.target.to_owned(), grant.role_name.to_lowercase()))
            .or_insert((grant.role_name.as_str(), None));
        if entry.1.is_none() {
            entry.1 = grant.ruleset.as_deref();
        }
    }

    let template = default_template()?;
    let mut res = Vec::new();
    for ((target, _), (role_name, grant_ruleset)) in pairs {
        let ruleset_names = resolve_rulesets(&target, role_name, grant_ruleset, &desired.policies);
        let desired_rules = build_desired_rules(&template, &ruleset_names, &desired.rulesets)?;

        let role = reader.find_role_definition(&target, role_name).await?;
        let remote = reader.effective_policy(&target, &role).await?;
        match diff_policy(&target, &role.name, &desired_rules, &remote) {
            Some(update) => {
                debug!("policy for {} at {target} has drifted", role.name);
                res.push(update)
            }
            None => debug!("policy for {} at {target} is up to date", role.name),
        }
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::{
        cache::RunCache,
        grants::{GrantStatus, PrincipalKind},
        policy::{
            rules::{ExpirationRule, Rule},
            RemotePolicy, RulePatch, Ruleset,
        },
        test_util::{existing, grant, FakeRemote},
        ReconcileError,
    };

    const SUB1: &str = "/subscriptions/sub1";

    fn remote() -> FakeRemote {
        FakeRemote::new()
            .with_owner_caller(SUB1)
            .with_user("u1", "alice@contoso.com")
            .with_group("g1", "grp-a")
            .with_role(SUB1, "r-reader", "Reader")
            .with_role(SUB1, "r-owner", "Owner")
    }

    fn state(grants: Vec<Grant>) -> DesiredState {
        let mut state = DesiredState::default();
        state.managed_targets.insert(Target::scope(SUB1));
        state.grants = grants;
        state
    }

    async fn plan_for(remote: &FakeRemote, desired: &DesiredState) -> Result<Plan> {
        let mut cache = RunCache::new();
        let mut reader = CachedReader::new(remote, &mut cache);
        build_plan(desired, &mut reader, AccessMode::Plan).await
    }

    #[tokio::test]
    async fn creates_an_eligible_grant() -> Result<()> {
        let remote = remote();
        let desired = state(vec![grant(
            "grp-a",
            PrincipalKind::Group,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        )]);

        let plan = plan_for(&remote, &desired).await?;
        assert_eq!(plan.creates.len(), 1);
        let request = &plan.creates[0].request;
        assert_eq!(request.action, RequestAction::AdminAssign);
        assert_eq!(request.principal_id, "g1");
        assert_eq!(request.role_definition_id, "r-reader");
        assert_eq!(request.end, None);
        assert!(plan.updates.is_empty() && plan.deletes.is_empty());
        // the remote policy matches the template, so no policy changes
        assert!(plan.policy_updates.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn end_date_change_carries_the_existing_start() -> Result<()> {
        let start = datetime!(2024-03-01 12:00 UTC);
        let mut observed = existing("s1", GrantKind::Eligible, "g1", "r-reader", Target::scope(SUB1));
        observed.principal_kind = PrincipalKind::Group;
        observed.start = Some(start);
        observed.end = Some(datetime!(2025-01-01 0:00 UTC));
        let remote = remote().with_existing(observed);

        let mut desired_grant = grant(
            "grp-a",
            PrincipalKind::Group,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        );
        desired_grant.end = Some(datetime!(2025-06-01 0:00 UTC));

        let plan = plan_for(&remote, &state(vec![desired_grant])).await?;
        assert_eq!(plan.updates.len(), 1);
        let request = &plan.updates[0].request;
        assert_eq!(request.action, RequestAction::AdminUpdate);
        assert_eq!(request.end, Some(datetime!(2025-06-01 0:00 UTC)));
        assert_eq!(request.start, Some(start));
        assert_eq!(request.target_schedule_id.as_deref(), Some("s1"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_starts_are_left_to_the_remote_side() -> Result<()> {
        let mut observed = existing("s1", GrantKind::Eligible, "g1", "r-reader", Target::scope(SUB1));
        observed.principal_kind = PrincipalKind::Group;
        observed.start = None;
        let remote = remote().with_existing(observed);

        let mut desired_grant = grant(
            "grp-a",
            PrincipalKind::Group,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        );
        desired_grant.end = Some(datetime!(2025-06-01 0:00 UTC));

        let plan = plan_for(&remote, &state(vec![desired_grant])).await?;
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].request.start, None);
        Ok(())
    }

    #[tokio::test]
    async fn pending_grants_are_cancelled() -> Result<()> {
        let mut observed = existing("req-1", GrantKind::Eligible, "u1", "r-reader", Target::scope(SUB1));
        observed.status = GrantStatus::PendingApproval;
        observed.request_name = "req-1".to_owned();
        let remote = remote().with_existing(observed);

        let plan = plan_for(&remote, &state(vec![])).await?;
        assert_eq!(plan.deletes.len(), 1);
        assert!(plan.deletes[0].action.is_cancel());
        assert_eq!(plan.deletes[0].principal_name, "alice@contoso.com");
        Ok(())
    }

    #[tokio::test]
    async fn policy_drift_is_planned() -> Result<()> {
        let template = default_template()?;
        let drifted = template
            .into_iter()
            .map(|r| match r {
                Rule::Expiration(e) if e.id == "Expiration_Admin_Eligibility" => {
                    Rule::Expiration(ExpirationRule {
                        maximum_duration: Some("P90D".to_owned()),
                        ..e
                    })
                }
                other => other,
            })
            .collect();
        let remote = remote().with_policy(
            SUB1,
            "r-reader",
            RemotePolicy {
                id: "policy-reader".to_owned(),
                rules: drifted,
            },
        );

        let mut desired = state(vec![grant(
            "grp-a",
            PrincipalKind::Group,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        )]);
        desired.rulesets.insert(
            "short".to_owned(),
            Ruleset {
                name: "short".to_owned(),
                rules: vec![RulePatch {
                    rule_id: "Expiration_Admin_Eligibility".to_owned(),
                    patch: json!({"maximumDuration": "P30D"}),
                }],
            },
        );
        desired.policies.default = vec!["short".to_owned()];

        let plan = plan_for(&remote, &desired).await?;
        assert_eq!(plan.policy_updates.len(), 1);
        let update = &plan.policy_updates[0];
        assert_eq!(update.policy_id, "policy-reader");
        assert_eq!(update.role_name, "Reader");
        assert_eq!(update.changed_rules, vec!["Expiration_Admin_Eligibility"]);
        Ok(())
    }

    #[tokio::test]
    async fn active_grants_do_not_manage_policies() -> Result<()> {
        let remote = remote();
        let mut desired = state(vec![grant(
            "alice@contoso.com",
            PrincipalKind::User,
            "Owner",
            Target::scope(SUB1),
            GrantKind::Active,
        )]);
        desired.policies.default = vec!["missing".to_owned()];
        desired.rulesets.insert(
            "missing".to_owned(),
            Ruleset {
                name: "missing".to_owned(),
                rules: vec![],
            },
        );

        let plan = plan_for(&remote, &desired).await?;
        assert_eq!(plan.creates.len(), 1);
        assert!(plan.policy_updates.is_empty());
        assert_eq!(remote.calls("effective_policy"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dangling_principal_aborts_the_plan() -> Result<()> {
        let remote = remote().with_existing(existing(
            "s1",
            GrantKind::Eligible,
            "u-deleted",
            "r-reader",
            Target::scope(SUB1),
        ));
        let err = plan_for(&remote, &state(vec![])).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::DanglingReference { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_principal_aborts_the_plan() {
        let remote = remote();
        let desired = state(vec![grant(
            "bob@contoso.com",
            PrincipalKind::User,
            "Reader",
            Target::scope(SUB1),
            GrantKind::Eligible,
        )]);
        let err = plan_for(&remote, &desired).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::UnresolvedName { kind: "user", .. })
        ));
    }

    #[tokio::test]
    async fn empty_plans_say_so() -> Result<()> {
        let plan = plan_for(&remote(), &state(vec![])).await?;
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
        assert!(plan.to_string().contains("No changes found"));
        Ok(())
    }
}
