//! An in-memory remote service for tests

#![cfg(test)]

use std::{collections::HashMap, sync::Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use time::macros::datetime;

use crate::{
    grants::{ExistingGrant, Grant, GrantKind, GrantStatus, PrincipalKind, Target},
    policy::{default_template, PolicyUpdate, RemotePolicy},
    remote::{
        Cancellation, CallerAssignment, Removal, RemoteMutator, RemoteReader, RequestAction,
        RoleDefinition, ScheduleRequest,
    },
};

/// A provisioned grant for a user, starting 2024-01-01 and never ending
pub(crate) fn existing(
    id: &str,
    kind: GrantKind,
    principal_id: &str,
    role_definition_id: &str,
    target: Target,
) -> ExistingGrant {
    ExistingGrant {
        id: id.to_owned(),
        kind,
        principal_id: principal_id.to_owned(),
        principal_kind: PrincipalKind::User,
        role_definition_id: role_definition_id.to_owned(),
        target,
        status: GrantStatus::Provisioned,
        start: Some(datetime!(2024-01-01 0:00 UTC)),
        end: None,
        request_name: format!("{id}-request"),
    }
}

/// A desired grant with no dates, ruleset or justification
pub(crate) fn grant(
    principal_name: &str,
    principal_kind: PrincipalKind,
    role_name: &str,
    target: Target,
    kind: GrantKind,
) -> Grant {
    Grant {
        principal_name: principal_name.to_owned(),
        principal_kind,
        role_name: role_name.to_owned(),
        target,
        kind,
        start: None,
        end: None,
        ruleset: None,
        justification: None,
    }
}

#[derive(Default)]
struct FakeState {
    users: HashMap<String, String>,
    groups: HashMap<String, String>,
    roles: Vec<(Target, RoleDefinition)>,
    caller_assignments: HashMap<Target, Vec<CallerAssignment>>,
    grants: Vec<ExistingGrant>,
    policies: HashMap<(Target, String), RemotePolicy>,
    calls: HashMap<&'static str, usize>,
    mutations: Vec<String>,
    fail_next: Option<&'static str>,
    next_id: usize,
}

impl FakeState {
    fn record(&mut self, call: &'static str) -> Result<()> {
        *self.calls.entry(call).or_default() += 1;
        if self.fail_next == Some(call) {
            self.fail_next = None;
            bail!("injected failure in {call}");
        }
        Ok(())
    }

    fn role_name(&self, role_definition_id: &str) -> String {
        self.roles
            .iter()
            .find(|(_, r)| r.id == role_definition_id)
            .map(|(_, r)| r.name.to_owned())
            .unwrap_or_else(|| role_definition_id.to_owned())
    }

    fn principal_name(&self, principal_id: &str) -> String {
        self.users
            .get(principal_id)
            .or_else(|| self.groups.get(principal_id))
            .cloned()
            .unwrap_or_else(|| principal_id.to_owned())
    }
}

/// Remote state held in memory. Mutations change what later reads return,
/// so whole plan/apply/plan cycles can be run against it.
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    fn with(mut self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(self.state.get_mut().unwrap());
        self
    }

    pub(crate) fn with_user(self, id: &str, upn: &str) -> Self {
        self.with(|s| {
            s.users.insert(id.to_owned(), upn.to_owned());
        })
    }

    pub(crate) fn with_group(self, id: &str, name: &str) -> Self {
        self.with(|s| {
            s.groups.insert(id.to_owned(), name.to_owned());
        })
    }

    /// A role with no actions, visible at `target`
    pub(crate) fn with_role(self, target: &str, id: &str, name: &str) -> Self {
        self.with_role_definition(
            target,
            RoleDefinition {
                id: id.to_owned(),
                name: name.to_owned(),
                actions: vec![],
                not_actions: vec![],
            },
        )
    }

    pub(crate) fn with_role_definition(self, target: &str, role: RoleDefinition) -> Self {
        self.with(|s| s.roles.push((Target::scope(target), role)))
    }

    pub(crate) fn with_caller_assignment(self, target: &str, role_definition_id: &str) -> Self {
        self.with(|s| {
            let assignments = s.caller_assignments.entry(Target::scope(target)).or_default();
            let id = format!("caller-assignment-{}", assignments.len());
            assignments.push(CallerAssignment {
                id,
                role_definition_id: role_definition_id.to_owned(),
            });
        })
    }

    /// The caller holds Owner at `target`
    pub(crate) fn with_owner_caller(self, target: &str) -> Self {
        self.with_role_definition(
            target,
            RoleDefinition {
                id: "caller-owner".to_owned(),
                name: "Owner (caller)".to_owned(),
                actions: vec!["*".to_owned()],
                not_actions: vec![],
            },
        )
        .with_caller_assignment(target, "caller-owner")
    }

    /// The caller holds Reader at `target`
    pub(crate) fn with_reader_caller(self, target: &str) -> Self {
        self.with_role_definition(
            target,
            RoleDefinition {
                id: "caller-reader".to_owned(),
                name: "Reader (caller)".to_owned(),
                actions: vec!["*/read".to_owned()],
                not_actions: vec![],
            },
        )
        .with_caller_assignment(target, "caller-reader")
    }

    pub(crate) fn with_existing(self, grant: ExistingGrant) -> Self {
        self.with(|s| s.grants.push(grant))
    }

    pub(crate) fn with_policy(self, target: &str, role_definition_id: &str, policy: RemotePolicy) -> Self {
        self.with(|s| {
            s.policies
                .insert((Target::scope(target), role_definition_id.to_owned()), policy);
        })
    }

    /// Make the next call to `call` fail
    pub(crate) fn fail_next(&self, call: &'static str) {
        self.state.lock().unwrap().fail_next = Some(call);
    }

    /// How many times `call` was made
    pub(crate) fn calls(&self, call: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(call)
            .copied()
            .unwrap_or_default()
    }

    /// Successful mutations, in order
    pub(crate) fn mutation_log(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.to_owned()
    }
}

fn covers(outer: &Target, inner: &Target) -> bool {
    match (outer, inner) {
        (Target::Scope(o), Target::Scope(i)) => i == o || i.starts_with(&format!("{o}/")),
        _ => outer == inner,
    }
}

#[async_trait]
impl RemoteReader for FakeRemote {
    async fn list_existing_grants(
        &self,
        kind: GrantKind,
        target: &Target,
    ) -> Result<Vec<ExistingGrant>> {
        let mut s = self.state.lock().unwrap();
        s.record("list_existing_grants")?;
        // Like the real service, report grants below the target as well
        Ok(s.grants
            .iter()
            .filter(|g| g.kind == kind && covers(target, &g.target))
            .cloned()
            .collect())
    }

    async fn principal_name(&self, principal_id: &str) -> Result<Option<String>> {
        let mut s = self.state.lock().unwrap();
        s.record("principal_name")?;
        Ok(s.users
            .get(principal_id)
            .or_else(|| s.groups.get(principal_id))
            .cloned())
    }

    async fn principal_id(&self, kind: PrincipalKind, name: &str) -> Result<Option<String>> {
        let mut s = self.state.lock().unwrap();
        s.record("principal_id")?;
        let directory = match kind {
            PrincipalKind::User => &s.users,
            PrincipalKind::Group => &s.groups,
        };
        Ok(directory
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(id, _)| id.to_owned()))
    }

    async fn role_definition(
        &self,
        _target: &Target,
        role_definition_id: &str,
    ) -> Result<Option<RoleDefinition>> {
        let mut s = self.state.lock().unwrap();
        s.record("role_definition")?;
        Ok(s.roles
            .iter()
            .find(|(_, r)| r.id.eq_ignore_ascii_case(role_definition_id))
            .map(|(_, r)| r.to_owned()))
    }

    async fn find_role_definition(
        &self,
        target: &Target,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>> {
        let mut s = self.state.lock().unwrap();
        s.record("find_role_definition")?;
        Ok(s.roles
            .iter()
            .find(|(t, r)| covers(t, target) && r.name.eq_ignore_ascii_case(role_name))
            .map(|(_, r)| r.to_owned()))
    }

    async fn effective_policy(
        &self,
        target: &Target,
        role: &RoleDefinition,
    ) -> Result<RemotePolicy> {
        let mut s = self.state.lock().unwrap();
        s.record("effective_policy")?;
        match s.policies.get(&(target.to_owned(), role.id.to_owned())) {
            Some(policy) => Ok(policy.to_owned()),
            None => Ok(RemotePolicy {
                id: format!("policy:{target}:{}", role.id),
                rules: default_template()?,
            }),
        }
    }

    async fn caller_assignments(&self, target: &Target) -> Result<Vec<CallerAssignment>> {
        let mut s = self.state.lock().unwrap();
        s.record("caller_assignments")?;
        Ok(s.caller_assignments
            .get(target)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RemoteMutator for FakeRemote {
    async fn submit_schedule_request(&self, request: &ScheduleRequest) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.record("submit_schedule_request")?;
        match request.action {
            RequestAction::AdminAssign => {
                s.next_id += 1;
                let id = s.next_id;
                let grant = ExistingGrant {
                    id: format!("s-{id}"),
                    kind: request.kind,
                    principal_id: request.principal_id.to_owned(),
                    principal_kind: request.principal_kind,
                    role_definition_id: request.role_definition_id.to_owned(),
                    target: request.target.to_owned(),
                    status: GrantStatus::Provisioned,
                    start: Some(request.start.unwrap_or(datetime!(2024-06-01 0:00 UTC))),
                    end: request.end,
                    request_name: format!("r-{id}"),
                };
                let log = format!(
                    "assign {} {} {}",
                    request.kind,
                    s.role_name(&request.role_definition_id),
                    s.principal_name(&request.principal_id)
                );
                s.grants.push(grant);
                s.mutations.push(log);
            }
            RequestAction::AdminUpdate => {
                let schedule_id = request.target_schedule_id.to_owned().unwrap_or_default();
                let Some(grant) = s.grants.iter_mut().find(|g| g.id == schedule_id) else {
                    bail!("no schedule {schedule_id}");
                };
                if request.start.is_some() {
                    grant.start = request.start;
                }
                grant.end = request.end;
                s.mutations
                    .push(format!("update {} {schedule_id}", request.kind));
            }
            RequestAction::AdminRemove => bail!("removals go through request_removal"),
        }
        Ok(())
    }

    async fn request_removal(&self, removal: &Removal) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.record("request_removal")?;
        let before = s.grants.len();
        s.grants
            .retain(|g| !(g.id == removal.schedule_id && g.status.is_provisioned()));
        if s.grants.len() == before {
            bail!("no live schedule {}", removal.schedule_id);
        }
        s.mutations
            .push(format!("remove {} {}", removal.kind, removal.schedule_id));
        Ok(())
    }

    async fn cancel_request(&self, cancellation: &Cancellation) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.record("cancel_request")?;
        let before = s.grants.len();
        s.grants.retain(|g| {
            !(g.request_name == cancellation.request_name && !g.status.is_provisioned())
        });
        if s.grants.len() == before {
            bail!("no pending request {}", cancellation.request_name);
        }
        s.mutations.push(format!(
            "cancel {} {}",
            cancellation.kind, cancellation.request_name
        ));
        Ok(())
    }

    async fn update_policy(&self, update: &PolicyUpdate) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.record("update_policy")?;
        let role_id = s
            .roles
            .iter()
            .find(|(t, r)| covers(t, &update.target) && r.name.eq_ignore_ascii_case(&update.role_name))
            .map(|(_, r)| r.id.to_owned())
            .unwrap_or_default();
        s.policies.insert(
            (update.target.to_owned(), role_id),
            RemotePolicy {
                id: update.policy_id.to_owned(),
                rules: update.rules.to_owned(),
            },
        );
        s.mutations.push(format!("policy {}", update.role_name));
        Ok(())
    }
}
