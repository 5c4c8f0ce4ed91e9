//! Run-scoped memoization of remote reads.
//!
//! A [`RunCache`] lives exactly as long as one reconciliation. Nothing in it
//! is persisted and nothing expires, so a fresh run always sees fresh state.

use std::collections::HashMap;

use anyhow::Result;

use crate::{
    grants::{ExistingGrant, GrantKind, PrincipalKind, Target},
    logging::debug,
    policy::RemotePolicy,
    remote::{CallerAssignment, RemoteReader, RoleDefinition},
    ReconcileError,
};

/// Everything read from the remote service during one run
#[derive(Default, Debug)]
pub struct RunCache {
    existing_grants: HashMap<(GrantKind, Target), Vec<ExistingGrant>>,
    principal_names: HashMap<String, String>,
    principal_ids: HashMap<(PrincipalKind, String), String>,
    role_definitions: HashMap<String, RoleDefinition>,
    role_definitions_by_name: HashMap<(Target, String), RoleDefinition>,
    effective_policies: HashMap<(Target, String), RemotePolicy>,
    caller_assignments: HashMap<Target, Vec<CallerAssignment>>,
}

impl RunCache {
    /// A new, empty cache
    pub fn new() -> Self {
        Default::default()
    }
}

/// A [`RemoteReader`] in front of a [`RunCache`].
///
/// Lookups that the reader answers with "not found" become typed errors here:
/// an id that doesn't resolve is a [`ReconcileError::DanglingReference`] and a
/// name that doesn't resolve is a [`ReconcileError::UnresolvedName`].
pub struct CachedReader<'a, R: RemoteReader> {
    reader: &'a R,
    cache: &'a mut RunCache,
}

impl<'a, R: RemoteReader> CachedReader<'a, R> {
    /// Wrap a reader with a run's cache
    pub fn new(reader: &'a R, cache: &'a mut RunCache) -> Self {
        Self { reader, cache }
    }

    /// The existing grants of both kinds at exactly `target`.
    ///
    /// The reader may return grants inherited from or nested under the
    /// target; those are dropped.
    pub async fn existing_grants(&mut self, target: &Target) -> Result<Vec<ExistingGrant>> {
        let active_key = (GrantKind::Active, target.to_owned());
        let eligible_key = (GrantKind::Eligible, target.to_owned());

        if !(self.cache.existing_grants.contains_key(&active_key)
            && self.cache.existing_grants.contains_key(&eligible_key))
        {
            let reader = self.reader;
            let (active, eligible) = futures::try_join!(
                reader.list_existing_grants(GrantKind::Active, target),
                reader.list_existing_grants(GrantKind::Eligible, target),
            )?;
            debug!(
                "fetched {} active and {} eligible grants around {target}",
                active.len(),
                eligible.len()
            );
            self.cache
                .existing_grants
                .insert(active_key.to_owned(), only_at(target, active));
            self.cache
                .existing_grants
                .insert(eligible_key.to_owned(), only_at(target, eligible));
        }

        let mut res = Vec::new();
        for key in [active_key, eligible_key] {
            if let Some(grants) = self.cache.existing_grants.get(&key) {
                res.extend(grants.iter().cloned());
            }
        }
        Ok(res)
    }

    /// The configured name of a principal
    pub async fn principal_name(&mut self, principal_id: &str) -> Result<String> {
        if let Some(name) = self.cache.principal_names.get(principal_id) {
            return Ok(name.to_owned());
        }
        let name = self.reader.principal_name(principal_id).await?.ok_or_else(|| {
            ReconcileError::DanglingReference {
                kind: "principal",
                id: principal_id.to_owned(),
            }
        })?;
        self.cache
            .principal_names
            .insert(principal_id.to_owned(), name.to_owned());
        Ok(name)
    }

    /// The remote id of a named principal
    pub async fn principal_id(&mut self, kind: PrincipalKind, name: &str) -> Result<String> {
        let key = (kind, name.to_lowercase());
        if let Some(id) = self.cache.principal_ids.get(&key) {
            return Ok(id.to_owned());
        }
        let id = self
            .reader
            .principal_id(kind, name)
            .await?
            .ok_or_else(|| ReconcileError::UnresolvedName {
                kind: match kind {
                    PrincipalKind::User => "user",
                    PrincipalKind::Group => "group",
                },
                name: name.to_owned(),
            })?;
        self.cache.principal_ids.insert(key, id.to_owned());
        // Remember the reverse too, so names we resolved never count as dangling
        self.cache
            .principal_names
            .entry(id.to_owned())
            .or_insert_with(|| name.to_owned());
        Ok(id)
    }

    /// A role definition by its remote id
    pub async fn role_definition(
        &mut self,
        target: &Target,
        role_definition_id: &str,
    ) -> Result<RoleDefinition> {
        let key = role_definition_id.to_lowercase();
        if let Some(role) = self.cache.role_definitions.get(&key) {
            return Ok(role.to_owned());
        }
        let role = self
            .reader
            .role_definition(target, role_definition_id)
            .await?
            .ok_or_else(|| ReconcileError::DanglingReference {
                kind: "role definition",
                id: role_definition_id.to_owned(),
            })?;
        self.cache.role_definitions.insert(key, role.to_owned());
        Ok(role)
    }

    /// A role definition by display name, as visible from `target`
    pub async fn find_role_definition(
        &mut self,
        target: &Target,
        role_name: &str,
    ) -> Result<RoleDefinition> {
        let key = (target.to_owned(), role_name.to_lowercase());
        if let Some(role) = self.cache.role_definitions_by_name.get(&key) {
            return Ok(role.to_owned());
        }
        let role = self
            .reader
            .find_role_definition(target, role_name)
            .await?
            .ok_or_else(|| ReconcileError::UnresolvedName {
                kind: "role",
                name: role_name.to_owned(),
            })?;
        self.cache
            .role_definitions
            .entry(role.id.to_lowercase())
            .or_insert_with(|| role.to_owned());
        self.cache
            .role_definitions_by_name
            .insert(key, role.to_owned());
        Ok(role)
    }

    /// The policy currently enforced for `role` at `target`
    pub async fn effective_policy(
        &mut self,
        target: &Target,
        role: &RoleDefinition,
    ) -> Result<RemotePolicy> {
        let key = (target.to_owned(), role.id.to_lowercase());
        if let Some(policy) = self.cache.effective_policies.get(&key) {
            return Ok(policy.to_owned());
        }
        let policy = self.reader.effective_policy(target, role).await?;
        self.cache.effective_policies.insert(key, policy.to_owned());
        Ok(policy)
    }

    /// The caller's own role assignments at `target`
    pub async fn caller_assignments(&mut self, target: &Target) -> Result<Vec<CallerAssignment>> {
        if let Some(assignments) = self.cache.caller_assignments.get(target) {
            return Ok(assignments.to_owned());
        }
        let assignments = self.reader.caller_assignments(target).await?;
        self.cache
            .caller_assignments
            .insert(target.to_owned(), assignments.to_owned());
        Ok(assignments)
    }
}

fn only_at(target: &Target, grants: Vec<ExistingGrant>) -> Vec<ExistingGrant> {
    grants.into_iter().filter(|g| &g.target == target).collect()
}
