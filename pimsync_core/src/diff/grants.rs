//! Match desired grants against observed grants by correlation key

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use time::OffsetDateTime;

use crate::{
    grants::{CorrelationKey, ExistingGrant, Grant, GrantKind, PrincipalKind},
    logging::debug,
    ReconcileError,
};

use super::NameLookup;

/// An observed grant with nothing desired behind it, along with the names it
/// resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedGrant {
    /// Principal name, as the directory spells it
    pub principal_name: String,
    /// Role name, as the remote service spells it
    pub role_name: String,
    /// The grant itself
    pub existing: ExistingGrant,
}

impl UnmatchedGrant {
    fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.existing.target, &self.role_name, &self.principal_name)
    }
}

/// The outcome of matching one set of desired grants against one set of
/// observed grants
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GrantMatch {
    /// Desired grants with no observed counterpart
    pub creates: Vec<Grant>,
    /// Desired grants whose observed counterpart has a different schedule
    pub updates: Vec<(Grant, ExistingGrant)>,
    /// Observed grants with no desired counterpart
    pub deletes: Vec<UnmatchedGrant>,
    /// Keys that are already as desired
    pub unchanged: Vec<CorrelationKey>,
}

/// Match desired against existing grants, separately for each combination of
/// grant kind and principal kind.
///
/// Observed grants are identified by resolving their principal and role ids
/// to names; an id that can't be resolved fails the whole match.
pub fn match_grants(
    desired: &[Grant],
    existing: &[ExistingGrant],
    names: &impl NameLookup,
) -> Result<GrantMatch> {
    check_unique_keys(desired)?;

    let partitions: BTreeSet<(GrantKind, PrincipalKind)> = desired
        .iter()
        .map(|g| (g.kind, g.principal_kind))
        .chain(existing.iter().map(|e| (e.kind, e.principal_kind)))
        .collect();

    let mut res = GrantMatch::default();
    for (kind, principal_kind) in partitions {
        let partition_desired = desired
            .iter()
            .filter(|g| g.kind == kind && g.principal_kind == principal_kind);
        let partition_existing = existing
            .iter()
            .filter(|e| e.kind == kind && e.principal_kind == principal_kind);
        match_partition(partition_desired, partition_existing, names, &mut res)?;
        debug!("matched {kind} grants for {principal_kind} principals");
    }

    res.creates.sort_by_cached_key(|g| (g.key(), g.kind));
    res.updates.sort_by_cached_key(|(g, _)| (g.key(), g.kind));
    res.deletes
        .sort_by_cached_key(|d| (d.key(), d.existing.kind, d.existing.id.to_owned()));
    res.unchanged.sort();

    Ok(res)
}

fn match_partition<'a>(
    desired: impl Iterator<Item = &'a Grant>,
    existing: impl Iterator<Item = &'a ExistingGrant>,
    names: &impl NameLookup,
    res: &mut GrantMatch,
) -> Result<()> {
    let config_state: BTreeMap<CorrelationKey, &Grant> = desired.map(|g| (g.key(), g)).collect();

    // The same key can show up more than once remotely, e.g. a live schedule
    // alongside a pending request to change it.
    let mut env_state: BTreeMap<CorrelationKey, Vec<UnmatchedGrant>> = BTreeMap::new();
    for e in existing {
        let observed = UnmatchedGrant {
            principal_name: names.principal_name(&e.principal_id)?.to_owned(),
            role_name: names.role_name(&e.role_definition_id)?.to_owned(),
            existing: e.to_owned(),
        };
        env_state.entry(observed.key()).or_default().push(observed);
    }

    for (key, grant) in config_state {
        // Take the match out of the env state. Whatever is left over at the
        // end isn't desired.
        let candidates = match env_state.remove(&key) {
            Some(candidates) => candidates,
            None => {
                res.creates.push(grant.to_owned());
                continue;
            }
        };

        let current = candidates
            .iter()
            .find(|c| c.existing.status.is_provisioned())
            .or_else(|| candidates.first());
        let current = match current {
            Some(c) => &c.existing,
            None => {
                res.creates.push(grant.to_owned());
                continue;
            }
        };

        if grant.kind.supports_schedule_updates()
            && current.status.is_provisioned()
            && needs_update(grant.start, grant.end, current.start, current.end)
        {
            res.updates.push((grant.to_owned(), current.to_owned()));
        } else {
            if !current.status.is_provisioned() {
                debug!("{key} is still {}; leaving it be", current.status);
            }
            res.unchanged.push(key);
        }
    }

    res.deletes
        .extend(env_state.into_values().flat_map(|leftovers| leftovers.into_iter()));

    Ok(())
}

/// Whether an observed schedule has to change to match the desired dates.
///
/// An unset desired start is never compared: the remote side picked the start
/// and it stays. Ends are compared including their absence, so going from
/// "never expires" to a fixed end (or back) is a change.
pub fn needs_update(
    desired_start: Option<OffsetDateTime>,
    desired_end: Option<OffsetDateTime>,
    existing_start: Option<OffsetDateTime>,
    existing_end: Option<OffsetDateTime>,
) -> bool {
    if let Some(start) = desired_start {
        if Some(start) != existing_start {
            return true;
        }
    }
    match (desired_end, existing_end) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(desired), Some(existing)) => desired != existing,
    }
}

/// Correlation keys must be unique per grant kind
fn check_unique_keys(desired: &[Grant]) -> Result<()> {
    let mut counts: HashMap<(GrantKind, CorrelationKey), usize> = HashMap::new();
    for grant in desired {
        *counts.entry((grant.kind, grant.key())).or_default() += 1;
    }

    let mut errors = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((kind, key), count)| format!("{kind} grant {key} is declared {count} times"))
        .collect::<Vec<_>>();

    if errors.is_empty() {
        Ok(())
    } else {
        errors.sort();
        Err(ReconcileError::Config(errors).into())
    }
}
