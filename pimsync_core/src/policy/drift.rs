//! Compare a desired rule list against the remote effective policy

use std::collections::BTreeMap;

use crate::grants::Target;

use super::{PolicyUpdate, RemotePolicy, Rule};

/// Diff desired rules against the remote policy. Any difference yields an
/// update that carries the whole desired rule list, because the remote side
/// replaces rule sets atomically.
pub fn diff_policy(
    target: &Target,
    role_name: &str,
    desired: &[Rule],
    remote: &RemotePolicy,
) -> Option<PolicyUpdate> {
    let desired_by_id: BTreeMap<&str, &Rule> = desired.iter().map(|r| (r.id(), r)).collect();
    let mut remote_by_id: BTreeMap<&str, &Rule> =
        remote.rules.iter().map(|r| (r.id(), r)).collect();

    let mut changed_rules = Vec::new();

    // Walk the desired rules, taking their remote counterparts out as we go.
    // Whatever is left over is enforced remotely but not desired.
    for (id, desired_rule) in &desired_by_id {
        match remote_by_id.remove(id) {
            Some(remote_rule) if desired_rule.matches_remote(remote_rule) => continue,
            _ => changed_rules.push(id.to_string()),
        }
    }
    changed_rules.extend(remote_by_id.keys().map(|id| id.to_string()));

    if changed_rules.is_empty() {
        return None;
    }
    changed_rules.sort();

    let mut rules = desired.to_vec();
    rules.sort_by(|a, b| a.id().cmp(b.id()));

    Some(PolicyUpdate {
        target: target.to_owned(),
        role_name: role_name.to_owned(),
        policy_id: remote.id.to_owned(),
        rules,
        changed_rules,
    })
}
