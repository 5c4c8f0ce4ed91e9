//! Semantic checks on the desired state

use std::collections::{BTreeMap, HashMap};

use crate::grants::{CorrelationKey, GrantKind, Target};

use super::DesiredState;

/// The only roles a managed group has
const GROUP_ROLES: [&str; 2] = ["member", "owner"];

/// Return every problem with the desired state. An empty list means it's
/// fine to plan against.
pub(crate) fn validate(state: &DesiredState) -> Vec<String> {
    let mut errors = Vec::new();

    // Duplicate correlation keys, per kind
    let mut seen: HashMap<(GrantKind, CorrelationKey), usize> = HashMap::new();
    for grant in &state.grants {
        *seen.entry((grant.kind, grant.key())).or_default() += 1;
    }
    let mut duplicates = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((kind, key), count)| format!("{kind} grant {key} is declared {count} times"))
        .collect::<Vec<_>>();
    duplicates.sort();
    errors.extend(duplicates);

    // Ruleset references
    for name in &state.policies.default {
        if !state.rulesets.contains_key(name) {
            errors.push(format!(
                "`policies.default` refers to ruleset `{name}`, but there is no ruleset with that name"
            ));
        }
    }
    for o in &state.policies.overrides {
        if !state.managed_targets.contains(&o.target) {
            errors.push(format!(
                "there is a policy override for {}, but nothing in the configuration manages that target",
                o.target
            ));
        }
        for name in &o.rulesets {
            if !state.rulesets.contains_key(name) {
                errors.push(format!(
                    "the policy override for {} refers to ruleset `{name}`, but there is no ruleset with that name",
                    o.target
                ));
            }
        }
    }

    // (target, role) -> the first ruleset a grant declared for it
    let mut grant_rulesets: BTreeMap<(Target, String), &str> = BTreeMap::new();

    for grant in &state.grants {
        let key = grant.key();

        if let (Some(start), Some(end)) = (grant.start, grant.end) {
            if end < start {
                errors.push(format!("{} grant {key} ends before it starts", grant.kind));
            }
        }

        if let Target::Group(_) = grant.target {
            if !GROUP_ROLES
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&grant.role_name))
            {
                errors.push(format!(
                    "{} grant {key} uses role `{}`, but managed groups only have the roles {}",
                    grant.kind,
                    grant.role_name,
                    GROUP_ROLES.join(" and ")
                ));
            }
        }

        let Some(ruleset) = &grant.ruleset else {
            continue;
        };

        if !state.rulesets.contains_key(ruleset) {
            errors.push(format!(
                "{} grant {key} refers to ruleset `{ruleset}`, but there is no ruleset with that name",
                grant.kind
            ));
        }

        match grant.kind {
            GrantKind::Active => errors.push(format!(
                "active grant {key} sets a ruleset, but policies only govern eligible grants"
            )),
            GrantKind::Eligible => {
                let pair = (grant.target.to_owned(), grant.role_name.to_lowercase());
                match grant_rulesets.get(&pair) {
                    Some(existing) if *existing != ruleset.as_str() => errors.push(format!(
                        "grants for role `{}` at {} name different rulesets (`{existing}` and `{ruleset}`)",
                        grant.role_name, grant.target
                    )),
                    Some(_) => (),
                    None => {
                        grant_rulesets.insert(pair, ruleset.as_str());
                    }
                }
            }
        }
    }

    errors
}
