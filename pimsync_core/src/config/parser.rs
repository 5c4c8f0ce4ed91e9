//! Parsing configuration documents and expanding them into grants

use std::collections::{BTreeSet, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    grants::{Grant, GrantKind, PrincipalKind, Target},
    policy::{PolicyOverride, Ruleset},
};

use super::DesiredState;

/// One grant as written in configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentYaml {
    /// Role display name
    pub role: String,
    /// User principal name or group display name
    pub principal: String,
    /// `User` or `Group`
    pub principal_type: PrincipalKind,
    /// RFC 3339 start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// RFC 3339 end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Ruleset for the role's policy at this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset: Option<String>,
    /// Sent along with requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PoliciesYaml {
    #[serde(default)]
    default: Vec<String>,
    #[serde(default)]
    overrides: Vec<OverrideYaml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct OverrideYaml {
    target: String,
    #[serde(default)]
    roles: Vec<String>,
    rulesets: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroupYaml {
    name: String,
    #[serde(default)]
    active: Vec<AssignmentYaml>,
    #[serde(default)]
    eligible: Vec<AssignmentYaml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionYaml {
    id: String,
    #[serde(default)]
    active: Vec<AssignmentYaml>,
    #[serde(default)]
    eligible: Vec<AssignmentYaml>,
    #[serde(default)]
    resource_groups: Vec<ResourceGroupYaml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourceGroupYaml {
    name: String,
    #[serde(default)]
    active: Vec<AssignmentYaml>,
    #[serde(default)]
    eligible: Vec<AssignmentYaml>,
    #[serde(default)]
    resources: Vec<ResourceYaml>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourceYaml {
    path: String,
    #[serde(default)]
    active: Vec<AssignmentYaml>,
    #[serde(default)]
    eligible: Vec<AssignmentYaml>,
}

/// One configuration document. Any number of these, across any number of
/// files, make up the full configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConfigDoc {
    #[serde(default)]
    rulesets: Vec<Ruleset>,
    #[serde(default)]
    policies: Option<PoliciesYaml>,
    #[serde(default)]
    groups: Vec<GroupYaml>,
    #[serde(default)]
    subscriptions: Vec<SubscriptionYaml>,
}

/// Parse every document in a YAML string
pub(crate) fn parse(val: &str) -> Result<Vec<ConfigDoc>> {
    let docs: Vec<ConfigDoc> = yaml_peg::serde::from_str(val)?;
    if docs.is_empty() {
        bail!("unable to parse configuration")
    };
    Ok(docs)
}

/// Policy override targets that look like paths are scopes; anything else
/// names a managed group.
pub(crate) fn parse_target(raw: &str) -> Target {
    if raw.trim_start().starts_with('/') {
        Target::scope(raw)
    } else {
        Target::group(raw.trim())
    }
}

fn parse_timestamp(raw: &Option<String>, field: &str, errors: &mut Vec<String>) -> Option<OffsetDateTime> {
    let raw = raw.as_ref()?;
    match OffsetDateTime::parse(raw.trim(), &Rfc3339) {
        Ok(t) => Some(t),
        Err(e) => {
            errors.push(format!("`{raw}` is not a valid RFC 3339 {field} timestamp: {e}"));
            None
        }
    }
}

/// Collects grants and managed targets while walking the nested documents
#[derive(Default)]
struct Materializer {
    state: DesiredState,
    errors: Vec<String>,
}

impl Materializer {
    fn add_target(&mut self, target: Target, active: &[AssignmentYaml], eligible: &[AssignmentYaml]) {
        for (kind, assignments) in [(GrantKind::Active, active), (GrantKind::Eligible, eligible)] {
            for a in assignments {
                let start = parse_timestamp(&a.start, "start", &mut self.errors);
                let end = parse_timestamp(&a.end, "end", &mut self.errors);
                self.state.grants.push(Grant {
                    principal_name: a.principal.trim().to_owned(),
                    principal_kind: a.principal_type,
                    role_name: a.role.trim().to_owned(),
                    target: target.to_owned(),
                    kind,
                    start,
                    end,
                    ruleset: a.ruleset.to_owned(),
                    justification: a.justification.to_owned(),
                });
            }
        }
        self.state.managed_targets.insert(target);
    }
}

/// Expand the nested documents into one flat desired state. Problems that
/// only show up here (bad timestamps, repeated names) are returned rather
/// than raised so they can be reported alongside validation errors.
pub(crate) fn materialize(docs: Vec<ConfigDoc>) -> (DesiredState, Vec<String>) {
    let mut m = Materializer::default();
    let mut default_set = false;
    let mut ruleset_names = HashSet::new();
    let mut group_names = BTreeSet::new();

    for doc in docs {
        for ruleset in doc.rulesets {
            if !ruleset_names.insert(ruleset.name.to_owned()) {
                m.errors
                    .push(format!("ruleset `{}` is defined more than once", ruleset.name));
            }
            m.state.rulesets.insert(ruleset.name.to_owned(), ruleset);
        }

        if let Some(policies) = doc.policies {
            if !policies.default.is_empty() {
                if default_set {
                    m.errors
                        .push("`policies.default` is set in more than one place".to_owned());
                }
                default_set = true;
                m.state.policies.default = policies.default;
            }
            for o in policies.overrides {
                m.state.policies.overrides.push(PolicyOverride {
                    target: parse_target(&o.target),
                    roles: o.roles,
                    rulesets: o.rulesets,
                });
            }
        }

        for group in doc.groups {
            if !group_names.insert(group.name.to_lowercase()) {
                m.errors
                    .push(format!("group `{}` is declared more than once", group.name));
            }
            m.add_target(Target::group(group.name.trim()), &group.active, &group.eligible);
        }

        for sub in doc.subscriptions {
            let sub_scope = format!("/subscriptions/{}", sub.id.trim());
            m.add_target(Target::scope(&sub_scope), &sub.active, &sub.eligible);

            for rg in sub.resource_groups {
                let rg_scope = format!("{sub_scope}/resourceGroups/{}", rg.name.trim());
                m.add_target(Target::scope(&rg_scope), &rg.active, &rg.eligible);

                for resource in rg.resources {
                    let resource_scope =
                        format!("{rg_scope}/{}", resource.path.trim().trim_start_matches('/'));
                    m.add_target(Target::scope(resource_scope), &resource.active, &resource.eligible);
                }
            }
        }
    }

    (m.state, m.errors)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn nested_scopes_expand() -> Result<()> {
        let docs = parse(
            r#"
subscriptions:
  - id: sub1
    active:
      - role: Owner
        principal: alice@contoso.com
        principalType: User
    resourceGroups:
      - name: rg1
        resources:
          - path: providers/Microsoft.KeyVault/vaults/kv1
            eligible:
              - role: Key Vault Reader
                principal: grp-a
                principalType: Group
                start: "2024-01-01T00:00:00Z"
                justification: audits
"#,
        )?;
        let (state, errors) = materialize(docs);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(state.managed_targets.len(), 3);

        let kv = state
            .grants
            .iter()
            .find(|g| g.kind == GrantKind::Eligible)
            .expect("eligible grant");
        assert_eq!(
            kv.target,
            Target::scope("/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.KeyVault/vaults/kv1")
        );
        assert_eq!(kv.start, Some(datetime!(2024-01-01 0:00 UTC)));
        assert_eq!(kv.justification.as_deref(), Some("audits"));
        Ok(())
    }

    #[test]
    fn bad_timestamps_and_repeats_are_collected() -> Result<()> {
        let docs = parse(
            r#"
rulesets:
  - name: a
  - name: a
groups:
  - name: grp-x
    eligible:
      - role: member
        principal: bob@contoso.com
        principalType: User
        end: next tuesday
  - name: GRP-X
"#,
        )?;
        let (_, errors) = materialize(docs);
        assert_eq!(errors.len(), 3, "{errors:?}");
        Ok(())
    }

    #[test]
    fn override_targets_are_scopes_or_groups() {
        assert_eq!(parse_target("/subscriptions/SUB1/"), Target::scope("/subscriptions/sub1"));
        assert_eq!(parse_target("grp-admins"), Target::group("grp-admins"));
        assert_eq!(parse_target(" Grp-Admins "), Target::group("grp-admins"));
    }

    #[test]
    fn multiple_defaults_conflict() -> Result<()> {
        let mut docs = parse("policies:\n  default: [a]\n")?;
        docs.extend(parse("policies:\n  default: [b]\n")?);
        let (_, errors) = materialize(docs);
        assert_eq!(errors.len(), 1);
        Ok(())
    }
}
