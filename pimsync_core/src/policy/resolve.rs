//! Decide which rulesets apply to a (target, role) and assemble the desired
//! rule list from them.

use anyhow::Result;

use crate::{grants::Target, logging::debug, ReconcileError};

use super::{
    merge_patch::{merge_patch, unknown_paths},
    PolicyConfig, Rule, RulesetMap,
};

/// Find the rulesets for a (target, role). The most specific level that
/// names any rulesets wins outright:
///
/// 1. the ruleset declared on the role's grants at that target
/// 2. an override for the exact target that lists the role
/// 3. an override for the exact target that doesn't list roles
/// 4. the defaults
pub fn resolve_rulesets<'a>(
    target: &Target,
    role_name: &str,
    grant_ruleset: Option<&'a str>,
    config: &'a PolicyConfig,
) -> Vec<&'a str> {
    if let Some(name) = grant_ruleset {
        return vec![name];
    }

    let target_overrides = config
        .overrides
        .iter()
        .filter(|o| &o.target == target)
        .collect::<Vec<_>>();

    let role_override = target_overrides.iter().find(|o| {
        o.roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case(role_name))
    });
    if let Some(o) = role_override {
        return o.rulesets.iter().map(String::as_str).collect();
    }

    if let Some(o) = target_overrides.iter().find(|o| o.roles.is_empty()) {
        return o.rulesets.iter().map(String::as_str).collect();
    }

    config.default.iter().map(String::as_str).collect()
}

/// Merge-patch the named rulesets onto the template, in order.
///
/// Every patch must name a rule the template has, keep that rule's kind,
/// and only touch fields that the kind defines.
pub fn build_desired_rules(
    template: &[Rule],
    ruleset_names: &[&str],
    rulesets: &RulesetMap,
) -> Result<Vec<Rule>> {
    let mut rules = template.to_vec();

    for name in ruleset_names {
        let ruleset = rulesets
            .get(*name)
            .ok_or_else(|| ReconcileError::UnknownRuleset(name.to_string()))?;

        for rule_patch in &ruleset.rules {
            let rule = rules
                .iter_mut()
                .find(|r| r.id() == rule_patch.rule_id)
                .ok_or_else(|| ReconcileError::UnknownRule {
                    ruleset: ruleset.name.to_owned(),
                    rule_id: rule_patch.rule_id.to_owned(),
                })?;

            let mut document = rule.to_value()?;
            merge_patch(&mut document, &rule_patch.patch);

            let patched = Rule::from_value(document).map_err(|e| {
                if e.downcast_ref::<ReconcileError>().is_some() {
                    e
                } else {
                    ReconcileError::Config(vec![format!(
                        "ruleset `{}` produces an invalid `{}` rule: {e:#}",
                        ruleset.name, rule_patch.rule_id
                    )])
                    .into()
                }
            })?;

            if patched.kind() != rule.kind() || patched.id() != rule.id() {
                return Err(ReconcileError::RuleKindChanged {
                    ruleset: ruleset.name.to_owned(),
                    rule_id: rule_patch.rule_id.to_owned(),
                }
                .into());
            }

            let unknown = unknown_paths(&rule_patch.patch, &patched.to_value()?);
            if !unknown.is_empty() {
                return Err(ReconcileError::Config(
                    unknown
                        .into_iter()
                        .map(|path| {
                            format!(
                                "ruleset `{}` sets `{path}` on rule `{}`, but {} rules have no such field",
                                ruleset.name,
                                rule_patch.rule_id,
                                rule.kind()
                            )
                        })
                        .collect(),
                )
                .into());
            }

            debug!("applied ruleset {} to rule {}", ruleset.name, rule_patch.rule_id);
            *rule = patched;
        }
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use serde_json::json;

    use super::*;
    use crate::policy::{
        default_template, rules::ExpirationRule, PolicyOverride, RulePatch, Ruleset,
    };

    fn ruleset(name: &str, rules: Vec<(&str, serde_json::Value)>) -> Ruleset {
        Ruleset {
            name: name.to_owned(),
            rules: rules
                .into_iter()
                .map(|(id, patch)| RulePatch {
                    rule_id: id.to_owned(),
                    patch,
                })
                .collect(),
        }
    }

    fn config() -> PolicyConfig {
        PolicyConfig {
            default: vec!["baseline".to_owned()],
            overrides: vec![
                PolicyOverride {
                    target: Target::scope("/subscriptions/prod"),
                    roles: vec![],
                    rulesets: vec!["prod".to_owned()],
                },
                PolicyOverride {
                    target: Target::scope("/subscriptions/prod"),
                    roles: vec!["Owner".to_owned()],
                    rulesets: vec!["prod".to_owned(), "owners".to_owned()],
                },
            ],
        }
    }

    #[test]
    fn most_specific_rulesets_win() {
        let config = config();
        let prod = Target::scope("/subscriptions/prod");
        let dev = Target::scope("/subscriptions/dev");

        assert_eq!(resolve_rulesets(&dev, "Reader", None, &config), vec!["baseline"]);
        assert_eq!(resolve_rulesets(&prod, "Reader", None, &config), vec!["prod"]);
        assert_eq!(
            resolve_rulesets(&prod, "owner", None, &config),
            vec!["prod", "owners"]
        );
        assert_eq!(
            resolve_rulesets(&prod, "Owner", Some("special"), &config),
            vec!["special"]
        );
    }

    #[test]
    fn group_overrides_ignore_name_case() {
        let config = PolicyConfig {
            default: vec!["baseline".to_owned()],
            overrides: vec![PolicyOverride {
                target: Target::group("Grp-Admins"),
                roles: vec![],
                rulesets: vec!["strict".to_owned()],
            }],
        };
        assert_eq!(
            resolve_rulesets(&Target::group("grp-admins"), "Member", None, &config),
            vec!["strict"]
        );
    }

    #[test]
    fn no_rulesets_yields_the_template() -> Result<()> {
        let template = default_template()?;
        assert_eq!(build_desired_rules(&template, &[], &RulesetMap::new())?, template);
        Ok(())
    }

    #[test]
    fn patches_apply_in_order() -> Result<()> {
        let template = default_template()?;
        let rulesets = btreemap! {
            "first".to_owned() => ruleset("first", vec![
                ("Expiration_Admin_Eligibility", json!({"isExpirationRequired": true, "maximumDuration": "P90D"}))
            ]),
            "second".to_owned() => ruleset("second", vec![
                ("Expiration_Admin_Eligibility", json!({"maximumDuration": "P30D"}))
            ]),
        };

        let rules = build_desired_rules(&template, &["first", "second"], &rulesets)?;
        let expiration = rules
            .iter()
            .find(|r| r.id() == "Expiration_Admin_Eligibility")
            .unwrap();
        match expiration {
            Rule::Expiration(ExpirationRule {
                is_expiration_required,
                maximum_duration,
                ..
            }) => {
                assert_eq!(*is_expiration_required, Some(true));
                assert_eq!(maximum_duration.as_deref(), Some("P30D"));
            }
            _ => panic!("wrong rule kind"),
        }

        // deterministic
        let again = build_desired_rules(&template, &["first", "second"], &rulesets)?;
        assert_eq!(
            serde_json::to_string(&rules)?,
            serde_json::to_string(&again)?
        );
        Ok(())
    }

    #[test]
    fn unknown_ruleset_is_fatal() -> Result<()> {
        let err = build_desired_rules(&default_template()?, &["nope"], &RulesetMap::new())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ReconcileError>(),
            Some(&ReconcileError::UnknownRuleset("nope".to_owned()))
        );
        Ok(())
    }

    #[test]
    fn unknown_rule_id_is_fatal() -> Result<()> {
        let rulesets = btreemap! {
            "bad".to_owned() => ruleset("bad", vec![("Expiration_Nobody", json!({}))]),
        };
        let err = build_desired_rules(&default_template()?, &["bad"], &rulesets).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::UnknownRule { rule_id, .. }) if rule_id == "Expiration_Nobody"
        ));
        Ok(())
    }

    #[test]
    fn changing_rule_kind_is_fatal() -> Result<()> {
        let rulesets = btreemap! {
            "bad".to_owned() => ruleset("bad", vec![(
                "Expiration_Admin_Eligibility",
                json!({"ruleType": "RoleManagementPolicyEnablementRule"})
            )]),
        };
        let err = build_desired_rules(&default_template()?, &["bad"], &rulesets).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::RuleKindChanged { .. })
        ));
        Ok(())
    }

    #[test]
    fn unsupported_rule_kind_is_fatal() -> Result<()> {
        let rulesets = btreemap! {
            "bad".to_owned() => ruleset("bad", vec![(
                "Expiration_Admin_Eligibility",
                json!({"ruleType": "RoleManagementPolicyPizzaRule"})
            )]),
        };
        let err = build_desired_rules(&default_template()?, &["bad"], &rulesets).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::UnsupportedRuleKind { .. })
        ));
        Ok(())
    }

    #[test]
    fn misspelled_fields_are_rejected() -> Result<()> {
        let rulesets = btreemap! {
            "typo".to_owned() => ruleset("typo", vec![(
                "Expiration_Admin_Eligibility",
                json!({"maximumDurration": "P30D"})
            )]),
        };
        let err = build_desired_rules(&default_template()?, &["typo"], &rulesets).unwrap_err();
        match err.downcast_ref::<ReconcileError>() {
            Some(ReconcileError::Config(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("maximumDurration"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn misspelled_approver_fields_are_rejected() -> Result<()> {
        let rulesets = btreemap! {
            "typo".to_owned() => ruleset("typo", vec![(
                "Approval_EndUser_Assignment",
                json!({"setting": {
                    "isApprovalRequired": true,
                    "approvalStages": [{
                        "approvalStageTimeOutInDays": 1,
                        "primaryAprovers": [{"id": "x", "userType": "User"}]
                    }]
                }})
            )]),
        };
        let err = build_desired_rules(&default_template()?, &["typo"], &rulesets).unwrap_err();
        match err.downcast_ref::<ReconcileError>() {
            Some(ReconcileError::Config(errors)) => {
                assert_eq!(errors.len(), 1, "{errors:?}");
                assert!(errors[0].contains("setting.approvalStages[0].primaryAprovers"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn approvers_in_stages_are_kept() -> Result<()> {
        let rulesets = btreemap! {
            "approval".to_owned() => ruleset("approval", vec![(
                "Approval_EndUser_Assignment",
                json!({"setting": {
                    "isApprovalRequired": true,
                    "approvalStages": [{
                        "approvalStageTimeOutInDays": 1,
                        "primaryApprovers": [{"id": "x", "userType": "User"}]
                    }]
                }})
            )]),
        };
        let rules = build_desired_rules(&default_template()?, &["approval"], &rulesets)?;
        let approval = rules
            .iter()
            .find(|r| r.id() == "Approval_EndUser_Assignment")
            .unwrap()
            .to_value()?;
        assert_eq!(
            approval["setting"]["approvalStages"][0]["primaryApprovers"][0]["id"],
            json!("x")
        );
        Ok(())
    }

    #[test]
    fn badly_typed_fields_are_config_errors() -> Result<()> {
        let rulesets = btreemap! {
            "bad".to_owned() => ruleset("bad", vec![(
                "Expiration_Admin_Eligibility",
                json!({"isExpirationRequired": "definitely"})
            )]),
        };
        let err = build_desired_rules(&default_template()?, &["bad"], &rulesets).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Config(_))
        ));
        Ok(())
    }
}
