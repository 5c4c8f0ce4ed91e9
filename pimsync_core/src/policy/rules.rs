//! The five kinds of role management policy rule. Field names follow the
//! remote wire format.
#![allow(missing_docs)]

use std::fmt::Display;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ReconcileError;

/// The closed set of rule kinds
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleKind {
    /// Who has to approve an activation
    Approval,
    /// Conditional access authentication context on activation
    AuthenticationContext,
    /// Requirements such as MFA or justification
    Enablement,
    /// How long assignments may last
    Expiration,
    /// Who gets notified
    Notification,
}

impl RuleKind {
    const ALL: [RuleKind; 5] = [
        RuleKind::Approval,
        RuleKind::AuthenticationContext,
        RuleKind::Enablement,
        RuleKind::Expiration,
        RuleKind::Notification,
    ];

    /// The `ruleType` discriminator used on the wire
    pub fn rule_type(&self) -> &'static str {
        match self {
            RuleKind::Approval => "RoleManagementPolicyApprovalRule",
            RuleKind::AuthenticationContext => "RoleManagementPolicyAuthenticationContextRule",
            RuleKind::Enablement => "RoleManagementPolicyEnablementRule",
            RuleKind::Expiration => "RoleManagementPolicyExpirationRule",
            RuleKind::Notification => "RoleManagementPolicyNotificationRule",
        }
    }

    /// Look a kind up by its wire discriminator
    pub fn from_rule_type(rule_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.rule_type().eq_ignore_ascii_case(rule_type))
    }
}

impl Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What a rule applies to. Fixed per rule id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_objects: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inheritable_settings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_settings: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRule {
    pub id: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default)]
    pub setting: ApprovalSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_approval_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_approval_required_for_extension: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_requestor_justification_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_stages: Option<Vec<ApprovalStage>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_stage_time_out_in_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_approver_justification_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_time_in_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_approvers: Option<Vec<Approver>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_escalation_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_approvers: Option<Vec<Approver>>,
}

/// A user or group that can approve a request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_backup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationContextRule {
    pub id: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnablementRule {
    pub id: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_rules: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationRule {
    pub id: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_expiration_required: Option<bool>,
    /// ISO-8601 duration, e.g. `P30D` or `PT8H`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_duration: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    pub id: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default_recipients_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_recipients: Option<Vec<String>>,
}

/// A single policy rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ruleType")]
pub enum Rule {
    #[serde(rename = "RoleManagementPolicyApprovalRule")]
    Approval(ApprovalRule),
    #[serde(rename = "RoleManagementPolicyAuthenticationContextRule")]
    AuthenticationContext(AuthenticationContextRule),
    #[serde(rename = "RoleManagementPolicyEnablementRule")]
    Enablement(EnablementRule),
    #[serde(rename = "RoleManagementPolicyExpirationRule")]
    Expiration(ExpirationRule),
    #[serde(rename = "RoleManagementPolicyNotificationRule")]
    Notification(NotificationRule),
}

impl Rule {
    /// The rule's id, unique within a policy
    pub fn id(&self) -> &str {
        match self {
            Rule::Approval(r) => &r.id,
            Rule::AuthenticationContext(r) => &r.id,
            Rule::Enablement(r) => &r.id,
            Rule::Expiration(r) => &r.id,
            Rule::Notification(r) => &r.id,
        }
    }

    /// The rule's kind
    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Approval(_) => RuleKind::Approval,
            Rule::AuthenticationContext(_) => RuleKind::AuthenticationContext,
            Rule::Enablement(_) => RuleKind::Enablement,
            Rule::Expiration(_) => RuleKind::Expiration,
            Rule::Notification(_) => RuleKind::Notification,
        }
    }

    fn target_mut(&mut self) -> &mut RuleTarget {
        match self {
            Rule::Approval(r) => &mut r.target,
            Rule::AuthenticationContext(r) => &mut r.target,
            Rule::Enablement(r) => &mut r.target,
            Rule::Expiration(r) => &mut r.target,
            Rule::Notification(r) => &mut r.target,
        }
    }

    /// Parse a rule from its wire representation. A `ruleType` outside the
    /// five known kinds is an [`ReconcileError::UnsupportedRuleKind`].
    pub fn from_value(value: Value) -> Result<Self> {
        let rule_id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_owned();
        let rule_type = value
            .get("ruleType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let kind = RuleKind::from_rule_type(&rule_type).ok_or_else(|| {
            ReconcileError::UnsupportedRuleKind {
                rule_id: rule_id.to_owned(),
                rule_type: rule_type.to_owned(),
            }
        })?;

        // Normalize the discriminator's case so serde's exact match succeeds
        let mut value = value;
        if let Value::Object(map) = &mut value {
            map.insert("ruleType".to_owned(), Value::from(kind.rule_type()));
        }

        serde_json::from_value(value)
            .with_context(|| format!("rule `{rule_id}` doesn't fit the fields of a {kind} rule"))
    }

    /// The wire representation of this rule
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serializing policy rule")
    }

    /// Whether an observed rule agrees with this (desired) rule on every
    /// field that is authoritative for its kind.
    pub fn matches_remote(&self, remote: &Rule) -> bool {
        self.comparable(self) == remote.comparable(self)
    }

    /// A copy of this rule with remote-only fields cleared and unordered
    /// lists sorted.
    fn comparable(&self, desired: &Rule) -> Rule {
        let mut rule = self.to_owned();

        let target = rule.target_mut();
        target.target_objects = None;
        target.inheritable_settings = None;
        target.enforced_settings = None;

        match &mut rule {
            Rule::Approval(r) => {
                for stage in r.setting.approval_stages.iter_mut().flatten() {
                    for approver in stage
                        .primary_approvers
                        .iter_mut()
                        .chain(stage.escalation_approvers.iter_mut())
                        .flatten()
                    {
                        approver.description = None;
                    }
                    normalize_list(&mut stage.primary_approvers);
                    normalize_list(&mut stage.escalation_approvers);
                }
            }
            Rule::AuthenticationContext(r) => {
                // The claim value is only authoritative when the desired rule names one
                let desired_claim = match desired {
                    Rule::AuthenticationContext(d) => d.claim_value.as_deref().unwrap_or_default(),
                    _ => "",
                };
                if desired_claim.is_empty() || r.claim_value.as_deref() == Some("") {
                    r.claim_value = None;
                }
            }
            Rule::Enablement(r) => {
                normalize_list(&mut r.enabled_rules);
            }
            Rule::Expiration(_) => (),
            Rule::Notification(r) => {
                normalize_list(&mut r.notification_recipients);
            }
        }
        rule
    }
}

/// Treat a missing list like an empty one and ignore ordering
fn normalize_list<T: Ord + Clone>(list: &mut Option<Vec<T>>) {
    let mut items = list.take().unwrap_or_default();
    items.sort();
    *list = Some(items);
}

impl PartialOrd for Approver {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Approver {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.id, &self.user_type, &self.is_backup).cmp(&(
            &other.id,
            &other.user_type,
            &other.is_backup,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expiration(duration: &str) -> Rule {
        Rule::from_value(json!({
            "id": "Expiration_Admin_Eligibility",
            "ruleType": "RoleManagementPolicyExpirationRule",
            "isExpirationRequired": true,
            "maximumDuration": duration,
            "target": {"caller": "Admin", "operations": ["All"], "level": "Eligibility"}
        }))
        .unwrap()
    }

    #[test]
    fn rules_parse_by_rule_type() {
        let rule = expiration("P30D");
        assert_eq!(rule.kind(), RuleKind::Expiration);
        assert_eq!(rule.id(), "Expiration_Admin_Eligibility");
    }

    #[test]
    fn unknown_rule_types_are_rejected() {
        let err = Rule::from_value(json!({
            "id": "Mystery_Rule",
            "ruleType": "RoleManagementPolicyPizzaRule",
        }))
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ReconcileError>(),
            Some(&ReconcileError::UnsupportedRuleKind {
                rule_id: "Mystery_Rule".to_owned(),
                rule_type: "RoleManagementPolicyPizzaRule".to_owned()
            })
        );
    }

    #[test]
    fn serialization_carries_the_discriminator() {
        let value = expiration("P30D").to_value().unwrap();
        assert_eq!(value["ruleType"], "RoleManagementPolicyExpirationRule");
        assert_eq!(value["maximumDuration"], "P30D");
    }

    #[test]
    fn remote_only_target_metadata_is_ignored() {
        let desired = expiration("P30D");
        let mut remote = desired.to_value().unwrap();
        remote["target"]["targetObjects"] = json!([]);
        remote["target"]["enforcedSettings"] = json!(["x"]);
        assert!(desired.matches_remote(&Rule::from_value(remote).unwrap()));
        assert!(!desired.matches_remote(&expiration("P90D")));
    }

    #[test]
    fn claim_value_only_counts_when_desired() {
        let rule = |enabled: bool, claim: &str| {
            Rule::from_value(json!({
                "id": "AuthenticationContext_EndUser_Assignment",
                "ruleType": "RoleManagementPolicyAuthenticationContextRule",
                "isEnabled": enabled,
                "claimValue": claim,
            }))
            .unwrap()
        };
        assert!(rule(false, "").matches_remote(&rule(false, "c1")));
        assert!(!rule(true, "c2").matches_remote(&rule(true, "c1")));
        assert!(rule(true, "c1").matches_remote(&rule(true, "c1")));
        assert!(!rule(true, "").matches_remote(&rule(false, "")));
    }

    #[test]
    fn enabled_rule_order_does_not_matter() {
        let rule = |rules: Value| {
            Rule::from_value(json!({
                "id": "Enablement_EndUser_Assignment",
                "ruleType": "RoleManagementPolicyEnablementRule",
                "enabledRules": rules,
            }))
            .unwrap()
        };
        assert!(rule(json!(["Justification", "MultiFactorAuthentication"]))
            .matches_remote(&rule(json!(["MultiFactorAuthentication", "Justification"]))));
        assert!(rule(json!([])).matches_remote(&rule(Value::Null)));
        assert!(!rule(json!(["Justification"])).matches_remote(&rule(json!([]))));
    }
}
