//! Role management policies: named rulesets layered onto a default template,
//! diffed against the policy the remote service is actually enforcing.

pub mod drift;
mod merge_patch;
pub mod resolve;
pub mod rules;

use std::{
    collections::BTreeMap,
    fmt::Display,
};

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::grants::Target;

pub use drift::diff_policy;
pub use resolve::{build_desired_rules, resolve_rulesets};
pub use rules::{Rule, RuleKind};

/// The baseline policy the remote service ships for every role
const DEFAULT_POLICY_TEMPLATE: &str = include_str!("policy/default_policy.json");

/// Load the embedded default policy template
pub fn default_template() -> Result<Vec<Rule>> {
    let raw: Vec<Value> =
        serde_json::from_str(DEFAULT_POLICY_TEMPLATE).context("parsing default policy template")?;
    raw.into_iter().map(Rule::from_value).collect()
}

/// A partial rule document to merge onto the template rule with the same id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    /// Id of the template rule to patch
    pub rule_id: String,
    /// JSON merge patch fragment
    pub patch: Value,
}

/// A named, reusable set of rule patches
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruleset {
    /// How grants and overrides refer to this ruleset
    pub name: String,
    /// Patches, applied in order
    #[serde(default)]
    pub rules: Vec<RulePatch>,
}

/// Ruleset selection scoped to one target (and optionally some roles)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyOverride {
    /// The exact target this override applies to
    pub target: Target,
    /// Roles the override is limited to. Empty means every role.
    pub roles: Vec<String>,
    /// Rulesets to apply, in order
    pub rulesets: Vec<String>,
}

/// Which rulesets apply where
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Rulesets for every (target, role) without something more specific
    pub default: Vec<String>,
    /// Target-scoped overrides
    pub overrides: Vec<PolicyOverride>,
}

/// Every ruleset defined in configuration, by name
pub type RulesetMap = BTreeMap<String, Ruleset>;

/// A policy as the remote service reports it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePolicy {
    /// The policy's own identifier, used to update it
    pub id: String,
    /// The effective rules
    pub rules: Vec<Rule>,
}

/// A full replacement of one role's policy at one target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyUpdate {
    /// Where the policy applies
    pub target: Target,
    /// The role the policy governs
    pub role_name: String,
    /// The remote policy's identifier
    pub policy_id: String,
    /// The fully assembled desired rule list
    pub rules: Vec<Rule>,
    /// Ids of the rules that differ from what's enforced now
    pub changed_rules: Vec<String>,
}

impl Display for PolicyUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut text = format!(
            "{}{} @ {}\n",
            "~ policy: ".yellow(),
            self.role_name.yellow(),
            self.target.to_string().yellow()
        );
        for rule in &self.changed_rules {
            text += format!("    ~ {rule}\n").yellow().to_string().as_str();
        }
        write!(f, "{text}")
    }
}
