//! Errors that abort a reconciliation run.
//!
//! Everything else (remote failures, I/O) travels as a plain `anyhow::Error`.
//! These variants are raised through `anyhow` too, so callers that care about
//! the category can `downcast_ref::<ReconcileError>()`.

use thiserror::Error;

use crate::{grants::Target, permissions::AccessMode};

/// The categories of fatal errors a run can hit before or while planning
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// One or more problems with the configuration, all reported at once
    #[error("configuration is invalid:\n{}", error_vec_to_string(.0))]
    Config(Vec<String>),

    /// A ruleset was referenced but never defined
    #[error("ruleset `{0}` is referenced but not defined")]
    UnknownRuleset(String),

    /// A ruleset patches a rule id that the policy template doesn't have
    #[error("ruleset `{ruleset}` patches rule `{rule_id}`, which is not part of the policy template")]
    UnknownRule {
        /// The ruleset with the bad patch
        ruleset: String,
        /// The rule id that couldn't be found
        rule_id: String,
    },

    /// A rule whose kind isn't one of the five supported kinds
    #[error("rule `{rule_id}` has unsupported rule type `{rule_type}`")]
    UnsupportedRuleKind {
        /// The offending rule
        rule_id: String,
        /// Its declared type
        rule_type: String,
    },

    /// A patch turned a rule of one kind into another
    #[error("ruleset `{ruleset}` changes the type of rule `{rule_id}`")]
    RuleKindChanged {
        /// The ruleset with the bad patch
        ruleset: String,
        /// The rule that changed type
        rule_id: String,
    },

    /// A remote id that no longer resolves to anything
    #[error("unable to resolve {kind} `{id}`: the remote reference is dangling")]
    DanglingReference {
        /// What kind of object the id refers to
        kind: &'static str,
        /// The id
        id: String,
    },

    /// A configured name that has no remote counterpart
    #[error("unable to find {kind} `{name}` in the directory")]
    UnresolvedName {
        /// What kind of object was looked up
        kind: &'static str,
        /// The configured name
        name: String,
    },

    /// The caller can't do what the run needs to do
    #[error("the calling identity lacks the permissions needed to {mode} at {target}")]
    PermissionDenied {
        /// Where the check failed
        target: Target,
        /// What the run was trying to do
        mode: AccessMode,
    },

    /// A grant status the delete/cancel routing doesn't know how to handle
    #[error("unrecognized grant status `{0}`")]
    UnknownStatus(String),
}

/// Render a list of errors, one per line
pub(crate) fn error_vec_to_string(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!(" - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
