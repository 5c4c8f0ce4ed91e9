//! Check that the calling identity may do what the run is about to do,
//! before anything is changed.

use std::fmt::Display;

use anyhow::Result;
use glob::{MatchOptions, Pattern};

use crate::{
    cache::CachedReader,
    grants::Target,
    logging::debug,
    remote::{RemoteReader, RoleDefinition},
    ReconcileError,
};

const NAMESPACE: &str = "Microsoft.Authorization";

/// What the run needs to be able to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read grants and policies
    Plan,
    /// Read and change grants and policies
    Apply,
}

impl AccessMode {
    /// Role actions that are sufficient on their own
    pub fn allowed_actions(&self) -> Vec<String> {
        let mut actions = vec!["*".to_owned(), format!("{NAMESPACE}/*")];
        if let AccessMode::Plan = self {
            actions.push("*/read".to_owned());
            actions.push(format!("{NAMESPACE}/*/read"));
        }
        actions
    }

    /// A representative action that `notActions` must not carve out
    pub fn probe_action(&self) -> String {
        match self {
            AccessMode::Plan => format!("{NAMESPACE}/roleAssignmentSchedules/read"),
            AccessMode::Apply => format!("{NAMESPACE}/roleAssignmentScheduleRequests/write"),
        }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Plan => write!(f, "plan"),
            AccessMode::Apply => write!(f, "apply"),
        }
    }
}

/// Make sure the caller holds a sufficient role at every scope target.
///
/// Group targets are authorized through directory application permissions
/// rather than role assignments, so they're skipped here.
pub async fn check_permissions<'t, R: RemoteReader>(
    reader: &mut CachedReader<'_, R>,
    targets: impl IntoIterator<Item = &'t Target>,
    mode: AccessMode,
) -> Result<()> {
    for target in targets {
        if let Target::Group(_) = target {
            continue;
        }

        let mut allowed = false;
        for assignment in reader.caller_assignments(target).await? {
            let role = reader
                .role_definition(target, &assignment.role_definition_id)
                .await?;
            if grants_access(&role, mode) {
                debug!("{} grants {mode} access at {target}", role.name);
                allowed = true;
                break;
            }
        }

        if !allowed {
            return Err(ReconcileError::PermissionDenied {
                target: target.to_owned(),
                mode,
            }
            .into());
        }
    }
    Ok(())
}

/// Whether a role definition is enough for `mode`
pub fn grants_access(role: &RoleDefinition, mode: AccessMode) -> bool {
    let allowed = mode.allowed_actions();
    let has_allowed_action = role
        .actions
        .iter()
        .any(|action| allowed.iter().any(|a| a.eq_ignore_ascii_case(action)));

    let probe = mode.probe_action();
    let carved_out = role
        .not_actions
        .iter()
        .any(|pattern| wildcard_match(pattern, &probe));

    has_allowed_action && !carved_out
}

/// Case-insensitive match where `*` stands for any run of characters,
/// slashes included. Nothing else in the pattern is special.
pub fn wildcard_match(pattern: &str, action: &str) -> bool {
    let escaped = pattern
        .split('*')
        .map(Pattern::escape)
        .collect::<Vec<_>>()
        .join("*");
    match Pattern::new(&escaped) {
        Ok(p) => p.matches_with(
            action,
            MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        ),
        Err(e) => {
            debug!("ignoring unusable action pattern {pattern}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::RunCache, test_util::FakeRemote};

    fn role(actions: &[&str], not_actions: &[&str]) -> RoleDefinition {
        RoleDefinition {
            id: "r".to_owned(),
            name: "Some Role".to_owned(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            not_actions: not_actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn wildcards_match() {
        assert!(wildcard_match("*", "anything/at/all"));
        assert!(wildcard_match(
            "Microsoft.Authorization/*/Write",
            "microsoft.authorization/roleAssignmentScheduleRequests/write"
        ));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
        assert!(!wildcard_match("Microsoft.Authorization/*/read", "Microsoft.Compute/vm/read"));
        assert!(wildcard_match("exact", "EXACT"));
        assert!(!wildcard_match("Microsoft.Authorization/[abc]/read", "Microsoft.Authorization/a/read"));
        assert!(wildcard_match("Microsoft.Authorization/[abc]/read", "microsoft.authorization/[ABC]/read"));
    }

    #[test]
    fn owner_can_apply() {
        assert!(grants_access(&role(&["*"], &[]), AccessMode::Apply));
        assert!(grants_access(
            &role(&["Microsoft.Authorization/*"], &[]),
            AccessMode::Apply
        ));
    }

    #[test]
    fn contributor_cannot_apply() {
        // Contributor carves authorization writes out of "*"
        let contributor = role(
            &["*"],
            &[
                "Microsoft.Authorization/*/Delete",
                "Microsoft.Authorization/*/Write",
                "Microsoft.Authorization/elevateAccess/Action",
            ],
        );
        assert!(!grants_access(&contributor, AccessMode::Apply));
        assert!(grants_access(&contributor, AccessMode::Plan));
    }

    #[test]
    fn reader_can_only_plan() {
        let reader = role(&["*/read"], &[]);
        assert!(grants_access(&reader, AccessMode::Plan));
        assert!(!grants_access(&reader, AccessMode::Apply));
    }

    #[tokio::test]
    async fn denied_scopes_fail_and_groups_are_skipped() -> Result<()> {
        let remote = FakeRemote::new()
            .with_role_definition("/subscriptions/sub1", role(&["*/read"], &[]))
            .with_caller_assignment("/subscriptions/sub1", "r");

        let mut cache = RunCache::new();
        let mut reader = CachedReader::new(&remote, &mut cache);
        let sub1 = Target::scope("/subscriptions/sub1");
        let group = Target::group("grp-a");

        check_permissions(&mut reader, [&sub1, &group], AccessMode::Plan).await?;

        let err = check_permissions(&mut reader, [&sub1, &group], AccessMode::Apply)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ReconcileError>(),
            Some(&ReconcileError::PermissionDenied {
                target: sub1,
                mode: AccessMode::Apply
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn no_assignments_means_no_access() {
        let remote = FakeRemote::new();
        let mut cache = RunCache::new();
        let mut reader = CachedReader::new(&remote, &mut cache);
        let sub1 = Target::scope("/subscriptions/sub1");
        assert!(check_permissions(&mut reader, [&sub1], AccessMode::Plan)
            .await
            .is_err());
    }
}
