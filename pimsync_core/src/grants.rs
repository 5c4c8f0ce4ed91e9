//! Desired and observed grants, and the key used to correlate them.

use std::{
    cmp::Ordering,
    fmt::Display,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ReconcileError;

/// The scope or managed group that a grant applies to.
///
/// Build these with [`Target::scope`] and [`Target::group`] so that
/// equivalent targets compare equal. Group names keep their configured
/// spelling but compare case-insensitively, like every directory name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Target {
    /// An ARM scope path (subscription, resource group or resource)
    Scope(String),
    /// A group whose membership is managed through PIM for Groups
    Group(String),
}

impl Target {
    /// An ARM scope. Scope paths are case-insensitive, so they are stored
    /// lowercased and without a trailing slash.
    pub fn scope<S: AsRef<str>>(path: S) -> Self {
        let trimmed = path.as_ref().trim().trim_end_matches('/');
        let path = if trimmed.starts_with('/') {
            trimmed.to_lowercase()
        } else {
            format!("/{}", trimmed.to_lowercase())
        };
        Target::Scope(path)
    }

    /// A managed group, by display name
    pub fn group<S: Into<String>>(name: S) -> Self {
        Target::Group(name.into())
    }

    /// The raw scope path or group name
    pub fn as_str(&self) -> &str {
        match self {
            Target::Scope(s) | Target::Group(s) => s,
        }
    }
}

impl Target {
    fn variant_index(&self) -> u8 {
        match self {
            Target::Scope(_) => 0,
            Target::Group(_) => 1,
        }
    }

    /// The name folded for comparison
    fn folded(&self) -> impl Iterator<Item = char> + '_ {
        self.as_str().chars().flat_map(char::to_lowercase)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Target {}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        self.variant_index()
            .cmp(&other.variant_index())
            .then_with(|| self.folded().cmp(other.folded()))
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_index().hash(state);
        for c in self.folded() {
            c.hash(state);
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Scope(path) => write!(f, "{path}"),
            Target::Group(name) => write!(f, "group:{name}"),
        }
    }
}

/// Whether the grantee is a user or a group
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrincipalKind {
    /// A directory user, named by user principal name
    User,
    /// A directory group, named by display name
    Group,
}

impl Display for PrincipalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalKind::User => write!(f, "user"),
            PrincipalKind::Group => write!(f, "group"),
        }
    }
}

/// Permanent or time-boxed/approval-gated
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GrantKind {
    /// Always-on assignment
    Active,
    /// Activation-on-demand eligibility schedule
    Eligible,
}

impl GrantKind {
    /// Only eligibility schedules carry a schedule that can be updated in place.
    pub fn supports_schedule_updates(&self) -> bool {
        matches!(self, GrantKind::Eligible)
    }
}

impl Display for GrantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantKind::Active => write!(f, "active"),
            GrantKind::Eligible => write!(f, "eligible"),
        }
    }
}

/// A grant as declared in configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    /// User principal name or group display name
    pub principal_name: String,
    /// The kind of principal being granted the role
    pub principal_kind: PrincipalKind,
    /// Role display name
    pub role_name: String,
    /// Where the role applies
    pub target: Target,
    /// Active or eligible
    pub kind: GrantKind,
    /// When the grant starts. Unset means "whenever the remote side says".
    pub start: Option<OffsetDateTime>,
    /// When the grant ends. Unset means no expiration.
    pub end: Option<OffsetDateTime>,
    /// Ruleset that governs the role's policy at this target
    pub ruleset: Option<String>,
    /// Justification sent with requests for this grant
    pub justification: Option<String>,
}

impl Grant {
    /// The semantic identity of this grant
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.target, &self.role_name, &self.principal_name)
    }
}

/// Status of an observed grant or its pending request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[allow(missing_docs)]
pub enum GrantStatus {
    Accepted,
    PendingEvaluation,
    Granted,
    Denied,
    PendingProvisioning,
    Provisioned,
    PendingRevocation,
    Revoked,
    Canceled,
    Failed,
    PendingApprovalProvisioning,
    PendingApproval,
    FailedAsResourceIsLocked,
    PendingAdminDecision,
    AdminApproved,
    AdminDenied,
    TimedOut,
    ProvisioningStarted,
    Invalid,
    PendingScheduleCreation,
    ScheduleCreated,
    PendingExternalProvisioning,
}

const ALL_STATUSES: [GrantStatus; 22] = [
    GrantStatus::Accepted,
    GrantStatus::PendingEvaluation,
    GrantStatus::Granted,
    GrantStatus::Denied,
    GrantStatus::PendingProvisioning,
    GrantStatus::Provisioned,
    GrantStatus::PendingRevocation,
    GrantStatus::Revoked,
    GrantStatus::Canceled,
    GrantStatus::Failed,
    GrantStatus::PendingApprovalProvisioning,
    GrantStatus::PendingApproval,
    GrantStatus::FailedAsResourceIsLocked,
    GrantStatus::PendingAdminDecision,
    GrantStatus::AdminApproved,
    GrantStatus::AdminDenied,
    GrantStatus::TimedOut,
    GrantStatus::ProvisioningStarted,
    GrantStatus::Invalid,
    GrantStatus::PendingScheduleCreation,
    GrantStatus::ScheduleCreated,
    GrantStatus::PendingExternalProvisioning,
];

impl GrantStatus {
    /// Every status the remote service is known to report
    pub fn all() -> &'static [GrantStatus] {
        &ALL_STATUSES
    }

    /// The live, terminal state of a grant
    pub fn is_provisioned(&self) -> bool {
        matches!(self, GrantStatus::Provisioned)
    }

    /// Whether a request in this state may still turn into a live grant.
    /// Requests that are provisioned already show up as schedules, and
    /// requests that failed or were withdrawn will never become one.
    pub fn is_in_flight(&self) -> bool {
        match self {
            GrantStatus::Accepted
            | GrantStatus::PendingEvaluation
            | GrantStatus::Granted
            | GrantStatus::PendingProvisioning
            | GrantStatus::PendingRevocation
            | GrantStatus::PendingApprovalProvisioning
            | GrantStatus::PendingApproval
            | GrantStatus::PendingAdminDecision
            | GrantStatus::AdminApproved
            | GrantStatus::ProvisioningStarted
            | GrantStatus::PendingScheduleCreation
            | GrantStatus::PendingExternalProvisioning => true,
            GrantStatus::Provisioned
            | GrantStatus::ScheduleCreated
            | GrantStatus::Denied
            | GrantStatus::Revoked
            | GrantStatus::Canceled
            | GrantStatus::Failed
            | GrantStatus::FailedAsResourceIsLocked
            | GrantStatus::AdminDenied
            | GrantStatus::TimedOut
            | GrantStatus::Invalid => false,
        }
    }
}

impl Display for GrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for GrantStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| ReconcileError::UnknownStatus(s.to_owned()))
    }
}

/// A grant as observed in the remote service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistingGrant {
    /// Schedule id (or request id, for items that never became a schedule)
    pub id: String,
    /// Active or eligible
    pub kind: GrantKind,
    /// Remote object id of the principal
    pub principal_id: String,
    /// Whether the principal is a user or a group
    pub principal_kind: PrincipalKind,
    /// Remote id of the role definition
    pub role_definition_id: String,
    /// Where the grant applies
    pub target: Target,
    /// Remote status
    pub status: GrantStatus,
    /// Remote-assigned start, when the remote side reports one
    pub start: Option<OffsetDateTime>,
    /// End, if the grant expires
    pub end: Option<OffsetDateTime>,
    /// Name of the request that created (or is creating) this grant
    pub request_name: String,
}

/// The semantic identity of a grant: `(target, role, principal)`.
///
/// Role and principal names are directory names, which the remote service
/// treats case-insensitively, so they are compared that way here too.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CorrelationKey {
    target: Target,
    role_name: String,
    principal_name: String,
}

impl CorrelationKey {
    /// Build a key from its parts
    pub fn new(target: &Target, role_name: &str, principal_name: &str) -> Self {
        Self {
            target: target.to_owned(),
            role_name: role_name.to_lowercase(),
            principal_name: principal_name.to_lowercase(),
        }
    }

    /// The target part of the key
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} / {}",
            self.target, self.role_name, self.principal_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn scope_targets_are_normalized() {
        assert_eq!(
            Target::scope("/Subscriptions/ABC/"),
            Target::scope("/subscriptions/abc")
        );
        assert_eq!(
            Target::scope("subscriptions/abc").as_str(),
            "/subscriptions/abc"
        );
        assert_ne!(Target::scope("/x"), Target::group("/x"));
    }

    #[test]
    fn group_targets_ignore_name_case() {
        let configured = Target::group("Grp-Admins");
        assert_eq!(configured, Target::group("grp-admins"));
        assert_eq!(configured.as_str(), "Grp-Admins");
        assert_ne!(configured, Target::group("grp-admin"));

        let targets = std::collections::HashSet::from([Target::group("GRP-ADMINS")]);
        assert!(targets.contains(&Target::group("grp-admins")));
        assert_eq!(
            CorrelationKey::new(&configured, "member", "alice"),
            CorrelationKey::new(&Target::group("grp-admins"), "Member", "Alice")
        );
    }

    #[test]
    fn status_parsing_is_case_insensitive() -> Result<()> {
        assert_eq!("provisioned".parse::<GrantStatus>()?, GrantStatus::Provisioned);
        assert_eq!(
            "PendingAdminDecision".parse::<GrantStatus>()?,
            GrantStatus::PendingAdminDecision
        );
        Ok(())
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = "Sideways".parse::<GrantStatus>().unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownStatus(s) if s == "Sideways"));
    }

    #[test]
    fn every_status_round_trips_through_its_name() -> Result<()> {
        for status in GrantStatus::all() {
            assert_eq!(&status.to_string().parse::<GrantStatus>()?, status);
        }
        Ok(())
    }

    #[test]
    fn provisioned_grants_are_not_in_flight() {
        assert!(!GrantStatus::Provisioned.is_in_flight());
        assert!(GrantStatus::PendingApproval.is_in_flight());
        assert!(!GrantStatus::Canceled.is_in_flight());
    }

    #[test]
    fn keys_ignore_name_case() {
        let t = Target::scope("/subscriptions/sub1");
        assert_eq!(
            CorrelationKey::new(&t, "Reader", "Alice@Contoso.com"),
            CorrelationKey::new(&t, "reader", "alice@contoso.com")
        );
        assert_ne!(
            CorrelationKey::new(&t, "Reader", "alice"),
            CorrelationKey::new(&Target::scope("/subscriptions/sub2"), "Reader", "alice")
        );
    }
}
