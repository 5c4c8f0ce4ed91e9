//! The seams between the reconciliation engine and the remote authorization
//! service. Implementations own paging, retries and authentication.

use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    grants::{ExistingGrant, GrantKind, PrincipalKind, Target},
    policy::{PolicyUpdate, RemotePolicy},
};

/// A role as the remote service defines it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleDefinition {
    /// The remote id, as referenced by grants
    pub id: String,
    /// The display name used in configuration
    pub name: String,
    /// Actions the role allows
    pub actions: Vec<String>,
    /// Actions carved out of `actions`
    pub not_actions: Vec<String>,
}

/// One of the calling identity's own role assignments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerAssignment {
    /// Assignment id
    pub id: String,
    /// The assigned role
    pub role_definition_id: String,
}

/// What a schedule request asks the remote service to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestAction {
    /// Create a new grant
    AdminAssign,
    /// Change the schedule of an existing grant
    AdminUpdate,
    /// Revoke a live grant
    AdminRemove,
}

impl Display for RequestAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A request to create or change a grant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleRequest {
    /// Freshly generated per request, so retries can be deduplicated
    pub request_id: Uuid,
    /// Active or eligible
    pub kind: GrantKind,
    /// Assign or update
    pub action: RequestAction,
    /// Where the grant applies
    pub target: Target,
    /// Remote id of the principal
    pub principal_id: String,
    /// Whether the principal is a user or group
    pub principal_kind: PrincipalKind,
    /// Remote id of the role
    pub role_definition_id: String,
    /// Schedule start. Unset lets the remote side pick "now".
    pub start: Option<OffsetDateTime>,
    /// Schedule end. Unset means no expiration.
    pub end: Option<OffsetDateTime>,
    /// Justification recorded with the request
    pub justification: Option<String>,
    /// The schedule being updated, for updates
    pub target_schedule_id: Option<String>,
}

/// An admin-removal request for a live grant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Removal {
    /// Generated per request
    pub request_id: Uuid,
    /// Active or eligible
    pub kind: GrantKind,
    /// Where the grant applies
    pub target: Target,
    /// The live schedule being removed
    pub schedule_id: String,
    /// Remote id of the principal
    pub principal_id: String,
    /// Whether the principal is a user or group
    pub principal_kind: PrincipalKind,
    /// Remote id of the role
    pub role_definition_id: String,
}

/// A cancellation of a request that never became live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cancellation {
    /// Active or eligible
    pub kind: GrantKind,
    /// Where the request applies
    pub target: Target,
    /// Name of the pending request
    pub request_name: String,
}

/// Read access to the remote authorization service
#[async_trait]
pub trait RemoteReader: Sync {
    /// List the grants of one kind at (or around) a target. Results may
    /// include grants at other scopes; callers filter to the exact target.
    async fn list_existing_grants(
        &self,
        kind: GrantKind,
        target: &Target,
    ) -> Result<Vec<ExistingGrant>>;

    /// The configured name of a principal, or `None` if the id doesn't exist
    async fn principal_name(&self, principal_id: &str) -> Result<Option<String>>;

    /// The id of a named principal, or `None` if there is no such principal
    async fn principal_id(&self, kind: PrincipalKind, name: &str) -> Result<Option<String>>;

    /// A role definition by id, or `None` if the id doesn't exist
    async fn role_definition(
        &self,
        target: &Target,
        role_definition_id: &str,
    ) -> Result<Option<RoleDefinition>>;

    /// A role definition by display name, as visible from `target`
    async fn find_role_definition(
        &self,
        target: &Target,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>>;

    /// The policy currently enforced for a role at a target
    async fn effective_policy(&self, target: &Target, role: &RoleDefinition)
        -> Result<RemotePolicy>;

    /// The calling identity's own role assignments at a target
    async fn caller_assignments(&self, target: &Target) -> Result<Vec<CallerAssignment>>;
}

/// Write access to the remote authorization service
#[async_trait]
pub trait RemoteMutator: Sync {
    /// Submit a request to create or update a grant
    async fn submit_schedule_request(&self, request: &ScheduleRequest) -> Result<()>;

    /// Revoke a live grant
    async fn request_removal(&self, removal: &Removal) -> Result<()>;

    /// Cancel a pending request
    async fn cancel_request(&self, cancellation: &Cancellation) -> Result<()>;

    /// Replace a policy's rules
    async fn update_policy(&self, update: &PolicyUpdate) -> Result<()>;
}
