//! PIM for Azure resources, through the resource manager API.
//!
//! Scopes are ARM resource paths. Schedules hold live grants, schedule
//! requests hold everything that hasn't become a schedule yet.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use pimsync_core::{
    grants::{ExistingGrant, GrantKind, GrantStatus, PrincipalKind, Target},
    logging::debug,
    policy::{PolicyUpdate, RemotePolicy, Rule},
    remote::{Cancellation, CallerAssignment, Removal, RequestAction, RoleDefinition, ScheduleRequest},
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    consts::{AUTHORIZATION_PROVIDER, PIM_API_VERSION, RBAC_API_VERSION},
    rest::{Api, AzureRestClient},
    schedule::{schedule_info_body, Casing, ScheduleInfo},
};

/// Request types that are still trying to put a grant in place
const PENDING_REQUEST_TYPES: [&str; 4] = ["AdminAssign", "AdminUpdate", "AdminExtend", "AdminRenew"];

#[derive(Deserialize, Debug)]
struct ArmResource<P> {
    id: String,
    name: String,
    properties: P,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ScheduleProperties {
    principal_id: String,
    principal_type: String,
    role_definition_id: String,
    status: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    start_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    end_date_time: Option<OffsetDateTime>,
    #[serde(default)]
    assignment_type: Option<String>,
    #[serde(
        default,
        rename = "roleEligibilityScheduleRequestId",
        alias = "roleAssignmentScheduleRequestId"
    )]
    schedule_request_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RequestProperties {
    principal_id: String,
    principal_type: String,
    role_definition_id: String,
    status: String,
    request_type: String,
    #[serde(default)]
    schedule_info: Option<ScheduleInfo>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_on: Option<OffsetDateTime>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RoleDefinitionProperties {
    role_name: String,
    #[serde(default)]
    permissions: Vec<PermissionBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PermissionBlock {
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    not_actions: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PolicyAssignmentProperties {
    policy_id: String,
    #[serde(default)]
    effective_rules: Vec<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RoleAssignmentProperties {
    role_definition_id: String,
}

fn schedules_resource(kind: GrantKind) -> &'static str {
    match kind {
        GrantKind::Active => "roleAssignmentSchedules",
        GrantKind::Eligible => "roleEligibilitySchedules",
    }
}

fn requests_resource(kind: GrantKind) -> &'static str {
    match kind {
        GrantKind::Active => "roleAssignmentScheduleRequests",
        GrantKind::Eligible => "roleEligibilityScheduleRequests",
    }
}

/// Only users and groups are managed. Service principals and the like are
/// left alone.
fn principal_kind(principal_type: &str) -> Option<PrincipalKind> {
    match principal_type.to_ascii_lowercase().as_str() {
        "user" => Some(PrincipalKind::User),
        "group" => Some(PrincipalKind::Group),
        _ => None,
    }
}

fn last_segment(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Live schedules plus in-flight requests of one kind at a scope.
pub(crate) async fn list_existing_grants(
    rest: &AzureRestClient,
    kind: GrantKind,
    scope: &str,
) -> Result<Vec<ExistingGrant>> {
    let query = [("api-version", PIM_API_VERSION), ("$filter", "atScope()")];
    let schedules_path = format!("{scope}/{AUTHORIZATION_PROVIDER}/{}", schedules_resource(kind));
    let requests_path = format!("{scope}/{AUTHORIZATION_PROVIDER}/{}", requests_resource(kind));
    let (schedules, requests) = futures::try_join!(
        async {
            rest.get_paged::<ArmResource<ScheduleProperties>>(Api::Arm, &schedules_path, &query)
                .await
                .context(format!("listing {kind} schedules at {scope}"))
        },
        async {
            rest.get_paged::<ArmResource<RequestProperties>>(Api::Arm, &requests_path, &query)
                .await
                .context(format!("listing {kind} schedule requests at {scope}"))
        },
    )?;

    let mut grants = vec![];
    for schedule in schedules {
        if let Some(grant) = schedule_to_grant(kind, schedule)? {
            grants.push(grant);
        }
    }
    for request in requests {
        if let Some(grant) = request_to_grant(kind, request)? {
            grants.push(grant);
        }
    }
    Ok(grants)
}

fn schedule_to_grant(
    kind: GrantKind,
    schedule: ArmResource<ScheduleProperties>,
) -> Result<Option<ExistingGrant>> {
    let props = schedule.properties;
    // Activations of an eligible grant show up as active schedules
    if props
        .assignment_type
        .as_deref()
        .map(|t| t.eq_ignore_ascii_case("Activated"))
        .unwrap_or(false)
    {
        return Ok(None);
    }
    let Some(principal_kind) = principal_kind(&props.principal_type) else {
        debug!("skipping schedule {} for a {}", schedule.name, props.principal_type);
        return Ok(None);
    };
    let status = GrantStatus::from_str(&props.status)?;
    let scope = scope_of(&schedule.id)?;
    Ok(Some(ExistingGrant {
        request_name: props
            .schedule_request_id
            .as_deref()
            .map(last_segment)
            .unwrap_or(&schedule.name)
            .to_owned(),
        id: schedule.name,
        kind,
        principal_id: props.principal_id,
        principal_kind,
        role_definition_id: props.role_definition_id,
        target: Target::scope(scope),
        status,
        start: props.start_date_time,
        end: props.end_date_time,
    }))
}

fn request_to_grant(
    kind: GrantKind,
    request: ArmResource<RequestProperties>,
) -> Result<Option<ExistingGrant>> {
    let props = request.properties;
    let status = GrantStatus::from_str(&props.status)?;
    if !status.is_in_flight()
        || !PENDING_REQUEST_TYPES
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&props.request_type))
    {
        return Ok(None);
    }
    let Some(principal_kind) = principal_kind(&props.principal_type) else {
        return Ok(None);
    };
    let scope = scope_of(&request.id)?;
    let schedule_info = props.schedule_info.unwrap_or_default();
    Ok(Some(ExistingGrant {
        id: request.name.to_owned(),
        kind,
        principal_id: props.principal_id,
        principal_kind,
        role_definition_id: props.role_definition_id,
        target: Target::scope(scope),
        status,
        start: schedule_info.start_date_time.or(props.created_on),
        end: schedule_info.end(),
        request_name: request.name,
    }))
}

/// The scope a resource lives at, from its full id
fn scope_of(id: &str) -> Result<&str> {
    let lower = id.to_ascii_lowercase();
    let idx = lower
        .find(&format!("/{}", AUTHORIZATION_PROVIDER.to_ascii_lowercase()))
        .ok_or_else(|| anyhow!("unexpected resource id {id}"))?;
    Ok(&id[..idx])
}

pub(crate) async fn role_definition(
    rest: &AzureRestClient,
    role_definition_id: &str,
) -> Result<Option<RoleDefinition>> {
    let role: Option<ArmResource<RoleDefinitionProperties>> = rest
        .get_optional(
            Api::Arm,
            role_definition_id,
            &[("api-version", RBAC_API_VERSION)],
        )
        .await
        .context(format!("fetching role definition {role_definition_id}"))?;
    Ok(role.map(to_role_definition))
}

pub(crate) async fn find_role_definition(
    rest: &AzureRestClient,
    scope: &str,
    role_name: &str,
) -> Result<Option<RoleDefinition>> {
    let filter = format!("roleName eq '{}'", role_name.replace('\'', "''"));
    let roles: Vec<ArmResource<RoleDefinitionProperties>> = rest
        .get_paged(
            Api::Arm,
            &format!("{scope}/{AUTHORIZATION_PROVIDER}/roleDefinitions"),
            &[("api-version", RBAC_API_VERSION), ("$filter", &filter)],
        )
        .await
        .context(format!("looking up role {role_name} at {scope}"))?;
    Ok(roles
        .into_iter()
        .find(|r| r.properties.role_name.eq_ignore_ascii_case(role_name))
        .map(to_role_definition))
}

fn to_role_definition(role: ArmResource<RoleDefinitionProperties>) -> RoleDefinition {
    let (actions, not_actions) = role.properties.permissions.into_iter().fold(
        (vec![], vec![]),
        |(mut actions, mut not_actions), block| {
            actions.extend(block.actions);
            not_actions.extend(block.not_actions);
            (actions, not_actions)
        },
    );
    RoleDefinition {
        id: role.id,
        name: role.properties.role_name,
        actions,
        not_actions,
    }
}

pub(crate) async fn effective_policy(
    rest: &AzureRestClient,
    scope: &str,
    role: &RoleDefinition,
) -> Result<RemotePolicy> {
    let filter = format!("roleDefinitionId eq '{}'", role.id);
    let assignments: Vec<ArmResource<PolicyAssignmentProperties>> = rest
        .get_paged(
            Api::Arm,
            &format!("{scope}/{AUTHORIZATION_PROVIDER}/roleManagementPolicyAssignments"),
            &[("api-version", PIM_API_VERSION), ("$filter", &filter)],
        )
        .await
        .context(format!("fetching the policy for {} at {scope}", role.name))?;
    let assignment = assignments
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no policy is assigned to {} at {scope}", role.name))?;
    let rules = assignment
        .properties
        .effective_rules
        .into_iter()
        .map(Rule::from_value)
        .collect::<Result<Vec<_>>>()?;
    Ok(RemotePolicy {
        id: assignment.properties.policy_id,
        rules,
    })
}

pub(crate) async fn caller_assignments(
    rest: &AzureRestClient,
    scope: &str,
    caller_object_id: &str,
) -> Result<Vec<CallerAssignment>> {
    let filter = format!("atScope() and assignedTo('{caller_object_id}')");
    let assignments: Vec<ArmResource<RoleAssignmentProperties>> = rest
        .get_paged(
            Api::Arm,
            &format!("{scope}/{AUTHORIZATION_PROVIDER}/roleAssignments"),
            &[("api-version", RBAC_API_VERSION), ("$filter", &filter)],
        )
        .await
        .context(format!("listing the caller's role assignments at {scope}"))?;
    Ok(assignments
        .into_iter()
        .map(|a| CallerAssignment {
            id: a.id,
            role_definition_id: a.properties.role_definition_id,
        })
        .collect())
}

pub(crate) async fn submit_schedule_request(
    rest: &AzureRestClient,
    scope: &str,
    request: &ScheduleRequest,
) -> Result<()> {
    let mut properties = json!({
        "principalId": request.principal_id,
        "roleDefinitionId": request.role_definition_id,
        "requestType": request.action.to_string(),
        "scheduleInfo": schedule_info_body(request.start, request.end, Casing::Pascal)?,
    });
    if let Some(justification) = &request.justification {
        properties["justification"] = Value::from(justification.as_str());
    }
    if let Some(schedule_id) = &request.target_schedule_id {
        properties["targetScheduleId"] =
            Value::from(schedule_path(scope, request.kind, schedule_id));
    }
    put_request(rest, scope, request.kind, &request.request_id.to_string(), properties).await
}

pub(crate) async fn request_removal(
    rest: &AzureRestClient,
    scope: &str,
    removal: &Removal,
) -> Result<()> {
    let properties = json!({
        "principalId": removal.principal_id,
        "roleDefinitionId": removal.role_definition_id,
        "requestType": RequestAction::AdminRemove.to_string(),
        "targetScheduleId": schedule_path(scope, removal.kind, &removal.schedule_id),
    });
    put_request(rest, scope, removal.kind, &removal.request_id.to_string(), properties).await
}

/// The full resource id of a schedule
fn schedule_path(scope: &str, kind: GrantKind, schedule_id: &str) -> String {
    format!(
        "{scope}/{AUTHORIZATION_PROVIDER}/{}/{schedule_id}",
        schedules_resource(kind)
    )
}

async fn put_request(
    rest: &AzureRestClient,
    scope: &str,
    kind: GrantKind,
    request_name: &str,
    properties: Value,
) -> Result<()> {
    rest.send_json(
        Api::Arm,
        Method::PUT,
        &format!(
            "{scope}/{AUTHORIZATION_PROVIDER}/{}/{request_name}",
            requests_resource(kind)
        ),
        &[("api-version", PIM_API_VERSION)],
        Some(&json!({ "properties": properties })),
    )
    .await
}

pub(crate) async fn cancel_request(
    rest: &AzureRestClient,
    scope: &str,
    cancellation: &Cancellation,
) -> Result<()> {
    rest.send_json(
        Api::Arm,
        Method::POST,
        &format!(
            "{scope}/{AUTHORIZATION_PROVIDER}/{}/{}/cancel",
            requests_resource(cancellation.kind),
            cancellation.request_name
        ),
        &[("api-version", PIM_API_VERSION)],
        None,
    )
    .await
}

pub(crate) async fn update_policy(rest: &AzureRestClient, update: &PolicyUpdate) -> Result<()> {
    let rules = update
        .rules
        .iter()
        .map(Rule::to_value)
        .collect::<Result<Vec<_>>>()?;
    rest.send_json(
        Api::Arm,
        Method::PATCH,
        &update.policy_id,
        &[("api-version", PIM_API_VERSION)],
        Some(&json!({ "properties": { "rules": rules } })),
    )
    .await
}
