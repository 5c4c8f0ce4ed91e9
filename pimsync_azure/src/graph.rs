//! Directory lookups and PIM for Groups, through Microsoft Graph.
//!
//! Group grants are keyed by the group's object id on the wire, and the only
//! two roles are `member` and `owner`.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use pimsync_core::{
    grants::{ExistingGrant, GrantKind, GrantStatus, PrincipalKind, Target},
    logging::debug,
    policy::{PolicyUpdate, RemotePolicy, Rule},
    remote::{Cancellation, Removal, RequestAction, RoleDefinition, ScheduleRequest},
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::{
    consts::GROUP_ROLES,
    rest::{Api, AzureRestClient},
    schedule::{schedule_info_body, Casing, ScheduleInfo},
};

const PIM_GROUP_PATH: &str = "/identityGovernance/privilegedAccess/group";
const GRAPH_RULE_PREFIX: &str = "#microsoft.graph.unified";
const PENDING_ACTIONS: [&str; 4] = ["adminAssign", "adminUpdate", "adminExtend", "adminRenew"];

#[derive(Deserialize, Debug)]
pub(crate) struct DirectoryObject {
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    id: String,
    #[serde(rename = "userPrincipalName", default)]
    user_principal_name: Option<String>,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

impl DirectoryObject {
    fn kind(&self) -> Option<PrincipalKind> {
        match self.odata_type.as_deref() {
            Some("#microsoft.graph.user") => Some(PrincipalKind::User),
            Some("#microsoft.graph.group") => Some(PrincipalKind::Group),
            _ => None,
        }
    }

    /// The name configuration refers to this object by
    fn configured_name(&self) -> Option<String> {
        match self.kind() {
            Some(PrincipalKind::User) => self.user_principal_name.to_owned(),
            _ => self.display_name.to_owned(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GroupSchedule {
    id: String,
    access_id: String,
    principal_id: String,
    status: String,
    #[serde(default)]
    schedule_info: Option<ScheduleInfo>,
    #[serde(default)]
    assignment_type: Option<String>,
    #[serde(default)]
    principal: Option<DirectoryObject>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GroupRequest {
    id: String,
    access_id: String,
    principal_id: String,
    status: String,
    action: String,
    #[serde(default)]
    schedule_info: Option<ScheduleInfo>,
    #[serde(default)]
    principal: Option<DirectoryObject>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_date_time: Option<OffsetDateTime>,
}

#[derive(Deserialize, Debug)]
struct PolicyAssignment {
    policy: Option<GraphPolicy>,
}

#[derive(Deserialize, Debug)]
struct GraphPolicy {
    id: String,
    #[serde(default)]
    rules: Vec<Value>,
}

fn schedules_resource(kind: GrantKind) -> &'static str {
    match kind {
        GrantKind::Active => "assignmentSchedules",
        GrantKind::Eligible => "eligibilitySchedules",
    }
}

fn requests_resource(kind: GrantKind) -> &'static str {
    match kind {
        GrantKind::Active => "assignmentScheduleRequests",
        GrantKind::Eligible => "eligibilityScheduleRequests",
    }
}

fn odata_string(s: &str) -> String {
    s.replace('\'', "''")
}

pub(crate) async fn principal_name(rest: &AzureRestClient, id: &str) -> Result<Option<String>> {
    let object: Option<DirectoryObject> = rest
        .get_optional(Api::Graph, &format!("/directoryObjects/{id}"), &[])
        .await
        .context(format!("looking up directory object {id}"))?;
    Ok(object.and_then(|o| o.configured_name()))
}

pub(crate) async fn principal_id(
    rest: &AzureRestClient,
    kind: PrincipalKind,
    name: &str,
) -> Result<Option<String>> {
    match kind {
        PrincipalKind::User => {
            let user: Option<DirectoryObject> = rest
                .get_optional(
                    Api::Graph,
                    &format!("/users/{}", urlencoding::encode(name)),
                    &[("$select", "id,userPrincipalName")],
                )
                .await
                .context(format!("looking up user {name}"))?;
            Ok(user.map(|u| u.id))
        }
        PrincipalKind::Group => group_id(rest, name).await,
    }
}

/// Display names aren't unique, but configuration uses them as if they were.
/// Ambiguity is an error.
pub(crate) async fn group_id(rest: &AzureRestClient, name: &str) -> Result<Option<String>> {
    let filter = format!("displayName eq '{}'", odata_string(name));
    let groups: Vec<DirectoryObject> = rest
        .get_paged(
            Api::Graph,
            "/groups",
            &[("$filter", &filter), ("$select", "id,displayName")],
        )
        .await
        .context(format!("looking up group {name}"))?;
    match groups.as_slice() {
        [] => Ok(None),
        [group] => Ok(Some(group.id.to_owned())),
        _ => bail!("{} groups are named {name}", groups.len()),
    }
}

pub(crate) async fn list_existing_grants(
    rest: &AzureRestClient,
    kind: GrantKind,
    group_name: &str,
    group_id: &str,
) -> Result<Vec<ExistingGrant>> {
    let filter = format!("groupId eq '{group_id}'");
    let query = [("$filter", filter.as_str()), ("$expand", "principal")];
    let schedules: Vec<GroupSchedule> = rest
        .get_paged(
            Api::Graph,
            &format!("{PIM_GROUP_PATH}/{}", schedules_resource(kind)),
            &query,
        )
        .await
        .context(format!("listing {kind} schedules for group {group_name}"))?;
    let requests: Vec<GroupRequest> = rest
        .get_paged(
            Api::Graph,
            &format!("{PIM_GROUP_PATH}/{}", requests_resource(kind)),
            &query,
        )
        .await
        .context(format!("listing {kind} requests for group {group_name}"))?;

    let target = Target::group(group_name);
    let mut grants = vec![];
    for schedule in schedules {
        if schedule
            .assignment_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("activated"))
            .unwrap_or(false)
        {
            continue;
        }
        let Some(principal_kind) = schedule.principal.as_ref().and_then(DirectoryObject::kind) else {
            debug!("skipping group schedule {} for a non-user, non-group principal", schedule.id);
            continue;
        };
        let status = GrantStatus::from_str(&schedule.status)?;
        let info = schedule.schedule_info.unwrap_or_default();
        grants.push(ExistingGrant {
            request_name: schedule.id.to_owned(),
            id: schedule.id,
            kind,
            principal_id: schedule.principal_id,
            principal_kind,
            role_definition_id: schedule.access_id.to_ascii_lowercase(),
            target: target.to_owned(),
            status,
            start: info.start_date_time,
            end: info.end(),
        });
    }
    for request in requests {
        let status = GrantStatus::from_str(&request.status)?;
        if !status.is_in_flight()
            || !PENDING_ACTIONS
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&request.action))
        {
            continue;
        }
        let Some(principal_kind) = request.principal.as_ref().and_then(DirectoryObject::kind) else {
            continue;
        };
        let info = request.schedule_info.unwrap_or_default();
        grants.push(ExistingGrant {
            id: request.id.to_owned(),
            kind,
            principal_id: request.principal_id,
            principal_kind,
            role_definition_id: request.access_id.to_ascii_lowercase(),
            target: target.to_owned(),
            status,
            start: info.start_date_time.or(request.created_date_time),
            end: info.end(),
            request_name: request.id,
        });
    }
    Ok(grants)
}

/// Group roles aren't directory objects. Their id is their name.
pub(crate) fn group_role(role: &str) -> Option<RoleDefinition> {
    GROUP_ROLES
        .iter()
        .find(|r| r.eq_ignore_ascii_case(role))
        .map(|r| RoleDefinition {
            id: (*r).to_owned(),
            name: (*r).to_owned(),
            actions: vec![],
            not_actions: vec![],
        })
}

pub(crate) async fn effective_policy(
    rest: &AzureRestClient,
    group_id: &str,
    role: &RoleDefinition,
) -> Result<RemotePolicy> {
    let filter = format!(
        "scopeId eq '{group_id}' and scopeType eq 'Group' and roleDefinitionId eq '{}'",
        role.id
    );
    let assignments: Vec<PolicyAssignment> = rest
        .get_paged(
            Api::Graph,
            "/policies/roleManagementPolicyAssignments",
            &[("$filter", &filter), ("$expand", "policy($expand=rules)")],
        )
        .await
        .context(format!("fetching the {} policy for group {group_id}", role.name))?;
    let policy = assignments
        .into_iter()
        .find_map(|a| a.policy)
        .ok_or_else(|| anyhow!("no policy is assigned to {} of group {group_id}", role.name))?;
    let rules = policy
        .rules
        .into_iter()
        .map(|r| Rule::from_value(rule_from_graph(r)))
        .collect::<Result<Vec<_>>>()?;
    Ok(RemotePolicy {
        id: policy.id,
        rules,
    })
}

/// Graph patches rules one at a time, so only the changed ones are sent.
pub(crate) async fn update_policy(rest: &AzureRestClient, update: &PolicyUpdate) -> Result<()> {
    for rule in update
        .rules
        .iter()
        .filter(|r| update.changed_rules.iter().any(|c| c == r.id()))
    {
        rest.send_json(
            Api::Graph,
            Method::PATCH,
            &format!(
                "/policies/roleManagementPolicies/{}/rules/{}",
                update.policy_id,
                rule.id()
            ),
            &[],
            Some(&rule_to_graph(rule.to_value()?)),
        )
        .await
        .context(format!("updating rule {} of policy {}", rule.id(), update.policy_id))?;
    }
    Ok(())
}

fn graph_action(action: RequestAction) -> &'static str {
    match action {
        RequestAction::AdminAssign => "adminAssign",
        RequestAction::AdminUpdate => "adminUpdate",
        RequestAction::AdminRemove => "adminRemove",
    }
}

pub(crate) async fn submit_schedule_request(
    rest: &AzureRestClient,
    group_id: &str,
    request: &ScheduleRequest,
) -> Result<()> {
    let mut body = json!({
        "accessId": request.role_definition_id,
        "principalId": request.principal_id,
        "groupId": group_id,
        "action": graph_action(request.action),
        "scheduleInfo": schedule_info_body(request.start, request.end, Casing::Camel)?,
    });
    if let Some(justification) = &request.justification {
        body["justification"] = Value::from(justification.as_str());
    }
    if let Some(schedule_id) = &request.target_schedule_id {
        body["targetScheduleId"] = Value::from(schedule_id.as_str());
    }
    rest.send_json(
        Api::Graph,
        Method::POST,
        &format!("{PIM_GROUP_PATH}/{}", requests_resource(request.kind)),
        &[],
        Some(&body),
    )
    .await
}

pub(crate) async fn request_removal(
    rest: &AzureRestClient,
    group_id: &str,
    removal: &Removal,
) -> Result<()> {
    let body = json!({
        "accessId": removal.role_definition_id,
        "principalId": removal.principal_id,
        "groupId": group_id,
        "action": graph_action(RequestAction::AdminRemove),
        "targetScheduleId": removal.schedule_id,
    });
    rest.send_json(
        Api::Graph,
        Method::POST,
        &format!("{PIM_GROUP_PATH}/{}", requests_resource(removal.kind)),
        &[],
        Some(&body),
    )
    .await
}

pub(crate) async fn cancel_request(rest: &AzureRestClient, cancellation: &Cancellation) -> Result<()> {
    rest.send_json(
        Api::Graph,
        Method::POST,
        &format!(
            "{PIM_GROUP_PATH}/{}/{}/cancel",
            requests_resource(cancellation.kind),
            cancellation.request_name
        ),
        &[],
        None,
    )
    .await
}

/// Graph spells rules `#microsoft.graph.unifiedRoleManagementPolicyXRule`
/// in `@odata.type`, and names approvers by their own odata type. Rewrite
/// both into the resource manager shape the rules are modelled on.
pub(crate) fn rule_from_graph(mut rule: Value) -> Value {
    if let Value::Object(map) = &mut rule {
        if let Some(Value::String(odata_type)) = map.remove("@odata.type") {
            let rule_type = odata_type
                .strip_prefix(GRAPH_RULE_PREFIX)
                .unwrap_or(&odata_type)
                .to_owned();
            map.insert("ruleType".to_owned(), Value::from(rule_type));
        }
    }
    for_each_approver(&mut rule, |approver| {
        let odata_type = approver
            .remove("@odata.type")
            .and_then(|t| t.as_str().map(str::to_owned))
            .unwrap_or_default();
        let (user_type, id_field) = if odata_type.ends_with("groupMembers") {
            ("Group", "groupId")
        } else {
            ("User", "userId")
        };
        if let Some(id) = approver.remove(id_field) {
            approver.insert("id".to_owned(), id);
        }
        approver.insert("userType".to_owned(), Value::from(user_type));
    });
    rule
}

/// The inverse of [`rule_from_graph`]
pub(crate) fn rule_to_graph(mut rule: Value) -> Value {
    if let Value::Object(map) = &mut rule {
        if let Some(Value::String(rule_type)) = map.remove("ruleType") {
            map.insert(
                "@odata.type".to_owned(),
                Value::from(format!("{GRAPH_RULE_PREFIX}{rule_type}")),
            );
        }
    }
    for_each_approver(&mut rule, |approver| {
        let user_type = approver
            .remove("userType")
            .and_then(|t| t.as_str().map(str::to_owned))
            .unwrap_or_default();
        let (odata_type, id_field) = if user_type.eq_ignore_ascii_case("Group") {
            ("#microsoft.graph.groupMembers", "groupId")
        } else {
            ("#microsoft.graph.singleUser", "userId")
        };
        if let Some(id) = approver.remove("id") {
            approver.insert(id_field.to_owned(), id);
        }
        approver.insert("@odata.type".to_owned(), Value::from(odata_type));
    });
    rule
}

fn for_each_approver(rule: &mut Value, mut f: impl FnMut(&mut Map<String, Value>)) {
    let Some(stages) = rule
        .pointer_mut("/setting/approvalStages")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for stage in stages {
        for field in ["primaryApprovers", "escalationApprovers"] {
            if let Some(approvers) = stage.get_mut(field).and_then(Value::as_array_mut) {
                approvers
                    .iter_mut()
                    .filter_map(Value::as_object_mut)
                    .for_each(&mut f);
            }
        }
    }
}

/// Resolve a group target's name to the id Graph keys it by.
pub(crate) async fn require_group_id(rest: &AzureRestClient, name: &str) -> Result<String> {
    group_id(rest, name).await?.ok_or_else(|| {
        pimsync_core::ReconcileError::UnresolvedName {
            kind: "group",
            name: name.to_owned(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use pimsync_core::policy::RuleKind;

    use super::*;

    #[test]
    fn graph_rules_read_as_resource_manager_rules() -> Result<()> {
        let graph = json!({
            "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyApprovalRule",
            "id": "Approval_EndUser_Assignment",
            "target": {"caller": "EndUser", "operations": ["All"], "level": "Assignment"},
            "setting": {
                "isApprovalRequired": true,
                "approvalMode": "SingleStage",
                "approvalStages": [{
                    "approvalStageTimeOutInDays": 1,
                    "primaryApprovers": [
                        {"@odata.type": "#microsoft.graph.singleUser", "userId": "u1", "isBackup": false},
                        {"@odata.type": "#microsoft.graph.groupMembers", "groupId": "g1", "isBackup": false}
                    ]
                }]
            }
        });
        let rule = Rule::from_value(rule_from_graph(graph))?;
        assert_eq!(rule.kind(), RuleKind::Approval);

        let value = rule.to_value()?;
        let approvers = &value["setting"]["approvalStages"][0]["primaryApprovers"];
        assert_eq!(approvers[0]["id"], "u1");
        assert_eq!(approvers[0]["userType"], "User");
        assert_eq!(approvers[1]["id"], "g1");
        assert_eq!(approvers[1]["userType"], "Group");
        Ok(())
    }

    #[test]
    fn rules_are_written_back_in_graph_shape() -> Result<()> {
        let rule = Rule::from_value(json!({
            "ruleType": "RoleManagementPolicyApprovalRule",
            "id": "Approval_EndUser_Assignment",
            "setting": {
                "approvalStages": [{
                    "escalationApprovers": [{"id": "g9", "userType": "Group"}]
                }]
            }
        }))?;
        let graph = rule_to_graph(rule.to_value()?);
        assert_eq!(
            graph["@odata.type"],
            "#microsoft.graph.unifiedRoleManagementPolicyApprovalRule"
        );
        assert!(graph.get("ruleType").is_none());
        let approver = &graph["setting"]["approvalStages"][0]["escalationApprovers"][0];
        assert_eq!(approver["@odata.type"], "#microsoft.graph.groupMembers");
        assert_eq!(approver["groupId"], "g9");
        assert!(approver.get("id").is_none());
        Ok(())
    }

    #[test]
    fn group_roles_are_member_and_owner() {
        assert_eq!(group_role("Member").unwrap().id, "member");
        assert_eq!(group_role("owner").unwrap().name, "owner");
        assert!(group_role("Contributor").is_none());
    }

    #[test]
    fn configured_names_depend_on_the_object_type() {
        let user: DirectoryObject = serde_json::from_value(json!({
            "@odata.type": "#microsoft.graph.user",
            "id": "u1",
            "userPrincipalName": "alice@contoso.com",
            "displayName": "Alice"
        }))
        .unwrap();
        let group: DirectoryObject = serde_json::from_value(json!({
            "@odata.type": "#microsoft.graph.group",
            "id": "g1",
            "displayName": "Admins"
        }))
        .unwrap();
        assert_eq!(user.configured_name().as_deref(), Some("alice@contoso.com"));
        assert_eq!(group.configured_name().as_deref(), Some("Admins"));
    }
}
