//! Azure PIM connector
//!
//! Reads and writes role grants and role management policies through Azure
//! Resource Manager (for scopes) and Microsoft Graph (for directory lookups
//! and PIM for Groups).
//!
//! ```no_run
//! use pimsync_azure::AzureClient;
//! use pimsync_core::project::CredentialsMap;
//!
//! # async fn connect() -> anyhow::Result<()> {
//! let credentials = CredentialsMap::default();
//! let client = AzureClient::new(&credentials).await?;
//! # Ok(())
//! # }
//! ```

mod arm;
mod consts;
mod creds;
mod graph;
mod rest;
mod schedule;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use maplit::hashset;
use pimsync_core::{
    grants::{ExistingGrant, GrantKind, PrincipalKind, Target},
    logging::debug,
    policy::{PolicyUpdate, RemotePolicy},
    project::CredentialsMap,
    remote::{
        CallerAssignment, Cancellation, RemoteMutator, RemoteReader, Removal, RoleDefinition,
        ScheduleRequest,
    },
};
use serde::Deserialize;

use rest::{Api, AzureRestClient, AzureRestConfig};

/// Talks to Azure on behalf of one service principal
pub struct AzureClient {
    rest_client: AzureRestClient,
    /// The service principal's own object id, for permission checks
    caller_object_id: String,
    /// Group display name (lowercased) to object id
    group_ids: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ServicePrincipal {
    id: String,
}

impl AzureClient {
    /// Build a client from the credentials file. `tenantId`, `clientId` and
    /// `clientSecret` are required. `armUrl`, `graphUrl` and `loginUrl`
    /// override the public cloud endpoints.
    pub async fn new(credentials: &CredentialsMap) -> Result<Self> {
        Self::new_with_config(credentials, AzureRestConfig { retry: true }).await
    }

    async fn new_with_config(credentials: &CredentialsMap, config: AzureRestConfig) -> Result<Self> {
        let mut conn = creds::AzureCredentials::default();
        let mut required_fields: HashSet<_> = hashset! {"tenantId", "clientId", "clientSecret"};

        for (k, v) in credentials.iter() {
            match k.as_ref() {
                "tenantId" => conn.tenant_id = v.to_string(),
                "clientId" => conn.client_id = v.to_string(),
                "clientSecret" => conn.client_secret = v.to_string(),
                "armUrl" => conn.arm_url = Some(v.to_string()),
                "graphUrl" => conn.graph_url = Some(v.to_string()),
                "loginUrl" => conn.login_url = Some(v.to_string()),
                _ => (),
            }

            required_fields.remove::<str>(k);
        }

        if !required_fields.is_empty() {
            return Err(anyhow![
                "Azure credentials missing required fields: {:#?}",
                required_fields
            ]);
        }

        let rest_client = AzureRestClient::new(conn, config).await?;
        let caller: ServicePrincipal = rest_client
            .get_json(
                Api::Graph,
                &format!("/servicePrincipals(appId='{}')", rest_client.client_id()),
                &[("$select", "id")],
            )
            .await
            .context("looking up the calling service principal")?;
        debug!("authenticated as service principal {}", caller.id);

        Ok(AzureClient {
            rest_client,
            caller_object_id: caller.id,
            group_ids: Mutex::new(HashMap::new()),
        })
    }

    /// The object id of a managed group, looked up once per name
    async fn group_id(&self, name: &str) -> Result<String> {
        let key = name.to_lowercase();
        let cached = self
            .group_ids
            .lock()
            .map_err(|_| anyhow!("group id cache poisoned"))?
            .get(&key)
            .cloned();
        if let Some(id) = cached {
            return Ok(id);
        }
        let id = graph::require_group_id(&self.rest_client, name).await?;
        self.group_ids
            .lock()
            .map_err(|_| anyhow!("group id cache poisoned"))?
            .insert(key, id.to_owned());
        Ok(id)
    }
}

#[async_trait]
impl RemoteReader for AzureClient {
    async fn list_existing_grants(
        &self,
        kind: GrantKind,
        target: &Target,
    ) -> Result<Vec<ExistingGrant>> {
        match target {
            Target::Scope(scope) => arm::list_existing_grants(&self.rest_client, kind, scope).await,
            Target::Group(name) => {
                let group_id = self.group_id(name).await?;
                graph::list_existing_grants(&self.rest_client, kind, name, &group_id).await
            }
        }
    }

    async fn principal_name(&self, principal_id: &str) -> Result<Option<String>> {
        graph::principal_name(&self.rest_client, principal_id).await
    }

    async fn principal_id(&self, kind: PrincipalKind, name: &str) -> Result<Option<String>> {
        graph::principal_id(&self.rest_client, kind, name).await
    }

    async fn role_definition(
        &self,
        target: &Target,
        role_definition_id: &str,
    ) -> Result<Option<RoleDefinition>> {
        match target {
            Target::Scope(_) => arm::role_definition(&self.rest_client, role_definition_id).await,
            Target::Group(_) => Ok(graph::group_role(role_definition_id)),
        }
    }

    async fn find_role_definition(
        &self,
        target: &Target,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>> {
        match target {
            Target::Scope(scope) => {
                arm::find_role_definition(&self.rest_client, scope, role_name).await
            }
            Target::Group(_) => Ok(graph::group_role(role_name)),
        }
    }

    async fn effective_policy(
        &self,
        target: &Target,
        role: &RoleDefinition,
    ) -> Result<RemotePolicy> {
        match target {
            Target::Scope(scope) => arm::effective_policy(&self.rest_client, scope, role).await,
            Target::Group(name) => {
                let group_id = self.group_id(name).await?;
                graph::effective_policy(&self.rest_client, &group_id, role).await
            }
        }
    }

    async fn caller_assignments(&self, target: &Target) -> Result<Vec<CallerAssignment>> {
        match target {
            Target::Scope(scope) => {
                arm::caller_assignments(&self.rest_client, scope, &self.caller_object_id).await
            }
            // Group management rights live in the directory, not in RBAC
            Target::Group(_) => Ok(vec![]),
        }
    }
}

#[async_trait]
impl RemoteMutator for AzureClient {
    async fn submit_schedule_request(&self, request: &ScheduleRequest) -> Result<()> {
        match &request.target {
            Target::Scope(scope) => {
                arm::submit_schedule_request(&self.rest_client, scope, request).await
            }
            Target::Group(name) => {
                let group_id = self.group_id(name).await?;
                graph::submit_schedule_request(&self.rest_client, &group_id, request).await
            }
        }
    }

    async fn request_removal(&self, removal: &Removal) -> Result<()> {
        match &removal.target {
            Target::Scope(scope) => arm::request_removal(&self.rest_client, scope, removal).await,
            Target::Group(name) => {
                let group_id = self.group_id(name).await?;
                graph::request_removal(&self.rest_client, &group_id, removal).await
            }
        }
    }

    async fn cancel_request(&self, cancellation: &Cancellation) -> Result<()> {
        match &cancellation.target {
            Target::Scope(scope) => {
                arm::cancel_request(&self.rest_client, scope, cancellation).await
            }
            Target::Group(_) => graph::cancel_request(&self.rest_client, cancellation).await,
        }
    }

    async fn update_policy(&self, update: &PolicyUpdate) -> Result<()> {
        match &update.target {
            Target::Scope(_) => arm::update_policy(&self.rest_client, update).await,
            Target::Group(_) => graph::update_policy(&self.rest_client, update).await,
        }
    }
}
