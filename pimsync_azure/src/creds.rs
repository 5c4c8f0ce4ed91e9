use anyhow::{anyhow, Result};

use crate::consts;

/// Credentials for a service principal, authenticating with a client secret.
///
/// The user sets these up in their credentials file. The endpoint overrides
/// are for sovereign clouds and tests.
#[derive(Default)]
pub(crate) struct AzureCredentials {
    pub(crate) tenant_id: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) arm_url: Option<String>,
    pub(crate) graph_url: Option<String>,
    pub(crate) login_url: Option<String>,
}

// The secret stays out of logs and error messages
impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &if self.client_secret.is_empty() { "" } else { "****" },
            )
            .field("arm_url", &self.arm_url)
            .field("graph_url", &self.graph_url)
            .field("login_url", &self.login_url)
            .finish()
    }
}

impl AzureCredentials {
    /// Perform simple field validation to catch bad input.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.tenant_id.is_empty() || self.client_id.is_empty() || self.client_secret.is_empty()
        {
            return Err(anyhow!(
                "Credentials are missing. Please make sure your credentials file is correct. Credentials received: {:#?}", self
            ));
        }
        Ok(())
    }

    pub(crate) fn arm_url(&self) -> String {
        self.arm_url
            .to_owned()
            .unwrap_or_else(|| consts::DEFAULT_ARM_URL.to_owned())
            .trim_end_matches('/')
            .to_owned()
    }

    pub(crate) fn graph_url(&self) -> String {
        self.graph_url
            .to_owned()
            .unwrap_or_else(|| consts::DEFAULT_GRAPH_URL.to_owned())
            .trim_end_matches('/')
            .to_owned()
    }

    pub(crate) fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_url
                .as_deref()
                .unwrap_or(consts::DEFAULT_LOGIN_URL)
                .trim_end_matches('/'),
            self.tenant_id
        )
    }
}
