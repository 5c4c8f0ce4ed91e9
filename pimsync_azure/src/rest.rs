//! Rest API interface for Azure Resource Manager and Microsoft Graph
//!

use crate::{consts, creds::AzureCredentials};

use anyhow::{anyhow, Context, Result};
use pimsync_core::logging::debug;
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

#[derive(Default)]
pub(crate) struct AzureRestConfig {
    /// Enable/disable retry logic.
    pub(crate) retry: bool,
}

/// Which of the two APIs a request goes to. Each has its own base url and
/// its own token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Api {
    Arm,
    Graph,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// One page of a list response. ARM calls the continuation `nextLink`,
/// Graph calls it `@odata.nextLink`.
#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
    #[serde(rename = "@odata.nextLink", default)]
    odata_next_link: Option<String>,
}

/// Wrapper struct for http functionality
pub(crate) struct AzureRestClient {
    credentials: AzureCredentials,
    http_client: ClientWithMiddleware,
    arm_token: String,
    graph_token: String,
}

impl AzureRestClient {
    /// Build the client and exchange the client secret for a token per API.
    pub(crate) async fn new(
        credentials: AzureCredentials,
        config: AzureRestConfig,
    ) -> Result<Self> {
        credentials.validate()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let mut client_builder = ClientBuilder::new(reqwest::Client::new());
        if config.retry {
            client_builder =
                client_builder.with(RetryTransientMiddleware::new_with_policy(retry_policy))
        }
        let http_client = client_builder.build();

        let arm_token = fetch_token(&credentials, consts::ARM_TOKEN_SCOPE)
            .await
            .context("fetching resource manager token")?;
        let graph_token = fetch_token(&credentials, consts::GRAPH_TOKEN_SCOPE)
            .await
            .context("fetching graph token")?;

        Ok(Self {
            credentials,
            http_client,
            arm_token,
            graph_token,
        })
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    /// Absolute urls (continuation links, mostly) are used as they are.
    fn get_url(&self, api: Api, path: &str) -> String {
        if path.starts_with("http") {
            return path.to_owned();
        }
        let base = match api {
            Api::Arm => self.credentials.arm_url(),
            Api::Graph => self.credentials.graph_url(),
        };
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn get_request(&self, api: Api, method: Method, path: &str) -> RequestBuilder {
        let token = match api {
            Api::Arm => &self.arm_token,
            Api::Graph => &self.graph_token,
        };
        let url = self.get_url(api, path);
        debug!("{} {}", method, url);
        self.http_client
            .request(method, url)
            .header(consts::AUTH_HEADER, format!["Bearer {}", token])
            .header(consts::ACCEPT_HEADER, "application/json")
            .header(consts::USER_AGENT_HEADER, consts::USER_AGENT)
    }

    /// GET a single JSON document.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        api: Api,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .get_request(api, Method::GET, path)
            .query(query)
            .send()
            .await
            .context("couldn't send request")?;
        check_status(response)
            .await?
            .json::<T>()
            .await
            .context(format!("parsing response from {path}"))
    }

    /// GET a single JSON document that may not exist.
    pub(crate) async fn get_optional<T: DeserializeOwned>(
        &self,
        api: Api,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let response = self
            .get_request(api, Method::GET, path)
            .query(query)
            .send()
            .await
            .context("couldn't send request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = check_status(response)
            .await?
            .json::<T>()
            .await
            .context(format!("parsing response from {path}"))?;
        Ok(Some(value))
    }

    /// GET every item of a list, following continuation links.
    pub(crate) async fn get_paged<T: DeserializeOwned>(
        &self,
        api: Api,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut items = vec![];
        let mut page: Page = self.get_json(api, path, query).await?;
        loop {
            for value in page.value {
                items.push(
                    serde_json::from_value(value)
                        .context(format!("parsing list item from {path}"))?,
                );
            }
            // The continuation link already carries the query
            match page.next_link.or(page.odata_next_link) {
                Some(next) => page = self.get_json(api, &next, &[]).await?,
                None => break,
            }
        }
        Ok(items)
    }

    /// Send a JSON body, dropping whatever comes back.
    pub(crate) async fn send_json(
        &self,
        api: Api,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<()> {
        let mut request = self.get_request(api, method, path).query(query);
        if let Some(body) = body {
            request = request
                .header(consts::CONTENT_TYPE_HEADER, "application/json")
                .json(body);
        }
        let response = request.send().await.context("couldn't send request")?;
        check_status(response).await?;
        Ok(())
    }
}

/// Azure explains failures in the body, so keep it in the error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("request to {url} failed with {status}: {body}"))
}

async fn fetch_token(credentials: &AzureCredentials, scope: &str) -> Result<String> {
    let resp = reqwest::Client::new()
        .post(credentials.token_url())
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("scope", scope),
        ])
        .header(consts::ACCEPT_HEADER, "application/json")
        .send()
        .await
        .context("couldn't send token request")?;
    let token = check_status(resp)
        .await?
        .json::<TokenResponse>()
        .await
        .map_err(|_| anyhow!["unable to get token from response"])?;
    Ok(token.access_token)
}
