//! Client for the Consul catalog and agent HTTP APIs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use storm_api::{ApiError, ApiResult};

/// Port every Consul agent serves its HTTP API on.
pub const CONSUL_HTTP_PORT: u16 = 8500;

/// Tag marking catalog entries this platform owns. Entries without it
/// are never touched.
pub const MANAGED_TAG: &str = "ps-consul";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of a catalog service listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "ServicePort")]
    pub port: u16,
    #[serde(rename = "ServiceTags", default)]
    pub tags: Vec<String>,
}

#[derive(Serialize)]
struct Registration<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: [&'a str; 1],
}

/// Talks to Consul agents over HTTP. Catalog reads go through the
/// server agent; registrations go to the agent local to the service.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
}

impl Default for CatalogClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn url(agent: &str, path: &str) -> String {
        format!("http://{agent}:{CONSUL_HTTP_PORT}/v1/{path}")
    }

    /// All catalog services with their tags.
    pub async fn services(&self, agent: &str) -> ApiResult<BTreeMap<String, Vec<String>>> {
        let response = self.http.get(Self::url(agent, "catalog/services")).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Catalog entries for one service.
    pub async fn service(&self, agent: &str, name: &str) -> ApiResult<Vec<CatalogEntry>> {
        let response = self
            .http
            .get(Self::url(agent, &format!("catalog/service/{name}")))
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Register a managed service with the agent at `agent`.
    pub async fn register(&self, agent: &str, name: &str, port: u16) -> ApiResult<()> {
        debug!(agent, name, port, "registering consul service");
        let response = self
            .http
            .put(Self::url(agent, "agent/service/register"))
            .json(&Registration {
                name,
                port,
                tags: [MANAGED_TAG],
            })
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    /// Remove a managed service from the agent at `agent`.
    pub async fn deregister(&self, agent: &str, name: &str) -> ApiResult<()> {
        debug!(agent, name, "deregistering consul service");
        let response = self
            .http
            .put(Self::url(agent, &format!("agent/service/deregister/{name}")))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }
}

async fn checked(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound {
            path: response.url().path().to_string(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Client {
        status: status.as_u16(),
        body,
    })
}
