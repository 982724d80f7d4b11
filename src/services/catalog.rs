//! Client for the service catalog's own API. Every request is retried and
//! logged at debug level; the surface stays behind a trait so it can be
//! mocked.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CatalogConfig;
use crate::retry::Retry;

pub const ENTERPRISE_SKU: &str = "ent";
pub const OSS_SKU: &str = "oss";

/// Retry budget for catalog calls, matching the template engine's own
/// retry count.
pub const DEFAULT_CATALOG_MAX_RETRIES: i64 = 8;

const TOKEN_HEADER: &str = "X-Catalog-Token";

/// Options forwarded on read requests.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub datacenter: Option<String>,
}

/// Read surface of the catalog the controller depends on.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Fetch the signed license, if the catalog has one.
    async fn get_license(&self, cancel: &CancellationToken, opts: &QueryOptions)
        -> Result<String>;

    /// Determine whether the catalog is an enterprise or OSS build.
    async fn get_sku(&self, cancel: &CancellationToken) -> Result<String>;
}

/// HTTP implementation of [`CatalogApi`].
pub struct HttpCatalogClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
    retry: Retry,
}

impl HttpCatalogClient {
    pub fn new(config: &CatalogConfig, max_retries: i64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("unable to build catalog http client")?;
        Ok(Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            retry: Retry::new(max_retries, Utc::now().timestamp_millis() as u64),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.get(format!("{}{path}", self.address));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn get_license(
        &self,
        cancel: &CancellationToken,
        opts: &QueryOptions,
    ) -> Result<String> {
        debug!("getting license");
        self.retry
            .run(
                cancel,
                || {
                    let mut request = self.request("/v1/operator/license");
                    if let Some(datacenter) = &opts.datacenter {
                        request = request.query(&[("dc", datacenter)]);
                    }
                    async move {
                        let response = request.send().await?.error_for_status()?;
                        Ok(response.text().await?)
                    }
                },
                "catalog client get license",
            )
            .await
    }

    async fn get_sku(&self, cancel: &CancellationToken) -> Result<String> {
        debug!("getting sku");
        let info: Value = self
            .retry
            .run(
                cancel,
                || {
                    let request = self.request("/v1/agent/self");
                    async move {
                        let response = request.send().await?.error_for_status()?;
                        Ok(response.json::<Value>().await?)
                    }
                },
                "catalog client get sku",
            )
            .await?;
        parse_sku(&info).ok_or_else(|| anyhow!("unable to parse sku"))
    }
}

/// Read the build SKU out of the agent's self-description: the version's
/// build metadata carries `ent` on enterprise builds.
fn parse_sku(info: &Value) -> Option<String> {
    let version = info.get("Config")?.get("Version")?.as_str()?;
    let version = semver::Version::parse(version.trim().trim_start_matches('v')).ok()?;
    if version.build.as_str().contains(ENTERPRISE_SKU) {
        Some(ENTERPRISE_SKU.to_string())
    } else {
        Some(OSS_SKU.to_string())
    }
}
