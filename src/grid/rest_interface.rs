//! REST grid gateway implementation

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::common::{GridEnvelope, GridJobDefinition};
use super::grid_interface::GridInterface;

#[derive(Serialize)]
struct JobIdsBody {
    ids: Vec<i64>,
}

/// Client for a REST gateway exposing the grid's job management operations.
///
/// The gateway wraps every response in the ok/value/message envelope; HTTP
/// and connection errors surface as transport failures. Each request carries
/// its own timeout so a hung backend cannot stall a monitoring cycle
/// indefinitely.
pub struct RestGridInterface {
    base_url: String,
    client: reqwest::Client,
}

impl RestGridInterface {
    /// Create a new gateway client. `timeout_secs` bounds each call.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build grid gateway HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post_envelope<B, T>(&self, path: &str, body: &B) -> Result<GridEnvelope<T>>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        trace!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach grid gateway at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Grid gateway returned HTTP {} for {}", status, url);
        }

        response
            .json::<GridEnvelope<T>>()
            .await
            .with_context(|| format!("Invalid result envelope from {}", url))
    }
}

#[async_trait]
impl GridInterface for RestGridInterface {
    async fn submit(&self, definition: &GridJobDefinition) -> Result<GridEnvelope<Vec<i64>>> {
        self.post_envelope("jobs", definition).await
    }

    async fn get_status(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<HashMap<i64, String>>> {
        let body = JobIdsBody {
            ids: ids.iter().copied().collect(),
        };
        self.post_envelope("jobs/status", &body).await
    }

    async fn kill(&self, ids: &[i64]) -> Result<GridEnvelope<()>> {
        let body = JobIdsBody { ids: ids.to_vec() };
        self.post_envelope("jobs/kill", &body).await
    }

    async fn delete(&self, ids: &[i64]) -> Result<GridEnvelope<()>> {
        let body = JobIdsBody { ids: ids.to_vec() };
        self.post_envelope("jobs/delete", &body).await
    }

    async fn reschedule(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<BTreeSet<i64>>> {
        let body = JobIdsBody {
            ids: ids.iter().copied().collect(),
        };
        self.post_envelope("jobs/reschedule", &body).await
    }

    async fn ping(&self) -> Result<bool> {
        let url = format!("{}/ping", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach grid gateway at {}", url))?;
        Ok(response.status().is_success())
    }
}
