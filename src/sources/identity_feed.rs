//! Identity network profile-count adapter
//!
//! Single global reading, no key. The stats endpoint is configurable so a
//! deployment can point at whichever identity network it tracks; the
//! response is expected to carry a `total_profiles` (or `count`) field.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::Reading;

const SOURCE_ID: &str = "identity_stats";

#[derive(Debug, Deserialize)]
struct ProfileStatsResponse {
    #[serde(default)]
    total_profiles: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Clone)]
pub struct IdentityStatsClient {
    client: Client,
    stats_url: String,
}

impl IdentityStatsClient {
    pub fn new(stats_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build identity stats client")?;

        Ok(Self {
            client,
            stats_url: stats_url.to_string(),
        })
    }

    /// Fetch the network-wide profile count.
    pub async fn fetch_profile_count(&self) -> Result<Reading> {
        let resp = self
            .client
            .get(&self.stats_url)
            .send()
            .await
            .context("GET identity stats failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("identity stats {}: {}", status, text));
        }

        let body = resp.text().await.context("failed to read stats body")?;
        let stats: ProfileStatsResponse =
            serde_json::from_str(&body).context("failed to parse stats response")?;

        let count = stats
            .total_profiles
            .or(stats.count)
            .ok_or_else(|| anyhow::anyhow!("stats response missing profile count"))?;

        Ok(Reading {
            source: SOURCE_ID.to_string(),
            value: count as f64,
            timestamp: Utc::now(),
            raw_payload: Some(body),
        })
    }
}
