//! DefiLlama TVL adapter
//!
//! Protocol TVL comes from the `/tvl/{slug}` endpoint (bare JSON number);
//! chain TVL comes from the `/v2/chains` listing matched by name.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::Reading;

const PROTOCOL_SOURCE_ID: &str = "defillama_protocol";
const CHAIN_SOURCE_ID: &str = "defillama_chain";

#[derive(Debug, Deserialize)]
struct ChainTvlEntry {
    name: String,
    tvl: f64,
}

#[derive(Clone)]
pub struct TvlClient {
    client: Client,
    base_url: String,
}

impl TvlClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build TVL client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current TVL for a protocol slug (e.g. "aave").
    pub async fn fetch_protocol_tvl(&self, protocol: &str) -> Result<Reading> {
        let slug = protocol.trim().to_lowercase();
        let url = format!("{}/tvl/{}", self.base_url, slug);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET protocol TVL failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("protocol TVL {}: {}", status, text));
        }

        let body = resp.text().await.context("failed to read TVL body")?;
        let value: f64 = body
            .trim()
            .parse()
            .with_context(|| format!("non-numeric TVL for {}: {}", slug, body))?;

        Ok(Reading {
            source: PROTOCOL_SOURCE_ID.to_string(),
            value,
            timestamp: Utc::now(),
            raw_payload: Some(body),
        })
    }

    /// Current TVL for a chain, matched case-insensitively by name.
    pub async fn fetch_chain_tvl(&self, chain: &str) -> Result<Reading> {
        let url = format!("{}/v2/chains", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET chains TVL failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("chains TVL {}: {}", status, text));
        }

        let chains: Vec<ChainTvlEntry> = resp
            .json()
            .await
            .context("failed to parse chains response")?;

        let wanted = chain.trim().to_lowercase();
        let entry = chains
            .iter()
            .find(|c| c.name.to_lowercase() == wanted)
            .ok_or_else(|| anyhow::anyhow!("chain not found: {}", chain))?;

        Ok(Reading {
            source: CHAIN_SOURCE_ID.to_string(),
            value: entry.tvl,
            timestamp: Utc::now(),
            raw_payload: Some(format!("{{\"name\":\"{}\",\"tvl\":{}}}", entry.name, entry.tvl)),
        })
    }
}
