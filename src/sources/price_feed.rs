//! Binance spot price adapter
//!
//! Quotes every asset against USDT via the public ticker endpoint. One call,
//! no retries; the caller treats each reading as authoritative-for-the-moment.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::Reading;

const SOURCE_ID: &str = "binance_spot";

#[derive(Debug, Deserialize)]
struct TickerPriceResponse {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

#[derive(Clone)]
pub struct SpotPriceClient {
    client: Client,
    base_url: String,
}

impl SpotPriceClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build spot price client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the current USDT quote for an asset symbol (e.g. "BTC").
    pub async fn fetch_price(&self, asset: &str) -> Result<Reading> {
        let symbol = format!("{}USDT", asset.trim().to_uppercase());
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .context("GET ticker/price failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("ticker/price {}: {}", status, text));
        }

        let body = resp.text().await.context("failed to read ticker body")?;
        let ticker: TickerPriceResponse =
            serde_json::from_str(&body).context("failed to parse ticker response")?;

        let value: f64 = ticker
            .price
            .parse()
            .with_context(|| format!("non-numeric price for {}: {}", symbol, ticker.price))?;

        Ok(Reading {
            source: SOURCE_ID.to_string(),
            value,
            timestamp: Utc::now(),
            raw_payload: Some(body),
        })
    }
}
