//! Data Source Adapters
//!
//! Thin fetchers for the three oracle input feeds: spot prices, protocol and
//! chain TVL, and identity-network profile counts. Each provider client
//! returns `Result` internally; the [`DataSources`] trait boundary converts
//! failures to `None` with a warning so the resolver can treat "no data" as
//! a first-class case distinct from a crash.

pub mod identity_feed;
pub mod price_feed;
pub mod tvl_feed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use identity_feed::IdentityStatsClient;
pub use price_feed::SpotPriceClient;
pub use tvl_feed::TvlClient;

use crate::models::Config;

/// A single numeric reading from an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub source: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Raw provider payload, kept for evidence but excluded from hashing.
    pub raw_payload: Option<String>,
}

/// Narrow contract the resolution engine consumes. Implementations must
/// never panic or error for business reasons; a failed or timed-out fetch
/// is `None`.
#[async_trait]
pub trait DataSources: Send + Sync {
    async fn price(&self, asset: &str) -> Option<Reading>;
    async fn tvl(&self, protocol: Option<&str>, chain: Option<&str>) -> Option<Reading>;
    async fn profile_count(&self) -> Option<Reading>;
}

/// Production adapter set backed by live provider APIs.
pub struct LiveSources {
    price: SpotPriceClient,
    tvl: TvlClient,
    identity: IdentityStatsClient,
}

impl LiveSources {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            price: SpotPriceClient::new(&config.price_api_base, config.http_timeout_secs)?,
            tvl: TvlClient::new(&config.tvl_api_base, config.http_timeout_secs)?,
            identity: IdentityStatsClient::new(
                &config.identity_stats_url,
                config.http_timeout_secs,
            )?,
        })
    }
}

#[async_trait]
impl DataSources for LiveSources {
    async fn price(&self, asset: &str) -> Option<Reading> {
        match self.price.fetch_price(asset).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(asset = %asset, error = %e, "price fetch failed");
                None
            }
        }
    }

    async fn tvl(&self, protocol: Option<&str>, chain: Option<&str>) -> Option<Reading> {
        let result = match (protocol, chain) {
            (Some(p), _) => self.tvl.fetch_protocol_tvl(p).await,
            (None, Some(c)) => self.tvl.fetch_chain_tvl(c).await,
            (None, None) => return None,
        };
        match result {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(protocol = ?protocol, chain = ?chain, error = %e, "TVL fetch failed");
                None
            }
        }
    }

    async fn profile_count(&self) -> Option<Reading> {
        match self.identity.fetch_profile_count().await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(error = %e, "profile count fetch failed");
                None
            }
        }
    }
}
