use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market lifecycle states. Transitions are monotonic: a market never
/// regresses to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Locked,
    Resolved,
    Settled,
    Cancelled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Locked => "locked",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Settled => "settled",
            MarketStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(MarketStatus::Open),
            "locked" => Some(MarketStatus::Locked),
            "resolved" => Some(MarketStatus::Resolved),
            "settled" => Some(MarketStatus::Settled),
            "cancelled" => Some(MarketStatus::Cancelled),
            _ => None,
        }
    }
}

/// Side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Yes,
    No,
}

impl Position {
    pub fn as_str(&self) -> &str {
        match self {
            Position::Yes => "yes",
            Position::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Position::Yes),
            "no" => Some(Position::No),
            _ => None,
        }
    }
}

/// Ternary resolution decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Yes,
    No,
    Invalid,
}

impl Outcome {
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
            Outcome::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Outcome::Yes),
            "no" => Some(Outcome::No),
            "invalid" => Some(Outcome::Invalid),
            _ => None,
        }
    }

    /// Whether a position is on the winning side of this outcome.
    pub fn matches(&self, position: Position) -> bool {
        matches!(
            (self, position),
            (Outcome::Yes, Position::Yes) | (Outcome::No, Position::No)
        )
    }
}

/// Comparison direction for price oracles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceComparison {
    Above,
    Below,
}

/// Oracle configuration, one concrete payload shape per oracle type.
///
/// Stored as JSON on the market row; a config that does not match its
/// declared type fails deserialization and resolves INVALID rather than
/// being accepted with missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "oracle_type", rename_all = "snake_case")]
pub enum OracleConfig {
    /// Resolves against a spot price reading for `asset`.
    PriceClose {
        asset: String,
        target_price: f64,
        comparison: PriceComparison,
    },
    /// Resolves against protocol or chain TVL. Threshold is always
    /// "at least" — there is no below mode for this oracle type.
    MetricThreshold {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        chain: Option<String>,
        target_value: f64,
    },
    /// Resolves against the identity network's global profile count.
    CountThreshold { target_count: u64 },
}

impl OracleConfig {
    pub fn oracle_type(&self) -> &'static str {
        match self {
            OracleConfig::PriceClose { .. } => "price_close",
            OracleConfig::MetricThreshold { .. } => "metric_threshold",
            OracleConfig::CountThreshold { .. } => "count_threshold",
        }
    }

    /// Validate completeness beyond what the type system enforces.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            OracleConfig::PriceClose {
                asset,
                target_price,
                ..
            } => {
                if asset.trim().is_empty() {
                    return Err("price_close config missing asset".to_string());
                }
                if !target_price.is_finite() || *target_price <= 0.0 {
                    return Err("price_close config has invalid target_price".to_string());
                }
                Ok(())
            }
            OracleConfig::MetricThreshold {
                protocol,
                chain,
                target_value,
            } => {
                let has_protocol = protocol.as_deref().map_or(false, |p| !p.trim().is_empty());
                let has_chain = chain.as_deref().map_or(false, |c| !c.trim().is_empty());
                if !has_protocol && !has_chain {
                    return Err("metric_threshold config needs a protocol or chain".to_string());
                }
                if !target_value.is_finite() || *target_value <= 0.0 {
                    return Err("metric_threshold config has invalid target_value".to_string());
                }
                Ok(())
            }
            OracleConfig::CountThreshold { target_count } => {
                if *target_count == 0 {
                    return Err("count_threshold config has zero target_count".to_string());
                }
                Ok(())
            }
        }
    }
}

/// A binary prediction market backed by RepScore stakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub oracle_config: OracleConfig,
    pub locks_at: DateTime<Utc>,
    pub resolves_at: Option<DateTime<Utc>>,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub resolution_value: Option<String>,
    pub evidence_id: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub stake_yes: f64,
    pub stake_no: f64,
    pub weighted_yes: f64,
    pub weighted_no: f64,
    pub virtual_yes: f64,
    pub virtual_no: f64,
    pub raw_prob_yes: f64,
    pub weighted_prob_yes: f64,
    pub created_at: DateTime<Utc>,
}

impl Market {
    /// Raw stake aggregate for one side.
    pub fn stake_for(&self, position: Position) -> f64 {
        match position {
            Position::Yes => self.stake_yes,
            Position::No => self.stake_no,
        }
    }

    pub fn total_stake(&self) -> f64 {
        self.stake_yes + self.stake_no
    }
}

/// A user's stake on one side of a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub market_id: String,
    pub user_id: String,
    pub position: Position,
    pub stake: f64,
    /// Credibility score snapshotted at creation; never recomputed.
    pub credibility_at_prediction: f64,
    /// stake * (1 + credibility / 1000), frozen at creation.
    pub weighted_stake: f64,
    pub is_settled: bool,
    pub payout: Option<f64>,
    pub rep_delta: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Reputation account. `rep_score` is the total currency; `locked_rep_score`
/// is the portion staked in open predictions (available = total - locked).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub rep_score: f64,
    pub locked_rep_score: f64,
    pub credibility: f64,
    pub total_predictions: i64,
    pub correct_predictions: i64,
    pub total_staked: f64,
    pub total_won: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn available_rep(&self) -> f64 {
        (self.rep_score - self.locked_rep_score).max(0.0)
    }

    /// Maximum stake per market, derived from credibility tier.
    pub fn max_stake_per_market(&self) -> f64 {
        tier_stake_cap(self.credibility)
    }
}

/// Tier stake caps by credibility score.
pub fn tier_stake_cap(credibility: f64) -> f64 {
    if credibility < 200.0 {
        100.0
    } else if credibility < 500.0 {
        250.0
    } else if credibility < 750.0 {
        500.0
    } else {
        1000.0
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub engine_interval_secs: u64,
    pub price_api_base: String,
    pub tvl_api_base: String,
    pub identity_stats_url: String,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./repmarket.db".to_string());

        let engine_interval_secs = std::env::var("ENGINE_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let price_api_base = std::env::var("PRICE_API_BASE")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let tvl_api_base =
            std::env::var("TVL_API_BASE").unwrap_or_else(|_| "https://api.llama.fi".to_string());

        let identity_stats_url = std::env::var("IDENTITY_STATS_URL")
            .unwrap_or_else(|_| "https://api.lens.dev/stats/profiles".to_string());

        let http_timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(Self {
            database_path,
            engine_interval_secs,
            price_api_base,
            tvl_api_base,
            identity_stats_url,
            http_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_config_round_trips_as_tagged_json() {
        let config = OracleConfig::PriceClose {
            asset: "BTC".to_string(),
            target_price: 50000.0,
            comparison: PriceComparison::Above,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"oracle_type\":\"price_close\""));
        let back: OracleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn mismatched_config_shape_fails_to_parse() {
        // price_close payload without a target price must not deserialize
        let json = r#"{"oracle_type":"price_close","asset":"BTC"}"#;
        assert!(serde_json::from_str::<OracleConfig>(json).is_err());
    }

    #[test]
    fn metric_threshold_needs_protocol_or_chain() {
        let config = OracleConfig::MetricThreshold {
            protocol: None,
            chain: None,
            target_value: 1_000_000.0,
        };
        assert!(config.validate().is_err());

        let config = OracleConfig::MetricThreshold {
            protocol: Some("aave".to_string()),
            chain: None,
            target_value: 1_000_000.0,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tier_caps_step_with_credibility() {
        assert_eq!(tier_stake_cap(0.0), 100.0);
        assert_eq!(tier_stake_cap(350.0), 250.0);
        assert_eq!(tier_stake_cap(600.0), 500.0);
        assert_eq!(tier_stake_cap(900.0), 1000.0);
    }
}
