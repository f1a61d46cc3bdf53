//! Per-oracle-type resolution
//!
//! Converts an oracle config plus live readings into a YES/NO/INVALID
//! decision and an evidence snapshot. Never errors for business reasons:
//! bad config and missing data both come back as INVALID with the failure
//! captured in the evidence record.

use chrono::Utc;
use tracing::debug;

use crate::models::{OracleConfig, Outcome, PriceComparison};
use crate::oracle::evidence::{EvidenceSnapshot, SourceReading};
use crate::sources::{DataSources, Reading};

/// Outcome plus the evidence backing it.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub outcome: Outcome,
    pub evidence: EvidenceSnapshot,
    pub evidence_hash: String,
}

/// Resolve a market's oracle config against live data sources.
pub async fn resolve_market(
    config: &OracleConfig,
    sources: &dyn DataSources,
) -> ResolutionResult {
    if let Err(reason) = config.validate() {
        return invalid_result(config, Vec::new(), &reason);
    }

    match config {
        OracleConfig::PriceClose {
            asset,
            target_price,
            comparison,
        } => {
            let readings = collect(sources.price(asset).await);
            let Some(value) = consensus_value(&readings) else {
                return invalid_result(
                    config,
                    failed_sources(&readings, "price_feed", "no price reading available"),
                    "no price reading available",
                );
            };
            let outcome = match comparison {
                PriceComparison::Above if value >= *target_price => Outcome::Yes,
                PriceComparison::Below if value <= *target_price => Outcome::Yes,
                _ => Outcome::No,
            };
            decided_result(config, &readings, value, outcome)
        }
        OracleConfig::MetricThreshold {
            protocol,
            chain,
            target_value,
        } => {
            let readings =
                collect(sources.tvl(protocol.as_deref(), chain.as_deref()).await);
            let Some(value) = consensus_value(&readings) else {
                return invalid_result(
                    config,
                    failed_sources(&readings, "tvl_feed", "no TVL reading available"),
                    "no TVL reading available",
                );
            };
            let outcome = if value >= *target_value {
                Outcome::Yes
            } else {
                Outcome::No
            };
            decided_result(config, &readings, value, outcome)
        }
        OracleConfig::CountThreshold { target_count } => {
            let readings = collect(sources.profile_count().await);
            let Some(value) = consensus_value(&readings) else {
                return invalid_result(
                    config,
                    failed_sources(&readings, "identity_feed", "no profile count available"),
                    "no profile count available",
                );
            };
            let outcome = if value >= *target_count as f64 {
                Outcome::Yes
            } else {
                Outcome::No
            };
            decided_result(config, &readings, value, outcome)
        }
    }
}

fn collect(reading: Option<Reading>) -> Vec<Reading> {
    reading.into_iter().collect()
}

/// Median of the available readings. Single-source today, but sorting and
/// taking the median index keeps the extraction consensus-ready for
/// additional sources.
fn consensus_value(readings: &[Reading]) -> Option<f64> {
    if readings.is_empty() {
        return None;
    }
    let mut values: Vec<f64> = readings
        .iter()
        .map(|r| r.value)
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}

fn failed_sources(readings: &[Reading], fallback_source: &str, error: &str) -> Vec<SourceReading> {
    if readings.is_empty() {
        vec![SourceReading::failed(fallback_source, error)]
    } else {
        readings.iter().map(SourceReading::from_reading).collect()
    }
}

fn decided_result(
    config: &OracleConfig,
    readings: &[Reading],
    value: f64,
    outcome: Outcome,
) -> ResolutionResult {
    let extracted = format_value(value);
    debug!(
        oracle_type = config.oracle_type(),
        extracted = %extracted,
        outcome = outcome.as_str(),
        "oracle resolved"
    );

    let evidence = EvidenceSnapshot {
        timestamp: Utc::now(),
        oracle_type: config.oracle_type().to_string(),
        sources: readings.iter().map(SourceReading::from_reading).collect(),
        extracted_value: extracted,
        decision: outcome,
        config: serde_json::to_string(config).unwrap_or_default(),
    };
    let evidence_hash = evidence.content_hash();

    ResolutionResult {
        outcome,
        evidence,
        evidence_hash,
    }
}

fn invalid_result(
    config: &OracleConfig,
    sources: Vec<SourceReading>,
    reason: &str,
) -> ResolutionResult {
    let evidence = EvidenceSnapshot {
        timestamp: Utc::now(),
        oracle_type: config.oracle_type().to_string(),
        sources,
        extracted_value: reason.to_string(),
        decision: Outcome::Invalid,
        config: serde_json::to_string(config).unwrap_or_default(),
    };
    let evidence_hash = evidence.content_hash();

    ResolutionResult {
        outcome: Outcome::Invalid,
        evidence,
        evidence_hash,
    }
}

/// Stringify the extracted reading without trailing noise for whole numbers.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct MockSources {
        price: Option<f64>,
        tvl: Option<f64>,
        count: Option<f64>,
    }

    impl MockSources {
        fn empty() -> Self {
            Self {
                price: None,
                tvl: None,
                count: None,
            }
        }
    }

    #[async_trait]
    impl DataSources for MockSources {
        async fn price(&self, _asset: &str) -> Option<Reading> {
            self.price.map(|value| Reading {
                source: "mock_price".to_string(),
                value,
                timestamp: Utc::now(),
                raw_payload: None,
            })
        }

        async fn tvl(&self, _protocol: Option<&str>, _chain: Option<&str>) -> Option<Reading> {
            self.tvl.map(|value| Reading {
                source: "mock_tvl".to_string(),
                value,
                timestamp: Utc::now(),
                raw_payload: None,
            })
        }

        async fn profile_count(&self) -> Option<Reading> {
            self.count.map(|value| Reading {
                source: "mock_identity".to_string(),
                value,
                timestamp: Utc::now(),
                raw_payload: None,
            })
        }
    }

    fn btc_above_50k() -> OracleConfig {
        OracleConfig::PriceClose {
            asset: "BTC".to_string(),
            target_price: 50000.0,
            comparison: PriceComparison::Above,
        }
    }

    #[tokio::test]
    async fn price_market_resolves_yes_above_target() {
        let sources = MockSources {
            price: Some(52000.0),
            ..MockSources::empty()
        };
        let result = resolve_market(&btc_above_50k(), &sources).await;
        assert_eq!(result.outcome, Outcome::Yes);
        assert_eq!(result.evidence.extracted_value, "52000");
        assert_eq!(result.evidence_hash, result.evidence.content_hash());
    }

    #[tokio::test]
    async fn price_market_resolves_no_below_target() {
        let sources = MockSources {
            price: Some(48000.0),
            ..MockSources::empty()
        };
        let result = resolve_market(&btc_above_50k(), &sources).await;
        assert_eq!(result.outcome, Outcome::No);
    }

    #[tokio::test]
    async fn below_comparison_inverts_the_rule() {
        let config = OracleConfig::PriceClose {
            asset: "ETH".to_string(),
            target_price: 3000.0,
            comparison: PriceComparison::Below,
        };
        let sources = MockSources {
            price: Some(2500.0),
            ..MockSources::empty()
        };
        assert_eq!(resolve_market(&config, &sources).await.outcome, Outcome::Yes);

        let sources = MockSources {
            price: Some(3500.0),
            ..MockSources::empty()
        };
        assert_eq!(resolve_market(&config, &sources).await.outcome, Outcome::No);
    }

    #[tokio::test]
    async fn reading_equal_to_target_counts_as_yes() {
        let sources = MockSources {
            price: Some(50000.0),
            ..MockSources::empty()
        };
        assert_eq!(
            resolve_market(&btc_above_50k(), &sources).await.outcome,
            Outcome::Yes
        );
    }

    #[tokio::test]
    async fn tvl_market_resolves_no_below_threshold() {
        let config = OracleConfig::MetricThreshold {
            protocol: Some("aave".to_string()),
            chain: None,
            target_value: 20_000_000_000.0,
        };
        let sources = MockSources {
            tvl: Some(15_000_000_000.0),
            ..MockSources::empty()
        };
        let result = resolve_market(&config, &sources).await;
        assert_eq!(result.outcome, Outcome::No);
        assert_eq!(result.evidence.extracted_value, "15000000000");
    }

    #[tokio::test]
    async fn count_market_resolves_yes_at_threshold() {
        let config = OracleConfig::CountThreshold {
            target_count: 1_000_000,
        };
        let sources = MockSources {
            count: Some(1_000_000.0),
            ..MockSources::empty()
        };
        assert_eq!(resolve_market(&config, &sources).await.outcome, Outcome::Yes);
    }

    #[tokio::test]
    async fn missing_data_resolves_invalid_with_error_evidence() {
        let result = resolve_market(&btc_above_50k(), &MockSources::empty()).await;
        assert_eq!(result.outcome, Outcome::Invalid);
        assert_eq!(result.evidence.sources.len(), 1);
        assert!(result.evidence.sources[0].error.is_some());
        assert!(result.evidence.extracted_value.contains("no price reading"));
    }

    #[tokio::test]
    async fn incomplete_config_resolves_invalid_with_empty_sources() {
        let config = OracleConfig::MetricThreshold {
            protocol: None,
            chain: None,
            target_value: 1.0,
        };
        let sources = MockSources {
            tvl: Some(5.0),
            ..MockSources::empty()
        };
        let result = resolve_market(&config, &sources).await;
        assert_eq!(result.outcome, Outcome::Invalid);
        assert!(result.evidence.sources.is_empty());
        assert!(result.evidence.extracted_value.contains("protocol or chain"));
    }
}
