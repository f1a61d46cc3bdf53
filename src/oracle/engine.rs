//! Market Lifecycle Orchestrator
//!
//! Batch driver invoked on a fixed interval by an external scheduler (or the
//! binary's own interval loop). One run walks three sequential phases: lock
//! eligible OPEN markets, resolve eligible LOCKED markets, settle RESOLVED
//! markets. Per-market failures are recorded and skipped, never aborting the
//! batch; every transition is an atomic conditional update, so a re-run (or
//! an overlapping run) cannot double-process a market.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{Market, MarketStatus, Outcome};
use crate::oracle::resolver::{resolve_market, ResolutionResult};
use crate::settlement;
use crate::sources::DataSources;
use crate::store::{MarketDb, StatusCounts};

/// One failed market within a batch phase.
#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub market_id: String,
    pub phase: &'static str,
    pub message: String,
}

/// Result of one batch invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OracleEngineResult {
    pub processed: usize,
    pub locked: Vec<String>,
    pub resolved: Vec<String>,
    pub settled: Vec<String>,
    pub errors: Vec<EngineError>,
}

/// Monitoring snapshot, no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct OracleStatus {
    pub counts: StatusCounts,
}

pub struct OracleEngine<S: DataSources> {
    db: MarketDb,
    sources: S,
}

impl<S: DataSources> OracleEngine<S> {
    pub fn new(db: MarketDb, sources: S) -> Self {
        Self { db, sources }
    }

    pub fn db(&self) -> &MarketDb {
        &self.db
    }

    /// Run one lock -> resolve -> settle batch.
    pub async fn run(&self) -> Result<OracleEngineResult> {
        let mut result = OracleEngineResult::default();
        let now = Utc::now();

        // Phase 1: lock
        let lockable = self
            .db
            .lockable_market_ids(now)
            .await
            .context("select lockable markets")?;
        for market_id in lockable {
            result.processed += 1;
            match self
                .db
                .try_transition(&market_id, MarketStatus::Open, MarketStatus::Locked)
                .await
            {
                Ok(true) => {
                    info!(market_id = %market_id, "market locked");
                    result.locked.push(market_id);
                }
                Ok(false) => {} // another invocation got there first
                Err(e) => {
                    warn!(market_id = %market_id, error = %e, "lock failed");
                    result.errors.push(EngineError {
                        market_id,
                        phase: "lock",
                        message: e.to_string(),
                    });
                }
            }
        }

        // Phase 2: resolve
        let resolvable = self
            .db
            .resolvable_market_ids(now)
            .await
            .context("select resolvable markets")?;
        for market_id in resolvable {
            result.processed += 1;
            match self.resolve_one(&market_id).await {
                Ok(true) => result.resolved.push(market_id),
                Ok(false) => {}
                Err(e) => {
                    // Market stays LOCKED; the next run retries against live data
                    warn!(market_id = %market_id, error = %e, "resolution failed");
                    result.errors.push(EngineError {
                        market_id,
                        phase: "resolve",
                        message: e.to_string(),
                    });
                }
            }
        }

        // Phase 3: settle
        let settleable = self
            .db
            .resolved_market_ids()
            .await
            .context("select resolved markets")?;
        for market_id in settleable {
            result.processed += 1;
            match self.settle_one(&market_id).await {
                Ok(()) => result.settled.push(market_id),
                Err(e) => {
                    // Market stays RESOLVED; retry re-selects only unsettled predictions
                    warn!(market_id = %market_id, error = %e, "settlement failed");
                    result.errors.push(EngineError {
                        market_id,
                        phase: "settle",
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed = result.processed,
            locked = result.locked.len(),
            resolved = result.resolved.len(),
            settled = result.settled.len(),
            errors = result.errors.len(),
            "oracle engine run complete"
        );

        Ok(result)
    }

    /// Resolve one LOCKED market: query sources, persist evidence, then flip
    /// the market. Returns false if the market was no longer LOCKED.
    async fn resolve_one(&self, market_id: &str) -> Result<bool> {
        let market = self.require_market(market_id).await?;
        if market.status != MarketStatus::Locked {
            return Ok(false);
        }

        let resolution = resolve_market(&market.oracle_config, &self.sources).await;
        let evidence_id = self
            .db
            .insert_evidence(
                Some(market_id),
                &resolution.evidence,
                &resolution.evidence_hash,
            )
            .await
            .context("persist evidence snapshot")?;

        let transitioned = self
            .db
            .mark_resolved(
                market_id,
                resolution.outcome,
                &resolution.evidence.extracted_value,
                &evidence_id,
            )
            .await
            .context("transition market to resolved")?;

        if transitioned {
            info!(
                market_id = %market_id,
                outcome = resolution.outcome.as_str(),
                value = %resolution.evidence.extracted_value,
                evidence_hash = %resolution.evidence_hash,
                "market resolved"
            );
        }
        Ok(transitioned)
    }

    /// Settle one RESOLVED market, routing INVALID outcomes to cancellation.
    async fn settle_one(&self, market_id: &str) -> Result<()> {
        let market = self.require_market(market_id).await?;
        if market.status != MarketStatus::Resolved {
            return Ok(());
        }

        let predictions = self
            .db
            .unsettled_predictions(market_id)
            .await
            .context("load unsettled predictions")?;

        match market.outcome {
            Some(Outcome::Invalid) | None => {
                settlement::cancel_with_refunds(&self.db, &market, &predictions).await?;
            }
            Some(outcome) => {
                if predictions.is_empty() {
                    // Nothing to pay out; no settlement record needed
                    self.db
                        .mark_finalized(market_id, MarketStatus::Settled, Utc::now())
                        .await
                        .context("finalize empty market")?;
                    info!(market_id = %market_id, "market settled with no predictions");
                } else {
                    settlement::settle_market(&self.db, &market, outcome, &predictions).await?;
                }
            }
        }
        Ok(())
    }

    /// Read-only monitoring snapshot.
    pub async fn status(&self) -> Result<OracleStatus> {
        let counts = self.db.status_counts(Utc::now()).await?;
        Ok(OracleStatus { counts })
    }

    /// Administrative dry run: resolve against live sources without
    /// persisting anything.
    pub async fn preview_resolution(&self, market_id: &str) -> Result<ResolutionResult> {
        let market = self.require_market(market_id).await?;
        Ok(resolve_market(&market.oracle_config, &self.sources).await)
    }

    /// Administrative escape hatch: resolve a LOCKED market immediately,
    /// bypassing the time-based trigger. Same persistence as the batch.
    pub async fn resolve_manually(&self, market_id: &str) -> Result<ResolutionResult> {
        let market = self.require_market(market_id).await?;
        if market.status != MarketStatus::Locked {
            return Err(anyhow::anyhow!(
                "market {} is {}, only locked markets can be resolved",
                market_id,
                market.status.as_str()
            ));
        }
        let resolution = resolve_market(&market.oracle_config, &self.sources).await;
        let evidence_id = self
            .db
            .insert_evidence(
                Some(market_id),
                &resolution.evidence,
                &resolution.evidence_hash,
            )
            .await?;
        self.db
            .mark_resolved(
                market_id,
                resolution.outcome,
                &resolution.evidence.extracted_value,
                &evidence_id,
            )
            .await?;
        Ok(resolution)
    }

    async fn require_market(&self, market_id: &str) -> Result<Market> {
        self.db
            .get_market(market_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("market not found: {}", market_id))
    }
}
