//! Payout and reputation-delta computation for resolved markets
//!
//! Pools come from the market's stored stake aggregates, not a rescan of the
//! prediction set. Winner payout returns the stake in full plus a share of
//! the losers' pool proportional to raw stake. Reputation rewards scale up
//! (never down) with the credibility snapshot; losses carry a flat penalty
//! independent of stake size.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Market, MarketStatus, Outcome, Position, Prediction};
use crate::store::{MarketDb, SettlementRecord};

/// Base reputation reward for a correct prediction.
const REP_WIN_BASE: f64 = 5.0;

/// Flat reputation penalty for an incorrect prediction.
const REP_LOSS_PENALTY: i64 = -3;

/// What one settlement pass did.
#[derive(Debug, Clone, Default)]
pub struct SettlementSummary {
    pub market_id: String,
    pub predictions_settled: usize,
    pub winners: usize,
    pub winners_pool: f64,
    pub losers_pool: f64,
    pub total_paid_out: f64,
}

/// Winner payout: stake back plus a raw-stake-proportional share of the
/// losing pool.
pub fn winner_payout(stake: f64, winners_pool: f64, losers_pool: f64) -> f64 {
    if winners_pool <= 0.0 {
        return 0.0;
    }
    stake + (stake / winners_pool) * losers_pool
}

/// Reputation reward for a winner, scaled by the credibility snapshot.
/// Always a non-negative integer; credibility below 1000 never scales down.
pub fn winner_rep_delta(credibility_at_prediction: f64) -> i64 {
    (REP_WIN_BASE * (credibility_at_prediction / 1000.0).max(1.0)).round() as i64
}

/// Settle a RESOLVED, non-INVALID market.
///
/// Idempotent at prediction granularity: each prediction flips settled via a
/// conditional update, so a retry after partial failure only touches the
/// rows the failed attempt never reached. The settlement record itself is
/// keyed unique per market and cannot duplicate on retry.
pub async fn settle_market(
    db: &MarketDb,
    market: &Market,
    outcome: Outcome,
    predictions: &[Prediction],
) -> Result<SettlementSummary> {
    let winning_position = match outcome {
        Outcome::Yes => Position::Yes,
        Outcome::No => Position::No,
        Outcome::Invalid => {
            return Err(anyhow::anyhow!(
                "invalid outcome routed to settle_market for market {}",
                market.id
            ))
        }
    };

    let winners_pool = market.stake_for(winning_position);
    let losers_pool = market.total_stake() - winners_pool;

    let mut summary = SettlementSummary {
        market_id: market.id.clone(),
        winners_pool,
        losers_pool,
        ..Default::default()
    };

    let now = Utc::now();
    for prediction in predictions {
        let is_winner = outcome.matches(prediction.position);
        let (payout, rep_delta) = if is_winner && winners_pool > 0.0 {
            (
                winner_payout(prediction.stake, winners_pool, losers_pool),
                winner_rep_delta(prediction.credibility_at_prediction),
            )
        } else {
            (0.0, REP_LOSS_PENALTY)
        };

        let settled = db
            .settle_prediction(&prediction.id, payout, rep_delta, now)
            .await
            .with_context(|| format!("settle prediction {}", prediction.id))?;
        if !settled {
            // Already handled by an earlier, partially-failed attempt
            debug!(prediction_id = %prediction.id, "prediction already settled, skipping");
            continue;
        }

        db.apply_settlement(
            &prediction.user_id,
            prediction.stake,
            payout,
            rep_delta,
            is_winner,
        )
        .await
        .with_context(|| format!("update user {} for settlement", prediction.user_id))?;

        summary.predictions_settled += 1;
        summary.total_paid_out += payout;
        if is_winner {
            summary.winners += 1;
        }
    }

    let record = SettlementRecord {
        id: Uuid::new_v4().to_string(),
        market_id: market.id.clone(),
        outcome,
        total_pool: winners_pool + losers_pool,
        winners_pool,
        losers_pool,
        total_predictions: predictions.len() as i64,
        winning_predictions: summary.winners as i64,
        evidence_id: market.evidence_id.clone(),
        created_at: now,
    };
    let inserted = db.insert_settlement(&record).await?;
    if !inserted {
        debug!(market_id = %market.id, "settlement record already exists (retry)");
    }

    db.mark_finalized(&market.id, MarketStatus::Settled, now)
        .await
        .context("finalize settled market")?;

    info!(
        market_id = %market.id,
        outcome = outcome.as_str(),
        settled = summary.predictions_settled,
        winners = summary.winners,
        paid_out = summary.total_paid_out,
        "market settled"
    );

    Ok(summary)
}

/// INVALID (or missing) outcome: refund every unsettled prediction its full
/// stake with zero reputation delta and cancel the market.
pub async fn cancel_with_refunds(
    db: &MarketDb,
    market: &Market,
    predictions: &[Prediction],
) -> Result<SettlementSummary> {
    let mut summary = SettlementSummary {
        market_id: market.id.clone(),
        ..Default::default()
    };

    let now = Utc::now();
    for prediction in predictions {
        let settled = db
            .settle_prediction(&prediction.id, prediction.stake, 0, now)
            .await
            .with_context(|| format!("refund prediction {}", prediction.id))?;
        if !settled {
            continue;
        }
        db.apply_refund(&prediction.user_id, prediction.stake)
            .await
            .with_context(|| format!("unlock refund for user {}", prediction.user_id))?;
        summary.predictions_settled += 1;
        summary.total_paid_out += prediction.stake;
    }

    db.mark_finalized(&market.id, MarketStatus::Cancelled, now)
        .await
        .context("cancel unresolvable market")?;

    info!(
        market_id = %market.id,
        refunded = summary.predictions_settled,
        "market cancelled with full refunds"
    );

    Ok(summary)
}
