//! Trading Surface
//!
//! Synchronous user-triggered operations: place a prediction on an open
//! market, preview an exit, and sell a position before lock. Each operation
//! runs its whole validate-then-write sequence under the store's connection
//! lock, so two concurrent placements cannot both pass the cap check against
//! the same stale snapshot.
//!
//! Business-rule rejections surface as [`RejectReason`] (downcastable from
//! the `anyhow` error) so callers can render a specific message; they are
//! never retried.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::amm::pricing::{
    apply_stake_delta, calculate_sell_value, ProbabilityUpdate, SellValuation, SELL_FEE_RATE,
};
use crate::models::{MarketStatus, Position, Prediction};
use crate::store::MarketDb;

/// Machine-checkable rejection reasons for the trading surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MarketNotFound,
    UserNotFound,
    PredictionNotFound,
    MarketNotOpen,
    MarketLockedByTime,
    StakeNotPositive,
    StakeOverTierCap,
    MarketStakeCapExceeded,
    InsufficientRep,
    NotPredictionOwner,
    AlreadySettled,
}

impl RejectReason {
    pub fn as_str(&self) -> &str {
        match self {
            RejectReason::MarketNotFound => "market_not_found",
            RejectReason::UserNotFound => "user_not_found",
            RejectReason::PredictionNotFound => "prediction_not_found",
            RejectReason::MarketNotOpen => "market_not_open",
            RejectReason::MarketLockedByTime => "market_locked_by_time",
            RejectReason::StakeNotPositive => "stake_not_positive",
            RejectReason::StakeOverTierCap => "stake_over_tier_cap",
            RejectReason::MarketStakeCapExceeded => "market_stake_cap_exceeded",
            RejectReason::InsufficientRep => "insufficient_rep",
            RejectReason::NotPredictionOwner => "not_prediction_owner",
            RejectReason::AlreadySettled => "already_settled",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for RejectReason {}

/// Extract the rejection reason from a trading error, if it was one.
pub fn reject_reason(err: &anyhow::Error) -> Option<RejectReason> {
    err.downcast_ref::<RejectReason>().copied()
}

/// A placed prediction plus the market's refreshed probabilities.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementResult {
    pub prediction: Prediction,
    pub probabilities: ProbabilityUpdate,
}

/// A completed sale: the valuation that was paid out plus the refreshed
/// probabilities.
#[derive(Debug, Clone, Serialize)]
pub struct SellResult {
    pub prediction_id: String,
    pub valuation: SellValuation,
    pub probabilities: ProbabilityUpdate,
}

/// Stake on one side of an open market.
///
/// Snapshots the user's credibility into the prediction, locks the stake,
/// applies the aggregate delta, and recomputes both probability lanes.
pub async fn place_prediction(
    db: &MarketDb,
    market_id: &str,
    user_id: &str,
    position: Position,
    stake: f64,
) -> Result<PlacementResult> {
    let market_id = market_id.to_string();
    let user_id = user_id.to_string();

    let result = db
        .with_conn(move |conn| {
            let market = MarketDb::get_market_with(conn, &market_id)?
                .ok_or(RejectReason::MarketNotFound)?;
            let user =
                MarketDb::get_user_with(conn, &user_id)?.ok_or(RejectReason::UserNotFound)?;

            let now = Utc::now();
            if market.status != MarketStatus::Open {
                return Err(RejectReason::MarketNotOpen.into());
            }
            if now >= market.locks_at {
                return Err(RejectReason::MarketLockedByTime.into());
            }
            if !(stake > 0.0) || !stake.is_finite() {
                return Err(RejectReason::StakeNotPositive.into());
            }

            let cap = user.max_stake_per_market();
            if stake > cap {
                return Err(RejectReason::StakeOverTierCap.into());
            }
            let existing = MarketDb::user_market_stake_with(conn, &market_id, &user_id)?;
            if existing + stake > cap {
                return Err(RejectReason::MarketStakeCapExceeded.into());
            }
            if user.available_rep() < stake {
                return Err(RejectReason::InsufficientRep.into());
            }

            let weighted_stake = stake * (1.0 + user.credibility / 1000.0);
            let prediction = Prediction {
                id: Uuid::new_v4().to_string(),
                market_id: market_id.clone(),
                user_id: user_id.clone(),
                position,
                stake,
                credibility_at_prediction: user.credibility,
                weighted_stake,
                is_settled: false,
                payout: None,
                rep_delta: None,
                created_at: now,
                settled_at: None,
            };

            MarketDb::insert_prediction_with(conn, &prediction)
                .context("persist prediction")?;
            MarketDb::apply_stake_lock_with(conn, &user_id, stake)
                .context("lock user stake")?;

            let update = apply_stake_delta(
                market.stake_yes,
                market.stake_no,
                market.weighted_yes,
                market.weighted_no,
                market.virtual_yes,
                market.virtual_no,
                position,
                stake,
                weighted_stake,
            );
            MarketDb::update_market_aggregates_with(conn, &market_id, &update)
                .context("update market aggregates")?;

            Ok(PlacementResult {
                prediction,
                probabilities: ProbabilityUpdate {
                    raw_prob_yes: update.raw_prob_yes,
                    weighted_prob_yes: update.weighted_prob_yes,
                },
            })
        })
        .await?;

    info!(
        market_id = %result.prediction.market_id,
        user_id = %result.prediction.user_id,
        position = result.prediction.position.as_str(),
        stake = result.prediction.stake,
        raw_prob_yes = result.probabilities.raw_prob_yes,
        "prediction placed"
    );

    Ok(result)
}

/// Read-only exit valuation for an unsettled prediction on an open market.
pub async fn preview_sell(db: &MarketDb, prediction_id: &str) -> Result<SellValuation> {
    let prediction_id = prediction_id.to_string();
    db.with_conn(move |conn| {
        let prediction = MarketDb::get_prediction_with(conn, &prediction_id)?
            .ok_or(RejectReason::PredictionNotFound)?;
        if prediction.is_settled {
            return Err(RejectReason::AlreadySettled.into());
        }
        let market = MarketDb::get_market_with(conn, &prediction.market_id)?
            .ok_or(RejectReason::MarketNotFound)?;
        check_sellable(&market)?;

        Ok(value_position(&market, &prediction))
    })
    .await
}

/// Sell an open position: the preview valuation applied with persistence.
pub async fn sell_prediction(
    db: &MarketDb,
    prediction_id: &str,
    user_id: &str,
) -> Result<SellResult> {
    let prediction_id = prediction_id.to_string();
    let user_id = user_id.to_string();

    let result = db
        .with_conn(move |conn| {
            let prediction = MarketDb::get_prediction_with(conn, &prediction_id)?
                .ok_or(RejectReason::PredictionNotFound)?;
            if prediction.user_id != user_id {
                return Err(RejectReason::NotPredictionOwner.into());
            }
            if prediction.is_settled {
                return Err(RejectReason::AlreadySettled.into());
            }
            let market = MarketDb::get_market_with(conn, &prediction.market_id)?
                .ok_or(RejectReason::MarketNotFound)?;
            check_sellable(&market)?;

            let valuation = value_position(&market, &prediction);
            let now = Utc::now();

            let settled = MarketDb::settle_prediction_with(
                conn,
                &prediction.id,
                valuation.net_value,
                0,
                now,
            )
            .context("mark prediction sold")?;
            if !settled {
                return Err(RejectReason::AlreadySettled.into());
            }

            MarketDb::apply_sell_with(conn, &user_id, prediction.stake, valuation.net_value)
                .context("apply sell to user")?;

            let update = apply_stake_delta(
                market.stake_yes,
                market.stake_no,
                market.weighted_yes,
                market.weighted_no,
                market.virtual_yes,
                market.virtual_no,
                prediction.position,
                -prediction.stake,
                -prediction.weighted_stake,
            );
            MarketDb::update_market_aggregates_with(conn, &prediction.market_id, &update)
                .context("update market aggregates after sell")?;

            Ok(SellResult {
                prediction_id: prediction.id,
                valuation,
                probabilities: ProbabilityUpdate {
                    raw_prob_yes: update.raw_prob_yes,
                    weighted_prob_yes: update.weighted_prob_yes,
                },
            })
        })
        .await?;

    info!(
        prediction_id = %result.prediction_id,
        net_value = result.valuation.net_value,
        profit_loss = result.valuation.profit_loss,
        high_slippage = result.valuation.high_slippage,
        "prediction sold"
    );

    Ok(result)
}

fn check_sellable(market: &crate::models::Market) -> Result<()> {
    if market.status != MarketStatus::Open {
        return Err(RejectReason::MarketNotOpen.into());
    }
    if Utc::now() >= market.locks_at {
        return Err(RejectReason::MarketLockedByTime.into());
    }
    Ok(())
}

fn value_position(
    market: &crate::models::Market,
    prediction: &Prediction,
) -> SellValuation {
    calculate_sell_value(
        prediction.position,
        prediction.stake,
        market.raw_prob_yes,
        market.total_stake(),
        market.virtual_yes + market.virtual_no,
        SELL_FEE_RATE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::pricing::VIRTUAL_LIQUIDITY_DEFAULT;
    use crate::models::{OracleConfig, PriceComparison};
    use crate::store::NewMarket;
    use chrono::Duration;

    async fn test_db() -> (MarketDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trading_test.db");
        let db = MarketDb::new(path.to_str().unwrap()).unwrap();
        (db, dir)
    }

    fn open_market(virtual_liquidity: f64) -> NewMarket {
        NewMarket {
            title: "BTC above 50k".to_string(),
            description: "Resolves from spot price".to_string(),
            category: "crypto".to_string(),
            oracle_config: OracleConfig::PriceClose {
                asset: "BTC".to_string(),
                target_price: 50000.0,
                comparison: PriceComparison::Above,
            },
            locks_at: Utc::now() + Duration::hours(1),
            resolves_at: Some(Utc::now() + Duration::hours(2)),
            virtual_liquidity,
        }
    }

    #[tokio::test]
    async fn placement_updates_probability_and_locks_stake() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(open_market(100.0)).await.unwrap();
        // credibility 200 -> weighted stake 50 * 1.2 = 60
        let user = db.create_user(500.0, 200.0).await.unwrap();

        let placed = place_prediction(&db, &market.id, &user.id, Position::Yes, 50.0)
            .await
            .unwrap();

        assert!((placed.probabilities.raw_prob_yes - 0.6).abs() < 1e-12);
        assert!((placed.probabilities.weighted_prob_yes - 160.0 / 260.0).abs() < 1e-12);
        assert_eq!(placed.prediction.weighted_stake, 60.0);

        let user = db.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(user.locked_rep_score, 50.0);
        assert_eq!(user.total_predictions, 1);

        let market = db.get_market(&market.id).await.unwrap().unwrap();
        assert_eq!(market.stake_yes, 50.0);
        assert_eq!(market.stake_no, 0.0);
    }

    #[tokio::test]
    async fn placement_rejects_insufficient_available_rep() {
        let (db, _dir) = test_db().await;
        let market = db
            .create_market(open_market(VIRTUAL_LIQUIDITY_DEFAULT))
            .await
            .unwrap();
        let user = db.create_user(30.0, 0.0).await.unwrap();

        let err = place_prediction(&db, &market.id, &user.id, Position::No, 50.0)
            .await
            .unwrap_err();
        assert_eq!(reject_reason(&err), Some(RejectReason::InsufficientRep));
    }

    #[tokio::test]
    async fn placement_enforces_tier_and_cumulative_caps() {
        let (db, _dir) = test_db().await;
        let market = db
            .create_market(open_market(VIRTUAL_LIQUIDITY_DEFAULT))
            .await
            .unwrap();
        // credibility 0 -> tier cap 100 per market
        let user = db.create_user(10_000.0, 0.0).await.unwrap();

        let err = place_prediction(&db, &market.id, &user.id, Position::Yes, 150.0)
            .await
            .unwrap_err();
        assert_eq!(reject_reason(&err), Some(RejectReason::StakeOverTierCap));

        place_prediction(&db, &market.id, &user.id, Position::Yes, 80.0)
            .await
            .unwrap();
        let err = place_prediction(&db, &market.id, &user.id, Position::Yes, 30.0)
            .await
            .unwrap_err();
        assert_eq!(
            reject_reason(&err),
            Some(RejectReason::MarketStakeCapExceeded)
        );
    }

    #[tokio::test]
    async fn placement_rejects_past_lock_time() {
        let (db, _dir) = test_db().await;
        let mut new = open_market(VIRTUAL_LIQUIDITY_DEFAULT);
        new.locks_at = Utc::now() - Duration::minutes(1);
        new.resolves_at = Some(Utc::now() + Duration::hours(1));
        let market = db.create_market(new).await.unwrap();
        let user = db.create_user(500.0, 0.0).await.unwrap();

        let err = place_prediction(&db, &market.id, &user.id, Position::Yes, 10.0)
            .await
            .unwrap_err();
        assert_eq!(reject_reason(&err), Some(RejectReason::MarketLockedByTime));
    }

    #[tokio::test]
    async fn sell_conserves_other_side_and_pays_net_value() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(open_market(1000.0)).await.unwrap();
        let alice = db.create_user(500.0, 0.0).await.unwrap();
        let bob = db.create_user(500.0, 0.0).await.unwrap();

        let placed = place_prediction(&db, &market.id, &alice.id, Position::Yes, 20.0)
            .await
            .unwrap();
        place_prediction(&db, &market.id, &bob.id, Position::No, 40.0)
            .await
            .unwrap();

        let before = db.get_market(&market.id).await.unwrap().unwrap();
        let preview = preview_sell(&db, &placed.prediction.id).await.unwrap();
        let sold = sell_prediction(&db, &placed.prediction.id, &alice.id)
            .await
            .unwrap();
        assert_eq!(preview, sold.valuation);
        assert!(sold.valuation.net_value >= 0.0);

        let after = db.get_market(&market.id).await.unwrap().unwrap();
        // Sold side down by exactly the stake, other side untouched
        assert!((before.stake_yes - after.stake_yes - 20.0).abs() < 1e-9);
        assert_eq!(before.stake_no, after.stake_no);

        let alice = db.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!(alice.locked_rep_score, 0.0);
        assert!((alice.rep_score - (500.0 - 20.0 + sold.valuation.net_value)).abs() < 1e-9);

        // A second sell of the same prediction is rejected
        let err = sell_prediction(&db, &placed.prediction.id, &alice.id)
            .await
            .unwrap_err();
        assert_eq!(reject_reason(&err), Some(RejectReason::AlreadySettled));
    }

    #[tokio::test]
    async fn sell_rejects_non_owner() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(open_market(1000.0)).await.unwrap();
        let alice = db.create_user(500.0, 0.0).await.unwrap();
        let mallory = db.create_user(500.0, 0.0).await.unwrap();

        let placed = place_prediction(&db, &market.id, &alice.id, Position::Yes, 20.0)
            .await
            .unwrap();
        let err = sell_prediction(&db, &placed.prediction.id, &mallory.id)
            .await
            .unwrap_err();
        assert_eq!(reject_reason(&err), Some(RejectReason::NotPredictionOwner));
    }
}
