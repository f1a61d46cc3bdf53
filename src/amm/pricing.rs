//! Probability recompute and position exit valuation
//!
//! Two lenses per market: raw stake-weighted and credibility-weighted.
//! Virtual (seed) liquidity is added to both lanes unweighted — it is the
//! house's neutral prior, not a credibility-bearing participant.

use serde::{Deserialize, Serialize};

use crate::models::Position;

/// Seed liquidity per side, applied uniformly at market creation.
pub const VIRTUAL_LIQUIDITY_DEFAULT: f64 = 1000.0;

/// Exit fee rate applied by the sell path (0.5%).
pub const SELL_FEE_RATE: f64 = 0.005;

/// Price impact is bounded at 5% of base value regardless of trade size.
pub const MAX_SLIPPAGE_RATIO: f64 = 0.05;

/// Floor on effective liquidity in the slippage denominator.
pub const MIN_LIQUIDITY_FLOOR: f64 = 100.0;

/// Callers should surface a warning above this effective slippage percent.
pub const HIGH_SLIPPAGE_WARN_PCT: f64 = 2.0;

/// Result of a full probability recompute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityUpdate {
    pub raw_prob_yes: f64,
    pub weighted_prob_yes: f64,
}

/// Updated market aggregates after a stake delta, probabilities included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    pub stake_yes: f64,
    pub stake_no: f64,
    pub weighted_yes: f64,
    pub weighted_no: f64,
    pub raw_prob_yes: f64,
    pub weighted_prob_yes: f64,
}

/// Valuation of exiting a position before lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SellValuation {
    pub base_value: f64,
    pub fee_amount: f64,
    pub price_impact: f64,
    pub net_value: f64,
    pub profit_loss: f64,
    pub profit_loss_percent: f64,
    pub effective_slippage_percent: f64,
    /// True when effective slippage exceeds [`HIGH_SLIPPAGE_WARN_PCT`].
    pub high_slippage: bool,
}

/// Recompute both probability lanes from current aggregates.
///
/// `eff = stake + virtual` per side; prob = effYes / (effYes + effNo),
/// defaulting to 0.5 on a zero denominator. Fully determined by the inputs —
/// probabilities are never stored independently of a recompute.
pub fn recompute_probabilities(
    stake_yes: f64,
    stake_no: f64,
    weighted_yes: f64,
    weighted_no: f64,
    virtual_yes: f64,
    virtual_no: f64,
) -> ProbabilityUpdate {
    ProbabilityUpdate {
        raw_prob_yes: side_probability(stake_yes, stake_no, virtual_yes, virtual_no),
        weighted_prob_yes: side_probability(weighted_yes, weighted_no, virtual_yes, virtual_no),
    }
}

fn side_probability(yes: f64, no: f64, virtual_yes: f64, virtual_no: f64) -> f64 {
    let effective_yes = yes + virtual_yes;
    let effective_no = no + virtual_no;
    let denom = effective_yes + effective_no;
    if denom <= 0.0 {
        return 0.5;
    }
    (effective_yes / denom).clamp(0.0, 1.0)
}

/// Apply a signed stake delta to one side's running totals and recompute.
///
/// The single aggregate-update strategy for every hot path: placement uses a
/// positive delta, sell and settlement use negative ones. Totals clamp at
/// zero; the opposite side is untouched.
pub fn apply_stake_delta(
    stake_yes: f64,
    stake_no: f64,
    weighted_yes: f64,
    weighted_no: f64,
    virtual_yes: f64,
    virtual_no: f64,
    position: Position,
    stake_delta: f64,
    weighted_delta: f64,
) -> AggregateUpdate {
    let (stake_yes, stake_no, weighted_yes, weighted_no) = match position {
        Position::Yes => (
            (stake_yes + stake_delta).max(0.0),
            stake_no,
            (weighted_yes + weighted_delta).max(0.0),
            weighted_no,
        ),
        Position::No => (
            stake_yes,
            (stake_no + stake_delta).max(0.0),
            weighted_yes,
            (weighted_no + weighted_delta).max(0.0),
        ),
    };

    let probs = recompute_probabilities(
        stake_yes,
        stake_no,
        weighted_yes,
        weighted_no,
        virtual_yes,
        virtual_no,
    );

    AggregateUpdate {
        stake_yes,
        stake_no,
        weighted_yes,
        weighted_no,
        raw_prob_yes: probs.raw_prob_yes,
        weighted_prob_yes: probs.weighted_prob_yes,
    }
}

/// Fair unwind value of a position before lock.
///
/// Base value scales the stake by the position's current probability, so a
/// position that moved in the holder's favor redeems above its stake and one
/// that moved against redeems below it, independent of liquidity. Price
/// impact and the exit fee then come off the base, and the net floors at 0.
pub fn calculate_sell_value(
    position: Position,
    stake: f64,
    current_prob_yes: f64,
    total_liquidity: f64,
    virtual_liquidity: f64,
    fee_rate: f64,
) -> SellValuation {
    let position_prob = match position {
        Position::Yes => current_prob_yes,
        Position::No => 1.0 - current_prob_yes,
    };

    let base_value = stake * position_prob;

    let effective_liquidity = total_liquidity.max(virtual_liquidity);
    let slippage_ratio =
        (stake / effective_liquidity.max(MIN_LIQUIDITY_FLOOR)).min(MAX_SLIPPAGE_RATIO);

    let price_impact = base_value * slippage_ratio;
    let fee_amount = base_value * fee_rate;
    let net_value = (base_value - fee_amount - price_impact).max(0.0);

    let profit_loss = net_value - stake;
    let profit_loss_percent = if stake > 0.0 {
        profit_loss / stake * 100.0
    } else {
        0.0
    };
    let effective_slippage_percent = if stake > 0.0 {
        (fee_amount + price_impact) / stake * 100.0
    } else {
        0.0
    };

    SellValuation {
        base_value,
        fee_amount,
        price_impact,
        net_value,
        profit_loss,
        profit_loss_percent,
        effective_slippage_percent,
        high_slippage: effective_slippage_percent > HIGH_SLIPPAGE_WARN_PCT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_aggregates_default_to_half() {
        let probs = recompute_probabilities(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(probs.raw_prob_yes, 0.5);
        assert_eq!(probs.weighted_prob_yes, 0.5);
    }

    #[test]
    fn probabilities_stay_in_unit_interval() {
        let cases = [
            (0.0, 0.0, 0.0, 0.0, 100.0, 100.0),
            (1e9, 0.0, 1e9, 0.0, 1000.0, 1000.0),
            (0.0, 1e9, 0.0, 1e9, 0.0, 0.0),
            (3.5, 7.25, 4.1, 8.0, 50.0, 50.0),
        ];
        for (sy, sn, wy, wn, vy, vn) in cases {
            let probs = recompute_probabilities(sy, sn, wy, wn, vy, vn);
            assert!((0.0..=1.0).contains(&probs.raw_prob_yes));
            assert!((0.0..=1.0).contains(&probs.weighted_prob_yes));
        }
    }

    #[test]
    fn stake_placement_moves_probability() {
        // (0,0) aggregates with 100/100 virtual start at 0.5; a 50 raw /
        // 60 weighted YES stake lands at 150/250 = 0.6 raw, 160/260 weighted.
        let update = apply_stake_delta(
            0.0,
            0.0,
            0.0,
            0.0,
            100.0,
            100.0,
            Position::Yes,
            50.0,
            60.0,
        );
        assert!((update.raw_prob_yes - 0.6).abs() < 1e-12);
        assert!((update.weighted_prob_yes - 160.0 / 260.0).abs() < 1e-12);
        assert_eq!(update.stake_yes, 50.0);
        assert_eq!(update.stake_no, 0.0);
    }

    #[test]
    fn sell_delta_only_touches_sold_side() {
        let update = apply_stake_delta(
            80.0,
            40.0,
            90.0,
            45.0,
            1000.0,
            1000.0,
            Position::Yes,
            -30.0,
            -35.0,
        );
        assert_eq!(update.stake_yes, 50.0);
        assert_eq!(update.stake_no, 40.0);
        assert_eq!(update.weighted_yes, 55.0);
        assert_eq!(update.weighted_no, 45.0);
    }

    #[test]
    fn sell_delta_clamps_at_zero() {
        let update = apply_stake_delta(
            10.0,
            0.0,
            12.0,
            0.0,
            1000.0,
            1000.0,
            Position::Yes,
            -50.0,
            -50.0,
        );
        assert_eq!(update.stake_yes, 0.0);
        assert_eq!(update.weighted_yes, 0.0);
    }

    #[test]
    fn sell_value_matches_reference_scenario() {
        // stake 20 YES at prob 0.5, fee 0.5%, liquidity 200 vs virtual 2000:
        // base 10, slippage 20/2000 = 1% -> impact 0.1, fee 0.05, net 9.85
        let value = calculate_sell_value(Position::Yes, 20.0, 0.5, 200.0, 2000.0, SELL_FEE_RATE);
        assert!((value.base_value - 10.0).abs() < 1e-12);
        assert!((value.price_impact - 0.1).abs() < 1e-12);
        assert!((value.fee_amount - 0.05).abs() < 1e-12);
        assert!((value.net_value - 9.85).abs() < 1e-12);
        assert!((value.profit_loss + 10.15).abs() < 1e-12);
    }

    #[test]
    fn sell_value_never_negative() {
        for prob in [0.0, 0.01, 0.5, 0.99, 1.0] {
            for stake in [0.5, 20.0, 5000.0] {
                let value =
                    calculate_sell_value(Position::No, stake, prob, 1.0, 1.0, 0.9);
                assert!(value.net_value >= 0.0, "prob={prob} stake={stake}");
            }
        }
    }

    #[test]
    fn price_impact_capped_at_five_percent_of_base() {
        // Tiny liquidity relative to stake: slippage ratio must cap at 5%.
        let value = calculate_sell_value(Position::Yes, 10_000.0, 0.5, 1.0, 1.0, 0.0);
        assert!((value.price_impact - value.base_value * MAX_SLIPPAGE_RATIO).abs() < 1e-9);
    }

    #[test]
    fn favorable_move_redeems_above_stake_before_costs() {
        let value = calculate_sell_value(Position::Yes, 100.0, 0.8, 10_000.0, 1000.0, 0.0);
        assert!(value.base_value > 100.0 * 0.79);
        assert!(value.net_value > 75.0);
    }

    #[test]
    fn high_slippage_flagged_above_threshold() {
        // 5% impact + 0.5% fee on a mid-probability position is > 2%
        let value = calculate_sell_value(Position::Yes, 1000.0, 0.5, 1.0, 1.0, SELL_FEE_RATE);
        assert!(value.high_slippage);

        let calm = calculate_sell_value(Position::Yes, 10.0, 0.5, 100_000.0, 1000.0, 0.0);
        assert!(!calm.high_slippage);
    }
}
