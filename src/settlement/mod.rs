//! Settlement Processor
//!
//! Splits the losing pool among winners, applies reputation deltas, and
//! writes the per-market settlement audit record. The INVALID-outcome path
//! refunds every stake in full with no reputation change.

pub mod processor;

pub use processor::{cancel_with_refunds, settle_market, SettlementSummary};
