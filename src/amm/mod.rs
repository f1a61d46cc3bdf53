//! AMM Pricing Engine
//!
//! Pure probability and exit-valuation math. No I/O lives here; the trading
//! surface and settlement processor feed it aggregates and persist the
//! results.

pub mod pricing;

pub use pricing::*;
