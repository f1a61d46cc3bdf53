//! Relational store for markets, predictions, users and audit records
//!
//! One SQLite connection behind an async mutex. Every status transition is a
//! single conditional UPDATE checked by affected-row count, so overlapping
//! engine invocations cannot double-process a market.

pub mod market_db;

pub use market_db::{MarketDb, NewMarket, SettlementRecord, StatusCounts};
