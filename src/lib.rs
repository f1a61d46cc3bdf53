//! RepMarket Backend Library
//!
//! Core of the credibility-weighted prediction market: oracle resolution and
//! settlement pipeline plus the AMM probability engine. The HTTP layer and
//! UI live elsewhere; this crate exposes the operations they marshal into.

pub mod amm;
pub mod models;
pub mod oracle;
pub mod settlement;
pub mod sources;
pub mod store;
pub mod trading;
