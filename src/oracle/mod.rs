//! Oracle Resolution & Lifecycle
//!
//! This module handles:
//! 1. Tamper-evident evidence records and their content hash
//! 2. Per-oracle-type resolution (price close, metric threshold, count threshold)
//! 3. The batch lifecycle driver (lock -> resolve -> settle)

pub mod engine;
pub mod evidence;
pub mod resolver;

pub use engine::{OracleEngine, OracleEngineResult, OracleStatus};
pub use evidence::{EvidenceSnapshot, SourceReading};
pub use resolver::{resolve_market, ResolutionResult};
