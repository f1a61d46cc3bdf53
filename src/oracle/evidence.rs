//! Evidence snapshots and the content-addressed evidence hash
//!
//! The hash covers only the decision-relevant subset (timestamp, oracle
//! type, per-source readings, extracted value, decision) so any party can
//! reproduce it from the extracted readings alone — raw provider payloads
//! and per-source errors are recorded but never hashed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::Outcome;
use crate::sources::Reading;

/// One source's contribution to a resolution, value nullable on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReading {
    pub source: String,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReading {
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            source: reading.source.clone(),
            value: Some(reading.value),
            timestamp: reading.timestamp,
            raw_payload: reading.raw_payload.clone(),
            error: None,
        }
    }

    pub fn failed(source: &str, error: &str) -> Self {
        Self {
            source: source.to_string(),
            value: None,
            timestamp: Utc::now(),
            raw_payload: None,
            error: Some(error.to_string()),
        }
    }
}

/// Immutable record of what the resolver saw and decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub oracle_type: String,
    pub sources: Vec<SourceReading>,
    /// Extracted consensus value, or an error description when none exists.
    pub extracted_value: String,
    pub decision: Outcome,
    /// Oracle config JSON as used, for audit.
    pub config: String,
}

impl EvidenceSnapshot {
    /// SHA-256 over canonical JSON of the decision-relevant fields.
    ///
    /// Field order is fixed by the serialize-only structs below, so the hash
    /// is deterministic for structurally identical content.
    pub fn content_hash(&self) -> String {
        #[derive(Serialize)]
        struct HashedSource<'a> {
            source: &'a str,
            value: Option<f64>,
            timestamp: i64,
        }

        #[derive(Serialize)]
        struct HashedEvidence<'a> {
            timestamp: i64,
            oracle_type: &'a str,
            sources: Vec<HashedSource<'a>>,
            extracted_value: &'a str,
            decision: &'a str,
        }

        let payload = HashedEvidence {
            timestamp: self.timestamp.timestamp(),
            oracle_type: &self.oracle_type,
            sources: self
                .sources
                .iter()
                .map(|s| HashedSource {
                    source: &s.source,
                    value: s.value,
                    timestamp: s.timestamp.timestamp(),
                })
                .collect(),
            extracted_value: &self.extracted_value,
            decision: self.decision.as_str(),
        };

        // Serialization of a plain struct cannot fail
        let canonical = serde_json::to_vec(&payload).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}
