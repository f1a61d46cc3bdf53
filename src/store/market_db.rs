use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::amm::pricing::AggregateUpdate;
use crate::models::{Market, MarketStatus, Outcome, OracleConfig, Position, Prediction, User};
use crate::oracle::evidence::EvidenceSnapshot;

/// Inputs for market creation; aggregates and probabilities are seeded here.
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub title: String,
    pub description: String,
    pub category: String,
    pub oracle_config: OracleConfig,
    pub locks_at: DateTime<Utc>,
    pub resolves_at: Option<DateTime<Utc>>,
    pub virtual_liquidity: f64,
}

/// Immutable settlement audit row, at most one per market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub total_pool: f64,
    pub winners_pool: f64,
    pub losers_pool: f64,
    pub total_predictions: i64,
    pub winning_predictions: i64,
    pub evidence_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read-only monitoring snapshot for the oracle engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub open: i64,
    pub locked: i64,
    pub resolved: i64,
    pub settled: i64,
    pub cancelled: i64,
    pub eligible_to_lock: i64,
    pub eligible_to_resolve: i64,
}

#[derive(Clone)]
pub struct MarketDb {
    conn: Arc<Mutex<Connection>>,
}

impl MarketDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open market db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                oracle_type TEXT NOT NULL,
                oracle_config TEXT NOT NULL,
                locks_at INTEGER NOT NULL,
                resolves_at INTEGER,
                status TEXT NOT NULL,
                outcome TEXT,
                resolution_value TEXT,
                evidence_id TEXT,
                settled_at INTEGER,
                stake_yes REAL NOT NULL DEFAULT 0,
                stake_no REAL NOT NULL DEFAULT 0,
                weighted_yes REAL NOT NULL DEFAULT 0,
                weighted_no REAL NOT NULL DEFAULT 0,
                virtual_yes REAL NOT NULL,
                virtual_no REAL NOT NULL,
                raw_prob_yes REAL NOT NULL DEFAULT 0.5,
                weighted_prob_yes REAL NOT NULL DEFAULT 0.5,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_markets_status_locks ON markets(status, locks_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_markets_status_resolves ON markets(status, resolves_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position TEXT NOT NULL,
                stake REAL NOT NULL,
                credibility_at_prediction REAL NOT NULL,
                weighted_stake REAL NOT NULL,
                is_settled INTEGER NOT NULL DEFAULT 0,
                payout REAL,
                rep_delta INTEGER,
                created_at INTEGER NOT NULL,
                settled_at INTEGER,
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_predictions_market_settled
             ON predictions(market_id, is_settled)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_predictions_user ON predictions(user_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                rep_score REAL NOT NULL DEFAULT 0,
                locked_rep_score REAL NOT NULL DEFAULT 0,
                credibility REAL NOT NULL DEFAULT 0,
                total_predictions INTEGER NOT NULL DEFAULT 0,
                correct_predictions INTEGER NOT NULL DEFAULT 0,
                total_staked REAL NOT NULL DEFAULT 0,
                total_won REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence_snapshots (
                id TEXT PRIMARY KEY,
                market_id TEXT,
                ts INTEGER NOT NULL,
                oracle_type TEXT NOT NULL,
                sources TEXT NOT NULL,
                extracted_value TEXT NOT NULL,
                decision TEXT NOT NULL,
                config TEXT NOT NULL,
                hash TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL UNIQUE,
                outcome TEXT NOT NULL,
                total_pool REAL NOT NULL,
                winners_pool REAL NOT NULL,
                losers_pool REAL NOT NULL,
                total_predictions INTEGER NOT NULL,
                winning_predictions INTEGER NOT NULL,
                evidence_id TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Serialize a multi-statement read-modify-write sequence on the single
    /// connection. Trading paths run their whole validate-then-write flow
    /// inside one closure so concurrent callers cannot interleave.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    // ----- markets -----

    pub async fn create_market(&self, new: NewMarket) -> Result<Market> {
        let now = Utc::now();
        if let Some(resolves_at) = new.resolves_at {
            if resolves_at <= new.locks_at {
                return Err(anyhow::anyhow!("resolves_at must be after locks_at"));
            }
        }
        new.oracle_config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid oracle config: {}", e))?;

        let market = Market {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            category: new.category,
            oracle_config: new.oracle_config,
            locks_at: new.locks_at,
            resolves_at: new.resolves_at,
            status: MarketStatus::Open,
            outcome: None,
            resolution_value: None,
            evidence_id: None,
            settled_at: None,
            stake_yes: 0.0,
            stake_no: 0.0,
            weighted_yes: 0.0,
            weighted_no: 0.0,
            virtual_yes: new.virtual_liquidity,
            virtual_no: new.virtual_liquidity,
            raw_prob_yes: 0.5,
            weighted_prob_yes: 0.5,
            created_at: now,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets (id, title, description, category, oracle_type, oracle_config,
             locks_at, resolves_at, status, stake_yes, stake_no, weighted_yes, weighted_no,
             virtual_yes, virtual_no, raw_prob_yes, weighted_prob_yes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                market.id,
                market.title,
                market.description,
                market.category,
                market.oracle_config.oracle_type(),
                serde_json::to_string(&market.oracle_config)?,
                market.locks_at.timestamp(),
                market.resolves_at.map(|t| t.timestamp()),
                market.status.as_str(),
                market.stake_yes,
                market.stake_no,
                market.weighted_yes,
                market.weighted_no,
                market.virtual_yes,
                market.virtual_no,
                market.raw_prob_yes,
                market.weighted_prob_yes,
                market.created_at.timestamp(),
            ],
        )?;

        Ok(market)
    }

    pub async fn get_market(&self, id: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock().await;
        Self::get_market_with(&conn, id)
    }

    pub fn get_market_with(conn: &Connection, id: &str) -> Result<Option<Market>> {
        let mut stmt = conn.prepare_cached("SELECT * FROM markets WHERE id = ?")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(market_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// OPEN markets whose lock time has passed.
    pub async fn lockable_market_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.market_ids(
            "SELECT id FROM markets WHERE status = 'open' AND locks_at <= ? ORDER BY locks_at",
            Some(now),
        )
        .await
    }

    /// LOCKED markets with a resolve time that has passed.
    pub async fn resolvable_market_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.market_ids(
            "SELECT id FROM markets WHERE status = 'locked' AND resolves_at IS NOT NULL
             AND resolves_at <= ? ORDER BY resolves_at",
            Some(now),
        )
        .await
    }

    pub async fn resolved_market_ids(&self) -> Result<Vec<String>> {
        self.market_ids(
            "SELECT id FROM markets WHERE status = 'resolved' ORDER BY resolves_at",
            None,
        )
        .await
    }

    async fn market_ids(&self, sql: &str, now: Option<DateTime<Utc>>) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(sql)?;
        let ids = match now {
            Some(now) => stmt
                .query_map([now.timestamp()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(ids)
    }

    /// Atomic conditional status transition. Returns false when another
    /// caller already moved the market past `from`.
    pub async fn try_transition(
        &self,
        id: &str,
        from: MarketStatus,
        to: MarketStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE markets SET status = ? WHERE id = ? AND status = ?",
            params![to.as_str(), id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// LOCKED -> RESOLVED with the resolution fields, atomically.
    pub async fn mark_resolved(
        &self,
        id: &str,
        outcome: Outcome,
        resolution_value: &str,
        evidence_id: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE markets SET status = 'resolved', outcome = ?, resolution_value = ?,
             evidence_id = ? WHERE id = ? AND status = 'locked'",
            params![outcome.as_str(), resolution_value, evidence_id, id],
        )?;
        Ok(changed == 1)
    }

    /// RESOLVED -> SETTLED (or CANCELLED for the invalid-outcome path).
    pub async fn mark_finalized(
        &self,
        id: &str,
        terminal: MarketStatus,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE markets SET status = ?, settled_at = ? WHERE id = ? AND status = 'resolved'",
            params![terminal.as_str(), settled_at.timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    pub async fn update_market_aggregates(&self, id: &str, update: &AggregateUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::update_market_aggregates_with(&conn, id, update)
    }

    pub fn update_market_aggregates_with(
        conn: &Connection,
        id: &str,
        update: &AggregateUpdate,
    ) -> Result<()> {
        conn.execute(
            "UPDATE markets SET stake_yes = ?, stake_no = ?, weighted_yes = ?, weighted_no = ?,
             raw_prob_yes = ?, weighted_prob_yes = ? WHERE id = ?",
            params![
                update.stake_yes,
                update.stake_no,
                update.weighted_yes,
                update.weighted_no,
                update.raw_prob_yes,
                update.weighted_prob_yes,
                id
            ],
        )?;
        Ok(())
    }

    pub async fn status_counts(&self, now: DateTime<Utc>) -> Result<StatusCounts> {
        let conn = self.conn.lock().await;
        let mut counts = StatusCounts::default();

        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM markets GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "open" => counts.open = count,
                "locked" => counts.locked = count,
                "resolved" => counts.resolved = count,
                "settled" => counts.settled = count,
                "cancelled" => counts.cancelled = count,
                _ => {}
            }
        }

        counts.eligible_to_lock = conn.query_row(
            "SELECT COUNT(*) FROM markets WHERE status = 'open' AND locks_at <= ?",
            [now.timestamp()],
            |row| row.get(0),
        )?;
        counts.eligible_to_resolve = conn.query_row(
            "SELECT COUNT(*) FROM markets WHERE status = 'locked' AND resolves_at IS NOT NULL
             AND resolves_at <= ?",
            [now.timestamp()],
            |row| row.get(0),
        )?;

        Ok(counts)
    }

    // ----- predictions -----

    pub fn insert_prediction_with(conn: &Connection, prediction: &Prediction) -> Result<()> {
        conn.execute(
            "INSERT INTO predictions (id, market_id, user_id, position, stake,
             credibility_at_prediction, weighted_stake, is_settled, payout, rep_delta,
             created_at, settled_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                prediction.id,
                prediction.market_id,
                prediction.user_id,
                prediction.position.as_str(),
                prediction.stake,
                prediction.credibility_at_prediction,
                prediction.weighted_stake,
                prediction.is_settled as i64,
                prediction.payout,
                prediction.rep_delta,
                prediction.created_at.timestamp(),
                prediction.settled_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_prediction(&self, id: &str) -> Result<Option<Prediction>> {
        let conn = self.conn.lock().await;
        Self::get_prediction_with(&conn, id)
    }

    pub fn get_prediction_with(conn: &Connection, id: &str) -> Result<Option<Prediction>> {
        let mut stmt = conn.prepare_cached("SELECT * FROM predictions WHERE id = ?")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(prediction_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn unsettled_predictions(&self, market_id: &str) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM predictions WHERE market_id = ? AND is_settled = 0 ORDER BY created_at",
        )?;
        let mut rows = stmt.query([market_id])?;
        let mut predictions = Vec::new();
        while let Some(row) = rows.next()? {
            predictions.push(prediction_from_row(row)?);
        }
        Ok(predictions)
    }

    /// Sum of a user's live stake in one market, for the cumulative cap.
    pub fn user_market_stake_with(
        conn: &Connection,
        market_id: &str,
        user_id: &str,
    ) -> Result<f64> {
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(stake), 0) FROM predictions
             WHERE market_id = ? AND user_id = ? AND is_settled = 0",
            params![market_id, user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Terminal prediction update, idempotent: only an unsettled row flips.
    pub async fn settle_prediction(
        &self,
        id: &str,
        payout: f64,
        rep_delta: i64,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        Self::settle_prediction_with(&conn, id, payout, rep_delta, settled_at)
    }

    pub fn settle_prediction_with(
        conn: &Connection,
        id: &str,
        payout: f64,
        rep_delta: i64,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE predictions SET is_settled = 1, payout = ?, rep_delta = ?, settled_at = ?
             WHERE id = ? AND is_settled = 0",
            params![payout, rep_delta, settled_at.timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    // ----- users -----

    pub async fn create_user(&self, rep_score: f64, credibility: f64) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            rep_score,
            locked_rep_score: 0.0,
            credibility,
            total_predictions: 0,
            correct_predictions: 0,
            total_staked: 0.0,
            total_won: 0.0,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, rep_score, locked_rep_score, credibility, total_predictions,
             correct_predictions, total_staked, total_won, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.id,
                user.rep_score,
                user.locked_rep_score,
                user.credibility,
                user.total_predictions,
                user.correct_predictions,
                user.total_staked,
                user.total_won,
                user.created_at.timestamp(),
                user.updated_at.timestamp(),
            ],
        )?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Self::get_user_with(&conn, id)
    }

    pub fn get_user_with(conn: &Connection, id: &str) -> Result<Option<User>> {
        let mut stmt = conn.prepare_cached("SELECT * FROM users WHERE id = ?")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(user_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Placement: lock the stake and bump counters.
    pub fn apply_stake_lock_with(conn: &Connection, user_id: &str, stake: f64) -> Result<()> {
        conn.execute(
            "UPDATE users SET locked_rep_score = locked_rep_score + ?,
             total_predictions = total_predictions + 1,
             total_staked = total_staked + ?, updated_at = ? WHERE id = ?",
            params![stake, stake, Utc::now().timestamp(), user_id],
        )?;
        Ok(())
    }

    /// Sell: unlock the stake and apply the realized profit or loss.
    pub fn apply_sell_with(
        conn: &Connection,
        user_id: &str,
        stake: f64,
        net_value: f64,
    ) -> Result<()> {
        conn.execute(
            "UPDATE users SET locked_rep_score = MAX(0, locked_rep_score - ?),
             rep_score = MAX(0, rep_score + ?), updated_at = ? WHERE id = ?",
            params![stake, net_value - stake, Utc::now().timestamp(), user_id],
        )?;
        Ok(())
    }

    /// Settlement: unlock the stake, apply the economic and reputation
    /// deltas together, and bump win stats.
    pub async fn apply_settlement(
        &self,
        user_id: &str,
        stake: f64,
        payout: f64,
        rep_delta: i64,
        winner: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET locked_rep_score = MAX(0, locked_rep_score - ?),
             rep_score = MAX(0, rep_score + ?),
             correct_predictions = correct_predictions + ?,
             total_won = total_won + ?, updated_at = ? WHERE id = ?",
            params![
                stake,
                (payout - stake) + rep_delta as f64,
                winner as i64,
                payout,
                Utc::now().timestamp(),
                user_id
            ],
        )?;
        Ok(())
    }

    /// Invalid-outcome refund: unlock only, reputation untouched.
    pub async fn apply_refund(&self, user_id: &str, stake: f64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET locked_rep_score = MAX(0, locked_rep_score - ?), updated_at = ?
             WHERE id = ?",
            params![stake, Utc::now().timestamp(), user_id],
        )?;
        Ok(())
    }

    // ----- evidence & settlements -----

    pub async fn insert_evidence(
        &self,
        market_id: Option<&str>,
        evidence: &EvidenceSnapshot,
        hash: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO evidence_snapshots (id, market_id, ts, oracle_type, sources,
             extracted_value, decision, config, hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                market_id,
                evidence.timestamp.timestamp(),
                evidence.oracle_type,
                serde_json::to_string(&evidence.sources)?,
                evidence.extracted_value,
                evidence.decision.as_str(),
                evidence.config,
                hash,
            ],
        )?;
        Ok(id)
    }

    /// Insert the settlement audit row. UNIQUE(market_id) makes a retried
    /// settlement pass a no-op here; returns whether the row was new.
    pub async fn insert_settlement(&self, record: &SettlementRecord) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO settlements (id, market_id, outcome, total_pool, winners_pool,
             losers_pool, total_predictions, winning_predictions, evidence_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.market_id,
                record.outcome.as_str(),
                record.total_pool,
                record.winners_pool,
                record.losers_pool,
                record.total_predictions,
                record.winning_predictions,
                record.evidence_id,
                record.created_at.timestamp(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn get_settlement(&self, market_id: &str) -> Result<Option<SettlementRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT * FROM settlements WHERE market_id = ?")?;
        let mut rows = stmt.query([market_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(SettlementRecord {
                id: row.get(0)?,
                market_id: row.get(1)?,
                outcome: parse_outcome(row.get::<_, String>(2)?)?,
                total_pool: row.get(3)?,
                winners_pool: row.get(4)?,
                losers_pool: row.get(5)?,
                total_predictions: row.get(6)?,
                winning_predictions: row.get(7)?,
                evidence_id: row.get(8)?,
                created_at: ts_to_datetime(row.get(9)?),
            })),
            None => Ok(None),
        }
    }
}

fn ts_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_outcome(s: String) -> Result<Outcome> {
    Outcome::parse(&s).ok_or_else(|| anyhow::anyhow!("unknown outcome in row: {}", s))
}

fn market_from_row(row: &Row<'_>) -> Result<Market> {
    let status: String = row.get("status")?;
    let outcome: Option<String> = row.get("outcome")?;
    let config_json: String = row.get("oracle_config")?;

    Ok(Market {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        category: row.get("category")?,
        oracle_config: serde_json::from_str(&config_json)
            .with_context(|| format!("corrupt oracle config: {}", config_json))?,
        locks_at: ts_to_datetime(row.get("locks_at")?),
        resolves_at: row.get::<_, Option<i64>>("resolves_at")?.map(ts_to_datetime),
        status: MarketStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown market status: {}", status))?,
        outcome: outcome.map(parse_outcome).transpose()?,
        resolution_value: row.get("resolution_value")?,
        evidence_id: row.get("evidence_id")?,
        settled_at: row.get::<_, Option<i64>>("settled_at")?.map(ts_to_datetime),
        stake_yes: row.get("stake_yes")?,
        stake_no: row.get("stake_no")?,
        weighted_yes: row.get("weighted_yes")?,
        weighted_no: row.get("weighted_no")?,
        virtual_yes: row.get("virtual_yes")?,
        virtual_no: row.get("virtual_no")?,
        raw_prob_yes: row.get("raw_prob_yes")?,
        weighted_prob_yes: row.get("weighted_prob_yes")?,
        created_at: ts_to_datetime(row.get("created_at")?),
    })
}

fn prediction_from_row(row: &Row<'_>) -> Result<Prediction> {
    let position: String = row.get("position")?;
    Ok(Prediction {
        id: row.get("id")?,
        market_id: row.get("market_id")?,
        user_id: row.get("user_id")?,
        position: Position::parse(&position)
            .ok_or_else(|| anyhow::anyhow!("unknown position: {}", position))?,
        stake: row.get("stake")?,
        credibility_at_prediction: row.get("credibility_at_prediction")?,
        weighted_stake: row.get("weighted_stake")?,
        is_settled: row.get::<_, i64>("is_settled")? == 1,
        payout: row.get("payout")?,
        rep_delta: row.get("rep_delta")?,
        created_at: ts_to_datetime(row.get("created_at")?),
        settled_at: row.get::<_, Option<i64>>("settled_at")?.map(ts_to_datetime),
    })
}

fn user_from_row(row: &Row<'_>) -> Result<User> {
    Ok(User {
        id: row.get("id")?,
        rep_score: row.get("rep_score")?,
        locked_rep_score: row.get("locked_rep_score")?,
        credibility: row.get("credibility")?,
        total_predictions: row.get("total_predictions")?,
        correct_predictions: row.get("correct_predictions")?,
        total_staked: row.get("total_staked")?,
        total_won: row.get("total_won")?,
        created_at: ts_to_datetime(row.get("created_at")?),
        updated_at: ts_to_datetime(row.get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceComparison;
    use chrono::Duration;

    fn new_market() -> NewMarket {
        NewMarket {
            title: "test".to_string(),
            description: "test".to_string(),
            category: "crypto".to_string(),
            oracle_config: OracleConfig::PriceClose {
                asset: "BTC".to_string(),
                target_price: 50000.0,
                comparison: PriceComparison::Above,
            },
            locks_at: Utc::now() + Duration::hours(1),
            resolves_at: Some(Utc::now() + Duration::hours(2)),
            virtual_liquidity: 1000.0,
        }
    }

    async fn test_db() -> (MarketDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store_test.db");
        (MarketDb::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[tokio::test]
    async fn conditional_transition_succeeds_exactly_once() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(new_market()).await.unwrap();

        assert!(db
            .try_transition(&market.id, MarketStatus::Open, MarketStatus::Locked)
            .await
            .unwrap());
        // Second caller sees the predicate already false
        assert!(!db
            .try_transition(&market.id, MarketStatus::Open, MarketStatus::Locked)
            .await
            .unwrap());

        let locked = db.get_market(&market.id).await.unwrap().unwrap();
        assert_eq!(locked.status, MarketStatus::Locked);
    }

    #[tokio::test]
    async fn market_creation_rejects_resolve_before_lock() {
        let (db, _dir) = test_db().await;
        let mut bad = new_market();
        bad.resolves_at = Some(bad.locks_at - Duration::minutes(5));
        assert!(db.create_market(bad).await.is_err());
    }

    #[tokio::test]
    async fn prediction_settles_exactly_once() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(new_market()).await.unwrap();
        let user = db.create_user(100.0, 0.0).await.unwrap();

        let prediction = Prediction {
            id: "p1".to_string(),
            market_id: market.id.clone(),
            user_id: user.id.clone(),
            position: Position::Yes,
            stake: 10.0,
            credibility_at_prediction: 0.0,
            weighted_stake: 10.0,
            is_settled: false,
            payout: None,
            rep_delta: None,
            created_at: Utc::now(),
            settled_at: None,
        };
        db.with_conn({
            let prediction = prediction.clone();
            move |conn| MarketDb::insert_prediction_with(conn, &prediction)
        })
        .await
        .unwrap();

        assert!(db.settle_prediction("p1", 15.0, 5, Utc::now()).await.unwrap());
        assert!(!db.settle_prediction("p1", 15.0, 5, Utc::now()).await.unwrap());

        let settled = db.get_prediction("p1").await.unwrap().unwrap();
        assert!(settled.is_settled);
        assert_eq!(settled.payout, Some(15.0));
        assert_eq!(settled.rep_delta, Some(5));
    }

    #[tokio::test]
    async fn settlement_record_is_unique_per_market() {
        let (db, _dir) = test_db().await;
        let market = db.create_market(new_market()).await.unwrap();

        let record = SettlementRecord {
            id: "s1".to_string(),
            market_id: market.id.clone(),
            outcome: Outcome::Yes,
            total_pool: 150.0,
            winners_pool: 100.0,
            losers_pool: 50.0,
            total_predictions: 2,
            winning_predictions: 1,
            evidence_id: None,
            created_at: Utc::now(),
        };
        assert!(db.insert_settlement(&record).await.unwrap());

        let mut retry = record.clone();
        retry.id = "s2".to_string();
        assert!(!db.insert_settlement(&retry).await.unwrap());

        let stored = db.get_settlement(&market.id).await.unwrap().unwrap();
        assert_eq!(stored.id, "s1");
    }
}
