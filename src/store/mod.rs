// =============================================================================
// Persistence — SQLite projection of engine state
// =============================================================================
//
// The database is a durable projection, not the authority: order books and
// scores live in memory / in their engines, and the store exists for crash
// recovery (open orders) and the append-only logs (trades, score changes,
// audit decisions). Each method below is one transactional unit; callers hold
// their symbol or book critical region across exactly one call.
// =============================================================================

pub mod events;
pub mod instruments;
pub mod orders;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::runtime_config::RuntimeConfig;

/// Shared database handle. rusqlite connections are not Sync, so the single
/// connection sits behind an async mutex; statements are cached per
/// connection via `prepare_cached`.
pub struct Db {
    pub(crate) conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>, config: &RuntimeConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        init_schema(&conn, config)?;
        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory(config: &RuntimeConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn, config)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Create the eight core tables and their indexes. Numeric range constraints
/// are rendered from the runtime config so the tunables stay in one place.
fn init_schema(conn: &Connection, config: &RuntimeConfig) -> Result<()> {
    let (lo, hi) = (config.min_price, config.max_price);
    let cap = config.delta_cap;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS stocks (
            symbol         TEXT PRIMARY KEY,
            name           TEXT NOT NULL,
            description    TEXT NOT NULL DEFAULT '',
            market_weight  REAL NOT NULL CHECK (market_weight >= 0 AND market_weight <= 1),
            reality_weight REAL NOT NULL CHECK (reality_weight >= 0 AND reality_weight <= 1),
            min_price      REAL NOT NULL CHECK (min_price >= 0),
            max_price      REAL NOT NULL,
            created_at     TEXT NOT NULL,
            CHECK (max_price >= min_price)
        );

        CREATE TABLE IF NOT EXISTS scores (
            symbol        TEXT PRIMARY KEY REFERENCES stocks(symbol) ON DELETE CASCADE,
            reality_score REAL NOT NULL CHECK (reality_score >= {lo} AND reality_score <= {hi}),
            final_price   REAL NOT NULL CHECK (final_price >= {lo} AND final_price <= {hi}),
            confidence    REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
            last_updated  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            event_id                TEXT PRIMARY KEY,
            symbol                  TEXT NOT NULL,
            stocks                  TEXT NOT NULL,
            quick_score             REAL NOT NULL CHECK (quick_score >= -1 AND quick_score <= 1),
            impact_points           REAL NOT NULL CHECK (impact_points >= -{cap} AND impact_points <= {cap}),
            summary                 TEXT NOT NULL,
            sources                 TEXT NOT NULL,
            num_independent_sources INTEGER NOT NULL CHECK (num_independent_sources >= 1),
            llm_mode                TEXT NOT NULL,
            created_at              TEXT NOT NULL,
            processed               INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_events_symbol_created
            ON events(symbol, created_at DESC);

        CREATE TABLE IF NOT EXISTS llm_calls (
            id          TEXT PRIMARY KEY,
            event_id    TEXT NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
            llm_mode    TEXT NOT NULL,
            input_hash  TEXT NOT NULL,
            output_json TEXT,
            timestamp   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_llm_calls_event ON llm_calls(event_id);

        CREATE TABLE IF NOT EXISTS llm_audit (
            id         TEXT PRIMARY KEY,
            event_id   TEXT NOT NULL UNIQUE REFERENCES events(event_id) ON DELETE CASCADE,
            symbol     TEXT NOT NULL,
            summary    TEXT NOT NULL,
            impact     REAL NOT NULL,
            sources    TEXT NOT NULL,
            approved   TEXT NOT NULL DEFAULT 'pending'
                       CHECK (approved IN ('pending', 'approved', 'rejected')),
            approver   TEXT,
            reason     TEXT,
            created_at TEXT NOT NULL,
            decided_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_llm_audit_pending
            ON llm_audit(created_at DESC) WHERE approved = 'pending';

        CREATE TABLE IF NOT EXISTS score_changes (
            id        TEXT PRIMARY KEY,
            symbol    TEXT NOT NULL,
            event_id  TEXT NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
            old_score REAL NOT NULL,
            new_score REAL NOT NULL,
            delta     REAL NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_score_changes_symbol
            ON score_changes(symbol, timestamp DESC);

        CREATE TABLE IF NOT EXISTS orders (
            order_id   TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            symbol     TEXT NOT NULL,
            side       TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
            type       TEXT NOT NULL CHECK (type IN ('limit', 'market')),
            price      REAL,
            qty        REAL NOT NULL CHECK (qty > 0),
            filled     REAL NOT NULL DEFAULT 0 CHECK (filled >= 0 AND filled <= qty),
            status     TEXT NOT NULL DEFAULT 'open'
                       CHECK (status IN ('open', 'partial', 'filled', 'cancelled')),
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);
        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
        CREATE INDEX IF NOT EXISTS idx_orders_active
            ON orders(created_at ASC) WHERE status IN ('open', 'partial');

        CREATE TABLE IF NOT EXISTS trade_history (
            trade_id      TEXT PRIMARY KEY,
            symbol        TEXT NOT NULL,
            price         REAL NOT NULL CHECK (price > 0),
            qty           REAL NOT NULL CHECK (qty > 0),
            buy_order_id  TEXT NOT NULL REFERENCES orders(order_id),
            sell_order_id TEXT NOT NULL REFERENCES orders(order_id),
            timestamp     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trade_history_symbol
            ON trade_history(symbol, timestamp DESC);
        "
    ))
    .context("initialise schema")?;

    Ok(())
}

// =============================================================================
// Column codecs
// =============================================================================

/// Fixed-width RFC 3339 (UTC, microseconds) so TEXT ordering matches time
/// ordering.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

pub(crate) fn sources_to_sql(sources: &[crate::types::SourceRef]) -> Result<String> {
    serde_json::to_string(sources).context("serialise sources")
}

pub(crate) fn sources_from_sql(raw: &str) -> Result<Vec<crate::types::SourceRef>> {
    serde_json::from_str(raw).context("deserialise sources")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    #[test]
    fn schema_initialises_in_memory() {
        let db = Db::open_in_memory(&RuntimeConfig::default()).unwrap();
        let conn = db.conn.try_lock().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn timestamp_roundtrip_is_sortable() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        let (sa, sb) = (ts_to_sql(a), ts_to_sql(b));
        assert!(sa < sb);
        assert_eq!(ts_from_sql(&sa).unwrap(), a.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn data_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.db");
        let config = RuntimeConfig::default();

        {
            let db = Db::open(&path, &config).unwrap();
            db.create_instrument(
                &crate::types::Instrument {
                    symbol: "ELON".to_string(),
                    name: "Elon".to_string(),
                    description: String::new(),
                    market_weight: 0.5,
                    reality_weight: 0.5,
                    min_price: 0.0,
                    max_price: 100.0,
                    created_at: Utc::now(),
                },
                50.0,
                0.1,
            )
            .await
            .unwrap();
        }

        let db = Db::open(&path, &config).unwrap();
        let score = db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 50.0).abs() < f64::EPSILON);
    }
}
