// =============================================================================
// Events, score changes, LLM calls, and the audit queue
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{sources_from_sql, sources_to_sql, ts_from_sql, ts_to_sql, Db};
use crate::types::{AuditRecord, AuditState, ScoreChange, StoredEvent};

/// Outcome of an audit decision attempt.
#[derive(Debug, Clone)]
pub enum DecideAudit {
    Decided(AuditRecord),
    AlreadyDecided,
    NotFound,
}

const EVENT_COLS: &str = "event_id, symbol, stocks, quick_score, impact_points, summary, \
                          sources, num_independent_sources, llm_mode, created_at, processed";
const AUDIT_COLS: &str = "id, event_id, symbol, summary, impact, sources, approved, approver, \
                          reason, created_at, decided_at";

fn event_from_row(row: &Row<'_>) -> Result<StoredEvent> {
    let event_id: String = row.get(0)?;
    let stocks: String = row.get(2)?;
    let sources: String = row.get(6)?;
    let llm_mode: String = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(StoredEvent {
        event_id: event_id.parse().context("event_id column")?,
        symbol: row.get(1)?,
        stocks: serde_json::from_str(&stocks).context("stocks column")?,
        quick_score: row.get(3)?,
        impact_points: row.get(4)?,
        summary: row.get(5)?,
        sources: sources_from_sql(&sources)?,
        num_independent_sources: row.get(7)?,
        llm_mode: llm_mode.parse().map_err(anyhow::Error::msg)?,
        created_at: ts_from_sql(&created_at)?,
        processed: row.get::<_, i64>(10)? != 0,
    })
}

fn audit_from_row(row: &Row<'_>) -> Result<AuditRecord> {
    let id: String = row.get(0)?;
    let event_id: String = row.get(1)?;
    let sources: String = row.get(5)?;
    let state: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    let decided_at: Option<String> = row.get(10)?;

    Ok(AuditRecord {
        id: id.parse().context("audit id column")?,
        event_id: event_id.parse().context("audit event_id column")?,
        symbol: row.get(2)?,
        summary: row.get(3)?,
        impact: row.get(4)?,
        sources: sources_from_sql(&sources)?,
        state: state.parse().map_err(anyhow::Error::msg)?,
        approver: row.get(7)?,
        reason: row.get(8)?,
        created_at: ts_from_sql(&created_at)?,
        decided_at: decided_at.as_deref().map(ts_from_sql).transpose()?,
    })
}

impl Db {
    pub async fn event_exists(&self, event_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT 1 FROM events WHERE event_id = ?1")?;
        let found: Option<i64> = stmt
            .query_row(params![event_id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Persist a new event row (`processed = false`), optionally with its LLM
    /// call projection, in one transaction.
    pub async fn insert_event(
        &self,
        event: &StoredEvent,
        llm_call: Option<(&str, &serde_json::Value)>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin insert_event")?;

        tx.execute(
            "INSERT INTO events (event_id, symbol, stocks, quick_score, impact_points, summary,
                                 sources, num_independent_sources, llm_mode, created_at, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                event.event_id.to_string(),
                event.symbol,
                serde_json::to_string(&event.stocks).context("serialise stocks")?,
                event.quick_score,
                event.impact_points,
                event.summary,
                sources_to_sql(&event.sources)?,
                event.num_independent_sources,
                event.llm_mode.to_string(),
                ts_to_sql(event.created_at),
            ],
        )?;

        if let Some((input_hash, output_json)) = llm_call {
            tx.execute(
                "INSERT INTO llm_calls (id, event_id, llm_mode, input_hash, output_json, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    event.event_id.to_string(),
                    event.llm_mode.to_string(),
                    input_hash,
                    output_json.to_string(),
                    ts_to_sql(event.created_at),
                ],
            )?;
        }

        tx.commit().context("commit insert_event")
    }

    pub async fn get_event(&self, event_id: Uuid) -> Result<Option<StoredEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {EVENT_COLS} FROM events WHERE event_id = ?1"))?;
        let mut rows = stmt.query(params![event_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(event_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn mark_event_processed(&self, event_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE events SET processed = 1 WHERE event_id = ?1",
            params![event_id.to_string()],
        )?;
        Ok(())
    }

    /// Commit one reality-score mutation: score row update plus the
    /// append-only score-change record, atomically.
    pub async fn commit_score_update(
        &self,
        change: &ScoreChange,
        new_confidence: f64,
        new_final: f64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin commit_score_update")?;

        let n = tx.execute(
            "UPDATE scores SET reality_score = ?2, final_price = ?3, confidence = ?4,
                               last_updated = ?5
             WHERE symbol = ?1",
            params![
                change.symbol,
                change.new_score,
                new_final,
                new_confidence,
                ts_to_sql(change.timestamp),
            ],
        )?;
        if n == 0 {
            anyhow::bail!("no score row for symbol {}", change.symbol);
        }

        tx.execute(
            "INSERT INTO score_changes (id, symbol, event_id, old_score, new_score, delta, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                change.symbol,
                change.event_id.to_string(),
                change.old_score,
                change.new_score,
                change.delta,
                ts_to_sql(change.timestamp),
            ],
        )?;

        tx.commit().context("commit commit_score_update")
    }

    /// Processed events referencing `symbol` with `created_at >= since`,
    /// oldest first. Feeds the rolling source-influence window.
    pub async fn processed_events_since(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLS} FROM events
             WHERE processed = 1 AND created_at >= ?2
               AND (symbol = ?1 OR stocks LIKE ?3)
             ORDER BY created_at ASC"
        ))?;
        // Secondary symbols only appear inside the stocks JSON array.
        let needle = format!("%\"{symbol}\"%");
        let mut rows = stmt.query(params![symbol, ts_to_sql(since), needle])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event = event_from_row(row)?;
            if event.stocks.iter().any(|s| s == symbol) {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Recent events referencing `symbol`, newest first.
    pub async fn events_for_symbol(&self, symbol: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLS} FROM events
             WHERE symbol = ?1 OR stocks LIKE ?2
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let needle = format!("%\"{symbol}\"%");
        let mut rows = stmt.query(params![symbol, needle, limit as i64])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event = event_from_row(row)?;
            if event.stocks.iter().any(|s| s == symbol) {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Score changes for `symbol` since `since`, newest first.
    pub async fn score_changes_since(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScoreChange>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, event_id, old_score, new_score, delta, timestamp
             FROM score_changes
             WHERE symbol = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC",
        )?;
        let mut rows = stmt.query(params![symbol, ts_to_sql(since)])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id: String = row.get(1)?;
            let raw_ts: String = row.get(5)?;
            out.push(ScoreChange {
                symbol: row.get(0)?,
                event_id: event_id.parse().context("score_change event_id")?,
                old_score: row.get(2)?,
                new_score: row.get(3)?,
                delta: row.get(4)?,
                timestamp: ts_from_sql(&raw_ts)?,
            });
        }
        Ok(out)
    }

    pub async fn count_events(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n)
    }

    pub async fn last_event_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT MAX(created_at) FROM events", [], |row| row.get(0))
            .optional()?
            .flatten();
        raw.as_deref().map(ts_from_sql).transpose()
    }

    // =========================================================================
    // Audit queue
    // =========================================================================

    pub async fn insert_audit(&self, audit: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO llm_audit (id, event_id, symbol, summary, impact, sources, approved,
                                    approver, reason, created_at, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                audit.id.to_string(),
                audit.event_id.to_string(),
                audit.symbol,
                audit.summary,
                audit.impact,
                sources_to_sql(&audit.sources)?,
                audit.state.to_string(),
                audit.approver,
                audit.reason,
                ts_to_sql(audit.created_at),
                audit.decided_at.map(ts_to_sql),
            ],
        )?;
        Ok(())
    }

    /// Audit records newest first, optionally pending only.
    pub async fn list_audits(&self, pending_only: bool) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().await;
        let sql = if pending_only {
            format!(
                "SELECT {AUDIT_COLS} FROM llm_audit WHERE approved = 'pending'
                 ORDER BY created_at DESC"
            )
        } else {
            format!("SELECT {AUDIT_COLS} FROM llm_audit ORDER BY created_at DESC")
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(audit_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn get_audit(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {AUDIT_COLS} FROM llm_audit WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(audit_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Transition an audit record pending -> approved/rejected exactly once.
    pub async fn decide_audit(
        &self,
        id: Uuid,
        approve: bool,
        approver: &str,
        reason: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<DecideAudit> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin decide_audit")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT approved FROM llm_audit WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let state = match current.as_deref() {
            None => return Ok(DecideAudit::NotFound),
            Some("pending") => {
                if approve {
                    AuditState::Approved
                } else {
                    AuditState::Rejected
                }
            }
            Some(_) => return Ok(DecideAudit::AlreadyDecided),
        };

        tx.execute(
            "UPDATE llm_audit SET approved = ?2, approver = ?3, reason = ?4, decided_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                state.to_string(),
                approver,
                reason,
                ts_to_sql(decided_at),
            ],
        )?;

        let row = tx.query_row(
            &format!("SELECT {AUDIT_COLS} FROM llm_audit WHERE id = ?1"),
            params![id.to_string()],
            |row| {
                audit_from_row(row).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })
            },
        )?;

        tx.commit().context("commit decide_audit")?;
        Ok(DecideAudit::Decided(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{Instrument, LlmMode, SourceRef};

    async fn db_with_instrument(symbol: &str) -> Db {
        let db = Db::open_in_memory(&RuntimeConfig::default()).unwrap();
        db.create_instrument(
            &Instrument {
                symbol: symbol.to_string(),
                name: symbol.to_string(),
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
        db
    }

    fn test_event(symbol: &str, impact: f64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            stocks: vec![symbol.to_string()],
            quick_score: 0.4,
            impact_points: impact,
            summary: "earnings beat expectations".to_string(),
            sources: vec![SourceRef {
                id: "reuters".to_string(),
                url: "https://example.com/a".to_string(),
                trust: 0.9,
            }],
            num_independent_sources: 2,
            llm_mode: LlmMode::Tiny,
            created_at: Utc::now(),
            processed: false,
        }
    }

    #[tokio::test]
    async fn event_roundtrip_and_idempotency_check() {
        let db = db_with_instrument("ELON").await;
        let event = test_event("ELON", 10.0);

        assert!(!db.event_exists(event.event_id).await.unwrap());
        db.insert_event(&event, Some(("abc123", &serde_json::json!({"ok": true}))))
            .await
            .unwrap();
        assert!(db.event_exists(event.event_id).await.unwrap());

        let loaded = db.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "ELON");
        assert!(!loaded.processed);
        assert_eq!(loaded.sources[0].id, "reuters");

        // Duplicate insert violates the primary key.
        assert!(db.insert_event(&event, None).await.is_err());
    }

    #[tokio::test]
    async fn processed_filter_and_window() {
        let db = db_with_instrument("ELON").await;
        let event = test_event("ELON", 5.0);
        db.insert_event(&event, None).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        assert!(db
            .processed_events_since("ELON", since)
            .await
            .unwrap()
            .is_empty());

        db.mark_event_processed(event.event_id).await.unwrap();
        let found = db.processed_events_since("ELON", since).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].processed);
    }

    #[tokio::test]
    async fn score_update_is_atomic_with_change_log() {
        let db = db_with_instrument("ELON").await;
        let event = test_event("ELON", 10.0);
        db.insert_event(&event, None).await.unwrap();

        let now = Utc::now();
        db.commit_score_update(
            &ScoreChange {
                symbol: "ELON".to_string(),
                event_id: event.event_id,
                old_score: 50.0,
                new_score: 52.5,
                delta: 2.5,
                timestamp: now,
            },
            0.2,
            52.5,
        )
        .await
        .unwrap();

        let score = db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 52.5).abs() < 1e-9);
        assert!((score.final_price - 52.5).abs() < 1e-9);

        let changes = db
            .score_changes_since("ELON", now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!((changes[0].delta - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn audit_decides_exactly_once() {
        let db = db_with_instrument("ELON").await;
        let event = test_event("ELON", 18.0);
        db.insert_event(&event, None).await.unwrap();

        let audit = AuditRecord {
            id: Uuid::new_v4(),
            event_id: event.event_id,
            symbol: "ELON".to_string(),
            summary: event.summary.clone(),
            impact: event.impact_points,
            sources: event.sources.clone(),
            state: AuditState::Pending,
            approver: None,
            reason: Some("impact beyond review threshold".to_string()),
            created_at: Utc::now(),
            decided_at: None,
        };
        db.insert_audit(&audit).await.unwrap();

        assert_eq!(db.list_audits(true).await.unwrap().len(), 1);

        let decided = db
            .decide_audit(audit.id, true, "admin1", None, Utc::now())
            .await
            .unwrap();
        match decided {
            DecideAudit::Decided(record) => {
                assert_eq!(record.state, AuditState::Approved);
                assert_eq!(record.approver.as_deref(), Some("admin1"));
                assert!(record.decided_at.is_some());
            }
            other => panic!("expected Decided, got {other:?}"),
        }

        let again = db
            .decide_audit(audit.id, false, "admin2", None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(again, DecideAudit::AlreadyDecided));

        let missing = db
            .decide_audit(Uuid::new_v4(), true, "admin1", None, Utc::now())
            .await
            .unwrap();
        assert!(matches!(missing, DecideAudit::NotFound));

        assert!(db.list_audits(true).await.unwrap().is_empty());
        assert_eq!(db.list_audits(false).await.unwrap().len(), 1);
    }
}
