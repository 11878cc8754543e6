// =============================================================================
// Instrument and score rows
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{ts_from_sql, ts_to_sql, Db};
use crate::types::{Instrument, ScoreRow};

/// Result of an instrument create attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateInstrument {
    Created,
    Duplicate,
}

fn instrument_from_row(row: &Row<'_>) -> rusqlite::Result<(Instrument, String)> {
    Ok((
        Instrument {
            symbol: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            market_weight: row.get(3)?,
            reality_weight: row.get(4)?,
            min_price: row.get(5)?,
            max_price: row.get(6)?,
            created_at: Utc::now(), // patched from column 7 below
        },
        row.get::<_, String>(7)?,
    ))
}

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<(ScoreRow, String)> {
    Ok((
        ScoreRow {
            symbol: row.get(0)?,
            reality_score: row.get(1)?,
            final_price: row.get(2)?,
            confidence: row.get(3)?,
            last_updated: Utc::now(), // patched from column 4 below
        },
        row.get::<_, String>(4)?,
    ))
}

const INSTRUMENT_COLS: &str =
    "symbol, name, description, market_weight, reality_weight, min_price, max_price, created_at";
const SCORE_COLS: &str = "symbol, reality_score, final_price, confidence, last_updated";

impl Db {
    /// Create an instrument together with its score row at the neutral
    /// baseline, in one transaction. Returns `Duplicate` if the symbol is
    /// already taken.
    pub async fn create_instrument(
        &self,
        inst: &Instrument,
        neutral_score: f64,
        initial_confidence: f64,
    ) -> Result<CreateInstrument> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin create_instrument")?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT symbol FROM stocks WHERE symbol = ?1",
                params![inst.symbol],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(CreateInstrument::Duplicate);
        }

        tx.execute(
            "INSERT INTO stocks (symbol, name, description, market_weight, reality_weight,
                                 min_price, max_price, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                inst.symbol,
                inst.name,
                inst.description,
                inst.market_weight,
                inst.reality_weight,
                inst.min_price,
                inst.max_price,
                ts_to_sql(inst.created_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO scores (symbol, reality_score, final_price, confidence, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                inst.symbol,
                neutral_score,
                neutral_score,
                initial_confidence,
                ts_to_sql(inst.created_at),
            ],
        )?;

        tx.commit().context("commit create_instrument")?;
        Ok(CreateInstrument::Created)
    }

    pub async fn get_instrument(&self, symbol: &str) -> Result<Option<Instrument>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INSTRUMENT_COLS} FROM stocks WHERE symbol = ?1"
        ))?;
        let found = stmt
            .query_row(params![symbol], instrument_from_row)
            .optional()?;
        found
            .map(|(mut inst, raw_ts)| {
                inst.created_at = ts_from_sql(&raw_ts)?;
                Ok(inst)
            })
            .transpose()
    }

    pub async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INSTRUMENT_COLS} FROM stocks ORDER BY symbol ASC"
        ))?;
        let rows = stmt.query_map([], instrument_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            let (mut inst, raw_ts) = row?;
            inst.created_at = ts_from_sql(&raw_ts)?;
            out.push(inst);
        }
        Ok(out)
    }

    /// Update the blend weights. The only mutable instrument fields.
    pub async fn update_instrument_weights(
        &self,
        symbol: &str,
        market_weight: f64,
        reality_weight: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE stocks SET market_weight = ?2, reality_weight = ?3 WHERE symbol = ?1",
            params![symbol, market_weight, reality_weight],
        )?;
        Ok(n > 0)
    }

    pub async fn get_score(&self, symbol: &str) -> Result<Option<ScoreRow>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {SCORE_COLS} FROM scores WHERE symbol = ?1"))?;
        let found = stmt.query_row(params![symbol], score_from_row).optional()?;
        found
            .map(|(mut score, raw_ts)| {
                score.last_updated = ts_from_sql(&raw_ts)?;
                Ok(score)
            })
            .transpose()
    }

    pub async fn list_scores(&self) -> Result<Vec<ScoreRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCORE_COLS} FROM scores ORDER BY symbol ASC"
        ))?;
        let rows = stmt.query_map([], score_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            let (mut score, raw_ts) = row?;
            score.last_updated = ts_from_sql(&raw_ts)?;
            out.push(score);
        }
        Ok(out)
    }

    /// Overwrite the score row with decayed-and-updated values. Used by the
    /// blender's trade-triggered pass (no score change is logged there; event
    /// applications go through [`Db::commit_score_update`] instead).
    pub async fn write_score(
        &self,
        symbol: &str,
        reality_score: f64,
        final_price: f64,
        last_updated: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE scores SET reality_score = ?2, final_price = ?3, last_updated = ?4
             WHERE symbol = ?1",
            params![symbol, reality_score, final_price, ts_to_sql(last_updated)],
        )?;
        Ok(n > 0)
    }

    pub async fn count_instruments(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row("SELECT COUNT(*) FROM stocks", [], |row| row.get(0))?;
        Ok(n)
    }
}
