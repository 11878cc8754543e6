// =============================================================================
// Reality Engine — lazy decay, impact cap, EWMA smoothing
// =============================================================================
//
// Score mechanics, composed in this order and no other:
//   1. lazy decay toward neutral:  s' = s·e^(−age/τ) + neutral·(1 − e^(−age/τ))
//   2. per-event cap:              d  = clamp(impact, −cap, +cap)
//   3. EWMA:                       s″ = α·(s' + d) + (1 − α)·s'
//   4. clamp to [min, max]
//
// Decay is computed on access, never by a timer. Reads return the decayed
// value WITHOUT persisting it; only writes persist the decayed-then-updated
// value and bump last_updated.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::runtime_config::RuntimeConfig;
use crate::store::Db;
use crate::types::ScoreRow;

// =============================================================================
// Pure score math
// =============================================================================

/// Decay `current` toward `neutral` by `age_secs` of elapsed time.
pub fn decayed_score(current: f64, age_secs: f64, tau_secs: f64, neutral: f64) -> f64 {
    let decay = (-age_secs.max(0.0) / tau_secs).exp();
    current * decay + neutral * (1.0 - decay)
}

/// Clamp an event's impact to the per-event cap.
pub fn capped_impact(impact: f64, cap: f64) -> f64 {
    impact.clamp(-cap, cap)
}

/// EWMA step: pull `prev` toward `target` by factor `alpha`.
pub fn ewma(prev: f64, target: f64, alpha: f64) -> f64 {
    alpha * target + (1.0 - alpha) * prev
}

/// Apply a capped impact to an already-decayed score: EWMA toward
/// (decayed + capped), then clamp.
pub fn apply_impact(decayed: f64, impact: f64, config: &RuntimeConfig) -> f64 {
    let capped = capped_impact(impact, config.delta_cap);
    let smoothed = ewma(decayed, decayed + capped, config.ewma_alpha);
    smoothed.clamp(config.min_price, config.max_price)
}

/// Confidence grows logarithmically with corroborating documents and never
/// decreases here (only an explicit admin action may lower it).
pub fn boosted_confidence(prev: f64, num_related_docs: u32) -> f64 {
    let boost = 0.1 * (1.0 + f64::from(num_related_docs)).ln();
    (prev + boost).min(1.0)
}

// =============================================================================
// Engine
// =============================================================================

/// Read-side view of a score with lazy decay applied.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreView {
    pub symbol: String,
    pub reality_score: f64,
    pub final_price: f64,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
    pub time_since_update_hours: f64,
}

/// Long-lived scoring engine over the durable score rows.
pub struct RealityEngine {
    db: Arc<Db>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl RealityEngine {
    pub fn new(db: Arc<Db>, config: Arc<RwLock<RuntimeConfig>>) -> Self {
        Self { db, config }
    }

    /// Decay a stored row as of `now` without touching persistent state.
    pub fn decayed_view(&self, row: &ScoreRow, now: DateTime<Utc>) -> ScoreView {
        let cfg = self.config.read();
        let age_secs = (now - row.last_updated).num_milliseconds() as f64 / 1000.0;
        let decayed = decayed_score(
            row.reality_score,
            age_secs,
            cfg.tau_seconds(),
            cfg.neutral_score,
        )
        .clamp(cfg.min_price, cfg.max_price);

        debug!(
            symbol = %row.symbol,
            stored = row.reality_score,
            decayed,
            age_hours = age_secs / 3600.0,
            "score decayed on read"
        );

        ScoreView {
            symbol: row.symbol.clone(),
            reality_score: decayed,
            final_price: row.final_price,
            confidence: row.confidence,
            last_updated: row.last_updated,
            time_since_update_hours: age_secs / 3600.0,
        }
    }

    /// Current decayed score for one symbol. Pure read; repeated calls with
    /// no intervening write return the same value for the same `now`.
    pub async fn read_score(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ScoreView>> {
        let row = self.db.get_score(symbol).await?;
        Ok(row.map(|r| self.decayed_view(&r, now)))
    }

    /// Decayed views for every instrument.
    pub async fn read_all_scores(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScoreView>> {
        let rows = self.db.list_scores().await?;
        Ok(rows.iter().map(|r| self.decayed_view(r, now)).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
