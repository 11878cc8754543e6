// =============================================================================
// Blender — final price from reality score + market price
// =============================================================================
//
//   final_raw = market_weight · market_price + reality_weight · reality_score
//   final_new = α · final_raw + (1 − α) · final_prev
//
// both clamped to the instrument's [min_price, max_price]. When the market
// side is unavailable (no book, fetch timeout), the raw final IS the reality
// score.
//
// Blend passes are triggered by (a) reality-score commits — run inline in the
// ingest path's symbol region — and (b) trade commits, which go through the
// BlendScheduler below. The scheduler's pending set collapses trigger bursts
// into at most one queued pass per symbol.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::SymbolLocks;
use crate::broadcast::{BlendWeights, Broadcaster, FeedMessage, FinalComponents};
use crate::matching::{MarketPressure, MatchingEngine};
use crate::runtime_config::RuntimeConfig;
use crate::scoring::reality_engine::{decayed_score, ewma};
use crate::store::Db;
use crate::types::Instrument;

// =============================================================================
// Pure blend math
// =============================================================================

/// Weighted blend, clamped to the instrument's price band. A missing market
/// side falls back to the reality score alone.
pub fn blend_components(reality: f64, market: Option<f64>, inst: &Instrument) -> f64 {
    let raw = match market {
        Some(market_price) => {
            inst.market_weight * market_price + inst.reality_weight * reality
        }
        None => reality,
    };
    raw.clamp(inst.min_price, inst.max_price)
}

/// EWMA the raw blend toward the previous committed final, clamped again.
pub fn smoothed_final(prev_final: f64, raw: f64, alpha: f64, inst: &Instrument) -> f64 {
    ewma(prev_final, raw, alpha).clamp(inst.min_price, inst.max_price)
}

// =============================================================================
// Market feed
// =============================================================================

/// Where the blender reads market pressure from: the in-process matching
/// engine, or a separate matching service over HTTP (bounded timeout; expiry
/// means "market unavailable", never an error).
pub enum MarketFeed {
    Local(Arc<MatchingEngine>),
    Remote {
        client: reqwest::Client,
        base_url: String,
        timeout: Duration,
    },
}

impl MarketFeed {
    pub fn remote(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self::Remote {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Fetch the current pressure snapshot for `symbol`, or `None` when the
    /// market side is unavailable.
    pub async fn pressure(&self, symbol: &str) -> Option<MarketPressure> {
        match self {
            Self::Local(engine) => engine.try_pressure(symbol).await,
            Self::Remote {
                client,
                base_url,
                timeout,
            } => {
                let url = format!("{base_url}/market/{symbol}/pressure");
                let resp = client.get(&url).timeout(*timeout).send().await;
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<MarketPressure>().await {
                            Ok(pressure) => Some(pressure),
                            Err(e) => {
                                warn!(symbol, error = %e, "malformed pressure response");
                                None
                            }
                        }
                    }
                    Ok(resp) => {
                        warn!(symbol, status = %resp.status(), "pressure fetch rejected");
                        None
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "pressure fetch failed");
                        None
                    }
                }
            }
        }
    }
}

// =============================================================================
// Trigger scheduler
// =============================================================================

/// De-duplicating trigger queue for trade-driven blend passes. Triggers
/// landing while a symbol is already queued collapse into the queued pass;
/// triggers landing while its pass runs (after `begin`) queue one more.
pub struct BlendScheduler {
    tx: mpsc::UnboundedSender<String>,
    pending: Mutex<HashSet<String>>,
}

impl BlendScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }

    /// Request a blend pass for `symbol`.
    pub fn trigger(&self, symbol: &str) {
        let mut pending = self.pending.lock();
        if pending.insert(symbol.to_string()) {
            // Send can only fail at shutdown, when the worker is gone anyway.
            let _ = self.tx.send(symbol.to_string());
        } else {
            debug!(symbol, "blend trigger collapsed into queued pass");
        }
    }

    /// Mark a pass as started so later triggers queue a fresh one.
    pub fn begin(&self, symbol: &str) {
        self.pending.lock().remove(symbol);
    }
}

// =============================================================================
// Blender
// =============================================================================

pub struct Blender {
    db: Arc<Db>,
    feed: MarketFeed,
    broadcaster: Broadcaster,
    config: Arc<RwLock<RuntimeConfig>>,
    locks: Arc<SymbolLocks>,
}

impl Blender {
    pub fn new(
        db: Arc<Db>,
        feed: MarketFeed,
        broadcaster: Broadcaster,
        config: Arc<RwLock<RuntimeConfig>>,
        locks: Arc<SymbolLocks>,
    ) -> Self {
        Self {
            db,
            feed,
            broadcaster,
            config,
            locks,
        }
    }

    pub async fn fetch_pressure(&self, symbol: &str) -> Option<MarketPressure> {
        self.feed.pressure(symbol).await
    }

    /// One trade-triggered blend pass: re-read the (decayed) reality score,
    /// blend it with the fresh market price, and commit the smoothed final.
    /// The market fetch happens before the symbol region is taken.
    pub async fn run_pass(&self, symbol: &str) -> Result<()> {
        let pressure = self.fetch_pressure(symbol).await;

        let lock = self.locks.for_symbol(symbol);
        let _guard = lock.lock().await;

        let Some(score) = self.db.get_score(symbol).await? else {
            debug!(symbol, "blend pass skipped: no score row");
            return Ok(());
        };
        let inst = self
            .db
            .get_instrument(symbol)
            .await?
            .context("score row without instrument")?;

        let (tau, neutral, alpha, lo, hi) = {
            let cfg = self.config.read();
            (
                cfg.tau_seconds(),
                cfg.neutral_score,
                cfg.ewma_alpha,
                cfg.min_price,
                cfg.max_price,
            )
        };

        let now = Utc::now();
        let age_secs = (now - score.last_updated).num_milliseconds() as f64 / 1000.0;
        let reality = decayed_score(score.reality_score, age_secs, tau, neutral).clamp(lo, hi);

        let market = pressure.as_ref().map(|p| p.market_price);
        let raw = blend_components(reality, market, &inst);
        let final_price = smoothed_final(score.final_price, raw, alpha, &inst);

        self.db
            .write_score(symbol, reality, final_price, now)
            .await
            .context("persist blended final")?;

        info!(
            symbol,
            reality,
            ?market,
            final_price,
            "final price committed"
        );

        self.broadcaster.publish(FeedMessage::FinalUpdate {
            symbol: symbol.to_string(),
            final_price,
            components: FinalComponents {
                market,
                reality,
                weights: BlendWeights {
                    market: inst.market_weight,
                    reality: inst.reality_weight,
                },
            },
            ts: now,
        });

        Ok(())
    }
}

/// Drain the trigger queue forever. Spawned once at startup.
pub async fn run_blend_worker(
    blender: Arc<Blender>,
    scheduler: Arc<BlendScheduler>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    info!("blend worker started");
    while let Some(symbol) = rx.recv().await {
        scheduler.begin(&symbol);
        if let Err(e) = blender.run_pass(&symbol).await {
            warn!(symbol = %symbol, error = %e, "blend pass failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(market_weight: f64, reality_weight: f64) -> Instrument {
        Instrument {
            symbol: "ELON".to_string(),
            name: "Elon".to_string(),
            description: String::new(),
            market_weight,
            reality_weight,
            min_price: 0.0,
            max_price: 100.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn blend_with_single_sided_market() {
        // best_bid 90, reality 50, weights (0.6, 0.4):
        // raw = 0.6·90 + 0.4·50 = 74; smoothed from prev 50 → 56.
        let inst = inst(0.6, 0.4);
        let raw = blend_components(50.0, Some(90.0), &inst);
        assert!((raw - 74.0).abs() < 1e-12);
        let committed = smoothed_final(50.0, raw, 0.25, &inst);
        assert!((committed - 56.0).abs() < 1e-12);
    }

    #[test]
    fn missing_market_falls_back_to_reality() {
        let inst = inst(0.6, 0.4);
        assert!((blend_components(52.5, None, &inst) - 52.5).abs() < f64::EPSILON);
    }

    #[test]
    fn blend_clamps_to_instrument_band() {
        let mut tight = inst(0.5, 0.5);
        tight.min_price = 40.0;
        tight.max_price = 60.0;
        assert!((blend_components(100.0, Some(100.0), &tight) - 60.0).abs() < f64::EPSILON);
        assert!((blend_components(0.0, Some(0.0), &tight) - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn scheduler_collapses_duplicate_triggers() {
        let (scheduler, mut rx) = BlendScheduler::new();
        scheduler.trigger("ELON");
        scheduler.trigger("ELON");
        scheduler.trigger("MARS");

        assert_eq!(rx.try_recv().unwrap(), "ELON");
        assert_eq!(rx.try_recv().unwrap(), "MARS");
        assert!(rx.try_recv().is_err());

        // After a pass begins, a new trigger queues one more pass.
        scheduler.begin("ELON");
        scheduler.trigger("ELON");
        assert_eq!(rx.try_recv().unwrap(), "ELON");
    }
}
