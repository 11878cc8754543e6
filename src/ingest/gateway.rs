// =============================================================================
// Ingest Gateway — authenticated event intake
// =============================================================================
//
// Validation order (fail fast, distinct error kinds):
//   1. signature over the canonical payload bytes
//   2. schema + range checks
//   3. idempotency (known event_id => Duplicate, observable, not an error)
//   4. every referenced symbol exists
//   5. suspicion rules => persist unprocessed + audit queue + PendingReview
//   6. persist + apply scores synchronously + mark processed => Created
//
// Scores are applied symbol by symbol, each inside its own critical region;
// the market-price fetch happens before the region is taken. A persistence
// failure leaves the event unprocessed with no score change emitted, so a
// retry recomputes from the persisted checkpoint.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::verify_signature;
use crate::api::error::ApiError;
use crate::app_state::SymbolLocks;
use crate::blender::{blend_components, smoothed_final, Blender};
use crate::broadcast::{BlendWeights, Broadcaster, FeedMessage, FinalComponents};
use crate::ingest::canonical::canonicalize;
use crate::ingest::suspicion::check_suspicious;
use crate::runtime_config::RuntimeConfig;
use crate::scoring::reality_engine::{apply_impact, boosted_confidence, decayed_score};
use crate::store::Db;
use crate::types::{AuditRecord, AuditState, LlmMode, RealityEvent, ScoreChange, StoredEvent};

/// Decision returned to the event producer.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Event accepted and applied. 201.
    Created { event_id: Uuid },
    /// Event id already known; nothing changed. 200.
    Duplicate { event_id: Uuid },
    /// Event quarantined for admin review; scores untouched. 202.
    PendingReview { event_id: Uuid, reason: String },
}

pub struct IngestGateway {
    db: Arc<Db>,
    locks: Arc<SymbolLocks>,
    blender: Arc<Blender>,
    broadcaster: Broadcaster,
    config: Arc<RwLock<RuntimeConfig>>,
    secret: String,
}

impl IngestGateway {
    pub fn new(
        db: Arc<Db>,
        locks: Arc<SymbolLocks>,
        blender: Arc<Blender>,
        broadcaster: Broadcaster,
        config: Arc<RwLock<RuntimeConfig>>,
        secret: String,
    ) -> Self {
        Self {
            db,
            locks,
            blender,
            broadcaster,
            config,
            secret,
        }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Run the full intake pipeline on the exact bytes received.
    pub async fn ingest(
        &self,
        raw: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, ApiError> {
        // 1. Signature over the canonical serialisation of the payload.
        let Some(signature) = signature else {
            return Err(ApiError::Unauthorized("missing signature".to_string()));
        };
        let (value, canonical) = canonicalize(raw)
            .map_err(|e| ApiError::Validation(format!("payload is not valid JSON: {e}")))?;
        if !verify_signature(&self.secret, &canonical, signature) {
            warn!("event signature verification failed");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }

        // 2. Schema and range checks.
        let event: RealityEvent = serde_json::from_value(value)
            .map_err(|e| ApiError::Validation(format!("event schema: {e}")))?;
        self.validate_ranges(&event)?;

        // 3. Idempotency before any expensive work.
        if self.db.event_exists(event.event_id).await? {
            info!(event_id = %event.event_id, "duplicate event replayed");
            return Ok(IngestOutcome::Duplicate {
                event_id: event.event_id,
            });
        }

        // 4. Every referenced symbol must exist.
        for symbol in &event.stocks {
            if self.db.get_instrument(symbol).await?.is_none() {
                return Err(ApiError::BadRequest(format!("unknown symbol {symbol:?}")));
            }
        }

        // 5. Suspicion gate.
        let config = self.config.read().clone();
        for symbol in &event.stocks {
            if let Some(reason) = check_suspicious(&self.db, symbol, &event, &config).await? {
                return self.quarantine(&event, symbol, reason).await;
            }
        }

        // 6. Persist and apply synchronously.
        let stored = to_stored(&event);
        let llm_call = match event.llm_mode {
            LlmMode::Skipped => None,
            _ => Some((
                hex::encode(Sha256::digest(&canonical)),
                serde_json::json!({ "summary": event.summary }),
            )),
        };
        self.db
            .insert_event(
                &stored,
                llm_call.as_ref().map(|(hash, out)| (hash.as_str(), out)),
            )
            .await?;

        self.apply_event(&stored).await?;

        info!(event_id = %event.event_id, stocks = ?event.stocks, "event applied");
        Ok(IngestOutcome::Created {
            event_id: event.event_id,
        })
    }

    fn validate_ranges(&self, event: &RealityEvent) -> Result<(), ApiError> {
        let config = self.config.read();
        let fail = |detail: String| Err(ApiError::Validation(detail));

        if event.stocks.is_empty() {
            return fail("stocks must not be empty".to_string());
        }
        if event.stocks.iter().any(|s| s.trim().is_empty()) {
            return fail("stocks entries must not be blank".to_string());
        }
        if !(-1.0..=1.0).contains(&event.quick_score) {
            return fail(format!("quick_score {} outside [-1, 1]", event.quick_score));
        }
        if event.impact_points.abs() > config.delta_cap || !event.impact_points.is_finite() {
            return fail(format!(
                "impact_points {} outside [-{}, {}]",
                event.impact_points, config.delta_cap, config.delta_cap
            ));
        }
        if event.summary.chars().count() > config.max_summary_chars {
            return fail(format!(
                "summary exceeds {} characters",
                config.max_summary_chars
            ));
        }
        if event.sources.is_empty() {
            return fail("sources must not be empty".to_string());
        }
        if let Some(bad) = event
            .sources
            .iter()
            .find(|s| !(0.0..=1.0).contains(&s.trust))
        {
            return fail(format!("source {:?} trust outside [0, 1]", bad.id));
        }
        if event.num_independent_sources < 1 {
            return fail("num_independent_sources must be >= 1".to_string());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Suspicious path
    // -------------------------------------------------------------------------

    async fn quarantine(
        &self,
        event: &RealityEvent,
        symbol: &str,
        reason: String,
    ) -> Result<IngestOutcome, ApiError> {
        let stored = to_stored(event);
        self.db.insert_event(&stored, None).await?;

        let audit = AuditRecord {
            id: Uuid::new_v4(),
            event_id: event.event_id,
            symbol: symbol.to_string(),
            summary: event.summary.clone(),
            impact: event.impact_points,
            sources: event.sources.clone(),
            state: AuditState::Pending,
            approver: None,
            reason: Some(reason.clone()),
            created_at: Utc::now(),
            decided_at: None,
        };
        self.db.insert_audit(&audit).await?;

        self.broadcaster.publish(FeedMessage::AuditEvent {
            event_id: event.event_id,
            symbol: symbol.to_string(),
            delta: event.impact_points,
            state: "pending_review".to_string(),
            reason: Some(reason.clone()),
            ts: audit.created_at,
        });

        warn!(event_id = %event.event_id, symbol, %reason, "event quarantined for review");
        Ok(IngestOutcome::PendingReview {
            event_id: event.event_id,
            reason,
        })
    }

    // -------------------------------------------------------------------------
    // Normal path (also taken on audit approval)
    // -------------------------------------------------------------------------

    /// Apply a persisted event to every referenced symbol, then flip its
    /// processed flag. Symbols are handled one region at a time; there is no
    /// cross-symbol atomicity by design.
    pub async fn apply_event(&self, event: &StoredEvent) -> Result<(), ApiError> {
        for symbol in &event.stocks {
            self.apply_to_symbol(event, symbol).await?;
        }
        self.db.mark_event_processed(event.event_id).await?;
        Ok(())
    }

    async fn apply_to_symbol(&self, event: &StoredEvent, symbol: &str) -> Result<(), ApiError> {
        // Market fetch suspends, so it happens before the region is taken.
        let pressure = self.blender.fetch_pressure(symbol).await;

        let lock = self.locks.for_symbol(symbol);
        let _guard = lock.lock().await;

        let score = self
            .db
            .get_score(symbol)
            .await?
            .with_context(|| format!("no score row for {symbol}"))?;
        let inst = self
            .db
            .get_instrument(symbol)
            .await?
            .with_context(|| format!("no instrument row for {symbol}"))?;
        let config = self.config.read().clone();

        let now = Utc::now();
        let age_secs = (now - score.last_updated).num_milliseconds() as f64 / 1000.0;
        let decayed = decayed_score(
            score.reality_score,
            age_secs,
            config.tau_seconds(),
            config.neutral_score,
        )
        .clamp(config.min_price, config.max_price);

        let new_reality = apply_impact(decayed, event.impact_points, &config);
        let confidence = boosted_confidence(score.confidence, event.num_independent_sources);

        let market = pressure.as_ref().map(|p| p.market_price);
        let raw_final = blend_components(new_reality, market, &inst);
        let new_final = smoothed_final(score.final_price, raw_final, config.ewma_alpha, &inst);

        let change = ScoreChange {
            symbol: symbol.to_string(),
            event_id: event.event_id,
            old_score: decayed,
            new_score: new_reality,
            delta: new_reality - decayed,
            timestamp: now,
        };

        // One atomic step: score row + score-change log. A failure here
        // leaves the event unprocessed and emits nothing.
        self.db
            .commit_score_update(&change, confidence, new_final)
            .await?;

        info!(
            symbol,
            event_id = %event.event_id,
            old = change.old_score,
            new = change.new_score,
            final_price = new_final,
            "reality score committed"
        );

        self.broadcaster.publish(FeedMessage::RealityUpdate {
            symbol: symbol.to_string(),
            reality_score: new_reality,
            delta: change.delta,
            event_id: event.event_id,
            ts: now,
        });
        if let Some(p) = &pressure {
            self.broadcaster.publish(FeedMessage::MarketUpdate {
                symbol: symbol.to_string(),
                market_price: p.market_price,
                buy_volume: p.buy_volume,
                sell_volume: p.sell_volume,
                net_pressure: p.net_pressure,
                ts: p.timestamp,
            });
        }
        self.broadcaster.publish(FeedMessage::FinalUpdate {
            symbol: symbol.to_string(),
            final_price: new_final,
            components: FinalComponents {
                market,
                reality: new_reality,
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

fn to_stored(event: &RealityEvent) -> StoredEvent {
    StoredEvent {
        event_id: event.event_id,
        symbol: event.stocks[0].clone(),
        stocks: event.stocks.clone(),
        quick_score: event.quick_score,
        impact_points: event.impact_points,
        summary: event.summary.clone(),
        sources: event.sources.clone(),
        num_independent_sources: event.num_independent_sources,
        llm_mode: event.llm_mode,
        created_at: Utc::now(),
        processed: false,
    }
}

// =============================================================================
// Tests — full intake pipeline over an in-memory store
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::sign_payload;
    use crate::audit::AuditDesk;
    use crate::blender::{BlendScheduler, MarketFeed};
    use crate::matching::engine::PlaceOrderRequest;
    use crate::matching::MatchingEngine;
    use crate::types::{Instrument, OrderSide, OrderType};

    const SECRET: &str = "test-ingest-secret";

    struct Harness {
        db: Arc<Db>,
        broadcaster: Broadcaster,
        matching: Arc<MatchingEngine>,
        gateway: Arc<IngestGateway>,
        audit: AuditDesk,
    }

    async fn harness() -> Harness {
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        let db = Arc::new(Db::open_in_memory(&config.read().clone()).unwrap());
        let broadcaster = Broadcaster::new();
        let locks = Arc::new(SymbolLocks::new());
        let (scheduler, _blend_rx) = BlendScheduler::new();

        let matching = Arc::new(MatchingEngine::new(
            db.clone(),
            config.clone(),
            broadcaster.clone(),
            Arc::new(scheduler),
        ));
        let blender = Arc::new(crate::blender::Blender::new(
            db.clone(),
            MarketFeed::Local(matching.clone()),
            broadcaster.clone(),
            config.clone(),
            locks.clone(),
        ));
        let gateway = Arc::new(IngestGateway::new(
            db.clone(),
            locks,
            blender,
            broadcaster.clone(),
            config.clone(),
            SECRET.to_string(),
        ));
        let audit = AuditDesk::new(db.clone(), gateway.clone(), broadcaster.clone());

        db.create_instrument(
            &Instrument {
                symbol: "ELON".to_string(),
                name: "Elon Musk".to_string(),
                description: String::new(),
                market_weight: 0.6,
                reality_weight: 0.4,
                min_price: 0.0,
                max_price: 100.0,
                created_at: Utc::now(),
            },
            50.0,
            0.1,
        )
        .await
        .unwrap();

        Harness {
            db,
            broadcaster,
            matching,
            gateway,
            audit,
        }
    }

    fn payload(event_id: Uuid, impact: f64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event_id": event_id,
            "timestamp": Utc::now().to_rfc3339(),
            "stocks": ["ELON"],
            "quick_score": 0.5,
            "impact_points": impact,
            "summary": "launch succeeded",
            "sources": [{"id": "wire", "url": "https://example.com/a", "trust": 0.9}],
            "num_independent_sources": 1,
            "llm_mode": "tiny",
        }))
        .unwrap()
    }

    fn signed(raw: &[u8]) -> String {
        let (_, canonical) = canonicalize(raw).unwrap();
        sign_payload(SECRET, &canonical)
    }

    #[tokio::test]
    async fn fresh_positive_event_scores_and_blends() {
        let h = harness().await;
        let mut feed = h.broadcaster.subscribe();
        let raw = payload(Uuid::new_v4(), 10.0);

        let outcome = h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap();
        let event_id = match outcome {
            IngestOutcome::Created { event_id } => event_id,
            other => panic!("expected Created, got {other:?}"),
        };

        // 0.25·(50+10) + 0.75·50 = 52.5; no market side => final = reality.
        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 52.5).abs() < 1e-6);
        assert!((score.final_price - 52.5).abs() < 1e-6);
        let expected_conf = 0.1 + 0.1 * 2.0f64.ln();
        assert!((score.confidence - expected_conf).abs() < 1e-9);

        let changes = h
            .db
            .score_changes_since("ELON", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!((changes[0].old_score - 50.0).abs() < 1e-6);
        assert!((changes[0].new_score - 52.5).abs() < 1e-6);
        assert!((changes[0].delta - 2.5).abs() < 1e-6);

        assert!(h.db.get_event(event_id).await.unwrap().unwrap().processed);

        // reality_update then final_update; no market_update (empty market).
        assert!(matches!(
            feed.try_recv().unwrap(),
            FeedMessage::RealityUpdate { .. }
        ));
        match feed.try_recv().unwrap() {
            FeedMessage::FinalUpdate {
                final_price,
                components,
                ..
            } => {
                assert!((final_price - 52.5).abs() < 1e-6);
                assert!(components.market.is_none());
            }
            other => panic!("expected final_update, got {other:?}"),
        }
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn replaying_an_event_is_a_cheap_duplicate() {
        let h = harness().await;
        let raw = payload(Uuid::new_v4(), 10.0);
        let sig = signed(&raw);

        let first = h.gateway.ingest(&raw, Some(&sig)).await.unwrap();
        assert!(matches!(first, IngestOutcome::Created { .. }));

        let second = h.gateway.ingest(&raw, Some(&sig)).await.unwrap();
        assert!(matches!(second, IngestOutcome::Duplicate { .. }));

        // No additional score change, no score drift.
        let changes = h
            .db
            .score_changes_since("ELON", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 52.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn impact_beyond_cap_is_rejected_with_no_state_change() {
        let h = harness().await;
        let raw = payload(Uuid::new_v4(), 100.0);

        let err = h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        assert_eq!(h.db.count_events().await.unwrap(), 0);
        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_symbol_is_a_bad_request() {
        let h = harness().await;
        let raw = serde_json::to_vec(&serde_json::json!({
            "event_id": Uuid::new_v4(),
            "timestamp": Utc::now().to_rfc3339(),
            "stocks": ["NOPE"],
            "quick_score": 0.5,
            "impact_points": 5.0,
            "summary": "s",
            "sources": [{"id": "wire", "url": "https://example.com/a", "trust": 0.9}],
            "num_independent_sources": 1,
            "llm_mode": "skipped",
        }))
        .unwrap();

        let err = h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(h.db.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_or_wrong_signature_is_unauthorized() {
        let h = harness().await;
        let raw = payload(Uuid::new_v4(), 5.0);

        let err = h.gateway.ingest(&raw, None).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let err = h
            .gateway
            .ingest(&raw, Some(&sign_payload("wrong-secret", &raw)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        assert_eq!(h.db.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reordered_json_verifies_under_the_same_signature() {
        let h = harness().await;
        let event_id = Uuid::new_v4();
        let ts = Utc::now().to_rfc3339();
        let sig = {
            let raw = serde_json::to_vec(&serde_json::json!({
                "event_id": event_id,
                "timestamp": ts,
                "stocks": ["ELON"],
                "quick_score": 0.5,
                "impact_points": 3.0,
                "summary": "s",
                "sources": [{"id": "wire", "url": "https://example.com/a", "trust": 0.9}],
                "num_independent_sources": 1,
                "llm_mode": "skipped",
            }))
            .unwrap();
            signed(&raw)
        };

        // Same content, different key order, extra whitespace.
        let reordered = format!(
            "{{ \"llm_mode\": \"skipped\", \"num_independent_sources\": 1,
                \"sources\": [{{\"trust\": 0.9, \"url\": \"https://example.com/a\", \"id\": \"wire\"}}],
                \"summary\": \"s\", \"impact_points\": 3.0, \"quick_score\": 0.5,
                \"stocks\": [\"ELON\"], \"timestamp\": \"{ts}\", \"event_id\": \"{event_id}\" }}"
        );

        let outcome = h
            .gateway
            .ingest(reordered.as_bytes(), Some(&sig))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn suspicious_event_parks_then_applies_on_approval() {
        let h = harness().await;
        let mut feed = h.broadcaster.subscribe();
        let raw = payload(Uuid::new_v4(), 18.0);

        let outcome = h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap();
        let (event_id, reason) = match outcome {
            IngestOutcome::PendingReview { event_id, reason } => (event_id, reason),
            other => panic!("expected PendingReview, got {other:?}"),
        };
        assert!(reason.contains("review threshold"));

        // Scores untouched, event persisted unprocessed, audit pending.
        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 50.0).abs() < 1e-9);
        assert!(!h.db.get_event(event_id).await.unwrap().unwrap().processed);
        let pending = h.audit.list(true).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            feed.try_recv().unwrap(),
            FeedMessage::AuditEvent { .. }
        ));

        // Approval applies the event exactly as the normal path would:
        // 0.25·(50+18) + 0.75·50 = 54.5.
        let record = h
            .audit
            .decide(pending[0].id, "admin1", true, None)
            .await
            .unwrap();
        assert_eq!(record.state, AuditState::Approved);
        assert_eq!(record.approver.as_deref(), Some("admin1"));

        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 54.5).abs() < 1e-6);
        assert!((score.final_price - 54.5).abs() < 1e-6);
        assert!(h.db.get_event(event_id).await.unwrap().unwrap().processed);

        // Exactly-once: a second decision conflicts.
        let err = h
            .audit
            .decide(pending[0].id, "admin2", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn rejected_audit_never_touches_scores() {
        let h = harness().await;
        let raw = payload(Uuid::new_v4(), 17.0);
        let outcome = h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap();
        let IngestOutcome::PendingReview { event_id, .. } = outcome else {
            panic!("expected PendingReview");
        };

        let pending = h.audit.list(true).await.unwrap();
        let record = h
            .audit
            .decide(pending[0].id, "admin1", false, Some("single-source push"))
            .await
            .unwrap();
        assert_eq!(record.state, AuditState::Rejected);
        assert_eq!(record.reason.as_deref(), Some("single-source push"));

        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 50.0).abs() < 1e-9);
        assert!(!h.db.get_event(event_id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn blend_pulls_the_live_order_book() {
        let h = harness().await;

        // Only bids at 90: market price = best bid = 90.
        h.matching
            .place_order(PlaceOrderRequest {
                symbol: "ELON".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                price: Some(90.0),
                qty: 10.0,
                user_id: "maker".to_string(),
            })
            .await
            .unwrap();

        // Zero-impact event: reality stays 50, so the blend is pure market
        // mix: raw = 0.6·90 + 0.4·50 = 74, smoothed = 0.25·74 + 0.75·50 = 56.
        let raw = payload(Uuid::new_v4(), 0.0);
        h.gateway.ingest(&raw, Some(&signed(&raw))).await.unwrap();

        let score = h.db.get_score("ELON").await.unwrap().unwrap();
        assert!((score.reality_score - 50.0).abs() < 1e-6);
        assert!((score.final_price - 56.0).abs() < 1e-6);
    }
}
