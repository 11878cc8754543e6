// =============================================================================
// Suspicion rules — manipulation defence at the ingest boundary
// =============================================================================
//
// An event is suspicious when either:
//   1. its absolute impact exceeds the review threshold; or
//   2. counting this event, its primary source would carry more than the
//      allowed share of the symbol's processed impact over the rolling
//      window (only evaluated when that window has any impact at all).
//
// Suspicious events are persisted unprocessed and parked in the audit queue;
// scores are never touched until a human approves.
// =============================================================================

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::warn;

use crate::runtime_config::RuntimeConfig;
use crate::store::Db;
use crate::types::{RealityEvent, StoredEvent};

/// Rule 1: absolute impact beyond the review threshold.
pub fn delta_rule(impact_points: f64, config: &RuntimeConfig) -> Option<String> {
    if impact_points.abs() > config.suspicious_delta {
        Some(format!(
            "impact points ({impact_points:.2}) exceeds review threshold ({:.2})",
            config.suspicious_delta
        ))
    } else {
        None
    }
}

/// Rule 2 numerator/denominator over a window of processed events. The
/// current event's impact is counted toward its source; the denominator is
/// the window alone.
pub fn source_influence(
    window: &[StoredEvent],
    source_id: &str,
    current_impact: f64,
) -> Option<f64> {
    let total: f64 = window.iter().map(|e| e.impact_points.abs()).sum();
    if total <= 0.0 {
        return None;
    }

    let from_source: f64 = window
        .iter()
        .filter(|e| e.sources.iter().any(|s| s.id == source_id))
        .map(|e| e.impact_points)
        .sum();

    Some((from_source + current_impact).abs() / total)
}

/// Evaluate both rules for one symbol. Returns the reason when suspicious.
pub async fn check_suspicious(
    db: &Db,
    symbol: &str,
    event: &RealityEvent,
    config: &RuntimeConfig,
) -> Result<Option<String>> {
    if let Some(reason) = delta_rule(event.impact_points, config) {
        warn!(symbol, event_id = %event.event_id, %reason, "suspicious event");
        return Ok(Some(reason));
    }

    let Some(primary) = event.sources.first() else {
        return Ok(None);
    };

    let since = Utc::now() - Duration::hours(config.rolling_window_hours);
    let window = db.processed_events_since(symbol, since).await?;

    if let Some(influence) = source_influence(&window, &primary.id, event.impact_points) {
        if influence > config.max_single_source_influence_24h {
            let reason = format!(
                "source {} influence ({:.1}%) exceeds max ({:.1}%) in {}h window",
                primary.id,
                influence * 100.0,
                config.max_single_source_influence_24h * 100.0,
                config.rolling_window_hours
            );
            warn!(symbol, event_id = %event.event_id, %reason, "suspicious event");
            return Ok(Some(reason));
        }
    }

    Ok(None)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LlmMode, SourceRef};
    use uuid::Uuid;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    fn event_with(impact: f64, source_ids: &[&str]) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            symbol: "ELON".to_string(),
            stocks: vec!["ELON".to_string()],
            quick_score: 0.1,
            impact_points: impact,
            summary: String::new(),
            sources: source_ids
                .iter()
                .map(|id| SourceRef {
                    id: id.to_string(),
                    url: format!("https://example.com/{id}"),
                    trust: 0.8,
                })
                .collect(),
            num_independent_sources: source_ids.len() as u32,
            llm_mode: LlmMode::Skipped,
            created_at: Utc::now(),
            processed: true,
        }
    }

    #[test]
    fn delta_rule_threshold_is_exclusive() {
        let c = cfg();
        assert!(delta_rule(15.0, &c).is_none());
        assert!(delta_rule(15.1, &c).is_some());
        assert!(delta_rule(-18.0, &c).is_some());
        assert!(delta_rule(2.0, &c).is_none());
    }

    #[test]
    fn influence_includes_current_event_in_numerator() {
        // Window: 10 from "wire", 10 from "blog". A fresh +4 from "wire"
        // pushes wire's share to (10+4)/20 = 0.7.
        let window = vec![event_with(10.0, &["wire"]), event_with(10.0, &["blog"])];
        let influence = source_influence(&window, "wire", 4.0).unwrap();
        assert!((influence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn influence_is_none_on_empty_window() {
        assert!(source_influence(&[], "wire", 4.0).is_none());

        let zero_window = vec![event_with(0.0, &["wire"])];
        assert!(source_influence(&zero_window, "wire", 4.0).is_none());
    }

    #[test]
    fn opposing_impacts_cancel_in_numerator_but_not_denominator() {
        let window = vec![event_with(10.0, &["wire"]), event_with(-10.0, &["wire"])];
        // |10 - 10 + 2| / 20 = 0.1
        let influence = source_influence(&window, "wire", 2.0).unwrap();
        assert!((influence - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn first_event_for_a_symbol_passes_rule_two() {
        let c = cfg();
        let db = Db::open_in_memory(&c).unwrap();
        let event = RealityEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            stocks: vec!["ELON".to_string()],
            quick_score: 0.2,
            impact_points: 10.0,
            summary: "fine".to_string(),
            sources: vec![SourceRef {
                id: "wire".to_string(),
                url: "https://example.com/w".to_string(),
                trust: 0.9,
            }],
            num_independent_sources: 1,
            llm_mode: LlmMode::Skipped,
            meta: serde_json::Value::Null,
        };
        assert!(check_suspicious(&db, "ELON", &event, &c)
            .await
            .unwrap()
            .is_none());
    }
}
