// =============================================================================
// Broadcast hub — typed push feed for subscribers
// =============================================================================
//
// Commits fan out as typed messages over a tokio broadcast channel. Delivery
// is best effort: a subscriber that lags or disconnects is dropped by its own
// connection task and never blocks a commit.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Channel capacity before slow subscribers start lagging out.
const FEED_CAPACITY: usize = 256;

/// Every message pushed to subscribers. The `type` tag on the wire matches
/// the variant name in snake_case.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// A reality-score commit.
    RealityUpdate {
        symbol: String,
        reality_score: f64,
        delta: f64,
        event_id: Uuid,
        ts: DateTime<Utc>,
    },
    /// An order-book change (placement, fill, or cancel).
    MarketUpdate {
        symbol: String,
        market_price: f64,
        buy_volume: f64,
        sell_volume: f64,
        net_pressure: f64,
        ts: DateTime<Utc>,
    },
    /// One executed trade.
    TradeEvent {
        trade_id: Uuid,
        symbol: String,
        price: f64,
        qty: f64,
        ts: DateTime<Utc>,
    },
    /// A blended final-price commit.
    FinalUpdate {
        symbol: String,
        final_price: f64,
        components: FinalComponents,
        ts: DateTime<Utc>,
    },
    /// An event entering or leaving the audit queue.
    AuditEvent {
        event_id: Uuid,
        symbol: String,
        delta: f64,
        state: String,
        reason: Option<String>,
        ts: DateTime<Utc>,
    },
}

/// Blend inputs attached to a final-price update.
#[derive(Debug, Clone, Serialize)]
pub struct FinalComponents {
    pub market: Option<f64>,
    pub reality: f64,
    pub weights: BlendWeights,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlendWeights {
    pub market: f64,
    pub reality: f64,
}

/// Cheap-to-clone handle on the feed channel.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<FeedMessage>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Publish a message to all current subscribers. Having no subscribers is
    /// not an error.
    pub fn publish(&self, msg: FeedMessage) {
        if let Err(e) = self.tx.send(msg) {
            debug!(error = %e, "feed message dropped (no subscribers)");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_snake_case_type_tags() {
        let msg = FeedMessage::RealityUpdate {
            symbol: "ELON".to_string(),
            reality_score: 52.5,
            delta: 2.5,
            event_id: Uuid::new_v4(),
            ts: Utc::now(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "reality_update");
        assert_eq!(json["symbol"], "ELON");

        let msg = FeedMessage::FinalUpdate {
            symbol: "ELON".to_string(),
            final_price: 56.0,
            components: FinalComponents {
                market: Some(90.0),
                reality: 50.0,
                weights: BlendWeights {
                    market: 0.6,
                    reality: 0.4,
                },
            },
            ts: Utc::now(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "final_update");
        assert_eq!(json["components"]["weights"]["market"], 0.6);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = Broadcaster::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(FeedMessage::TradeEvent {
            trade_id: Uuid::new_v4(),
            symbol: "ELON".to_string(),
            price: 42.0,
            qty: 1.0,
            ts: Utc::now(),
        });

        assert!(matches!(a.try_recv().unwrap(), FeedMessage::TradeEvent { .. }));
        assert!(matches!(b.try_recv().unwrap(), FeedMessage::TradeEvent { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let hub = Broadcaster::new();
        hub.publish(FeedMessage::MarketUpdate {
            symbol: "ELON".to_string(),
            market_price: 50.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            net_pressure: 0.0,
            ts: Utc::now(),
        });
    }
}
