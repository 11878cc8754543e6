// =============================================================================
// Shared domain types for the Meridian reality market
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Limit orders carry a price; market orders never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Order lifecycle. `Filled` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    /// Terminal orders never leave their state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Partial => write!(f, "partial"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Which LLM path the event producer took for this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmMode {
    Tiny,
    Skipped,
    Failed,
}

impl std::fmt::Display for LlmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tiny => write!(f, "tiny"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Audit record lifecycle: pending until exactly one decision is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditState {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for AuditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

macro_rules! impl_from_str {
    ($ty:ident { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), " {:?}"), other)),
                }
            }
        }
    };
}

impl_from_str!(OrderSide { "buy" => Buy, "sell" => Sell });
impl_from_str!(OrderType { "limit" => Limit, "market" => Market });
impl_from_str!(OrderStatus {
    "open" => Open,
    "partial" => Partial,
    "filled" => Filled,
    "cancelled" => Cancelled,
});
impl_from_str!(LlmMode { "tiny" => Tiny, "skipped" => Skipped, "failed" => Failed });
impl_from_str!(AuditState {
    "pending" => Pending,
    "approved" => Approved,
    "rejected" => Rejected,
});

/// A single news source backing an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub url: String,
    /// Source trust in [0, 1].
    pub trust: f64,
}

/// Canonical signed event payload produced by the external event producer.
///
/// The ingest gateway validates every field range before anything touches
/// persistent state; see the gateway for the exact order of checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealityEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Referenced instruments, primary symbol first. Never empty.
    pub stocks: Vec<String>,
    /// Quick-scorer sentiment in [-1, 1].
    pub quick_score: f64,
    /// Signed score contribution, |x| <= delta_cap.
    pub impact_points: f64,
    pub summary: String,
    pub sources: Vec<SourceRef>,
    pub num_independent_sources: u32,
    pub llm_mode: LlmMode,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// A persisted event row. `processed` flips to true only after the scoring
/// engine has committed the event for every referenced symbol.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    /// Primary symbol (first entry of `stocks`).
    pub symbol: String,
    pub stocks: Vec<String>,
    pub quick_score: f64,
    pub impact_points: f64,
    pub summary: String,
    pub sources: Vec<SourceRef>,
    pub num_independent_sources: u32,
    pub llm_mode: LlmMode,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

/// A tradeable instrument. Created only through the authenticated admin path;
/// immutable afterwards except the blend weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Weight of the order-book price in the final blend, [0, 1].
    pub market_weight: f64,
    /// Weight of the reality score in the final blend, [0, 1].
    pub reality_weight: f64,
    pub min_price: f64,
    pub max_price: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Tolerance for the `market_weight + reality_weight = 1` invariant.
pub const WEIGHT_SUM_EPSILON: f64 = 0.01;

impl Instrument {
    /// The two blend weights must sum to 1 within [`WEIGHT_SUM_EPSILON`].
    pub fn weights_valid(market_weight: f64, reality_weight: f64) -> bool {
        (0.0..=1.0).contains(&market_weight)
            && (0.0..=1.0).contains(&reality_weight)
            && ((market_weight + reality_weight) - 1.0).abs() < WEIGHT_SUM_EPSILON
    }
}

/// The per-instrument score row: reality score plus the blended final price.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRow {
    pub symbol: String,
    pub reality_score: f64,
    pub final_price: f64,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

/// Append-only record of one reality-score mutation.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreChange {
    pub symbol: String,
    pub event_id: Uuid,
    pub old_score: f64,
    pub new_score: f64,
    pub delta: f64,
    pub timestamp: DateTime<Utc>,
}

/// A quarantined event awaiting a human decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    /// The first symbol that tripped a suspicion rule.
    pub symbol: String,
    pub summary: String,
    pub impact: f64,
    pub sources: Vec<SourceRef>,
    pub state: AuditState,
    pub approver: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_sum_within_epsilon_accepted() {
        assert!(Instrument::weights_valid(0.6, 0.4));
        assert!(Instrument::weights_valid(0.6, 0.405));
        assert!(!Instrument::weights_valid(0.6, 0.5));
        assert!(!Instrument::weights_valid(1.2, -0.2));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn enum_wire_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&OrderType::Market).unwrap(), "\"market\"");
        assert_eq!(serde_json::to_string(&LlmMode::Tiny).unwrap(), "\"tiny\"");
        assert_eq!(serde_json::to_string(&AuditState::Pending).unwrap(), "\"pending\"");
    }
}
