// =============================================================================
// Matching Engine — books, critical regions, durable write-behind
// =============================================================================
//
// One book per symbol, created on demand. Each book has its own async mutex:
// the critical region covers (validate, match loop, persist order + trades +
// maker updates, emit market/trade updates). The persistence step is the only
// await inside the region, and it must succeed before the caller sees the
// placement.
//
// On startup the engine rebuilds books by replaying open/partial orders from
// the store in created_at order, without re-matching. Persisted fills are
// cross-checked against the trade log; a mismatch adopts the larger value.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::book::{DepthLevel, Order, OrderBook, TopOfBook, Trade};
use super::pressure::{calculate_pressure, MarketPressure};
use crate::blender::BlendScheduler;
use crate::broadcast::{Broadcaster, FeedMessage};
use crate::runtime_config::RuntimeConfig;
use crate::store::Db;
use crate::types::{OrderSide, OrderStatus, OrderType};

/// A new order as submitted by a trading client.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    pub qty: f64,
    pub user_id: String,
}

/// Full book snapshot served at `GET /market/{symbol}/snapshot`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub top: TopOfBook,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub recent_trades: Vec<Trade>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct MatchingEngine {
    db: Arc<Db>,
    config: Arc<RwLock<RuntimeConfig>>,
    books: SyncMutex<HashMap<String, Arc<Mutex<OrderBook>>>>,
    broadcaster: Broadcaster,
    blend: Arc<BlendScheduler>,
}

impl MatchingEngine {
    pub fn new(
        db: Arc<Db>,
        config: Arc<RwLock<RuntimeConfig>>,
        broadcaster: Broadcaster,
        blend: Arc<BlendScheduler>,
    ) -> Self {
        Self {
            db,
            config,
            books: SyncMutex::new(HashMap::new()),
            broadcaster,
            blend,
        }
    }

    /// Fetch or create the book for `symbol`.
    fn book(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        let mut books = self.books.lock();
        books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(symbol))))
            .clone()
    }

    /// Fetch the book for `symbol` without creating one.
    fn existing_book(&self, symbol: &str) -> Option<Arc<Mutex<OrderBook>>> {
        self.books.lock().get(symbol).cloned()
    }

    /// Validate an incoming order against the admission rules. Returns a
    /// human-readable reason when the order is malformed.
    pub fn validate(&self, req: &PlaceOrderRequest) -> Result<(), String> {
        if req.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if req.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if !(req.qty.is_finite() && req.qty > 0.0) {
            return Err("qty must be positive".to_string());
        }
        let max_price = self.config.read().max_price;
        match (req.order_type, req.price) {
            (OrderType::Limit, Some(p)) if p.is_finite() && p > 0.0 && p <= max_price => Ok(()),
            (OrderType::Limit, Some(_)) => {
                Err(format!("limit price must be in (0, {max_price}]"))
            }
            (OrderType::Limit, None) => Err("limit orders require a price".to_string()),
            (OrderType::Market, None) => Ok(()),
            (OrderType::Market, Some(_)) => {
                Err("market orders must not carry a price".to_string())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Admit an order: match, persist, broadcast, and schedule a blend pass
    /// if any trade committed. The caller has already run [`Self::validate`].
    pub async fn place_order(&self, req: PlaceOrderRequest) -> Result<(Order, Vec<Trade>)> {
        let order = Order {
            order_id: Uuid::new_v4(),
            user_id: req.user_id,
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            qty: req.qty,
            filled: 0.0,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        };

        let book_arc = self.book(&req.symbol);
        let mut book = book_arc.lock().await;

        let (order, trades, makers) = book.place(order);

        // The placement only exists once it is durable. A failure here leaves
        // the in-memory book ahead of the store; a restart replays the store.
        self.db
            .commit_order_placement(&order, &trades, &makers)
            .await
            .context("persist order placement")?;

        let pressure = self.pressure_of(&book);
        drop(book);

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            status = %order.status,
            trades = trades.len(),
            "order placed"
        );

        for trade in &trades {
            self.broadcaster.publish(FeedMessage::TradeEvent {
                trade_id: trade.trade_id,
                symbol: trade.symbol.clone(),
                price: trade.price,
                qty: trade.qty,
                ts: trade.timestamp,
            });
        }
        self.publish_market_update(&pressure);

        if !trades.is_empty() {
            self.blend.trigger(&order.symbol);
        }

        Ok((order, trades))
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel an order. Idempotent on terminal states: cancelling a filled or
    /// already-cancelled order returns its current stored state unchanged.
    /// Returns `None` when the order is unknown.
    pub async fn cancel_order(&self, symbol: &str, order_id: Uuid) -> Result<Option<Order>> {
        let book_arc = self.book(symbol);
        let mut book = book_arc.lock().await;

        if let Some(order) = book.cancel(order_id) {
            self.db
                .mark_order_cancelled(&order)
                .await
                .context("persist order cancel")?;

            let pressure = self.pressure_of(&book);
            drop(book);

            info!(order_id = %order_id, symbol = %symbol, "order cancelled");
            self.publish_market_update(&pressure);
            return Ok(Some(order));
        }
        drop(book);

        // Not resting: either terminal (no-op) or unknown.
        let stored = self.db.get_order(order_id).await?;
        Ok(stored.filter(|o| o.symbol == symbol))
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub async fn snapshot(&self, symbol: &str, depth: usize) -> BookSnapshot {
        let book_arc = self.book(symbol);
        let book = book_arc.lock().await;
        let (bids, asks) = book.depth(depth);
        BookSnapshot {
            symbol: symbol.to_string(),
            top: book.top_of_book(),
            bids,
            asks,
            recent_trades: book.recent_trades(),
            timestamp: Utc::now(),
        }
    }

    pub async fn pressure(&self, symbol: &str) -> MarketPressure {
        let book_arc = self.book(symbol);
        let book = book_arc.lock().await;
        self.pressure_of(&book)
    }

    /// Pressure for the blender: `None` when there is no market side at all
    /// (no book, nothing resting, no trade ever printed).
    pub async fn try_pressure(&self, symbol: &str) -> Option<MarketPressure> {
        let book_arc = self.existing_book(symbol)?;
        let book = book_arc.lock().await;
        if book.is_market_void() {
            return None;
        }
        Some(self.pressure_of(&book))
    }

    fn pressure_of(&self, book: &OrderBook) -> MarketPressure {
        let neutral = self.config.read().neutral_score;
        calculate_pressure(book, neutral, Utc::now())
    }

    fn publish_market_update(&self, pressure: &MarketPressure) {
        self.broadcaster.publish(FeedMessage::MarketUpdate {
            symbol: pressure.symbol.clone(),
            market_price: pressure.market_price,
            buy_volume: pressure.buy_volume,
            sell_volume: pressure.sell_volume,
            net_pressure: pressure.net_pressure,
            ts: pressure.timestamp,
        });
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Rebuild every book from the store. Orders arrive in created_at
    /// ascending order and are inserted directly at their price levels; the
    /// trade log is the arbiter when a persisted fill is stale.
    pub async fn recover(&self) -> Result<usize> {
        let active = self.db.load_active_orders().await?;
        let trade_sums = self.db.trade_fill_sums().await?;

        let mut count = 0;
        for mut order in active {
            if let Some(&traded) = trade_sums.get(&order.order_id) {
                if traded > order.filled {
                    warn!(
                        order_id = %order.order_id,
                        persisted = order.filled,
                        traded,
                        "stale fill on replay; adopting trade-log sum"
                    );
                    order.filled = traded.min(order.qty);
                    order.status = if order.filled >= order.qty {
                        OrderStatus::Filled
                    } else if order.filled > 0.0 {
                        OrderStatus::Partial
                    } else {
                        OrderStatus::Open
                    };
                }
            }
            if order.status.is_terminal() {
                // Fully covered by trades after the cross-check; nothing rests.
                self.db.repair_order_fill(&order).await?;
                continue;
            }

            let book_arc = self.book(&order.symbol);
            let mut book = book_arc.lock().await;
            book.restore(order);
            count += 1;
        }

        info!(orders = count, "order books recovered from store");
        Ok(count)
    }
}

// =============================================================================
// Tests
// =============================================================================
