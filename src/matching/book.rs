// =============================================================================
// Order Book — per-symbol price-time priority matching
// =============================================================================
//
// Ladder layout:
//   bids: price level -> FIFO queue of order ids, matched best (highest) first
//   asks: price level -> FIFO queue of order ids, matched best (lowest) first
//
// Matching rules:
//   - A limit aggressor stops at the first level that no longer crosses it;
//     a market aggressor never price-stops.
//   - trade qty = min(aggressor remaining, maker remaining); the trade price
//     is always the MAKER's limit price.
//   - A market order's unfilled remainder is cancelled, never rested.
//
// The book holds no locks itself; the matching engine serialises access.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{OrderSide, OrderStatus, OrderType};

/// Price key with a total order so it can live in a BTreeMap. Prices are
/// validated finite and positive before they reach the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Px(pub f64);

impl Eq for Px {}

impl PartialOrd for Px {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Px {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A single order as tracked by the matching engine and the order store.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Present iff the order is a limit order.
    pub price: Option<f64>,
    pub qty: f64,
    pub filled: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> f64 {
        self.qty - self.filled
    }

    fn refresh_status(&mut self) {
        if self.filled >= self.qty {
            self.status = OrderStatus::Filled;
        } else if self.filled > 0.0 {
            self.status = OrderStatus::Partial;
        } else {
            self.status = OrderStatus::Open;
        }
    }
}

/// One executed match. The price is the maker's limit price.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Post-match state of a resting order touched by a placement, for the
/// persistence step (the order itself may already be gone from the book).
#[derive(Debug, Clone, Copy)]
pub struct MakerUpdate {
    pub order_id: Uuid,
    pub filled: f64,
    pub status: OrderStatus,
}

/// One aggregated ladder level in a depth snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
    pub count: usize,
}

/// Best bid / best ask / mid. `mid` falls back to the single present side.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TopOfBook {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid: Option<f64>,
}

/// Trades retained for snapshot responses.
const RECENT_TRADES_CAP: usize = 50;

/// In-memory book for one symbol.
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Px, VecDeque<Uuid>>,
    asks: BTreeMap<Px, VecDeque<Uuid>>,
    /// Resting (open/partial) orders only; terminal orders leave the map.
    orders: HashMap<Uuid, Order>,
    recent_trades: VecDeque<Trade>,
    last_trade_price: Option<f64>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
            recent_trades: VecDeque::new(),
            last_trade_price: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_trade_price(&self) -> Option<f64> {
        self.last_trade_price
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Match `order` against the opposite ladder, then rest any limit
    /// remainder. Returns the aggressor's final state, the executed trades in
    /// match order, and the post-match state of every maker touched.
    pub fn place(&mut self, mut order: Order) -> (Order, Vec<Trade>, Vec<MakerUpdate>) {
        let mut trades = Vec::new();
        let mut makers = Vec::new();

        self.match_against_opposite(&mut order, &mut trades, &mut makers);

        if order.remaining() > 0.0 {
            match order.order_type {
                OrderType::Limit => {
                    // remainder rests at its price level, tail of the queue
                    let px = Px(order.price.expect("limit order always has a price"));
                    let ladder = match order.side {
                        OrderSide::Buy => &mut self.bids,
                        OrderSide::Sell => &mut self.asks,
                    };
                    ladder.entry(px).or_default().push_back(order.order_id);
                    self.orders.insert(order.order_id, order.clone());
                }
                OrderType::Market => {
                    order.status = OrderStatus::Cancelled;
                }
            }
        }

        for trade in &trades {
            self.last_trade_price = Some(trade.price);
            self.recent_trades.push_back(trade.clone());
            while self.recent_trades.len() > RECENT_TRADES_CAP {
                self.recent_trades.pop_front();
            }
        }

        (order, trades, makers)
    }

    fn match_against_opposite(
        &mut self,
        order: &mut Order,
        trades: &mut Vec<Trade>,
        makers: &mut Vec<MakerUpdate>,
    ) {
        let now = order.created_at;

        loop {
            if order.remaining() <= 0.0 {
                break;
            }

            // Best opposite level: lowest ask for a buy, highest bid for a sell.
            let level_px = match order.side {
                OrderSide::Buy => self.asks.keys().next().copied(),
                OrderSide::Sell => self.bids.keys().next_back().copied(),
            };
            let Some(level_px) = level_px else { break };

            // Limit aggressors stop once the level no longer crosses.
            if let Some(limit) = order.price {
                let crosses = match order.side {
                    OrderSide::Buy => limit >= level_px.0,
                    OrderSide::Sell => limit <= level_px.0,
                };
                if !crosses {
                    break;
                }
            }

            let ladder = match order.side {
                OrderSide::Buy => &mut self.asks,
                OrderSide::Sell => &mut self.bids,
            };
            let queue = ladder.get_mut(&level_px).expect("level key just observed");

            while order.remaining() > 0.0 {
                let Some(&maker_id) = queue.front() else { break };
                let maker = self
                    .orders
                    .get_mut(&maker_id)
                    .expect("queued order is in the order map");

                let qty = order.remaining().min(maker.remaining());
                maker.filled += qty;
                order.filled += qty;
                maker.refresh_status();
                order.refresh_status();

                let (buy_order_id, sell_order_id) = match order.side {
                    OrderSide::Buy => (order.order_id, maker_id),
                    OrderSide::Sell => (maker_id, order.order_id),
                };
                trades.push(Trade {
                    trade_id: Uuid::new_v4(),
                    symbol: self.symbol.clone(),
                    price: maker.price.expect("resting orders are limit orders"),
                    qty,
                    buy_order_id,
                    sell_order_id,
                    timestamp: now,
                });
                makers.push(MakerUpdate {
                    order_id: maker_id,
                    filled: maker.filled,
                    status: maker.status,
                });

                if maker.status == OrderStatus::Filled {
                    queue.pop_front();
                    self.orders.remove(&maker_id);
                } else {
                    // maker partially filled means the aggressor is exhausted
                    break;
                }
            }

            let emptied = queue.is_empty();
            if emptied {
                match order.side {
                    OrderSide::Buy => self.asks.remove(&level_px),
                    OrderSide::Sell => self.bids.remove(&level_px),
                };
            } else {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel a resting order. Returns the cancelled order, or `None` if no
    /// live order with that id rests in this book (terminal orders are
    /// handled by the engine from the durable store).
    pub fn cancel(&mut self, order_id: Uuid) -> Option<Order> {
        let mut order = self.orders.remove(&order_id)?;

        let px = Px(order.price.expect("resting orders are limit orders"));
        let ladder = match order.side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        };
        if let Some(queue) = ladder.get_mut(&px) {
            queue.retain(|id| *id != order_id);
            if queue.is_empty() {
                ladder.remove(&px);
            }
        }

        order.status = OrderStatus::Cancelled;
        Some(order)
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Insert a previously-persisted open/partial order directly at its price
    /// level, bypassing the matching loop. Callers feed orders in
    /// `created_at` ascending order so FIFO priority is preserved.
    pub fn restore(&mut self, order: Order) {
        debug_assert!(!order.status.is_terminal());
        let px = Px(order.price.expect("only limit orders rest"));
        let ladder = match order.side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        };
        ladder.entry(px).or_default().push_back(order.order_id);
        self.orders.insert(order.order_id, order);
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn top_of_book(&self) -> TopOfBook {
        let best_bid = self.bids.keys().next_back().map(|px| px.0);
        let best_ask = self.asks.keys().next().map(|px| px.0);
        let mid = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        TopOfBook {
            best_bid,
            best_ask,
            mid,
        }
    }

    /// Top-k levels per side, best first, aggregated by price.
    pub fn depth(&self, k: usize) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let level = |px: &Px, queue: &VecDeque<Uuid>| DepthLevel {
            price: px.0,
            qty: queue
                .iter()
                .filter_map(|id| self.orders.get(id))
                .map(Order::remaining)
                .sum(),
            count: queue.len(),
        };

        let bids = self
            .bids
            .iter()
            .rev()
            .take(k)
            .map(|(px, q)| level(px, q))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(k)
            .map(|(px, q)| level(px, q))
            .collect();
        (bids, asks)
    }

    pub fn recent_trades(&self) -> Vec<Trade> {
        self.recent_trades.iter().rev().cloned().collect()
    }

    /// True when there is no market at all: nothing rests on either side and
    /// no trade has ever printed. The blender falls back to reality-only.
    pub fn is_market_void(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty() && self.last_trade_price.is_none()
    }

    /// Total remaining quantity resting on one side.
    pub fn resting_volume(&self, side: OrderSide) -> f64 {
        self.orders
            .values()
            .filter(|o| o.side == side)
            .map(Order::remaining)
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn resting_order(&self, order_id: Uuid) -> Option<&Order> {
        self.orders.get(&order_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(side: OrderSide, price: f64, qty: f64, user: &str) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            user_id: user.to_string(),
            symbol: "ELON".to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            qty,
            filled: 0.0,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        }
    }

    fn market(side: OrderSide, qty: f64, user: &str) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            user_id: user.to_string(),
            symbol: "ELON".to_string(),
            side,
            order_type: OrderType::Market,
            price: None,
            qty,
            filled: 0.0,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn price_time_priority_across_levels() {
        // Resting: A buy 10@100, B buy 10@101, C buy 10@100 (in that order).
        // Incoming sell 25@99 must fill B first (better price), then A before
        // C (earlier at the same level), leaving C partial at 5.
        let mut book = OrderBook::new("ELON");
        let a = limit(OrderSide::Buy, 100.0, 10.0, "A");
        let b = limit(OrderSide::Buy, 101.0, 10.0, "B");
        let c = limit(OrderSide::Buy, 100.0, 10.0, "C");
        let (a_id, b_id, c_id) = (a.order_id, b.order_id, c.order_id);
        book.place(a);
        book.place(b);
        book.place(c);

        let (sell, trades, makers) = book.place(limit(OrderSide::Sell, 99.0, 25.0, "S"));

        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].buy_order_id, b_id);
        assert!((trades[0].price - 101.0).abs() < f64::EPSILON);
        assert!((trades[0].qty - 10.0).abs() < f64::EPSILON);
        assert_eq!(trades[1].buy_order_id, a_id);
        assert!((trades[1].price - 100.0).abs() < f64::EPSILON);
        assert_eq!(trades[2].buy_order_id, c_id);
        assert!((trades[2].price - 100.0).abs() < f64::EPSILON);
        assert!((trades[2].qty - 5.0).abs() < f64::EPSILON);

        assert_eq!(sell.status, OrderStatus::Filled);
        assert!((sell.filled - 25.0).abs() < f64::EPSILON);

        let c_rest = book.resting_order(c_id).unwrap();
        assert_eq!(c_rest.status, OrderStatus::Partial);
        assert!((c_rest.filled - 5.0).abs() < f64::EPSILON);
        assert!((c_rest.remaining() - 5.0).abs() < f64::EPSILON);

        // Maker updates cover B (filled), A (filled), C (partial).
        assert_eq!(makers.len(), 3);
        assert_eq!(makers[2].order_id, c_id);
        assert_eq!(makers[2].status, OrderStatus::Partial);

        // Fill-sum invariant: aggressor fills equal the sum of its trades.
        let traded: f64 = trades.iter().map(|t| t.qty).sum();
        assert!((traded - sell.filled).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_price_is_always_the_makers() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Sell, 40.0, 5.0, "M"));

        // Aggressive buy at 60 executes at the resting 40, not 60.
        let (_, trades, _) = book.place(limit(OrderSide::Buy, 60.0, 5.0, "T"));
        assert_eq!(trades.len(), 1);
        assert!((trades[0].price - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_fill_then_cancel_keeps_fills() {
        let mut book = OrderBook::new("ELON");
        let buy = limit(OrderSide::Buy, 100.0, 10.0, "A");
        let buy_id = buy.order_id;
        book.place(buy);

        let (sell, trades, _) = book.place(limit(OrderSide::Sell, 100.0, 4.0, "B"));
        assert_eq!(sell.status, OrderStatus::Filled);
        assert_eq!(trades.len(), 1);

        let resting = book.resting_order(buy_id).unwrap();
        assert_eq!(resting.status, OrderStatus::Partial);
        assert!((resting.filled - 4.0).abs() < f64::EPSILON);

        let cancelled = book.cancel(buy_id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!((cancelled.filled - 4.0).abs() < f64::EPSILON);

        // The bid level at 100 is gone.
        let top = book.top_of_book();
        assert!(top.best_bid.is_none());
        assert!(book.cancel(buy_id).is_none());
    }

    #[test]
    fn market_order_remainder_is_cancelled() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Sell, 50.0, 3.0, "M"));

        let (order, trades, _) = book.place(market(OrderSide::Buy, 10.0, "T"));
        assert_eq!(trades.len(), 1);
        assert!((trades[0].qty - 3.0).abs() < f64::EPSILON);
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!((order.filled - 3.0).abs() < f64::EPSILON);

        // Nothing rested: the ask side emptied and the market order is gone.
        let top = book.top_of_book();
        assert!(top.best_ask.is_none());
        assert!(top.best_bid.is_none());
    }

    #[test]
    fn market_order_sweeps_multiple_levels() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Sell, 50.0, 2.0, "M1"));
        book.place(limit(OrderSide::Sell, 55.0, 2.0, "M2"));

        let (order, trades, _) = book.place(market(OrderSide::Buy, 4.0, "T"));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(trades.len(), 2);
        assert!((trades[0].price - 50.0).abs() < f64::EPSILON);
        assert!((trades[1].price - 55.0).abs() < f64::EPSILON);
        assert_eq!(book.last_trade_price(), Some(55.0));
    }

    #[test]
    fn limit_aggressor_stops_at_non_crossing_level() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Sell, 50.0, 2.0, "M1"));
        book.place(limit(OrderSide::Sell, 60.0, 2.0, "M2"));

        let (order, trades, _) = book.place(limit(OrderSide::Buy, 55.0, 5.0, "T"));
        assert_eq!(trades.len(), 1);
        assert!((trades[0].price - 50.0).abs() < f64::EPSILON);
        assert_eq!(order.status, OrderStatus::Partial);
        assert!((order.remaining() - 3.0).abs() < f64::EPSILON);

        // Remainder rests as the new best bid at 55.
        let top = book.top_of_book();
        assert_eq!(top.best_bid, Some(55.0));
        assert_eq!(top.best_ask, Some(60.0));
        assert_eq!(top.mid, Some(57.5));
    }

    #[test]
    fn depth_aggregates_levels() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Buy, 100.0, 10.0, "A"));
        book.place(limit(OrderSide::Buy, 100.0, 5.0, "B"));
        book.place(limit(OrderSide::Buy, 99.0, 7.0, "C"));
        book.place(limit(OrderSide::Sell, 101.0, 3.0, "D"));

        let (bids, asks) = book.depth(10);
        assert_eq!(bids.len(), 2);
        assert!((bids[0].price - 100.0).abs() < f64::EPSILON);
        assert!((bids[0].qty - 15.0).abs() < f64::EPSILON);
        assert_eq!(bids[0].count, 2);
        assert!((bids[1].price - 99.0).abs() < f64::EPSILON);
        assert_eq!(asks.len(), 1);
        assert!((asks[0].qty - 3.0).abs() < f64::EPSILON);
        assert_eq!(asks[0].count, 1);
    }

    #[test]
    fn restore_preserves_fifo_order() {
        let mut book = OrderBook::new("ELON");
        let first = limit(OrderSide::Buy, 100.0, 1.0, "A");
        let second = limit(OrderSide::Buy, 100.0, 1.0, "B");
        let first_id = first.order_id;
        book.restore(first);
        book.restore(second);

        let (_, trades, _) = book.place(limit(OrderSide::Sell, 100.0, 1.0, "S"));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].buy_order_id, first_id);
    }

    #[test]
    fn resting_volume_by_side() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Buy, 100.0, 10.0, "A"));
        book.place(limit(OrderSide::Buy, 99.0, 5.0, "B"));
        book.place(limit(OrderSide::Sell, 101.0, 4.0, "C"));

        assert!((book.resting_volume(OrderSide::Buy) - 15.0).abs() < f64::EPSILON);
        assert!((book.resting_volume(OrderSide::Sell) - 4.0).abs() < f64::EPSILON);
    }
}
