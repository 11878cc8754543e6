// =============================================================================
// Market price derivation and order-book pressure
// =============================================================================
//
// Pressure aggregates CURRENT RESTING volume by side; executed-trade volume
// is deliberately not part of this signal. The market price falls back along
// mid -> best bid -> best ask -> last trade -> neutral.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::book::OrderBook;
use crate::types::OrderSide;

/// The signal the blender consumes, also served at
/// `GET /market/{symbol}/pressure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPressure {
    pub symbol: String,
    pub market_price: f64,
    /// Total remaining qty resting on the bid side.
    pub buy_volume: f64,
    /// Total remaining qty resting on the ask side.
    pub sell_volume: f64,
    /// buy_volume - sell_volume; positive means bid-side pressure.
    pub net_pressure: f64,
    pub timestamp: DateTime<Utc>,
}

/// Derive the current market price from the book state.
pub fn market_price(book: &OrderBook, neutral: f64) -> f64 {
    let top = book.top_of_book();
    top.mid
        .or(book.last_trade_price())
        .unwrap_or(neutral)
}

/// Compute the pressure snapshot for a book.
pub fn calculate_pressure(book: &OrderBook, neutral: f64, now: DateTime<Utc>) -> MarketPressure {
    let buy_volume = book.resting_volume(OrderSide::Buy);
    let sell_volume = book.resting_volume(OrderSide::Sell);

    MarketPressure {
        symbol: book.symbol().to_string(),
        market_price: market_price(book, neutral),
        buy_volume,
        sell_volume,
        net_pressure: buy_volume - sell_volume,
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::book::Order;
    use crate::types::{OrderStatus, OrderType};
    use uuid::Uuid;

    fn limit(side: OrderSide, price: f64, qty: f64) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            user_id: "u".to_string(),
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

    #[test]
    fn empty_book_falls_back_to_neutral() {
        let book = OrderBook::new("ELON");
        assert!((market_price(&book, 50.0) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_sided_book_uses_that_side() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Buy, 90.0, 5.0));
        assert!((market_price(&book, 50.0) - 90.0).abs() < f64::EPSILON);

        let mut asks_only = OrderBook::new("ELON");
        asks_only.place(limit(OrderSide::Sell, 70.0, 5.0));
        assert!((market_price(&asks_only, 50.0) - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn two_sided_book_uses_mid() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Buy, 40.0, 5.0));
        book.place(limit(OrderSide::Sell, 60.0, 5.0));
        assert!((market_price(&book, 50.0) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn emptied_book_falls_back_to_last_trade() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Sell, 42.0, 5.0));
        book.place(limit(OrderSide::Buy, 42.0, 5.0)); // fully crosses

        let top = book.top_of_book();
        assert!(top.best_bid.is_none() && top.best_ask.is_none());
        assert!((market_price(&book, 50.0) - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pressure_reports_resting_aggregates() {
        let mut book = OrderBook::new("ELON");
        book.place(limit(OrderSide::Buy, 45.0, 10.0));
        book.place(limit(OrderSide::Buy, 44.0, 5.0));
        book.place(limit(OrderSide::Sell, 55.0, 6.0));

        let pressure = calculate_pressure(&book, 50.0, Utc::now());
        assert!((pressure.buy_volume - 15.0).abs() < f64::EPSILON);
        assert!((pressure.sell_volume - 6.0).abs() < f64::EPSILON);
        assert!((pressure.net_pressure - 9.0).abs() < f64::EPSILON);
        assert!((pressure.market_price - 50.0).abs() < f64::EPSILON); // (45+55)/2
    }
}
