// =============================================================================
// Orders and the trade log
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{ts_from_sql, ts_to_sql, Db};
use crate::matching::book::{MakerUpdate, Order, Trade};

const ORDER_COLS: &str =
    "order_id, user_id, symbol, side, type, price, qty, filled, status, created_at";

fn order_from_row(row: &Row<'_>) -> Result<Order> {
    let order_id: String = row.get(0)?;
    let side: String = row.get(3)?;
    let order_type: String = row.get(4)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(Order {
        order_id: order_id.parse().context("order_id column")?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: side.parse().map_err(anyhow::Error::msg)?,
        order_type: order_type.parse().map_err(anyhow::Error::msg)?,
        price: row.get(5)?,
        qty: row.get(6)?,
        filled: row.get(7)?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        created_at: ts_from_sql(&created_at)?,
    })
}

impl Db {
    /// Persist a completed placement in one transaction: the incoming order,
    /// every trade it produced, and the new fill state of each maker touched.
    /// The caller holds the book's critical region across this call; only
    /// after it returns may the placement be reported as successful.
    pub async fn commit_order_placement(
        &self,
        order: &Order,
        trades: &[Trade],
        makers: &[MakerUpdate],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin commit_order_placement")?;

        tx.execute(
            "INSERT INTO orders (order_id, user_id, symbol, side, type, price, qty, filled,
                                 status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                order.order_id.to_string(),
                order.user_id,
                order.symbol,
                order.side.to_string(),
                order.order_type.to_string(),
                order.price,
                order.qty,
                order.filled,
                order.status.to_string(),
                ts_to_sql(order.created_at),
            ],
        )?;

        for maker in makers {
            tx.execute(
                "UPDATE orders SET filled = ?2, status = ?3 WHERE order_id = ?1",
                params![
                    maker.order_id.to_string(),
                    maker.filled,
                    maker.status.to_string(),
                ],
            )?;
        }

        for trade in trades {
            tx.execute(
                "INSERT INTO trade_history (trade_id, symbol, price, qty, buy_order_id,
                                            sell_order_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    trade.trade_id.to_string(),
                    trade.symbol,
                    trade.price,
                    trade.qty,
                    trade.buy_order_id.to_string(),
                    trade.sell_order_id.to_string(),
                    ts_to_sql(trade.timestamp),
                ],
            )?;
        }

        tx.commit().context("commit commit_order_placement")
    }

    /// Repair a stale fill discovered at recovery (trade log disagreed with
    /// the persisted order row).
    pub async fn repair_order_fill(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE orders SET filled = ?2, status = ?3 WHERE order_id = ?1",
            params![
                order.order_id.to_string(),
                order.filled,
                order.status.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Persist a cancellation (fills already made are retained).
    pub async fn mark_order_cancelled(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE orders SET filled = ?2, status = 'cancelled' WHERE order_id = ?1",
            params![order.order_id.to_string(), order.filled],
        )?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {ORDER_COLS} FROM orders WHERE order_id = ?1"))?;
        let mut rows = stmt.query(params![order_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(order_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All open/partial orders in `created_at` ascending order, for book
    /// replay at startup.
    pub async fn load_active_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE status IN ('open', 'partial')
             ORDER BY created_at ASC"
        ))?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(order_from_row(row)?);
        }
        Ok(out)
    }

    /// Executed quantity per order id across the whole trade log. Used at
    /// recovery to cross-check persisted fills against the trades that
    /// actually committed.
    pub async fn trade_fill_sums(&self) -> Result<HashMap<Uuid, f64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, SUM(qty) FROM (
                 SELECT buy_order_id AS order_id, qty FROM trade_history
                 UNION ALL
                 SELECT sell_order_id AS order_id, qty FROM trade_history
             ) GROUP BY order_id",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let qty: f64 = row.get(1)?;
            out.insert(id.parse().context("trade order_id")?, qty);
        }
        Ok(out)
    }

    pub async fn count_trades(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row("SELECT COUNT(*) FROM trade_history", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Sum of trade quantities attributed to one order (both sides).
    pub async fn order_trade_sum(&self, order_id: Uuid) -> Result<f64> {
        let conn = self.conn.lock().await;
        let id = order_id.to_string();
        let sum: Option<f64> = conn
            .query_row(
                "SELECT SUM(qty) FROM trade_history
                 WHERE buy_order_id = ?1 OR sell_order_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(sum.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{OrderSide, OrderStatus, OrderType};
    use chrono::Utc;

    fn order(symbol: &str, side: OrderSide, price: f64, qty: f64, filled: f64) -> Order {
        let status = if filled >= qty {
            OrderStatus::Filled
        } else if filled > 0.0 {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };
        Order {
            order_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            qty,
            filled,
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn placement_persists_order_trades_and_makers() {
        let db = Db::open_in_memory(&RuntimeConfig::default()).unwrap();

        let maker = order("ELON", OrderSide::Buy, 100.0, 10.0, 0.0);
        db.commit_order_placement(&maker, &[], &[]).await.unwrap();

        let mut taker = order("ELON", OrderSide::Sell, 100.0, 4.0, 4.0);
        taker.status = OrderStatus::Filled;
        let trade = Trade {
            trade_id: Uuid::new_v4(),
            symbol: "ELON".to_string(),
            price: 100.0,
            qty: 4.0,
            buy_order_id: maker.order_id,
            sell_order_id: taker.order_id,
            timestamp: Utc::now(),
        };
        let maker_update = MakerUpdate {
            order_id: maker.order_id,
            filled: 4.0,
            status: OrderStatus::Partial,
        };
        db.commit_order_placement(&taker, &[trade], &[maker_update])
            .await
            .unwrap();

        let stored_maker = db.get_order(maker.order_id).await.unwrap().unwrap();
        assert_eq!(stored_maker.status, OrderStatus::Partial);
        assert!((stored_maker.filled - 4.0).abs() < f64::EPSILON);

        assert_eq!(db.count_trades().await.unwrap(), 1);
        assert!((db.order_trade_sum(maker.order_id).await.unwrap() - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn active_orders_replay_in_created_order() {
        let db = Db::open_in_memory(&RuntimeConfig::default()).unwrap();

        let mut first = order("ELON", OrderSide::Buy, 100.0, 1.0, 0.0);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = order("ELON", OrderSide::Buy, 100.0, 1.0, 0.0);
        let mut done = order("ELON", OrderSide::Sell, 99.0, 1.0, 1.0);
        done.status = OrderStatus::Filled;

        // Insert out of order; replay must come back created_at ascending.
        db.commit_order_placement(&second, &[], &[]).await.unwrap();
        db.commit_order_placement(&first, &[], &[]).await.unwrap();
        db.commit_order_placement(&done, &[], &[]).await.unwrap();

        let active = db.load_active_orders().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].order_id, first.order_id);
        assert_eq!(active[1].order_id, second.order_id);
    }

    #[tokio::test]
    async fn trade_sums_group_both_sides() {
        let db = Db::open_in_memory(&RuntimeConfig::default()).unwrap();
        let buy = order("ELON", OrderSide::Buy, 100.0, 5.0, 5.0);
        let sell = order("ELON", OrderSide::Sell, 100.0, 5.0, 5.0);
        db.commit_order_placement(&buy, &[], &[]).await.unwrap();

        let trade = Trade {
            trade_id: Uuid::new_v4(),
            symbol: "ELON".to_string(),
            price: 100.0,
            qty: 5.0,
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            timestamp: Utc::now(),
        };
        db.commit_order_placement(&sell, &[trade], &[]).await.unwrap();

        let sums = db.trade_fill_sums().await.unwrap();
        assert!((sums[&buy.order_id] - 5.0).abs() < f64::EPSILON);
        assert!((sums[&sell.order_id] - 5.0).abs() < f64::EPSILON);
    }
}
