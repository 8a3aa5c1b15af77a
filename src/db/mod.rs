//! Durable trade and order state.
//!
//! Local rows are a cache of venue truth: the monitor re-observes the venue
//! every tick and corrects them. What the store does guarantee:
//! - one trade per (signal, account), enforced by a unique index
//! - atomic take-profit and breakeven claims, so placement is place-if-absent
//! - the first balance seen per (account, UTC day), for daily loss limits

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::models::{
    Direction, EntryOrderType, Order, OrderKind, OrderStatus, Trade, TradeStatus,
};

/// Persistence operations used by the placer and the monitor.
///
/// Implementations must be safe under concurrent calls from several
/// placement tasks and monitor loops.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert a new trade; `StoreError::Duplicate` if the signal already has
    /// a trade on that account.
    async fn insert_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    async fn update_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    async fn get_trade(&self, id: &str) -> Result<Option<Trade>, StoreError>;

    /// Non-terminal trades, optionally filtered by channel and exchange.
    async fn get_active_trades(
        &self,
        channel: Option<&str>,
        exchange: Option<&str>,
    ) -> Result<Vec<Trade>, StoreError>;

    /// Most recent trades first.
    async fn list_trades(&self, limit: i64) -> Result<Vec<Trade>, StoreError>;

    async fn insert_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn update_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_orders_by_trade_id(&self, trade_id: &str) -> Result<Vec<Order>, StoreError>;

    /// Claim the right to place take-profits for a trade.
    ///
    /// Succeeds only while nobody holds the claim. A complete ladder keeps it
    /// held for good; a failed placement releases it.
    async fn claim_take_profit_placement(&self, trade_id: &str) -> Result<bool, StoreError>;

    async fn release_take_profit_claim(&self, trade_id: &str) -> Result<(), StoreError>;

    /// Claim the right to apply breakeven; fails if already applied or claimed.
    async fn claim_breakeven(&self, trade_id: &str) -> Result<bool, StoreError>;

    async fn release_breakeven(&self, trade_id: &str) -> Result<(), StoreError>;

    /// Balance at the start of `date` for `account`.
    ///
    /// The first call for a given day records `observed`; later calls return
    /// that first value.
    async fn day_start_balance(
        &self,
        account: &str,
        date: NaiveDate,
        observed: Decimal,
    ) -> Result<Decimal, StoreError>;
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Trade row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTrade {
    id: String,
    signal_id: String,
    channel: String,
    trading_pair: String,
    direction: String,
    entry_price: String,
    stop_loss: String,
    take_profits: String,
    leverage: String,
    quantity: String,
    risk_percentage: String,
    exchange: String,
    account_name: String,
    entry_order_id: String,
    position_id: Option<String>,
    entry_order_type: String,
    status: String,
    stop_loss_breakeven: bool,
    entry_filled_at: Option<String>,
    exit_filled_at: Option<String>,
    exit_price: Option<String>,
    pnl: Option<String>,
    expires_at: String,
    created_at: String,
}

/// Order row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredOrder {
    id: String,
    trade_id: String,
    kind: String,
    venue_order_id: String,
    price: String,
    quantity: String,
    tp_index: Option<i64>,
    status: String,
    filled_price: Option<String>,
    filled_at: Option<String>,
}

fn decimal(column: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|_| StoreError::Corrupt(format!("{}: bad decimal {:?}", column, raw)))
}

fn opt_decimal(column: &str, raw: Option<&str>) -> Result<Option<Decimal>, StoreError> {
    raw.map(|r| decimal(column, r)).transpose()
}

fn timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("{}: bad timestamp {:?}", column, raw)))
}

fn opt_timestamp(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| timestamp(column, r)).transpose()
}

fn enum_value<T>(column: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Corrupt(format!("{}: unknown value {:?}", column, raw)))
}

impl TryFrom<StoredTrade> for Trade {
    type Error = StoreError;

    fn try_from(row: StoredTrade) -> Result<Self, Self::Error> {
        let take_profits: Vec<String> = serde_json::from_str(&row.take_profits)
            .map_err(|e| StoreError::Corrupt(format!("take_profits: {}", e)))?;
        let take_profits = take_profits
            .iter()
            .map(|tp| decimal("take_profits", tp))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Trade {
            direction: enum_value("direction", &row.direction, Direction::parse)?,
            entry_price: decimal("entry_price", &row.entry_price)?,
            stop_loss: decimal("stop_loss", &row.stop_loss)?,
            take_profits,
            leverage: decimal("leverage", &row.leverage)?,
            quantity: decimal("quantity", &row.quantity)?,
            risk_percentage: decimal("risk_percentage", &row.risk_percentage)?,
            entry_order_type: enum_value(
                "entry_order_type",
                &row.entry_order_type,
                EntryOrderType::parse,
            )?,
            status: enum_value("status", &row.status, TradeStatus::parse)?,
            entry_filled_at: opt_timestamp("entry_filled_at", row.entry_filled_at.as_deref())?,
            exit_filled_at: opt_timestamp("exit_filled_at", row.exit_filled_at.as_deref())?,
            exit_price: opt_decimal("exit_price", row.exit_price.as_deref())?,
            pnl: opt_decimal("pnl", row.pnl.as_deref())?,
            expires_at: timestamp("expires_at", &row.expires_at)?,
            created_at: timestamp("created_at", &row.created_at)?,
            id: row.id,
            signal_id: row.signal_id,
            channel: row.channel,
            trading_pair: row.trading_pair,
            exchange: row.exchange,
            account_name: row.account_name,
            entry_order_id: row.entry_order_id,
            position_id: row.position_id,
            stop_loss_breakeven: row.stop_loss_breakeven,
        })
    }
}

impl TryFrom<StoredOrder> for Order {
    type Error = StoreError;

    fn try_from(row: StoredOrder) -> Result<Self, Self::Error> {
        Ok(Order {
            kind: enum_value("kind", &row.kind, OrderKind::parse)?,
            price: decimal("price", &row.price)?,
            quantity: decimal("quantity", &row.quantity)?,
            tp_index: row
                .tp_index
                .map(|i| u32::try_from(i).map_err(|_| StoreError::Corrupt(format!("tp_index: {}", i))))
                .transpose()?,
            status: enum_value("status", &row.status, OrderStatus::parse)?,
            filled_price: opt_decimal("filled_price", row.filled_price.as_deref())?,
            filled_at: opt_timestamp("filled_at", row.filled_at.as_deref())?,
            id: row.id,
            trade_id: row.trade_id,
            venue_order_id: row.venue_order_id,
        })
    }
}

fn take_profits_json(trade: &Trade) -> String {
    let raw: Vec<String> = trade.take_profits.iter().map(|tp| tp.to_string()).collect();
    serde_json::Value::from(raw).to_string()
}

impl Database {
    /// Connect to `database_url` and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL {}", database_url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database, used by simulation and tests.
    ///
    /// A single connection that never expires: each SQLite memory connection
    /// is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Trades
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                trading_pair TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profits TEXT NOT NULL,
                leverage TEXT NOT NULL,
                quantity TEXT NOT NULL,
                risk_percentage TEXT NOT NULL,
                exchange TEXT NOT NULL,
                account_name TEXT NOT NULL,
                entry_order_id TEXT NOT NULL,
                position_id TEXT,
                entry_order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                stop_loss_breakeven INTEGER NOT NULL DEFAULT 0,
                entry_filled_at TEXT,
                exit_filled_at TEXT,
                exit_price TEXT,
                pnl TEXT,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                tp_claimed INTEGER NOT NULL DEFAULT 0,
                breakeven_claimed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(signal_id, account_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status, channel, exchange)",
        )
        .execute(&self.pool)
        .await?;

        // Orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                trade_id TEXT NOT NULL REFERENCES trades(id),
                kind TEXT NOT NULL,
                venue_order_id TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                tp_index INTEGER,
                status TEXT NOT NULL,
                filled_price TEXT,
                filled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_trade ON orders(trade_id)")
            .execute(&self.pool)
            .await?;

        // Day-start balances
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_snapshots (
                account_name TEXT NOT NULL,
                day TEXT NOT NULL,
                balance TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account_name, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TradeStore for Database {
    // ==================== Trades ====================

    async fn insert_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                id, signal_id, channel, trading_pair, direction, entry_price, stop_loss,
                take_profits, leverage, quantity, risk_percentage, exchange, account_name,
                entry_order_id, position_id, entry_order_type, status, stop_loss_breakeven,
                entry_filled_at, exit_filled_at, exit_price, pnl, expires_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.signal_id)
        .bind(&trade.channel)
        .bind(&trade.trading_pair)
        .bind(trade.direction.as_str())
        .bind(trade.entry_price.to_string())
        .bind(trade.stop_loss.to_string())
        .bind(take_profits_json(trade))
        .bind(trade.leverage.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.risk_percentage.to_string())
        .bind(&trade.exchange)
        .bind(&trade.account_name)
        .bind(&trade.entry_order_id)
        .bind(&trade.position_id)
        .bind(trade.entry_order_type.as_str())
        .bind(trade.status.as_str())
        .bind(trade.stop_loss_breakeven)
        .bind(trade.entry_filled_at.map(|t| t.to_rfc3339()))
        .bind(trade.exit_filled_at.map(|t| t.to_rfc3339()))
        .bind(trade.exit_price.map(|p| p.to_string()))
        .bind(trade.pnl.map(|p| p.to_string()))
        .bind(trade.expires_at.to_rfc3339())
        .bind(trade.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Duplicate {
                signal_id: trade.signal_id.clone(),
                account: trade.account_name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE trades SET
                entry_price = ?,
                stop_loss = ?,
                take_profits = ?,
                quantity = ?,
                position_id = ?,
                status = ?,
                stop_loss_breakeven = ?,
                entry_filled_at = ?,
                exit_filled_at = ?,
                exit_price = ?,
                pnl = ?
            WHERE id = ?
            "#,
        )
        .bind(trade.entry_price.to_string())
        .bind(trade.stop_loss.to_string())
        .bind(take_profits_json(trade))
        .bind(trade.quantity.to_string())
        .bind(&trade.position_id)
        .bind(trade.status.as_str())
        .bind(trade.stop_loss_breakeven)
        .bind(trade.entry_filled_at.map(|t| t.to_rfc3339()))
        .bind(trade.exit_filled_at.map(|t| t.to_rfc3339()))
        .bind(trade.exit_price.map(|p| p.to_string()))
        .bind(trade.pnl.map(|p| p.to_string()))
        .bind(&trade.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_trade(&self, id: &str) -> Result<Option<Trade>, StoreError> {
        let row = sqlx::query_as::<_, StoredTrade>("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Trade::try_from).transpose()
    }

    async fn get_active_trades(
        &self,
        channel: Option<&str>,
        exchange: Option<&str>,
    ) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT * FROM trades
            WHERE status IN ('pending', 'active')
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR exchange = ?)
            ORDER BY created_at
            "#,
        )
        .bind(channel)
        .bind(channel)
        .bind(exchange)
        .bind(exchange)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn list_trades(&self, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    // ==================== Orders ====================

    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, trade_id, kind, venue_order_id, price, quantity, tp_index,
                status, filled_price, filled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.trade_id)
        .bind(order.kind.as_str())
        .bind(&order.venue_order_id)
        .bind(order.price.to_string())
        .bind(order.quantity.to_string())
        .bind(order.tp_index.map(i64::from))
        .bind(order.status.as_str())
        .bind(order.filled_price.map(|p| p.to_string()))
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE orders SET
                venue_order_id = ?,
                price = ?,
                quantity = ?,
                status = ?,
                filled_price = ?,
                filled_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&order.venue_order_id)
        .bind(order.price.to_string())
        .bind(order.quantity.to_string())
        .bind(order.status.as_str())
        .bind(order.filled_price.map(|p| p.to_string()))
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .bind(&order.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_orders_by_trade_id(&self, trade_id: &str) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM orders WHERE trade_id = ? ORDER BY rowid",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    // ==================== Claims ====================

    async fn claim_take_profit_placement(&self, trade_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trades SET tp_claimed = 1
            WHERE id = ? AND tp_claimed = 0
            "#,
        )
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_take_profit_claim(&self, trade_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE trades SET tp_claimed = 0 WHERE id = ?")
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_breakeven(&self, trade_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trades SET breakeven_claimed = 1
            WHERE id = ?
              AND breakeven_claimed = 0
              AND stop_loss_breakeven = 0
              AND NOT EXISTS (
                  SELECT 1 FROM orders WHERE trade_id = ? AND kind = 'breakeven_limit'
              )
            "#,
        )
        .bind(trade_id)
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_breakeven(&self, trade_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE trades SET breakeven_claimed = 0 WHERE id = ?")
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Balances ====================

    async fn day_start_balance(
        &self,
        account: &str,
        date: NaiveDate,
        observed: Decimal,
    ) -> Result<Decimal, StoreError> {
        let day = date.format("%Y-%m-%d").to_string();

        sqlx::query(
            "INSERT OR IGNORE INTO balance_snapshots (account_name, day, balance) VALUES (?, ?, ?)",
        )
        .bind(account)
        .bind(&day)
        .bind(observed.to_string())
        .execute(&self.pool)
        .await?;

        let (balance,): (String,) = sqlx::query_as(
            "SELECT balance FROM balance_snapshots WHERE account_name = ? AND day = ?",
        )
        .bind(account)
        .bind(&day)
        .fetch_one(&self.pool)
        .await?;

        decimal("balance", &balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_trade_survives_a_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let mut trade = fixtures::pending_long();
        trade.take_profits = vec![dec!(105.5), dec!(110)];
        db.insert_trade(&trade).await.unwrap();

        let loaded = db.get_trade(&trade.id).await.unwrap().unwrap();
        assert_eq!(loaded.take_profits, trade.take_profits);
        assert_eq!(loaded.status, TradeStatus::Pending);
        assert_eq!(loaded.expires_at.timestamp(), trade.expires_at.timestamp());
    }

    #[tokio::test]
    async fn test_duplicate_signal_per_account_rejected() {
        let db = Database::in_memory().await.unwrap();
        let first = fixtures::pending_long();
        db.insert_trade(&first).await.unwrap();

        let mut again = fixtures::pending_long();
        again.signal_id = first.signal_id.clone();
        let err = db.insert_trade(&again).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        let mut other_account = fixtures::pending_long();
        other_account.account_name = "second".to_string();
        db.insert_trade(&other_account).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_trades_filter_and_skip_terminal() {
        let db = Database::in_memory().await.unwrap();
        let mut done = fixtures::pending_long();
        done.signal_id = "done".to_string();
        done.status = TradeStatus::Cancelled;
        let mut other_channel = fixtures::pending_long();
        other_channel.signal_id = "other".to_string();
        other_channel.channel = "beta".to_string();
        let live = fixtures::pending_long();

        for t in [&done, &other_channel, &live] {
            db.insert_trade(t).await.unwrap();
        }

        let all = db.get_active_trades(None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let alpha = db
            .get_active_trades(Some("alpha"), Some("simulated"))
            .await
            .unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].id, live.id);
    }

    #[tokio::test]
    async fn test_take_profit_claim_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let trade = fixtures::pending_long();
        db.insert_trade(&trade).await.unwrap();

        assert!(db.claim_take_profit_placement(&trade.id).await.unwrap());
        assert!(!db.claim_take_profit_placement(&trade.id).await.unwrap());

        // A released claim can be retaken even with part of the ladder placed.
        db.insert_order(&Order::new(&trade.id, OrderKind::TakeProfit, "tp-1", dec!(105), dec!(3)).with_tp_index(0))
            .await
            .unwrap();
        db.release_take_profit_claim(&trade.id).await.unwrap();
        assert!(db.claim_take_profit_placement(&trade.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_breakeven_claim_respects_applied_flag() {
        let db = Database::in_memory().await.unwrap();
        let mut trade = fixtures::pending_long();
        db.insert_trade(&trade).await.unwrap();

        assert!(db.claim_breakeven(&trade.id).await.unwrap());
        db.release_breakeven(&trade.id).await.unwrap();

        trade.stop_loss_breakeven = true;
        db.update_trade(&trade).await.unwrap();
        assert!(!db.claim_breakeven(&trade.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_order_update_and_lookup() {
        let db = Database::in_memory().await.unwrap();
        let trade = fixtures::pending_long();
        db.insert_trade(&trade).await.unwrap();

        let mut order = Order::new(&trade.id, OrderKind::Entry, "entry-1", dec!(100), dec!(10));
        db.insert_order(&order).await.unwrap();
        order.mark_filled(dec!(99.5), Utc::now());
        db.update_order(&order).await.unwrap();

        let orders = db.get_orders_by_trade_id(&trade.id).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(orders[0].filled_price, Some(dec!(99.5)));
    }

    #[tokio::test]
    async fn test_day_start_balance_keeps_first_observation() {
        let db = Database::in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        assert_eq!(db.day_start_balance("main", day, dec!(1000)).await.unwrap(), dec!(1000));
        assert_eq!(db.day_start_balance("main", day, dec!(900)).await.unwrap(), dec!(1000));

        let next = day.succ_opt().unwrap();
        assert_eq!(db.day_start_balance("main", next, dec!(900)).await.unwrap(), dec!(900));
    }
}
