use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::{OrderRepository, PositionRepository, WorkloadRepository};
use crate::types::{
    Account, Order, Pair, Position, PositionFilter, PositionStatus, PositionType, Side, Workload,
};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Initialize database with schema
    pub async fn new(db_path: &str) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_path);

        let options = SqliteConnectOptions::from_str(db_path)?.create_if_missing(true);

        // A pooled :memory: database would open one empty db per connection.
        let max_connections = if db_path.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                exchange TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                risk_factor TEXT NOT NULL,
                open_positions_limit INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workloads (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                workload_id TEXT NOT NULL REFERENCES workloads(id),
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                take_profit_price TEXT NOT NULL,
                stop_loss_price TEXT NOT NULL,
                time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_workload_status
                ON positions(workload_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions(id),
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                size TEXT NOT NULL,
                time TEXT NOT NULL,
                executed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_position ON orders(position_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PositionRepository for Database {
    async fn create_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (id, workload_id, type, status, entry_price, size,
                 take_profit_price, stop_loss_price, time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.id.to_string())
        .bind(position.workload_id.to_string())
        .bind(position.position_type.as_str())
        .bind(position.status.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.size.to_string())
        .bind(position.take_profit_price.to_string())
        .bind(position.stop_loss_price.to_string())
        .bind(position.time.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<()> {
        sqlx::query("UPDATE positions SET status = ? WHERE id = ?")
            .bind(position.status.as_str())
            .bind(position.id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn positions(&self, filter: PositionFilter) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT
                p.id, p.workload_id, p.type, p.status, p.entry_price, p.size,
                p.take_profit_price, p.stop_loss_price, p.time,
                o.id AS order_id, o.side AS order_side, o.price AS order_price,
                o.size AS order_size, o.time AS order_time,
                o.executed AS order_executed
            FROM positions p
            LEFT JOIN orders o ON o.position_id = p.id
            WHERE p.workload_id = ? AND p.status = ?
            ORDER BY o.time ASC
            "#,
        )
        .bind(filter.workload_id.to_string())
        .bind(filter.status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut positions_by_id: HashMap<Uuid, Position> = HashMap::new();
        let mut insertion_order: Vec<Uuid> = Vec::new();

        for row in rows {
            let position_id = parse_uuid(row.get::<String, _>("id"))?;

            if !positions_by_id.contains_key(&position_id) {
                let position = Position {
                    id: position_id,
                    workload_id: parse_uuid(row.get::<String, _>("workload_id"))?,
                    position_type: PositionType::parse(&row.get::<String, _>("type"))?,
                    status: PositionStatus::parse(&row.get::<String, _>("status"))?,
                    entry_price: parse_decimal(row.get::<String, _>("entry_price"))?,
                    size: parse_decimal(row.get::<String, _>("size"))?,
                    take_profit_price: parse_decimal(row.get::<String, _>("take_profit_price"))?,
                    stop_loss_price: parse_decimal(row.get::<String, _>("stop_loss_price"))?,
                    time: parse_time(row.get::<String, _>("time"))?,
                    orders: Vec::new(),
                };

                positions_by_id.insert(position_id, position);
                insertion_order.push(position_id);
            }

            if let Some(order_id) = row.get::<Option<String>, _>("order_id") {
                let order = Order {
                    id: parse_uuid(order_id)?,
                    position_id,
                    side: Side::parse(&row.get::<String, _>("order_side"))?,
                    price: parse_decimal(row.get::<String, _>("order_price"))?,
                    size: parse_decimal(row.get::<String, _>("order_size"))?,
                    time: parse_time(row.get::<String, _>("order_time"))?,
                    executed: row.get::<i64, _>("order_executed") != 0,
                };

                positions_by_id
                    .get_mut(&position_id)
                    .expect("position inserted above")
                    .orders
                    .push(order);
            }
        }

        Ok(insertion_order
            .into_iter()
            .map(|id| positions_by_id.remove(&id).expect("id from map"))
            .collect())
    }

    async fn positions_count(&self, filter: PositionFilter) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM positions WHERE workload_id = ? AND status = ?",
        )
        .bind(filter.workload_id.to_string())
        .bind(filter.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("count"))
    }
}

#[async_trait]
impl OrderRepository for Database {
    async fn create_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, position_id, side, price, size, time, executed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.position_id.to_string())
        .bind(order.side.as_str())
        .bind(order.price.to_string())
        .bind(order.size.to_string())
        .bind(order.time.to_rfc3339())
        .bind(order.executed as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        sqlx::query("UPDATE orders SET executed = ? WHERE id = ?")
            .bind(order.executed as i64)
            .bind(order.id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkloadRepository for Database {
    async fn workloads(&self) -> Result<Vec<Workload>> {
        let rows = sqlx::query(
            r#"
            SELECT
                w.id, w.base_asset, w.quote_asset,
                a.id AS account_id, a.email, a.exchange, a.api_key, a.api_secret,
                a.risk_factor, a.open_positions_limit
            FROM workloads w
            JOIN accounts a ON a.id = w.account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workloads = Vec::with_capacity(rows.len());

        for row in rows {
            workloads.push(Workload {
                id: parse_uuid(row.get::<String, _>("id"))?,
                account: Account {
                    id: parse_uuid(row.get::<String, _>("account_id"))?,
                    email: row.get("email"),
                    exchange: row.get("exchange"),
                    api_key: row.get("api_key"),
                    api_secret: row.get("api_secret"),
                    risk_factor: parse_decimal(row.get::<String, _>("risk_factor"))?,
                    open_positions_limit: row.get("open_positions_limit"),
                },
                pair: Pair::new(
                    row.get::<String, _>("base_asset"),
                    row.get::<String, _>("quote_asset"),
                ),
            });
        }

        Ok(workloads)
    }

    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO accounts
                (id, email, exchange, api_key, api_secret, risk_factor, open_positions_limit)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workload.account.id.to_string())
        .bind(&workload.account.email)
        .bind(&workload.account.exchange)
        .bind(&workload.account.api_key)
        .bind(&workload.account.api_secret)
        .bind(workload.account.risk_factor.to_string())
        .bind(workload.account.open_positions_limit)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workloads (id, account_id, base_asset, quote_asset)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(workload.id.to_string())
        .bind(workload.account.id.to_string())
        .bind(workload.pair.base.as_str())
        .bind(workload.pair.quote.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|e| anyhow!("malformed id [{}]: {}", value, e))
}

fn parse_decimal(value: String) -> Result<Decimal> {
    Decimal::from_str(&value).map_err(|e| anyhow!("malformed decimal [{}]: {}", value, e))
}

fn parse_time(value: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&value)
        .map_err(|e| anyhow!("malformed timestamp [{}]: {}", value, e))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn workload() -> Workload {
        Workload {
            id: Uuid::new_v4(),
            account: Account {
                id: Uuid::new_v4(),
                email: "trader@example.com".to_string(),
                exchange: "BINANCE".to_string(),
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                risk_factor: dec!(0.02),
                open_positions_limit: 1,
            },
            pair: Pair::new("ETH", "USDT"),
        }
    }

    fn position(workload_id: Uuid) -> Position {
        Position {
            id: Uuid::new_v4(),
            workload_id,
            position_type: PositionType::Long,
            status: PositionStatus::Open,
            entry_price: dec!(2000),
            size: dec!(0.4),
            take_profit_price: dec!(2052.05),
            stop_loss_price: dec!(1948.05),
            time: Utc::now(),
            orders: Vec::new(),
        }
    }

    #[tokio::test]
    async fn round_trips_workloads() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let workload = workload();

        db.create_workload(&workload).await.unwrap();

        let loaded = db.workloads().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, workload.id);
        assert_eq!(loaded[0].pair, workload.pair);
        assert_eq!(loaded[0].account.risk_factor, dec!(0.02));
    }

    #[tokio::test]
    async fn attaches_orders_to_positions_sorted_by_time() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let workload = workload();
        db.create_workload(&workload).await.unwrap();

        let mut position = position(workload.id);
        db.create_position(&position).await.unwrap();

        let entry = Order {
            id: Uuid::new_v4(),
            position_id: position.id,
            side: Side::Buy,
            price: dec!(2000),
            size: dec!(0.4),
            time: Utc::now(),
            executed: true,
        };
        let exit = Order {
            id: Uuid::new_v4(),
            position_id: position.id,
            side: Side::Sell,
            price: dec!(2052),
            size: dec!(0.4),
            time: entry.time + chrono::Duration::seconds(30),
            executed: false,
        };

        // Persist exit first; the query must still order by time.
        db.create_order(&exit).await.unwrap();
        db.create_order(&entry).await.unwrap();

        let loaded = db
            .positions(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].orders.len(), 2);
        assert_eq!(loaded[0].orders[0].id, entry.id);
        assert_eq!(loaded[0].orders[1].id, exit.id);

        position.status = PositionStatus::Closed;
        db.update_position(&position).await.unwrap();

        let still_open = db
            .positions_count(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert_eq!(still_open, 0);
    }

    #[tokio::test]
    async fn order_execution_update_is_persisted() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let workload = workload();
        db.create_workload(&workload).await.unwrap();

        let position = position(workload.id);
        db.create_position(&position).await.unwrap();

        let mut order = Order {
            id: Uuid::new_v4(),
            position_id: position.id,
            side: Side::Buy,
            price: dec!(2000),
            size: dec!(0.4),
            time: Utc::now(),
            executed: false,
        };
        db.create_order(&order).await.unwrap();

        order.executed = true;
        db.update_order(&order).await.unwrap();

        let loaded = db
            .positions(PositionFilter {
                workload_id: workload.id,
                status: PositionStatus::Open,
            })
            .await
            .unwrap();
        assert!(loaded[0].orders[0].executed);
    }
}
