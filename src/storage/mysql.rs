//! MySQL storage driver
//!
//! Multi-row upserts keyed on the natural unique keys, idempotent schema
//! bootstrap at startup, range deletes for retention. All statements are
//! built at runtime; nothing here requires a live database at compile time.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::{debug, info};

use super::MonitorStorage;
use crate::config::MysqlConfig;
use crate::models::{OrderAggregationRow, PositionRecord, Signal};

const SCHEMA_SQL: &[&str] = &[
    // externally owned in production; created here so a fresh database boots
    r#"CREATE TABLE IF NOT EXISTS watched_addresses (
        address     VARCHAR(64)  NOT NULL,
        enabled     TINYINT(1)   NOT NULL DEFAULT 1,
        created_at  TIMESTAMP    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (address)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS order_aggregations (
        address         VARCHAR(64)     NOT NULL,
        order_id        BIGINT UNSIGNED NOT NULL,
        direction       VARCHAR(16)     NOT NULL,
        symbol          VARCHAR(64)     NOT NULL,
        total_size      DOUBLE          NOT NULL,
        avg_price       DOUBLE          NOT NULL,
        fill_count      INT UNSIGNED    NOT NULL,
        order_status    VARCHAR(32)     NOT NULL,
        signal_sent     TINYINT(1)      NOT NULL DEFAULT 0,
        first_fill_time BIGINT          NOT NULL,
        last_fill_time  BIGINT          NOT NULL,
        fills_json      MEDIUMTEXT      NOT NULL,
        updated_at      TIMESTAMP       NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
        PRIMARY KEY (address, order_id, direction),
        KEY idx_oa_last_fill_time (last_fill_time),
        KEY idx_oa_signal_sent (signal_sent, last_fill_time)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS position_cache (
        address                VARCHAR(64) NOT NULL,
        spot_total_usd         DOUBLE      NOT NULL,
        account_value          DOUBLE      NOT NULL,
        spot_balances_json     MEDIUMTEXT  NOT NULL,
        futures_positions_json MEDIUMTEXT  NOT NULL,
        snapshot_time          BIGINT      NOT NULL,
        updated_at             TIMESTAMP   NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
        PRIMARY KEY (address)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS signals (
        id            BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        address       VARCHAR(64)     NOT NULL,
        asset_type    VARCHAR(16)     NOT NULL,
        symbol        VARCHAR(64)     NOT NULL,
        direction     VARCHAR(8)      NOT NULL,
        side          VARCHAR(8)      NOT NULL,
        position_rate DOUBLE          NOT NULL,
        close_rate    DOUBLE          NOT NULL,
        size          DOUBLE          NOT NULL,
        price         DOUBLE          NOT NULL,
        timestamp_ms  BIGINT          NOT NULL,
        created_at    TIMESTAMP       NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (id),
        KEY idx_signals_created_at (created_at),
        KEY idx_signals_address (address, created_at)
    )"#,
];

pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    pub async fn connect(cfg: &MysqlConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Duration::from_secs(cfg.conn_max_lifetime_secs))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.dsn)
            .await
            .context("Failed to connect to MySQL")?;
        info!("MySQL pool established");
        Ok(Self { pool })
    }

    /// Idempotent DDL bootstrap.
    pub async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA_SQL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Schema bootstrap statement failed")?;
        }
        debug!("Schema bootstrap complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MonitorStorage for MySqlStorage {
    async fn list_active_addresses(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT address FROM watched_addresses WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list active addresses")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("address").map_err(Into::into))
            .collect()
    }

    async fn get_sent_orders_since(&self, since: DateTime<Utc>) -> Result<Vec<OrderAggregationRow>> {
        let rows = sqlx::query(
            r#"SELECT address, order_id, direction, symbol, total_size, avg_price,
                      fill_count, order_status, signal_sent, first_fill_time,
                      last_fill_time, fills_json
               FROM order_aggregations
               WHERE signal_sent = 1 AND last_fill_time >= ?"#,
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load sent orders")?;

        rows.iter()
            .map(|row| {
                Ok(OrderAggregationRow {
                    address: row.try_get("address")?,
                    order_id: row.try_get("order_id")?,
                    direction: row.try_get("direction")?,
                    symbol: row.try_get("symbol")?,
                    total_size: row.try_get("total_size")?,
                    avg_price: row.try_get("avg_price")?,
                    fill_count: row.try_get("fill_count")?,
                    order_status: row.try_get("order_status")?,
                    signal_sent: row.try_get("signal_sent")?,
                    first_fill_time: row.try_get("first_fill_time")?,
                    last_fill_time: row.try_get("last_fill_time")?,
                    fills_json: row.try_get("fills_json")?,
                })
            })
            .collect()
    }

    async fn batch_upsert_order_aggregations(&self, rows: &[OrderAggregationRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
            "INSERT INTO order_aggregations (address, order_id, direction, symbol, total_size, \
             avg_price, fill_count, order_status, signal_sent, first_fill_time, last_fill_time, \
             fills_json) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.address)
                .push_bind(row.order_id)
                .push_bind(&row.direction)
                .push_bind(&row.symbol)
                .push_bind(row.total_size)
                .push_bind(row.avg_price)
                .push_bind(row.fill_count)
                .push_bind(&row.order_status)
                .push_bind(row.signal_sent)
                .push_bind(row.first_fill_time)
                .push_bind(row.last_fill_time)
                .push_bind(&row.fills_json);
        });
        qb.push(
            " ON DUPLICATE KEY UPDATE symbol = VALUES(symbol), total_size = VALUES(total_size), \
             avg_price = VALUES(avg_price), fill_count = VALUES(fill_count), \
             order_status = VALUES(order_status), signal_sent = VALUES(signal_sent), \
             first_fill_time = VALUES(first_fill_time), last_fill_time = VALUES(last_fill_time), \
             fills_json = VALUES(fills_json)",
        );
        qb.build()
            .execute(&self.pool)
            .await
            .context("Order aggregation upsert failed")?;
        Ok(())
    }

    async fn batch_upsert_position_cache(&self, rows: &[PositionRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
            "INSERT INTO position_cache (address, spot_total_usd, account_value, \
             spot_balances_json, futures_positions_json, snapshot_time) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.address)
                .push_bind(row.spot_total_usd)
                .push_bind(row.account_value)
                .push_bind(serde_json::to_string(&row.spot_balances).unwrap_or_default())
                .push_bind(serde_json::to_string(&row.futures_positions).unwrap_or_default())
                .push_bind(row.snapshot_time);
        });
        qb.push(
            " ON DUPLICATE KEY UPDATE spot_total_usd = VALUES(spot_total_usd), \
             account_value = VALUES(account_value), \
             spot_balances_json = VALUES(spot_balances_json), \
             futures_positions_json = VALUES(futures_positions_json), \
             snapshot_time = VALUES(snapshot_time)",
        );
        qb.build()
            .execute(&self.pool)
            .await
            .context("Position cache upsert failed")?;
        Ok(())
    }

    async fn create_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO signals (address, asset_type, symbol, direction, side,
                                    position_rate, close_rate, size, price, timestamp_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&signal.address)
        .bind(&signal.asset_type)
        .bind(&signal.symbol)
        .bind(&signal.direction)
        .bind(&signal.side)
        .bind(signal.position_rate)
        .bind(signal.close_rate)
        .bind(signal.size)
        .bind(signal.price)
        .bind(signal.timestamp)
        .execute(&self.pool)
        .await
        .context("Signal insert failed")?;
        Ok(())
    }

    async fn delete_aggregations_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM order_aggregations WHERE last_fill_time < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Aggregation retention delete failed")?;
        Ok(result.rows_affected())
    }

    async fn delete_signals_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM signals WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Signal retention delete failed")?;
        Ok(result.rows_affected())
    }
}
