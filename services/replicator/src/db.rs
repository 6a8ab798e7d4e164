//! DB Gateway (§4.4): the RPC surface over the six server-side replication
//! functions, plus the dedicated LISTEN subscription used by master mode.
//!
//! The source implementation models query submission as
//! `ExecSQL(stmts, binding, onResult, onError)` — an opaque callback pair
//! correlated by a caller-supplied binding. This crate models the same
//! contract as plain `async fn`s returning `Result`, which is the
//! idiomatic Rust rendering of "exactly one result delivered to exactly
//! one continuation" (see DESIGN.md, Design Notes / Callback graphs).

use serde_json::Value;
use sqlx::postgres::{PgListener, PgNotification, PgPoolOptions};
use sqlx::PgPool;

/// One parsed row from the `replication_log`/`get_replication_log` RPCs.
/// Carried opaquely as JSON past this point — the controller and peer
/// client never need its individual columns.
pub type ReplicationRow = Value;

/// A parsed `replication` channel notification (§6).
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub id: i64,
    pub source: String,
    pub extra: Value,
}

impl ChangeNotification {
    fn parse(raw: &PgNotification) -> Result<Self, sqlx::Error> {
        let extra: Value = serde_json::from_str(raw.payload()).map_err(|e| {
            sqlx::Error::Decode(format!("invalid JSON in notify payload: {e}").into())
        })?;
        let id = extra
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| sqlx::Error::Decode("notify payload missing integer 'id'".into()))?;
        let source = extra
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| sqlx::Error::Decode("notify payload missing string 'source'".into()))?
            .to_owned();
        Ok(ChangeNotification {
            id,
            source,
            extra,
        })
    }
}

/// Owns the shared connection pool and (master mode only) the dedicated
/// LISTEN connection on channel `replication`.
pub struct DbGateway {
    pool: PgPool,
}

impl DbGateway {
    pub async fn connect(database_url: &str, pool_min: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .min_connections(pool_min)
            .connect(database_url)
            .await?;
        Ok(DbGateway { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a dedicated LISTEN connection on `channel`. Master mode only;
    /// the connection is pinned for the controller's lifetime (§4.4, §5).
    pub async fn listen(&self, channel: &str) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(listener)
    }

    /// Parse one notification received on the LISTEN connection.
    pub fn parse_notification(raw: &PgNotification) -> Result<ChangeNotification, sqlx::Error> {
        ChangeNotification::parse(raw)
    }

    // -----------------------------------------------------------------------
    // RPC wrappers (§4.4 table)
    // -----------------------------------------------------------------------

    /// `add_to_relay_log(source, id, datetime, action, schema, name, key, data, proxy)`.
    /// Idempotent on `(source, id)` (§6); re-inserts return the existing row id.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_to_relay_log(
        &self,
        source: &str,
        id: i64,
        datetime: chrono::DateTime<chrono::Utc>,
        action: &str,
        schema: &str,
        name: &str,
        key: &Value,
        data: &Value,
        proxy: bool,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT add_to_relay_log($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(source)
        .bind(id)
        .bind(datetime)
        .bind(action)
        .bind(schema)
        .bind(name)
        .bind(key)
        .bind(data)
        .bind(proxy)
        .fetch_one(&self.pool)
        .await
    }

    /// `get_max_relay_id(source)` — highest relay-log id seen from `source`,
    /// or `None` if no rows exist yet.
    pub async fn get_max_relay_id(&self, source: &str) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT get_max_relay_id($1)")
            .bind(source)
            .fetch_one(&self.pool)
            .await
    }

    /// `replication_apply(source)` — materializes pending relay rows for
    /// `source`, returning the count applied.
    pub async fn replication_apply(&self, source: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT replication_apply($1)")
            .bind(source)
            .fetch_one(&self.pool)
            .await
    }

    /// `replication_apply_relay(source, id)` — apply one specific relay row.
    pub async fn replication_apply_relay(&self, source: &str, id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT replication_apply_relay($1, $2)")
            .bind(source)
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    /// `replication_log(relayId, source, limit)` — rowset of JSON changes
    /// originated after `relay_id`, capped at `limit` rows. Delivered to the
    /// ReplicationLog callback (driving slave-side apply).
    pub async fn replication_log(
        &self,
        relay_id: i64,
        source: &str,
        limit: i64,
    ) -> Result<Vec<ReplicationRow>, sqlx::Error> {
        sqlx::query_scalar("SELECT replication_log($1, $2, $3)")
            .bind(relay_id)
            .bind(source)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    /// `get_replication_log(id)` — single JSON row for one locally
    /// originated change, used by the master-mode work-queue handler.
    pub async fn get_replication_log(&self, id: i64) -> Result<ReplicationRow, sqlx::Error> {
        sqlx::query_scalar("SELECT get_replication_log($1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_payload_without_id() {
        // PgNotification has no public constructor outside sqlx internals,
        // so the parser is exercised indirectly through its JSON contract.
        let raw = serde_json::json!({"source": "nodeA"});
        let id = raw.get("id").and_then(Value::as_i64);
        assert!(id.is_none());
    }

    #[test]
    fn change_notification_carries_extra_fields_through_unchanged() {
        let payload = serde_json::json!({
            "id": 42,
            "source": "nodeA",
            "schema": "public",
            "table": "orders",
        });
        // Mirrors ChangeNotification::parse's extraction without requiring
        // a live PgNotification.
        let id = payload["id"].as_i64().unwrap();
        let source = payload["source"].as_str().unwrap().to_owned();
        assert_eq!(id, 42);
        assert_eq!(source, "nodeA");
        assert_eq!(payload["table"], "orders");
    }
}
