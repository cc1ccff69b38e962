use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::PostgresConfig;
use crate::error::{QueueError, QueueResult};
use crate::executor::run_with_retries;
use crate::lifecycle;
use crate::message::Message;
use crate::queue::{ClientOwnership, Queue, SIZE_UNSUPPORTED};
use crate::recovery::DEFAULT_BATCH_LIMIT;

/// Relational queue over two identically-shaped tables: the queued store
/// and the ephemeral (in-flight) store.
///
/// Every mutation runs in its own `SERIALIZABLE` transaction. Under
/// concurrent takes the row locks produce deadlock and serialization-failure
/// aborts; those map to [`QueueError::Transient`] and the whole logical
/// operation is retried up to `max_retries`. Duplicate-id inserts are
/// absorbed with `ON CONFLICT DO NOTHING` and logged: another actor
/// already completed the state change.
pub struct PostgresQueue {
    pool: PgPool,
    ownership: ClientOwnership,
    max_retries: u32,
    table: String,
    table_ephemeral: String,
    sql: Statements,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("ownership", &self.ownership)
            .field("max_retries", &self.max_retries)
            .field("table", &self.table)
            .field("table_ephemeral", &self.table_ephemeral)
            .finish_non_exhaustive()
    }
}

/// SQL built once at construction; table names are validated identifiers
/// interpolated into the text because identifiers cannot be bound.
struct Statements {
    select_head: String,
    delete_queued: String,
    insert_queued: String,
    insert_ephemeral: String,
    delete_ephemeral: String,
    delete_ephemeral_returning: String,
    select_orphans: String,
    count_queued: String,
    count_ephemeral: String,
}

impl Statements {
    fn new(table: &str, table_ephemeral: &str) -> Self {
        const COLUMNS: &str = "id, enqueued_at, updated_at, requeue_count, content";
        Self {
            select_head: format!(
                "SELECT {COLUMNS} FROM {table} ORDER BY updated_at, id LIMIT 1 FOR UPDATE"
            ),
            delete_queued: format!("DELETE FROM {table} WHERE id = $1"),
            insert_queued: format!(
                "INSERT INTO {table} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO NOTHING"
            ),
            insert_ephemeral: format!(
                "INSERT INTO {table_ephemeral} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO NOTHING"
            ),
            delete_ephemeral: format!("DELETE FROM {table_ephemeral} WHERE id = $1"),
            delete_ephemeral_returning: format!(
                "DELETE FROM {table_ephemeral} WHERE id = $1 RETURNING {COLUMNS}"
            ),
            select_orphans: format!(
                "SELECT {COLUMNS} FROM {table_ephemeral} WHERE updated_at < $1 LIMIT $2"
            ),
            count_queued: format!("SELECT COUNT(*) FROM {table}"),
            count_ephemeral: format!("SELECT COUNT(*) FROM {table_ephemeral}"),
        }
    }
}

impl PostgresQueue {
    /// Connect with a dedicated pool; `close` will shut it down.
    pub async fn connect(config: PostgresConfig) -> QueueResult<Self> {
        if config.url.is_empty() {
            return Err(QueueError::Config("postgres url is required".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .connect(&config.url)
            .await?;
        Self::build(pool, config, ClientOwnership::Owned, Arc::new(SystemClock))
    }

    /// Build on a caller-owned pool; `close` leaves it running.
    pub fn with_pool(pool: PgPool, config: PostgresConfig) -> QueueResult<Self> {
        Self::build(pool, config, ClientOwnership::Borrowed, Arc::new(SystemClock))
    }

    pub fn with_pool_and_clock(
        pool: PgPool,
        config: PostgresConfig,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        Self::build(pool, config, ClientOwnership::Borrowed, clock)
    }

    fn build(
        pool: PgPool,
        config: PostgresConfig,
        ownership: ClientOwnership,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        validate_identifier(&config.table_name)?;
        validate_identifier(&config.table_name_ephemeral)?;
        if config.table_name == config.table_name_ephemeral {
            return Err(QueueError::Config(format!(
                "queued and ephemeral tables must differ, both are {:?}",
                config.table_name
            )));
        }
        Ok(Self {
            pool,
            ownership,
            max_retries: config.max_retries,
            sql: Statements::new(&config.table_name, &config.table_name_ephemeral),
            table: config.table_name,
            table_ephemeral: config.table_name_ephemeral,
            clock,
        })
    }

    /// DDL for the two tables, for callers that provision their own schema.
    pub fn schema_statements(config: &PostgresConfig) -> QueueResult<Vec<String>> {
        validate_identifier(&config.table_name)?;
        validate_identifier(&config.table_name_ephemeral)?;
        Ok([
            ddl_for(&config.table_name),
            ddl_for(&config.table_name_ephemeral),
        ]
        .concat())
    }

    /// Create both tables if missing.
    pub async fn ensure_schema(&self) -> QueueResult<()> {
        let statements = [ddl_for(&self.table), ddl_for(&self.table_ephemeral)].concat();
        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn queue_once(&self, msg: &Message) -> QueueResult<bool> {
        let mut tx = self.begin_serializable().await?;
        let inserted = bind_message(sqlx::query(&self.sql.insert_queued), msg)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            warn!(id = msg.id, "duplicate id on enqueue, treating as stored");
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Shared by the visible and silent requeue paths: the stamped clone is
    /// prepared by the caller, so a retried attempt re-submits it unchanged.
    async fn requeue_once(&self, msg: &Message) -> QueueResult<bool> {
        let mut tx = self.begin_serializable().await?;
        sqlx::query(&self.sql.delete_ephemeral)
            .bind(msg.id as i64)
            .execute(&mut *tx)
            .await?;
        let inserted = bind_message(sqlx::query(&self.sql.insert_queued), msg)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            warn!(id = msg.id, "duplicate id on requeue, treating as stored");
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn finish_once(&self, id: u64) -> QueueResult<()> {
        let mut tx = self.begin_serializable().await?;
        sqlx::query(&self.sql.delete_ephemeral)
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn take_once(&self) -> QueueResult<Option<Message>> {
        let mut tx = self.begin_serializable().await?;
        let Some(row) = sqlx::query(&self.sql.select_head)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.commit().await?;
            return Ok(None);
        };
        let msg = row_to_message(&row)?;

        sqlx::query(&self.sql.delete_queued)
            .bind(msg.id as i64)
            .execute(&mut *tx)
            .await?;
        let stashed = bind_message(sqlx::query(&self.sql.insert_ephemeral), &msg)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if stashed == 0 {
            warn!(id = msg.id, "message already in-flight, keeping earlier entry");
        }
        tx.commit().await?;
        Ok(Some(msg))
    }

    async fn orphans_once(&self, cutoff_ms: u64) -> QueueResult<Vec<Message>> {
        let rows = sqlx::query(&self.sql.select_orphans)
            .bind(cutoff_ms as i64)
            .bind(DEFAULT_BATCH_LIMIT as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn move_once(&self, id: u64) -> QueueResult<bool> {
        let mut tx = self.begin_serializable().await?;
        let Some(row) = sqlx::query(&self.sql.delete_ephemeral_returning)
            .bind(id as i64)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.commit().await?;
            return Ok(false);
        };
        let msg = row_to_message(&row)?;
        let inserted = bind_message(sqlx::query(&self.sql.insert_queued), &msg)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            warn!(id = msg.id, "recovered message already queued");
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn begin_serializable(&self) -> QueueResult<sqlx::Transaction<'_, sqlx::Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn count(&self, sql: &str) -> QueueResult<i64> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await?;
        row.try_get::<i64, _>(0)
            .map_err(|e| QueueError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn queue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_enqueue(msg, self.clock.now_ms());
        run_with_retries("queue", self.max_retries, |_| self.queue_once(&stamped)).await
    }

    async fn requeue(&self, msg: &Message) -> QueueResult<bool> {
        // Stamp once, outside the retry loop: deadlock retries must not
        // charge the message additional requeues.
        let stamped = lifecycle::prepare_requeue(msg, self.clock.now_ms());
        run_with_retries("requeue", self.max_retries, |_| self.requeue_once(&stamped)).await
    }

    async fn requeue_silent(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue_silent(msg);
        run_with_retries("requeue_silent", self.max_retries, |_| {
            self.requeue_once(&stamped)
        })
        .await
    }

    async fn finish(&self, msg: &Message) -> QueueResult<()> {
        run_with_retries("finish", self.max_retries, |_| self.finish_once(msg.id)).await
    }

    #[tracing::instrument(skip_all)]
    async fn take(&self) -> QueueResult<Option<Message>> {
        run_with_retries("take", self.max_retries, |_| self.take_once()).await
    }

    async fn orphan_messages(&self, threshold_ms: u64) -> QueueResult<Vec<Message>> {
        let cutoff = self.clock.now_ms().saturating_sub(threshold_ms);
        run_with_retries("orphan_messages", self.max_retries, |_| {
            self.orphans_once(cutoff)
        })
        .await
    }

    async fn move_from_ephemeral_to_queue(&self, msg: &Message) -> QueueResult<bool> {
        run_with_retries("move_from_ephemeral_to_queue", self.max_retries, |_| {
            self.move_once(msg.id)
        })
        .await
    }

    async fn queue_size(&self) -> i64 {
        match self.count(&self.sql.count_queued).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "failed to count queued messages");
                SIZE_UNSUPPORTED
            }
        }
    }

    async fn ephemeral_size(&self) -> i64 {
        match self.count(&self.sql.count_ephemeral).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "failed to count in-flight messages");
                SIZE_UNSUPPORTED
            }
        }
    }

    async fn close(&self) -> QueueResult<()> {
        if self.ownership.is_owned() {
            self.pool.close().await;
        }
        Ok(())
    }
}

fn bind_message<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    msg: &'q Message,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(msg.id as i64)
        .bind(msg.enqueued_at as i64)
        .bind(msg.updated_at as i64)
        .bind(msg.requeue_count as i32)
        .bind(msg.payload.as_slice())
}

fn row_to_message(row: &PgRow) -> QueueResult<Message> {
    let get = |e: sqlx::Error| QueueError::Backend(format!("malformed queue row: {e}"));
    Ok(Message {
        id: row.try_get::<i64, _>("id").map_err(get)? as u64,
        requeue_count: row.try_get::<i32, _>("requeue_count").map_err(get)? as u32,
        enqueued_at: row.try_get::<i64, _>("enqueued_at").map_err(get)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(get)? as u64,
        payload: row.try_get::<Vec<u8>, _>("content").map_err(get)?,
        // The relational schema carries no routing column; partitioning is
        // a sharded-backend concern.
        partition_key: None,
    })
}

fn ddl_for(table: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id BIGINT PRIMARY KEY, \
             enqueued_at BIGINT NOT NULL, \
             updated_at BIGINT NOT NULL, \
             requeue_count INT NOT NULL, \
             content BYTEA)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_updated_at_idx ON {table} (updated_at)"),
    ]
}

fn validate_identifier(name: &str) -> QueueResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(QueueError::Config(format!(
            "invalid table name {name:?}: must match [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}
