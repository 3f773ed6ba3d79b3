use std::time::Duration;

use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use appshot_core::broker::{Delivery, MessageBroker};
use appshot_core::error::AppError;
use appshot_core::job::{Priority, QueueMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// PostgreSQL-backed broker using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// A claimed message is hidden by pushing `visible_at` past the visibility
/// timeout. If the consumer dies before acking it reappears on its own.
/// Ack and reschedule match on `delivery_count`, so a consumer whose lease
/// expired cannot touch the message after it was claimed again.
#[derive(Clone)]
pub struct QueueRepository {
    pool: Pool<Postgres>,
    visibility_timeout: Duration,
}

impl QueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

fn broker_err(e: sqlx::Error) -> AppError {
    AppError::BrokerUnavailable(e.to_string())
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    queue: String,
    job_id: Uuid,
    app_id: String,
    store: String,
    attempt: i32,
    priority: i16,
    delivery_count: i32,
    force_refresh: bool,
}

impl TryFrom<MessageRow> for Delivery {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let store = row.store.parse().map_err(|e: AppError| {
            AppError::BrokerUnavailable(format!("Corrupt store on message {}: {e}", row.id))
        })?;

        Ok(Delivery {
            id: row.id,
            queue: row.queue,
            message: QueueMessage {
                job_id: row.job_id,
                app_id: row.app_id,
                store,
                attempt: row.attempt.max(0) as u32,
                force_refresh: row.force_refresh,
            },
            priority: Priority::from_weight(row.priority),
            delivery_count: row.delivery_count.max(0) as u32,
        })
    }
}

impl MessageBroker for QueueRepository {
    async fn publish(
        &self,
        queue: &str,
        message: &QueueMessage,
        priority: Priority,
        delay: Duration,
    ) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queue_messages
                (id, queue, job_id, app_id, store, attempt, priority, force_refresh, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW() + make_interval(secs => $9))
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(message.job_id)
        .bind(&message.app_id)
        .bind(message.store.as_str())
        .bind(message.attempt as i32)
        .bind(priority.weight())
        .bind(message.force_refresh)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(broker_err)?;

        tracing::trace!(%queue, job_id = %message.job_id, delivery_id = %id, "Message published");
        Ok(id)
    }

    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, AppError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + make_interval(secs => $2),
                delivery_count = delivery_count + 1,
                consumer = $3
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND visible_at <= NOW()
                ORDER BY priority DESC, visible_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, job_id, app_id, store, attempt, priority, delivery_count, force_refresh
            "#,
        )
        .bind(queue)
        .bind(self.visibility_timeout.as_secs_f64())
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(broker_err)?;

        row.map(Delivery::try_from).transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND delivery_count = $2")
                .bind(delivery.id)
                .bind(delivery.delivery_count as i32)
                .execute(&self.pool)
            .await
            .map_err(broker_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        delivery: &Delivery,
        attempt: u32,
        delay: Duration,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET attempt = $2,
                visible_at = NOW() + make_interval(secs => $3),
                consumer = NULL
            WHERE id = $1 AND delivery_count = $4
            "#,
        )
        .bind(delivery.id)
        .bind(attempt as i32)
        .bind(delay.as_secs_f64())
        .bind(delivery.delivery_count as i32)
        .execute(&self.pool)
        .await
        .map_err(broker_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self, queue: &str) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(broker_err)?;

        Ok(count.max(0) as u64)
    }
}
