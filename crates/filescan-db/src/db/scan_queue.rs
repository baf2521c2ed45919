//! Durable scan queue tables
//!
//! Messages live in `scan_queue_messages` until a consumer acknowledges them.
//! Claiming uses `FOR UPDATE SKIP LOCKED` so several workers can share a queue
//! without coordination. A claimed message carries the consumer's tag and a lease;
//! once the lease runs out the message is claimable again, which is how deliveries
//! held by a crashed worker come back.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

/// Channel name for PostgreSQL LISTEN/NOTIFY when a message is published.
pub const QUEUE_NOTIFY_CHANNEL: &str = "filescan_queue_message";

/// A message claimed by one consumer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueMessage {
    pub id: i64,
    pub queue_name: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: i32,
}

/// Options a queue was first declared with.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueDeclaration {
    pub durable: bool,
    pub dead_letter_queue: Option<String>,
}

#[derive(Clone)]
pub struct ScanQueueRepository {
    pool: PgPool,
}

impl ScanQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue unless it exists. Returns the declaration as stored, which
    /// differs from the arguments when an earlier declaration used other options.
    #[tracing::instrument(skip(self))]
    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        dead_letter_queue: Option<&str>,
    ) -> Result<QueueDeclaration, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO scan_queues (name, durable, dead_letter_queue)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(durable)
        .bind(dead_letter_queue)
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as::<Postgres, QueueDeclaration>(
            "SELECT durable, dead_letter_queue FROM scan_queues WHERE name = $1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(queue = %name, durable = stored.durable, "Queue declared");
        Ok(stored)
    }

    /// Insert a message and wake listening consumers. Returns `None` when the
    /// queue has not been declared.
    #[tracing::instrument(skip(self, body), fields(body_len = body.len()))]
    pub async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let declared: bool =
            sqlx::query_scalar::<Postgres, bool>("SELECT EXISTS (SELECT 1 FROM scan_queues WHERE name = $1)")
                .bind(queue)
                .fetch_one(&mut *tx)
                .await?;
        if !declared {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar::<Postgres, i64>(
            r#"
            INSERT INTO scan_queue_messages (queue_name, body, persistent)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(body)
        .bind(persistent)
        .fetch_one(&mut *tx)
        .await?;

        // Delivered on commit, together with the row.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(QUEUE_NOTIFY_CHANNEL)
            .bind(queue)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(queue = %queue, message_id = id, "Message stored");
        Ok(Some(id))
    }

    /// Claim the oldest available message of `queue` for `consumer_tag`.
    ///
    /// Returns `None` when the queue is empty or the consumer already holds
    /// `prefetch` unexpired deliveries (`prefetch == 0` means unlimited).
    #[tracing::instrument(skip(self))]
    pub async fn claim_next(
        &self,
        queue: &str,
        consumer_tag: Uuid,
        prefetch: u16,
        lease: Duration,
    ) -> Result<Option<QueueMessage>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if prefetch > 0 {
            let held: i64 = sqlx::query_scalar::<Postgres, i64>(
                r#"
                SELECT COUNT(*)
                FROM scan_queue_messages
                WHERE consumer_tag = $1
                    AND state = 'in_flight'
                    AND locked_until > NOW()
                "#,
            )
            .bind(consumer_tag)
            .fetch_one(&mut *tx)
            .await?;

            if held >= i64::from(prefetch) {
                tx.rollback().await.ok();
                return Ok(None);
            }
        }

        let next: Option<i64> = sqlx::query_scalar::<Postgres, i64>(
            r#"
            SELECT id
            FROM scan_queue_messages
            WHERE queue_name = $1
                AND (state = 'ready' OR (state = 'in_flight' AND locked_until <= NOW()))
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = next else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let message: QueueMessage = sqlx::query_as::<Postgres, QueueMessage>(
            r#"
            UPDATE scan_queue_messages
            SET state = 'in_flight',
                consumer_tag = $2,
                locked_until = NOW() + ($3 * interval '1 second'),
                delivery_count = delivery_count + 1
            WHERE id = $1
            RETURNING id, queue_name, body, delivery_count
            "#,
        )
        .bind(id)
        .bind(consumer_tag)
        .bind(lease.as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            message_id = message.id,
            delivery_count = message.delivery_count,
            "Message claimed"
        );
        Ok(Some(message))
    }

    /// Remove an acknowledged message. Returns `false` if the consumer no longer
    /// holds it (lease expired and another consumer claimed it).
    #[tracing::instrument(skip(self))]
    pub async fn ack(&self, id: i64, consumer_tag: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM scan_queue_messages
            WHERE id = $1
                AND consumer_tag = $2
                AND state = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(consumer_tag)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Put a held message back at its original position in the queue.
    #[tracing::instrument(skip(self))]
    pub async fn requeue(&self, id: i64, consumer_tag: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE scan_queue_messages
            SET state = 'ready',
                consumer_tag = NULL,
                locked_until = NULL
            WHERE id = $1
                AND consumer_tag = $2
                AND state = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(consumer_tag)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reject a held message for good: move it to the queue's dead-letter queue
    /// if one is configured, delete it otherwise.
    #[tracing::instrument(skip(self))]
    pub async fn discard(&self, id: i64, consumer_tag: Uuid) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT m.queue_name, q.dead_letter_queue
            FROM scan_queue_messages m
            JOIN scan_queues q ON q.name = m.queue_name
            WHERE m.id = $1
                AND m.consumer_tag = $2
                AND m.state = 'in_flight'
            FOR UPDATE OF m
            "#,
        )
        .bind(id)
        .bind(consumer_tag)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(false);
        };
        let queue_name: String = row.get("queue_name");
        let dead_letter_queue: Option<String> = row.get("dead_letter_queue");

        match dead_letter_queue {
            Some(dlq) => {
                sqlx::query(
                    r#"
                    UPDATE scan_queue_messages
                    SET queue_name = $2,
                        state = 'ready',
                        consumer_tag = NULL,
                        locked_until = NULL,
                        dead_lettered_from = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&dlq)
                .bind(&queue_name)
                .execute(&mut *tx)
                .await?;
                tracing::info!(message_id = id, queue = %queue_name, dead_letter_queue = %dlq, "Message dead-lettered");
            }
            None => {
                sqlx::query("DELETE FROM scan_queue_messages WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tracing::info!(message_id = id, queue = %queue_name, "Message discarded");
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Return every delivery held by `consumer_tag` to its queue. Called when a
    /// channel closes cleanly.
    #[tracing::instrument(skip(self))]
    pub async fn release_consumer(&self, consumer_tag: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE scan_queue_messages
            SET state = 'ready',
                consumer_tag = NULL,
                locked_until = NULL
            WHERE consumer_tag = $1
                AND state = 'in_flight'
            "#,
        )
        .bind(consumer_tag)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of messages stored in `queue`, delivered or not.
    pub async fn count(&self, queue: &str) -> Result<i64> {
        sqlx::query_scalar::<Postgres, i64>(
            "SELECT COUNT(*) FROM scan_queue_messages WHERE queue_name = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count queue messages")
    }

    /// Move up to `limit` ready messages from `from` to `to`, oldest first, and
    /// wake consumers. Used to replay dead letters.
    #[tracing::instrument(skip(self))]
    pub async fn move_messages(&self, from: &str, to: &str, limit: i64) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for message move")?;

        let result = sqlx::query(
            r#"
            UPDATE scan_queue_messages
            SET queue_name = $2,
                state = 'ready',
                consumer_tag = NULL,
                locked_until = NULL,
                delivery_count = 0,
                dead_lettered_from = NULL
            WHERE id IN (
                SELECT id
                FROM scan_queue_messages
                WHERE queue_name = $1
                    AND state = 'ready'
                ORDER BY id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(limit)
        .execute(&mut *tx)
        .await
        .context("Failed to move queue messages")?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(QUEUE_NOTIFY_CHANNEL)
            .bind(to)
            .execute(&mut *tx)
            .await
            .context("Failed to notify consumers")?;

        tx.commit().await.context("Failed to commit message move")?;

        let moved = result.rows_affected();
        if moved > 0 {
            tracing::info!(from = %from, to = %to, count = moved, "Moved queue messages");
        }
        Ok(moved)
    }
}
