//! SQL operations on the live `task_queue` table.
//!
//! The claim statements combine select, lock, and update in a single atomic
//! `UPDATE ... WHERE message_id IN (SELECT ...) RETURNING *`: SQLite
//! serializes writers, so concurrent claimants can never receive the same
//! row. All statements are parameterized; dynamic id lists go through
//! [`sqlx::QueryBuilder`].

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    config::Config,
    error::{Error, Result},
    message::{Message, MessageState},
};

/// Primary claim: atomically transition eligible CREATED/SCHEDULED/RETRY
/// rows to PROCESSING, tagged with the claiming worker.
const CLAIM_ELIGIBLE: &str = "\
    UPDATE task_queue SET state = $1, worker_id = $2, updated = $3 \
    WHERE message_id IN ( \
        SELECT message_id FROM task_queue \
        WHERE state IN ($4, $5, $6) \
        AND (scheduled IS NULL OR scheduled <= $3) \
        AND (expiration IS NULL OR expiration >= $3) \
        AND (retry_counter = 0 OR updated + $7 <= $3) \
        ORDER BY priority \
        LIMIT $8 \
    ) RETURNING *";

/// Recovery claim: reclaim rows abandoned by dead workers. No eligibility
/// filters; any worker may take them.
const CLAIM_RECOVERY: &str = "\
    UPDATE task_queue SET state = $1, worker_id = $2, updated = $3 \
    WHERE message_id IN ( \
        SELECT message_id FROM task_queue \
        WHERE state = $4 \
        ORDER BY priority \
        LIMIT $5 \
    ) RETURNING *";

impl Message {
    pub async fn insert(db: &mut SqliteConnection, message: &Message) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_queue \
             (message_id, tenant_id, priority, scheduled, expiration, retry_counter, \
              state, payload_type, payload, failed_processors, worker_id, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&message.id)
        .bind(&message.tenant_id)
        .bind(message.priority)
        .bind(message.scheduled)
        .bind(message.expiration)
        .bind(message.retry_counter)
        .bind(message.state)
        .bind(&message.payload_type)
        .bind(&message.payload)
        .bind(&message.failed_processors)
        .bind(&message.worker_id)
        .bind(message.created)
        .bind(message.updated)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn insert_batch(db: &mut SqliteConnection, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO task_queue \
             (message_id, tenant_id, priority, scheduled, expiration, retry_counter, \
              state, payload_type, payload, failed_processors, worker_id, created, updated) ",
        );
        builder.push_values(messages, |mut row, message| {
            row.push_bind(&message.id)
                .push_bind(&message.tenant_id)
                .push_bind(message.priority)
                .push_bind(message.scheduled)
                .push_bind(message.expiration)
                .push_bind(message.retry_counter)
                .push_bind(message.state)
                .push_bind(&message.payload_type)
                .push_bind(&message.payload)
                .push_bind(&message.failed_processors)
                .push_bind(&message.worker_id)
                .push_bind(message.created)
                .push_bind(message.updated);
        });
        builder.build().execute(db).await?;

        Ok(())
    }

    /// Claims up to `batch_size` messages for `worker_id`.
    ///
    /// Tries the primary claim first; when nothing is eligible, falls back to
    /// reclaiming RECOVERY rows. Fails with [`Error::EmptyQueue`] when both
    /// come back empty. The returned batch is sorted by priority — the row
    /// order of `UPDATE ... RETURNING` is unspecified.
    pub async fn claim_batch(
        db: &mut SqliteConnection,
        config: &Config,
        worker_id: &str,
        now: i64,
    ) -> Result<Vec<Message>> {
        let mut claimed = Self::claim_eligible(&mut *db, config, worker_id, now).await?;

        if claimed.is_empty() {
            claimed = Self::claim_recovery(&mut *db, config, worker_id, now).await?;
        }

        if claimed.is_empty() {
            return Err(Error::EmptyQueue);
        }

        claimed.sort_by_key(|message| message.priority);

        Ok(claimed)
    }

    async fn claim_eligible(
        db: &mut SqliteConnection,
        config: &Config,
        worker_id: &str,
        now: i64,
    ) -> Result<Vec<Message>> {
        let mut stream = sqlx::query_as::<_, Message>(CLAIM_ELIGIBLE)
            .bind(MessageState::Processing)
            .bind(worker_id)
            .bind(now)
            .bind(MessageState::Created)
            .bind(MessageState::Scheduled)
            .bind(MessageState::Retry)
            .bind(config.retry_interval_secs as i64)
            .bind(config.batch_size as i64)
            .fetch(db);

        let mut claimed = Vec::new();

        while let Some(message) = stream.next().await.transpose()? {
            claimed.push(message);
        }

        Ok(claimed)
    }

    async fn claim_recovery(
        db: &mut SqliteConnection,
        config: &Config,
        worker_id: &str,
        now: i64,
    ) -> Result<Vec<Message>> {
        let mut stream = sqlx::query_as::<_, Message>(CLAIM_RECOVERY)
            .bind(MessageState::Processing)
            .bind(worker_id)
            .bind(now)
            .bind(MessageState::Recovery)
            .bind(config.batch_size as i64)
            .fetch(db);

        let mut claimed = Vec::new();

        while let Some(message) = stream.next().await.transpose()? {
            claimed.push(message);
        }

        Ok(claimed)
    }

    /// Rewrites requeued messages in place, retaining their ids so the next
    /// eligible poll reclaims them after the backoff window.
    pub async fn update_batch(db: &mut SqliteConnection, messages: &[Message]) -> Result<()> {
        for message in messages {
            sqlx::query(
                "UPDATE task_queue \
                 SET state = $1, retry_counter = $2, failed_processors = $3, \
                     worker_id = $4, updated = $5 \
                 WHERE message_id = $6",
            )
            .bind(message.state)
            .bind(message.retry_counter)
            .bind(&message.failed_processors)
            .bind(&message.worker_id)
            .bind(message.updated)
            .bind(&message.id)
            .execute(&mut *db)
            .await?;
        }

        Ok(())
    }

    /// Deletes terminal messages for one tenant.
    pub async fn delete_batch(
        db: &mut SqliteConnection,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("DELETE FROM task_queue WHERE tenant_id = ");
        builder.push_bind(tenant_id);
        builder.push(" AND message_id IN (");

        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }

        builder.push(")");
        builder.build().execute(db).await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, id: &str) -> Result<Option<Message>> {
        Ok(
            sqlx::query_as("SELECT * FROM task_queue WHERE message_id = $1")
                .bind(id)
                .fetch_optional(db)
                .await?,
        )
    }
}
