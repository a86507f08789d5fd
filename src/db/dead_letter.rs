//! SQL operations on the `task_queue_dl` dead-letter table.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{error::Result, message::DeadLetter};

impl DeadLetter {
    /// Archives a batch of terminally-failed messages. Snapshots are written
    /// once and never updated.
    pub async fn insert_batch(db: &mut SqliteConnection, records: &[DeadLetter]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO task_queue_dl \
             (message_id, tenant_id, priority, scheduled, expiration, retry_counter, \
              state, payload_type, payload, failed_processors, worker_id, archived) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.id)
                .push_bind(&record.tenant_id)
                .push_bind(record.priority)
                .push_bind(record.scheduled)
                .push_bind(record.expiration)
                .push_bind(record.retry_counter)
                .push_bind(record.state)
                .push_bind(&record.payload_type)
                .push_bind(&record.payload)
                .push_bind(&record.failed_processors)
                .push_bind(&record.worker_id)
                .push_bind(record.archived);
        });
        builder.build().execute(db).await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, id: &str) -> Result<Option<DeadLetter>> {
        Ok(
            sqlx::query_as("SELECT * FROM task_queue_dl WHERE message_id = $1")
                .bind(id)
                .fetch_optional(db)
                .await?,
        )
    }
}
