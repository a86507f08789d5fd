use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Acquire, SqlitePool,
};
use tracing::warn;

use crate::{
    config::Config,
    error::{Error, Result},
    message::Message,
    overflow::OverflowBuffer,
    wake::WakeChannel,
};

/// Shared handle to one task queue: the connection pool, its configuration,
/// and the wake channel producers notify on insert.
#[derive(Clone)]
pub struct Service {
    db: SqlitePool,
    config: Config,
    wake: WakeChannel,
}

impl Service {
    pub async fn connect() -> Result<Self> {
        Self::connect_with(Config::default()).await
    }

    /// Opens the pool and runs migrations — the single idempotent
    /// initialization step of a process lifecycle.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // Every connection to a `:memory:` database opens its own private
        // database, so the in-memory pool is pinned to one connection that
        // is never recycled.
        let pool_opts = if config.db_path.is_some() {
            SqlitePoolOptions::new()
        } else {
            SqlitePoolOptions::new()
                .max_connections(1)
                .max_lifetime(None)
                .idle_timeout(None)
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            db: pool,
            config,
            wake: WakeChannel::new("task_queue"),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn wake(&self) -> &WakeChannel {
        &self.wake
    }

    pub fn overflow(&self) -> OverflowBuffer {
        OverflowBuffer::new(&self.config.staging_dir, self.db.clone())
    }

    pub async fn enqueue(&self, message: &Message) -> Result<()> {
        let mut tx = self.db.begin().await?;

        Message::insert(tx.acquire().await?, message).await?;

        tx.commit().await?;

        self.wake.notify();

        Ok(())
    }

    pub async fn enqueue_batch(&self, messages: &[Message]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        Message::insert_batch(tx.acquire().await?, messages).await?;

        tx.commit().await?;

        self.wake.notify();

        Ok(())
    }

    /// Enqueues, falling back to the overflow buffer when the store write
    /// path is degraded. The staged copy is replayed by a later
    /// [`OverflowBuffer::offload`].
    pub async fn enqueue_or_stage(&self, message: &Message) -> Result<()> {
        match self.enqueue(message).await {
            Err(Error::Sqlx { source }) => {
                warn!(
                    id = %message.id,
                    error = %source,
                    "store unavailable, staging message to overflow buffer"
                );
                self.overflow().load(message).await
            }
            other => other,
        }
    }
}
