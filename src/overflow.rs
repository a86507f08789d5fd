//! Overflow buffer: local-disk staging for messages the store cannot accept.
//!
//! When the database is briefly unreachable, producers stage messages as
//! one JSON file per message id under a fixed directory. Once the store
//! recovers, [`OverflowBuffer::offload`] replays them: each staged file is
//! inserted inside its own transaction and deleted only after the insert
//! commits. A crash mid-offload leaves files in place for the next run —
//! data is never lost, though a delete failing after a committed insert can
//! duplicate a replay. Duplicates are rejected by the message id primary key.

use std::path::{Path, PathBuf};

use snafu::ResultExt;
use sqlx::{Acquire, SqlitePool};
use tokio::fs;
use tracing::{info, warn};

use crate::{
    error::{IoSnafu, Result},
    message::Message,
};

pub struct OverflowBuffer {
    dir: PathBuf,
    pool: SqlitePool,
}

impl OverflowBuffer {
    pub fn new(dir: impl Into<PathBuf>, pool: SqlitePool) -> Self {
        Self {
            dir: dir.into(),
            pool,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stages one message as `<dir>/<id>.json`.
    pub async fn load(&self, message: &Message) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context(IoSnafu { path: self.dir.as_path() })?;

        let path = self.message_path(&message.id);
        let bytes = serde_json::to_vec(message)?;

        fs::write(&path, bytes).await.context(IoSnafu { path })?;

        Ok(())
    }

    pub async fn load_batch(&self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.load(message).await?;
        }

        Ok(())
    }

    /// Replays every staged message into the store, returning how many were
    /// replayed. A message that fails to insert keeps its file and is
    /// retried on the next offload; the rest still replay.
    pub async fn offload(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            other => other.context(IoSnafu { path: self.dir.as_path() })?,
        };

        let mut replayed = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: self.dir.as_path() })?
        {
            let path = entry.path();

            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match self.replay(&path).await {
                Ok(()) => {
                    if let Err(source) = fs::remove_file(&path).await {
                        warn!(
                            path = %path.display(),
                            error = %source,
                            "replayed staged message but failed to delete its file"
                        );
                    }
                    replayed += 1;
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "failed to replay staged message, leaving file in place"
                    );
                }
            }
        }

        if replayed > 0 {
            info!(replayed, "offloaded staged messages into the store");
        }

        Ok(replayed)
    }

    async fn replay(&self, path: &Path) -> Result<()> {
        let bytes = fs::read(path).await.context(IoSnafu { path })?;
        let message: Message = serde_json::from_slice(&bytes)?;

        let mut tx = self.pool.begin().await?;

        Message::insert(tx.acquire().await?, &message).await?;

        tx.commit().await?;

        Ok(())
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}
