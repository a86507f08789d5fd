//! The queue consumer: claim, pace, dispatch, reconcile, repeat.
//!
//! One [`Consumer`] per worker process. [`Consumer::run`] is the tight
//! dispatch loop; [`Consumer::start`] wraps it in the idle/wake cycle driven
//! by the wake channel. Store-level failures are absorbed at the loop
//! boundary and logged — only message-level outcomes affect queue state, and
//! nothing in steady-state operation is fatal to the process.

use std::{pin::pin, sync::Arc};

use futures_util::StreamExt;
use itertools::Itertools;
use sqlx::Acquire;
use tokio::try_join;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{Error, Result},
    message::{now, DeadLetter, Message, MessageState},
    pacer::Pacer,
    processor::ProcessorRegistry,
    service::Service,
};

pub struct Consumer {
    service: Service,
    registry: Arc<ProcessorRegistry>,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn new(service: Service, registry: ProcessorRegistry) -> Self {
        Self {
            service,
            registry: Arc::new(registry),
            shutdown: CancellationToken::new(),
        }
    }

    /// The idle/wake outer loop: wait for a wake notification, pause the
    /// channel, drain the queue, resume, wait again. Returns only after
    /// [`Consumer::unsubscribe`]; every drain failure is logged and absorbed.
    pub async fn start(&self, worker_id: &str) {
        let wake = self.service.wake().clone();

        info!(worker_id, channel = wake.name(), "subscribed to wake channel");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker_id, channel = wake.name(), "wake subscription stopped");
                    return;
                }
                _ = wake.notified() => {}
            }

            debug!(worker_id, "message available");
            wake.pause();

            match self.run(worker_id).await {
                Err(Error::EmptyQueue) => {
                    info!(worker_id, "queue drained, resuming subscription");
                }
                Err(Error::IllegalState { message }) => {
                    info!(worker_id, %message, "resuming subscription");
                }
                Err(error) => {
                    error!(worker_id, %error, "dispatch loop error, resuming subscription");
                }
                Ok(()) => {}
            }

            wake.resume();
        }
    }

    /// Halts the idle/wake cycle. In-flight batches still complete.
    pub fn unsubscribe(&self) {
        self.shutdown.cancel();
    }

    /// The dispatch loop: claims a batch, paces it through the processors,
    /// reconciles the outcomes, and immediately claims again. Exits only by
    /// error; [`Error::EmptyQueue`] is the drained signal.
    pub async fn run(&self, worker_id: &str) -> Result<()> {
        loop {
            let batch = self.claim(worker_id).await?;

            debug!(worker_id, count = batch.len(), "claimed batch");

            let outcomes = self.dispatch(batch).await;

            if outcomes.is_empty() {
                return Err(Error::illegal_state("claimed batch produced no outcomes"));
            }

            self.reconcile(outcomes).await?;
        }
    }

    async fn claim(&self, worker_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.service.db().acquire().await?;

        Message::claim_batch(conn.acquire().await?, self.service.config(), worker_id, now()).await
    }

    /// Fans a claimed batch out to the processors, paced by the configured
    /// demand. Dispatch order follows the batch's priority order; completion
    /// order is not guaranteed.
    async fn dispatch(&self, batch: Vec<Message>) -> Vec<Message> {
        let config = self.service.config();
        let pacer = Pacer::new(config.concurrency, config.throttle());
        let max_retries = config.max_retries;

        let mut handles = Vec::new();
        let mut chunks = pin!(pacer.pace(batch));

        while let Some(chunk) = chunks.next().await {
            for message in chunk {
                let registry = Arc::clone(&self.registry);
                handles.push(tokio::spawn(async move {
                    registry.dispatch(message, max_retries).await
                }));
            }
        }

        let mut outcomes = Vec::with_capacity(handles.len());

        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                // A panicked processor leaves its row in PROCESSING; the
                // external liveness sweep will move it to RECOVERY.
                Err(join_error) => error!(%join_error, "processor task panicked"),
            }
        }

        outcomes
    }

    /// Post-processing reconciliation: requeue RETRY outcomes in place;
    /// delete terminal outcomes from the live table, archiving the
    /// terminal-failure states to the dead letters. The two halves run
    /// concurrently and the whole step fails fast if either fails.
    ///
    /// Archival fires uniformly for FATAL_FAILURE, RETRIES_EXHAUSTED, and
    /// EXPIRED; PROCESSED is deleted without archival.
    pub async fn reconcile(&self, outcomes: Vec<Message>) -> Result<()> {
        let (terminal, requeue): (Vec<_>, Vec<_>) = outcomes
            .into_iter()
            .filter(|message| {
                message.state.is_terminal() || message.state == MessageState::Retry
            })
            .partition(|message| message.state.is_terminal());

        try_join!(self.requeue(requeue), self.drop_and_archive(terminal))?;

        Ok(())
    }

    async fn requeue(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        info!(
            ids = ?messages.iter().map(|message| &message.id).collect::<Vec<_>>(),
            "re-queuing unhandled messages"
        );

        let mut tx = self.service.db().begin().await?;

        Message::update_batch(tx.acquire().await?, &messages).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn drop_and_archive(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let dead_letters: Vec<DeadLetter> = messages
            .iter()
            .filter(|message| message.state.is_terminal_failure())
            .map(DeadLetter::from)
            .collect();

        let by_tenant = messages
            .into_iter()
            .into_group_map_by(|message| message.tenant_id.clone());

        // Delete and archive in one transaction so a message id never
        // appears in both tables.
        let mut tx = self.service.db().begin().await?;

        for (tenant_id, group) in &by_tenant {
            let ids: Vec<String> = group.iter().map(|message| message.id.clone()).collect();

            Message::delete_batch(tx.acquire().await?, tenant_id, &ids).await?;
        }

        DeadLetter::insert_batch(tx.acquire().await?, &dead_letters).await?;

        tx.commit().await?;

        Ok(())
    }
}
