//! Processor registry: a closed mapping from payload-type discriminators to
//! processor functions, resolved once at startup.
//!
//! Processors never touch the store. They receive a claimed message and
//! report success or failure; the registry converts that report into the
//! outcome state the reconciler acts on. A processor failure is always a
//! message-level outcome, never a loop failure.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};
use snafu::Snafu;
use tracing::{debug, error, warn};

use crate::message::{now, Message, MessageState};

#[derive(Debug, Snafu)]
pub enum ProcessorError {
    /// The failure may clear up on a later attempt; the message is requeued
    /// until the retry budget runs out.
    #[snafu(display("Retryable processor failure: {reason}"))]
    Retryable { reason: String },

    /// Retrying cannot help; the message goes straight to the dead letters.
    #[snafu(display("Fatal processor failure: {reason}"))]
    Fatal { reason: String },
}

impl ProcessorError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }
}

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), ProcessorError>> + Send + Sync>;

struct Entry {
    name: String,
    handler: Handler,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    entries: HashMap<String, Entry>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name` for messages whose `payload_type`
    /// equals `payload_type`. Re-registering a payload type replaces the
    /// previous handler.
    pub fn register<F, Fut>(
        &mut self,
        payload_type: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessorError>> + Send + 'static,
    {
        self.entries.insert(
            payload_type.into(),
            Entry {
                name: name.into(),
                handler: Arc::new(move |message| handler(message).boxed()),
            },
        );
    }

    /// Runs the registered processor for `message` and returns the message
    /// rewritten with its outcome state.
    ///
    /// An unregistered payload type is a fatal outcome: retrying cannot make
    /// a handler appear, and the registry is closed after startup.
    pub async fn dispatch(&self, mut message: Message, max_retries: u32) -> Message {
        let Some(entry) = self.entries.get(&message.payload_type) else {
            warn!(
                id = %message.id,
                payload_type = %message.payload_type,
                "no processor registered, dead-lettering message"
            );
            message.state = MessageState::FatalFailure;
            message.failed_processors.0.push("unregistered".to_owned());
            message.updated = now();
            return message;
        };

        match (entry.handler)(message.clone()).await {
            Ok(()) => {
                message.state = MessageState::Processed;
            }
            Err(ProcessorError::Retryable { reason }) => {
                warn!(
                    id = %message.id,
                    processor = %entry.name,
                    retry = message.retry_counter + 1,
                    %reason,
                    "processor failed retryably"
                );
                message.retry_counter += 1;
                message.failed_processors.0.push(entry.name.clone());
                message.state = if message.retry_counter >= max_retries as i64 {
                    MessageState::RetriesExhausted
                } else {
                    MessageState::Retry
                };
            }
            Err(ProcessorError::Fatal { reason }) => {
                error!(
                    id = %message.id,
                    processor = %entry.name,
                    %reason,
                    "processor failed fatally"
                );
                message.failed_processors.0.push(entry.name.clone());
                message.state = MessageState::FatalFailure;
            }
        }

        message.updated = now();

        debug!(id = %message.id, state = %message.state, "processor outcome");

        message
    }
}
