//! Message types and state management for the task queue.
//!
//! Messages are rows of the `task_queue` table, owned exclusively by the
//! store: they are mutated only through the claim and reconciliation
//! operations in [`crate::db`], never by processors directly.
//!
//! # Message lifecycle
//!
//! 1. Producers insert messages in `Created` state (or `Scheduled`, when a
//!    visibility timestamp is set)
//! 2. A worker's claim atomically moves eligible messages to `Processing`
//!    and tags them with the claiming worker id
//! 3. Processing outcomes move each message to `Processed`, `Retry`,
//!    `RetriesExhausted`, `Expired`, or `FatalFailure`
//! 4. `Retry` messages are rewritten in place and reclaimed once the retry
//!    interval elapses; the other outcome states are terminal — the row is
//!    deleted, and every terminal state except `Processed` is archived to
//!    the `task_queue_dl` dead-letter table
//!
//! Workers that die mid-processing leave rows in `Processing`; an external
//! liveness sweep reclassifies those rows as `Recovery`, which any worker may
//! reclaim.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{prelude::FromRow, types::Json};

/// Current state of a message in the live table.
///
/// Stored as its SCREAMING_SNAKE_CASE name in the `state` column.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display,
)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    /// Freshly enqueued, eligible immediately
    Created,
    /// Enqueued with a visibility timestamp, eligible once it is reached
    Scheduled,
    /// Claimed by a worker, invisible to other claimants
    Processing,
    /// Failed retryably, eligible again after the retry interval
    Retry,
    /// Abandoned by a dead worker, reclaimable by anyone
    Recovery,
    /// Handled successfully; deleted without archival
    Processed,
    /// Failed after exhausting the retry budget; archived
    RetriesExhausted,
    /// Outlived its expiration timestamp; archived
    Expired,
    /// Failed in a way retrying cannot fix; archived
    FatalFailure,
}

impl MessageState {
    /// States reconciliation removes from the live table.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Processed | Self::FatalFailure | Self::RetriesExhausted | Self::Expired
        )
    }

    /// Terminal states that are archived to the dead-letter table.
    pub fn is_terminal_failure(self) -> bool {
        self.is_terminal() && self != Self::Processed
    }
}

/// A message in the live `task_queue` table.
///
/// Timestamps are epoch seconds. `priority` orders claims, lower first.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Message {
    #[sqlx(rename = "message_id")]
    pub id: String,
    pub tenant_id: String,

    pub priority: i64,
    /// Not eligible for claiming before this time
    pub scheduled: Option<i64>,
    /// Not eligible for claiming after this time
    pub expiration: Option<i64>,

    /// Number of retryable failures so far; only ever increases
    pub retry_counter: i64,
    pub state: MessageState,

    /// Discriminator resolved against the processor registry
    pub payload_type: String,
    pub payload: Json<Value>,

    /// Names of processors that have failed on this message; only ever grows
    pub failed_processors: Json<Vec<String>>,

    /// Worker holding the claim while the message is in `Processing`
    pub worker_id: Option<String>,

    pub created: i64,
    pub updated: i64,
}

#[bon::bon]
impl Message {
    #[builder]
    pub fn new(
        #[builder(into)] id: String,
        #[builder(into, default = String::from("default"))] tenant_id: String,
        #[builder(default = 0)] priority: i64,
        scheduled: Option<i64>,
        expiration: Option<i64>,
        #[builder(into)] payload_type: String,
        payload: Value,
    ) -> Self {
        let state = if scheduled.is_some() {
            MessageState::Scheduled
        } else {
            MessageState::Created
        };
        let now = now();

        Self {
            id,
            tenant_id,
            priority,
            scheduled,
            expiration,
            retry_counter: 0,
            state,
            payload_type,
            payload: Json(payload),
            failed_processors: Json(Vec::new()),
            worker_id: None,
            created: now,
            updated: now,
        }
    }
}

/// Immutable snapshot of a terminally-failed message in `task_queue_dl`.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct DeadLetter {
    #[sqlx(rename = "message_id")]
    pub id: String,
    pub tenant_id: String,

    pub priority: i64,
    pub scheduled: Option<i64>,
    pub expiration: Option<i64>,

    pub retry_counter: i64,
    /// Final state: `RetriesExhausted`, `Expired`, or `FatalFailure`
    pub state: MessageState,

    pub payload_type: String,
    pub payload: Json<Value>,

    pub failed_processors: Json<Vec<String>>,
    /// Worker that held the last claim
    pub worker_id: Option<String>,

    pub archived: i64,
}

impl From<&Message> for DeadLetter {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            tenant_id: message.tenant_id.clone(),
            priority: message.priority,
            scheduled: message.scheduled,
            expiration: message.expiration,
            retry_counter: message.retry_counter,
            state: message.state,
            payload_type: message.payload_type.clone(),
            payload: message.payload.clone(),
            failed_processors: message.failed_processors.clone(),
            worker_id: message.worker_id.clone(),
            archived: now(),
        }
    }
}

/// Current time as epoch seconds, the clock used for all eligibility checks.
pub fn now() -> i64 {
    Utc::now().timestamp()
}
