//! Broker-less task queue coordinated through SQLite.
//!
//! Many independent worker processes share one queue table: each runs a
//! [`consumer::Consumer`] that claims batches of messages with an atomic
//! locked selection, dispatches them to registered processors, and
//! reconciles the outcomes — acknowledge, retry with flat backoff, or
//! archive to the dead letters. Delivery is at-least-once; idempotency is
//! the processor's concern.
//!
//! ```no_run
//! use relayq::{config::Config, consumer::Consumer, message::Message,
//!              processor::ProcessorRegistry, service::Service};
//!
//! # async fn example() -> relayq::error::Result<()> {
//! let service = Service::connect_with(Config::load()?).await?;
//!
//! service
//!     .enqueue(
//!         &Message::builder()
//!             .id("order-42")
//!             .payload_type("order")
//!             .payload(serde_json::json!({"total": 42}))
//!             .build(),
//!     )
//!     .await?;
//!
//! let mut registry = ProcessorRegistry::new();
//! registry.register("order", "order-handler", |_message| async { Ok(()) });
//!
//! Consumer::new(service, registry).start("worker-1").await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod message;
pub mod overflow;
pub mod pacer;
pub mod processor;
pub mod service;
pub mod wake;
