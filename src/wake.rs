//! Wake channel: short-circuits the idle wait between polls.
//!
//! Producers notify the channel on insert; an idle consumer wakes, pauses the
//! channel, drains the queue to empty, then resumes it. Notifications arriving
//! while paused are dropped — the drain already covers them. The channel is
//! best-effort by design: a missed wake is self-healed by the next producer
//! write, so losing one is never an error.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Clone)]
pub struct WakeChannel {
    name: Arc<str>,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
}

impl WakeChannel {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            notify: Arc::new(Notify::new()),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer side: signal that new work is available.
    pub fn notify(&self) {
        if self.paused.load(Ordering::Acquire) {
            debug!(channel = %self.name, "wake channel paused, dropping notification");
            return;
        }

        self.notify.notify_one();
    }

    /// Consumer side: wait until a producer notifies.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}
