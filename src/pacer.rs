//! Backpressure pacing for claimed batches.
//!
//! The pacer turns a claimed batch into a rate-limited sequence of releases:
//! at most `concurrency` messages per throttle interval, fixed demand at a
//! fixed interval. Without a concurrency limit the whole batch is released
//! at once.

use std::{collections::VecDeque, time::Duration};

use futures_util::stream::{self, Stream};

pub struct Pacer {
    demand: Option<usize>,
    throttle: Duration,
}

impl Pacer {
    pub fn new(concurrency: Option<u32>, throttle: Duration) -> Self {
        Self {
            demand: concurrency.filter(|n| *n > 0).map(|n| n as usize),
            throttle,
        }
    }

    /// Splits `batch` into released chunks, preserving order. The first chunk
    /// is released immediately; each subsequent chunk waits one throttle
    /// interval.
    pub fn pace<T>(self, batch: Vec<T>) -> impl Stream<Item = Vec<T>> {
        let mut chunks = VecDeque::new();

        match self.demand {
            Some(demand) => {
                let mut batch = batch.into_iter();
                loop {
                    let chunk: Vec<T> = batch.by_ref().take(demand).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    chunks.push_back(chunk);
                }
            }
            None if batch.is_empty() => {}
            None => chunks.push_back(batch),
        }

        let throttle = self.throttle;
        let paced = self.demand.is_some();

        stream::unfold((chunks, true), move |(mut chunks, first)| async move {
            let chunk = chunks.pop_front()?;
            if paced && !first {
                tokio::time::sleep(throttle).await;
            }
            Some((chunk, (chunks, false)))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn unbounded_pacer_releases_everything_at_once() {
        let pacer = Pacer::new(None, Duration::from_secs(10));

        let chunks: Vec<Vec<u32>> = pacer.pace(vec![1, 2, 3, 4, 5]).collect().await;

        assert_eq!(chunks, vec![vec![1, 2, 3, 4, 5]]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_pacer_releases_fixed_demand_per_interval() {
        let throttle = Duration::from_millis(100);
        let pacer = Pacer::new(Some(2), throttle);

        let start = Instant::now();
        let mut released = Vec::new();

        let mut chunks = Box::pin(pacer.pace(vec![1, 2, 3, 4, 5]));
        while let Some(chunk) = chunks.next().await {
            released.push((start.elapsed(), chunk));
        }

        assert_eq!(released.len(), 3);
        assert_eq!(released[0].1, vec![1, 2]);
        assert_eq!(released[1].1, vec![3, 4]);
        assert_eq!(released[2].1, vec![5]);

        assert_eq!(released[0].0, Duration::ZERO);
        assert!(released[1].0 >= throttle);
        assert!(released[2].0 >= throttle * 2);
    }

    #[tokio::test]
    async fn empty_batch_yields_no_chunks() {
        let pacer = Pacer::new(None, Duration::from_millis(1));

        let chunks: Vec<Vec<u32>> = pacer.pace(Vec::new()).collect().await;

        assert!(chunks.is_empty());
    }
}
