use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::{jittered_delay, BackoffSettings};

/// Schedules retries on the async queue with jittered exponential delays.
///
/// The first attempt after construction or [`reset`](Self::reset) runs
/// immediately; each later attempt waits `base * factor` longer, up to the
/// configured maximum.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    settings: BackoffSettings,
    current_base: Duration,
    last_attempt: Arc<Mutex<Instant>>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId, settings: BackoffSettings) -> Self {
        Self {
            queue,
            timer_id,
            settings,
            current_base: Duration::ZERO,
            last_attempt: Arc::new(Mutex::new(Instant::now())),
            timer: None,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next attempt waits the maximum delay, e.g. after quota errors.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Cancels any pending attempt and schedules `operation` after the
    /// current backoff, minus time already spent since the last attempt.
    pub fn backoff_and_run<F, Fut>(&mut self, operation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let desired = jittered_delay(self.current_base);
        let elapsed = self
            .last_attempt
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default();
        let remaining = desired.saturating_sub(elapsed);
        if !remaining.is_zero() {
            log::debug!(
                target: "firestore::backoff",
                "backing off for {} ms (base delay {} ms, {} ms since last attempt)",
                remaining.as_millis(),
                self.current_base.as_millis(),
                elapsed.as_millis()
            );
        }

        let last_attempt = Arc::clone(&self.last_attempt);
        self.timer = Some(self.queue.enqueue_after_delay(
            self.timer_id,
            remaining,
            move || {
                if let Ok(mut last) = last_attempt.lock() {
                    *last = Instant::now();
                }
                operation()
            },
        ));

        let next = self.current_base.mul_f64(self.settings.backoff_factor);
        self.current_base = next.clamp(self.settings.initial_delay, self.settings.max_delay);
    }

    /// Skips the pending delay so the attempt runs as soon as possible.
    pub fn skip_backoff(&mut self) {
        if self.timer.is_some() {
            self.reset();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backoff(queue: &AsyncQueue) -> ExponentialBackoff {
        ExponentialBackoff::new(
            queue.clone(),
            TimerId::ListenStreamConnectionBackoff,
            BackoffSettings {
                initial_delay: Duration::from_millis(1_000),
                backoff_factor: 2.0,
                max_delay: Duration::from_millis(5_000),
            },
        )
    }

    #[tokio::test]
    async fn base_delay_grows_and_clamps() {
        let queue = AsyncQueue::new();
        let mut backoff = backoff(&queue);
        assert_eq!(backoff.current_base(), Duration::ZERO);

        let mut bases = Vec::new();
        for _ in 0..5 {
            backoff.backoff_and_run(|| async {});
            bases.push(backoff.current_base().as_millis());
        }
        assert_eq!(bases, vec![1_000, 2_000, 4_000, 5_000, 5_000]);

        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::ZERO);
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_millis(5_000));
        backoff.cancel();
    }

    #[tokio::test]
    async fn rescheduling_cancels_the_previous_attempt() {
        let queue = AsyncQueue::new();
        let mut backoff = backoff(&queue);
        let runs = Arc::new(AtomicUsize::new(0));
        backoff.backoff_and_run(|| async {});
        backoff.backoff_and_run(|| async {});
        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            backoff.backoff_and_run(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.run_delays_until(TimerId::All).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
