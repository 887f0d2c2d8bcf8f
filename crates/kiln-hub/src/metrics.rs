//! Per-channel delivery metrics.
//!
//! Counter semantics: `published` increments once per accepted publish,
//! `consumed` once per successful subscriber delivery (so one publish to K
//! subscribers can add up to K), `failed` once per abandoned delivery after
//! the retry budget, and `completed` once per publication fully processed
//! without failures. The rolling average covers the last
//! [`PROCESSING_RING_SIZE`] deliveries, not all history.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use kiln_core::event::now_ms;

/// Size of the rolling processing-time window.
pub const PROCESSING_RING_SIZE: usize = 100;

#[derive(Default)]
struct MetricsInner {
    published: u64,
    consumed: u64,
    failed: u64,
    completed: u64,
    times_ms: VecDeque<f64>,
    last_activity_ms: u64,
}

impl MetricsInner {
    fn touch(&mut self) {
        self.last_activity_ms = now_ms();
    }

    fn record_time(&mut self, elapsed_ms: f64) {
        if self.times_ms.len() == PROCESSING_RING_SIZE {
            self.times_ms.pop_front();
        }
        self.times_ms.push_back(elapsed_ms);
    }

    fn average(&self) -> f64 {
        if self.times_ms.is_empty() {
            return 0.0;
        }
        self.times_ms.iter().sum::<f64>() / self.times_ms.len() as f64
    }
}

/// Thread-safe counter set owned by each topic and queue.
#[derive(Default)]
pub struct MetricsTracker {
    inner: Mutex<MetricsInner>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// One message accepted into the bus.
    pub fn mark_published(&self) {
        let mut inner = self.inner.lock();
        inner.published += 1;
        inner.touch();
    }

    /// One successful subscriber delivery, with its processing time.
    pub fn mark_consumed(&self, elapsed_ms: f64) {
        let mut inner = self.inner.lock();
        inner.consumed += 1;
        inner.record_time(elapsed_ms);
        inner.touch();
    }

    /// One message pulled from a queue; no listener timing involved.
    pub fn mark_received(&self) {
        let mut inner = self.inner.lock();
        inner.consumed += 1;
        inner.touch();
    }

    /// One delivery abandoned after exhausting retries.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.lock();
        inner.failed += 1;
        inner.touch();
    }

    /// One publication drained and delivered without failures.
    pub fn mark_completed(&self) {
        let mut inner = self.inner.lock();
        inner.completed += 1;
        inner.touch();
    }

    /// Folds a fan-out result for one publication into the counters.
    pub fn record_delivery(&self, processed: usize, failed: usize, average_time_ms: f64) {
        let mut inner = self.inner.lock();
        inner.consumed += processed as u64;
        inner.failed += failed as u64;
        if processed > 0 {
            inner.record_time(average_time_ms);
        }
        if failed == 0 && processed > 0 {
            inner.completed += 1;
        }
        inner.touch();
    }

    /// Consistent snapshot; queue depth and subscriber count are supplied
    /// by the owning facade.
    pub fn snapshot(&self, messages_in_queue: usize, subscribers_count: usize) -> ChannelMetrics {
        let inner = self.inner.lock();
        ChannelMetrics {
            messages_published: inner.published,
            messages_consumed: inner.consumed,
            failed_messages: inner.failed,
            publications_completed: inner.completed,
            messages_in_queue,
            subscribers_count,
            avg_processing_time_ms: inner.average(),
            last_activity_ms: inner.last_activity_ms,
        }
    }

    /// Zeroes every counter and clears the rolling window.
    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::default();
    }
}

/// Point-in-time metrics for one topic or queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelMetrics {
    pub messages_published: u64,
    pub messages_consumed: u64,
    pub failed_messages: u64,
    pub publications_completed: u64,
    pub messages_in_queue: usize,
    pub subscribers_count: usize,
    pub avg_processing_time_ms: f64,
    pub last_activity_ms: u64,
}

impl ChannelMetrics {
    /// Folds another snapshot into this one; averages are weighted by
    /// consumed counts.
    pub fn merge(&mut self, other: &ChannelMetrics) {
        let weight = self.messages_consumed + other.messages_consumed;
        if weight > 0 {
            self.avg_processing_time_ms = (self.avg_processing_time_ms
                * self.messages_consumed as f64
                + other.avg_processing_time_ms * other.messages_consumed as f64)
                / weight as f64;
        }
        self.messages_published += other.messages_published;
        self.messages_consumed += other.messages_consumed;
        self.failed_messages += other.failed_messages;
        self.publications_completed += other.publications_completed;
        self.messages_in_queue += other.messages_in_queue;
        self.subscribers_count += other.subscribers_count;
        self.last_activity_ms = self.last_activity_ms.max(other.last_activity_ms);
    }
}

impl std::fmt::Display for ChannelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "published {}, consumed {}, failed {}, queued {}, subscribers {}, avg {:.2}ms",
            self.messages_published,
            self.messages_consumed,
            self.failed_messages,
            self.messages_in_queue,
            self.subscribers_count,
            self.avg_processing_time_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let tracker = MetricsTracker::new();
        tracker.mark_published();
        tracker.mark_published();
        tracker.mark_consumed(10.0);
        tracker.mark_failed();

        let snap = tracker.snapshot(1, 2);
        assert_eq!(snap.messages_published, 2);
        assert_eq!(snap.messages_consumed, 1);
        assert_eq!(snap.failed_messages, 1);
        assert_eq!(snap.messages_in_queue, 1);
        assert_eq!(snap.subscribers_count, 2);
    }

    #[test]
    fn average_is_over_ring_not_history() {
        let tracker = MetricsTracker::new();
        // Fill the ring with slow deliveries, then push it out with fast ones.
        for _ in 0..PROCESSING_RING_SIZE {
            tracker.mark_consumed(100.0);
        }
        for _ in 0..PROCESSING_RING_SIZE {
            tracker.mark_consumed(10.0);
        }
        let snap = tracker.snapshot(0, 0);
        assert!((snap.avg_processing_time_ms - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_zeroes_everything() {
        let tracker = MetricsTracker::new();
        tracker.mark_published();
        tracker.mark_consumed(5.0);
        tracker.reset();
        let snap = tracker.snapshot(0, 0);
        assert_eq!(snap, ChannelMetrics::default());
    }

    #[test]
    fn merge_weights_averages_by_consumed() {
        let mut a = ChannelMetrics {
            messages_consumed: 1,
            avg_processing_time_ms: 10.0,
            ..Default::default()
        };
        let b = ChannelMetrics {
            messages_consumed: 3,
            avg_processing_time_ms: 30.0,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.messages_consumed, 4);
        assert!((a.avg_processing_time_ms - 25.0).abs() < f64::EPSILON);
    }
}
