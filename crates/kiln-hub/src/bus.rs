//! The per-channel ordered in-memory store.
//!
//! Two interchangeable implementations sit behind [`MessageBus`]:
//!
//! - [`ArrayBus`] — append-only bounded FIFO.
//! - [`HeapBus`] — binary heap ordered by priority descending, then
//!   timestamp ascending, then enqueue sequence (so two events minted in the
//!   same millisecond keep insertion order).
//!
//! A bus is not internally synchronized; the owning topic or queue wraps it
//! in a mutex so enqueue/dequeue/snapshot stay atomic with respect to each
//! other. Retention GC calls [`MessageBus::purge_expired`] from the owner's
//! timer task under the same lock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use kiln_core::error::{HubError, HubResult};
use kiln_core::event::Event;

/// Ordered bounded store for one topic or queue.
pub trait MessageBus: Send {
    /// Appends an event; fails with
    /// [`HubError::ResourceUnavailable`] once `len() == capacity()`.
    fn enqueue(&mut self, event: Event) -> HubResult<()>;

    /// Removes and returns the next event in bus order.
    fn dequeue(&mut self) -> Option<Event>;

    /// The next event in bus order, without removing it.
    fn peek(&self) -> Option<&Event>;

    /// Number of stored events.
    fn len(&self) -> usize;

    /// Whether the bus is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity bound.
    fn capacity(&self) -> usize;

    /// Drops every stored event.
    fn clear(&mut self);

    /// Stored events in dequeue order. O(n).
    fn snapshot(&self) -> Vec<Event>;

    /// Removes every event with `timestamp_ms < now_ms - retention_ms`,
    /// preserving the ordering of survivors. Returns the purge count.
    fn purge_expired(&mut self, now_ms: u64, retention_ms: u64) -> usize;
}

fn full_error(name: &str, capacity: usize) -> HubError {
    HubError::ResourceUnavailable {
        resource: name.to_string(),
        capacity,
    }
}

// =============================================================================
// ArrayBus
// =============================================================================

/// FIFO bus; event priorities are ignored.
pub struct ArrayBus {
    name: String,
    events: VecDeque<Event>,
    max_size: usize,
}

impl ArrayBus {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            events: VecDeque::new(),
            max_size,
        }
    }
}

impl MessageBus for ArrayBus {
    fn enqueue(&mut self, event: Event) -> HubResult<()> {
        if self.events.len() >= self.max_size {
            return Err(full_error(&self.name, self.max_size));
        }
        self.events.push_back(event);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn peek(&self) -> Option<&Event> {
        self.events.front()
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn capacity(&self) -> usize {
        self.max_size
    }

    fn clear(&mut self) {
        self.events.clear();
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    fn purge_expired(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(retention_ms);
        let before = self.events.len();
        self.events.retain(|event| event.timestamp_ms >= cutoff);
        before - self.events.len()
    }
}

// =============================================================================
// HeapBus
// =============================================================================

struct HeapEntry {
    event: Event,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: "greater" dequeues first. Higher priority wins, then the
    // earlier timestamp, then the earlier enqueue sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| other.event.timestamp_ms.cmp(&self.event.timestamp_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority bus; higher [`EventPriority`](kiln_core::event::EventPriority)
/// dequeues first, FIFO within a priority level.
pub struct HeapBus {
    name: String,
    heap: BinaryHeap<HeapEntry>,
    max_size: usize,
    next_seq: u64,
}

impl HeapBus {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            heap: BinaryHeap::new(),
            max_size,
            next_seq: 0,
        }
    }
}

impl MessageBus for HeapBus {
    fn enqueue(&mut self, event: Event) -> HubResult<()> {
        if self.heap.len() >= self.max_size {
            return Err(full_error(&self.name, self.max_size));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { event, seq });
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Event> {
        self.heap.pop().map(|entry| entry.event)
    }

    fn peek(&self) -> Option<&Event> {
        self.heap.peek().map(|entry| &entry.event)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn capacity(&self) -> usize {
        self.max_size
    }

    fn clear(&mut self) {
        self.heap.clear();
    }

    fn snapshot(&self) -> Vec<Event> {
        let mut entries: Vec<&HeapEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.event.clone()).collect()
    }

    fn purge_expired(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(retention_ms);
        let before = self.heap.len();
        let survivors: Vec<HeapEntry> = self
            .heap
            .drain()
            .filter(|entry| entry.event.timestamp_ms >= cutoff)
            .collect();
        self.heap = survivors.into_iter().collect();
        before - self.heap.len()
    }
}

/// Constructs the bus variant selected by the channel config.
pub fn bus_for(
    name: &str,
    config: &crate::config::ChannelConfig,
) -> Box<dyn MessageBus + Send> {
    if config.priority_queue {
        Box::new(HeapBus::new(name, config.max_size))
    } else {
        Box::new(ArrayBus::new(name, config.max_size))
    }
}
