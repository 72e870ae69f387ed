//! Lock-free single-producer/single-consumer byte ring buffer.
//!
//! Bridges the byte collector (producer, interrupt-like context) and the
//! decoder worker (consumer). Correctness relies on the SPSC contract, which
//! the API enforces by splitting the buffer into two owned halves, and on the
//! memory-ordering rule that a slot's contents are published before the index
//! that makes them visible: the producer writes the slot, then stores `head`
//! with `Release`; the consumer loads `head` with `Acquire` before reading.
//!
//! Overflow policy: a push into a full buffer drops the incoming byte and
//! increments an observable counter. The policy is deliberately surfaced
//! rather than hidden so it can be revisited if sustained overrun turns out
//! to matter in the field.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct RingShared {
    slots: Box<[UnsafeCell<u8>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

// The halves hand out access to disjoint roles: only the producer writes
// slots and `head`, only the consumer reads slots and writes `tail`.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Create a ring buffer with at least `capacity` slots (rounded up to a
/// power of two) and split it into its producer and consumer halves.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(RingShared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Write half of the ring. Owned by the byte collector.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Push one byte. Returns `false` (and counts the loss) when the buffer
    /// is full; the incoming byte is dropped, never an existing one.
    pub fn push(&mut self, byte: u8) -> bool {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.shared.slots.len() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            *self.shared.slots[head & self.shared.mask].get() = byte;
        }
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Total bytes dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Cloneable overflow-counter handle for diagnostics.
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read half of the ring. Owned by the decoder worker.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Pop the oldest byte, `None` when the buffer is empty.
    pub fn pop(&mut self) -> Option<u8> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let byte = unsafe { *self.shared.slots[tail & self.shared.mask].get() };
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cloneable overflow-counter handle for diagnostics.
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only view of the ring's overflow counter.
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<RingShared>,
}

impl RingMonitor {
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
