//! Single-producer single-consumer byte ring for the interrupt-side receive
//! path.
//!
//! The producer half belongs to the UART driver's interrupt context and never
//! blocks: when the ring is full the byte is dropped and the fault flag is
//! raised instead of stalling the interrupt. The consumer half is drained
//! only from normal context by the serial transport.
//!
//! Memory-ordering contract: the producer publishes a slot with a `Release`
//! store of its cursor, paired with an `Acquire` load in the consumer; the
//! consumer frees a slot the same way in the opposite direction. Cursors grow
//! monotonically and are wrapped with a power-of-two mask.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct RingShared {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Producer cursor: next slot to write.
    head: AtomicUsize,
    /// Consumer cursor: next slot to read.
    tail: AtomicUsize,
    fault: AtomicBool,
}

// Safety: exactly one producer writes slots in [tail, head) and exactly one
// consumer reads slots in [head - len, tail); the cursor Release/Acquire
// pairs publish slot contents across contexts.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Interrupt-side half of the ring. Exactly one exists per ring.
pub struct IrqProducer {
    shared: Arc<RingShared>,
}

/// Normal-context half of the ring. Exactly one exists per ring.
pub struct IrqConsumer {
    shared: Arc<RingShared>,
}

/// Create a ring holding at least `capacity` bytes (rounded up to a power of
/// two).
pub fn irq_ring(capacity: usize) -> (IrqProducer, IrqConsumer) {
    let size = capacity.max(2).next_power_of_two();
    let storage = (0..size)
        .map(|_| UnsafeCell::new(0))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(RingShared {
        storage,
        mask: size - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        fault: AtomicBool::new(false),
    });
    (
        IrqProducer {
            shared: Arc::clone(&shared),
        },
        IrqConsumer { shared },
    )
}

impl IrqProducer {
    /// Push one byte. Returns `false` (and raises the fault flag) when the
    /// ring is full; the byte is dropped rather than blocking the caller.
    pub fn push(&self, byte: u8) -> bool {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == shared.storage.len() {
            shared.fault.store(true, Ordering::Release);
            return false;
        }
        unsafe { *shared.storage[head & shared.mask].get() = byte };
        shared.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Push a run of bytes, stopping at the first drop.
    pub fn push_all(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|b| self.push(*b))
    }

    /// Raise the fault flag without pushing data (hardware error path).
    pub fn raise_fault(&self) {
        self.shared.fault.store(true, Ordering::Release);
    }
}

impl IrqConsumer {
    /// Pop the oldest byte, if any.
    pub fn pop(&self) -> Option<u8> {
        let shared = &*self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let byte = unsafe { *shared.storage[tail & shared.mask].get() };
        shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the fault flag, returning whether it was raised since the
    /// last call.
    pub fn take_fault(&self) -> bool {
        self.shared.fault.swap(false, Ordering::AcqRel)
    }
}
