//! Lock-free ISR-to-foreground packet queue
//!
//! Single-producer single-consumer: the UART interrupt pushes completed
//! packets, the foreground pops them for dispatch. No locking, no heap;
//! head/tail publishing uses acquire/release atomics so packets written
//! by the ISR are fully visible to the consumer.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use portable_atomic::{AtomicUsize, Ordering};

use crate::framer::RxPacket;

/// Queue capacity in packets. Power of two; one slot stays empty to
/// distinguish full from empty.
pub const QUEUE_DEPTH: usize = 4;

/// SPSC queue of completed receive packets.
///
/// # Safety contract
/// Exactly one context may call `push` (the ISR) and exactly one may call
/// `pop` (the foreground). `len`/`is_empty` are safe from either side.
pub struct PacketQueue {
    slots: UnsafeCell<[MaybeUninit<RxPacket>; QUEUE_DEPTH]>,
    head: AtomicUsize, // producer position
    tail: AtomicUsize, // consumer position
}

// The SPSC discipline plus atomic index publishing makes shared access
// sound; slots are only read after the producer's release store.
unsafe impl Sync for PacketQueue {}

impl PacketQueue {
    pub const fn new() -> Self {
        assert!(QUEUE_DEPTH.is_power_of_two());
        Self {
            slots: UnsafeCell::new(
                // MaybeUninit slots need no initialisation.
                unsafe { MaybeUninit::uninit().assume_init() },
            ),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of packets waiting for the consumer.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a packet (producer side). Returns false when full.
    pub fn push(&self, packet: &RxPacket) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= QUEUE_DEPTH - 1 {
            return false;
        }

        // Sole producer: this slot is not visible to the consumer until
        // the release store below.
        let slots = unsafe { &mut *self.slots.get() };
        slots[head & (QUEUE_DEPTH - 1)] = MaybeUninit::new(*packet);

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Dequeue the oldest packet (consumer side).
    pub fn pop(&self) -> Option<RxPacket> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let slots = unsafe { &*self.slots.get() };
        // This slot was initialised by the producer before its release
        // store made `head` cover it.
        let packet = unsafe { slots[tail & (QUEUE_DEPTH - 1)].assume_init() };

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(packet)
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
