//! Serial input FIFO
//!
//! Single-producer single-consumer byte ring. The host pushes keystrokes
//! (possibly from another thread); the UART pops them from inside `step`.
//! Lock-free: the producer only moves `tail`, the consumer only moves `head`.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ring capacity in bytes. Must be a power of two so wrapping indices stay
/// consistent across `usize` overflow.
pub const FIFO_CAPACITY: usize = 1024;

struct Ring {
    buf: [AtomicU8; FIFO_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
}

/// Cloneable handle to a shared serial FIFO. Hand one clone to the producer
/// and one to the UART; do not pop from more than one place.
#[derive(Clone)]
pub struct SerialFifo {
    ring: Arc<Ring>,
}

impl SerialFifo {
    pub fn new() -> Self {
        const EMPTY: AtomicU8 = AtomicU8::new(0);
        SerialFifo {
            ring: Arc::new(Ring {
                buf: [EMPTY; FIFO_CAPACITY],
                head: AtomicUsize::new(0),
                tail: AtomicUsize::new(0),
            }),
        }
    }

    /// Producer side. Returns false (byte dropped) when the ring is full.
    pub fn push(&self, byte: u8) -> bool {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= FIFO_CAPACITY {
            return false;
        }
        ring.buf[tail % FIFO_CAPACITY].store(byte, Ordering::Relaxed);
        // Publish the byte before the new tail.
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Push as many bytes as fit; returns how many were accepted.
    pub fn push_slice(&self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.push(b)).count()
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<u8> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let byte = ring.buf[head % FIFO_CAPACITY].load(Ordering::Relaxed);
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Acquire);
        let head = self.ring.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl Default for SerialFifo {
    fn default() -> Self {
        Self::new()
    }
}
