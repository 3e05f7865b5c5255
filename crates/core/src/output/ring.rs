//! Single-producer/single-consumer ring of packet buffers.
//!
//! The tuner reader fills slots, the RTP writer drains them; indices are
//! monotonic and reduced mod [`MAX_BUF`]. A full ring makes the reader
//! drop its current buffer — the sole back-pressure mechanism, there are
//! no unbounded queues.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::mpegts::PacketBuffer;

/// Ring capacity in packet buffers.
pub const MAX_BUF: usize = 32;

pub struct BufferRing {
    slots: Vec<Mutex<PacketBuffer>>,
    write: AtomicUsize,
    read: AtomicUsize,
}

impl BufferRing {
    /// Build a ring with every buffer's RTP header prepared.
    pub fn new(ssrc: u32, timestamp: u32) -> Self {
        let mut slots = Vec::with_capacity(MAX_BUF);
        for _ in 0..MAX_BUF {
            let mut buffer = PacketBuffer::new();
            buffer.initialize(ssrc, timestamp);
            slots.push(Mutex::new(buffer));
        }
        BufferRing {
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    /// Free slots between writer and reader positions.
    pub fn available(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        MAX_BUF - write.wrapping_sub(read)
    }

    /// The slot the reader is currently filling.
    pub fn write_slot(&self) -> MutexGuard<'_, PacketBuffer> {
        self.slots[self.write.load(Ordering::Acquire) % MAX_BUF].lock()
    }

    /// Hand the filled write slot to the consumer and reset the next slot.
    /// Callers must have checked [`available`](Self::available) > 1.
    pub fn publish(&self) {
        let next = self.write.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.slots[next % MAX_BUF].lock().reset();
    }

    /// Run `f` over the oldest ready buffer and consume it. Returns `None`
    /// when nothing is ready to send.
    pub fn pop_ready<R>(&self, f: impl FnOnce(&mut PacketBuffer) -> R) -> Option<R> {
        let read = self.read.load(Ordering::Acquire);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.slots[read % MAX_BUF].lock();
        if !slot.ready_to_send() {
            return None;
        }
        let result = f(&mut slot);
        drop(slot);
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(result)
    }

    /// Drop everything buffered (stream restart).
    pub fn flush(&self) {
        let write = self.write.load(Ordering::Acquire);
        self.read.store(write, Ordering::Release);
        self.slots[write % MAX_BUF].lock().reset();
    }
}
