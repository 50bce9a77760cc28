//! Cross-thread payload envelopes.
//!
//! One envelope is shared by every recipient of a message. Each recipient
//! gets an owned [`Delivery`] that is pushed through the destination
//! worker's [`Mailbox`]; the kernel ring message that follows is only a
//! wake-up. A delivery releases its share exactly once: explicitly via
//! [`Delivery::release`], or implicitly when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_queue::SegQueue;

struct Shared {
    sender: u32,
    payload: Bytes,
    pending: AtomicUsize,
}

/// Outcome of releasing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other deliveries still hold the envelope.
    Pending(usize),
    /// This was the final delivery; the envelope is gone.
    Last,
}

pub struct Envelope;

impl Envelope {
    /// Build one envelope for `recipients.len()` destinations.
    pub fn new(sender: u32, payload: Bytes, recipients: &[u32]) -> Vec<Delivery> {
        if recipients.is_empty() {
            return Vec::new();
        }
        let shared = Arc::new(Shared {
            sender,
            payload,
            pending: AtomicUsize::new(recipients.len()),
        });
        recipients
            .iter()
            .map(|&dest| Delivery { dest, inner: Some(Arc::clone(&shared)) })
            .collect()
    }
}

/// One recipient's share of an envelope.
pub struct Delivery {
    dest: u32,
    inner: Option<Arc<Shared>>,
}

impl Delivery {
    /// Destination connection id.
    #[inline]
    pub fn dest(&self) -> u32 {
        self.dest
    }

    /// Sender connection id, or 0 once released.
    pub fn sender(&self) -> u32 {
        self.inner.as_ref().map_or(0, |s| s.sender)
    }

    pub fn payload(&self) -> &[u8] {
        match &self.inner {
            Some(s) => &s.payload[..],
            None => &[],
        }
    }

    /// Cheap clone of the payload for handing to a send path.
    pub fn payload_bytes(&self) -> Bytes {
        self.inner.as_ref().map(|s| s.payload.clone()).unwrap_or_default()
    }

    /// Deliveries of this envelope not yet released.
    pub fn pending(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |s| s.pending.load(Ordering::Acquire))
    }

    pub fn release(mut self) -> Release {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Release {
        match self.inner.take() {
            Some(shared) => {
                let prev = shared.pending.fetch_sub(1, Ordering::AcqRel);
                if prev == 1 {
                    Release::Last
                } else {
                    Release::Pending(prev - 1)
                }
            }
            None => Release::Last,
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.release_inner();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("dest", &self.dest)
            .field("sender", &self.sender())
            .field("len", &self.payload().len())
            .finish()
    }
}

/// Per-worker inbound queue of deliveries.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: SegQueue<Delivery>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, delivery: Delivery) {
        self.queue.push(delivery);
    }

    pub fn pop(&self) -> Option<Delivery> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
