//! Synchronous request queue.
//!
//! One FIFO per key. The consumer visits keys round-robin and takes at most
//! one request per visit, so every key with pending work is served once per
//! cycle and each key's requests come out in arrival order.

use crate::core::Result;
use crate::net::message::{extract_key, TaggedMessage};
use crate::net::queue::{RequestQueue, RoundRobin};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

/// Strictly ordered per-key request queue.
#[derive(Debug)]
pub struct SyncRequestQueue {
    slots: RoundRobin<VecDeque<TaggedMessage>>,
}

impl SyncRequestQueue {
    /// Create a queue that parks for `poll` after an empty cycle.
    pub fn new(poll: Duration) -> Self {
        Self {
            slots: RoundRobin::new(poll),
        }
    }
}

impl RequestQueue for SyncRequestQueue {
    fn enqueue(&self, msg: TaggedMessage) -> Result<()> {
        let key = extract_key(msg.tag, &msg.data)?;
        self.slots.push(&key, VecDeque::new, |index, queue| {
            trace!(key = %key, index, tag = %msg.tag, "enqueued request");
            queue.push_back(msg);
            Ok(())
        })
    }

    fn next_request(&self) -> Option<TaggedMessage> {
        self.slots.next(VecDeque::pop_front)
    }

    fn try_next(&self) -> Option<TaggedMessage> {
        self.slots.scan(VecDeque::pop_front)
    }

    fn close(&self) {
        self.slots.close();
    }

    fn key_count(&self) -> usize {
        self.slots.key_count()
    }

    fn pending(&self) -> usize {
        self.slots.pending()
    }
}
