//! Asynchronous request queue.
//!
//! Each key keeps a put sub-queue and a get sub-queue, each holding at most
//! `num_memory_servers` (M) requests, since every memory server has at most
//! one outstanding request of a kind per key. The consumer serves a key from
//! the sub-queue of its current phase and flips the phase after M requests,
//! so every get observes all puts of the current round before the next
//! round's puts are admitted.

use crate::core::{Error, Result};
use crate::net::message::{extract_key, Tag, TaggedMessage};
use crate::net::queue::{RequestQueue, RoundRobin};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, trace};

/// Which sub-queue a key is currently served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Put,
    Get,
}

#[derive(Debug)]
struct AsyncSlot {
    puts: VecDeque<TaggedMessage>,
    gets: VecDeque<TaggedMessage>,
    phase: Phase,
    served: usize,
    /// No put has been served for this key yet
    first_update: bool,
}

impl AsyncSlot {
    fn new() -> Self {
        Self {
            puts: VecDeque::new(),
            gets: VecDeque::new(),
            phase: Phase::Put,
            served: 0,
            first_update: true,
        }
    }

    fn take(&mut self, batch: usize, first_put_flips: bool) -> Option<TaggedMessage> {
        match self.phase {
            Phase::Put => {
                let msg = self.puts.pop_front()?;
                self.served += 1;
                let initial = std::mem::replace(&mut self.first_update, false);
                if (initial && first_put_flips) || self.served == batch {
                    self.phase = Phase::Get;
                    self.served = 0;
                }
                Some(msg)
            }
            Phase::Get => {
                let msg = self.gets.pop_front()?;
                self.served += 1;
                if self.served == batch {
                    self.phase = Phase::Put;
                    self.served = 0;
                }
                Some(msg)
            }
        }
    }
}

/// Phase-batched per-key request queue.
#[derive(Debug)]
pub struct AsyncRequestQueue {
    slots: RoundRobin<AsyncSlot>,
    num_memory_servers: usize,
    first_put_flips: bool,
}

impl AsyncRequestQueue {
    /// Create a queue for `num_memory_servers` peers that parks for `poll`
    /// after an empty cycle. A zero server count is treated as one.
    pub fn new(num_memory_servers: usize, poll: Duration) -> Self {
        Self {
            slots: RoundRobin::new(poll),
            num_memory_servers: num_memory_servers.max(1),
            first_put_flips: true,
        }
    }

    /// Whether a key's very first put flips it straight to get-serving.
    ///
    /// Enabled by default: the first put for a key initialises the value and
    /// readers may proceed immediately.
    pub fn with_first_put_flip(mut self, enabled: bool) -> Self {
        self.first_put_flips = enabled;
        self
    }

    pub fn capacity(&self) -> usize {
        self.num_memory_servers
    }
}

impl RequestQueue for AsyncRequestQueue {
    fn enqueue(&self, msg: TaggedMessage) -> Result<()> {
        let key = extract_key(msg.tag, &msg.data)?;
        let capacity = self.num_memory_servers;
        self.slots.push(&key, AsyncSlot::new, |index, slot| {
            let (queue, name) = if msg.tag == Tag::GET_REQUEST {
                (&mut slot.gets, "get")
            } else {
                (&mut slot.puts, "put")
            };
            if queue.len() >= capacity {
                error!(key = %key, index, queue = name, capacity, "request queue capacity exceeded");
                return Err(Error::CapacityExceeded {
                    key: key.clone(),
                    queue: name,
                    capacity,
                });
            }
            trace!(key = %key, index, queue = name, "enqueued request");
            queue.push_back(msg);
            Ok(())
        })
    }

    fn next_request(&self) -> Option<TaggedMessage> {
        let (batch, flip) = (self.num_memory_servers, self.first_put_flips);
        self.slots.next(|slot| slot.take(batch, flip))
    }

    fn try_next(&self) -> Option<TaggedMessage> {
        let (batch, flip) = (self.num_memory_servers, self.first_put_flips);
        self.slots.scan(|slot| slot.take(batch, flip))
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
