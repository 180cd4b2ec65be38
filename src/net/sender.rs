//! Outbound send tracking.
//!
//! Sends are queued as pending by any caller and issued by the network loop,
//! which moves them to the active set and later reclaims them once the
//! transport confirms completion.

use crate::core::{lock, now, Rank, Signal, Timestamp};
use crate::net::message::Tag;
use crate::net::transport::{SendHandle, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// An outbound message owned by the tracker until the transport completes it.
#[derive(Debug)]
pub struct OutboundSend {
    pub dest: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
    pub handle: Option<SendHandle>,
    pub failures: u32,
    pub start_time: Option<Timestamp>,
}

impl OutboundSend {
    pub fn new(dest: Rank, tag: Tag, payload: Vec<u8>) -> Self {
        Self {
            dest,
            tag,
            payload,
            handle: None,
            failures: 0,
            start_time: None,
        }
    }
}

/// Send counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendStats {
    pub queued: u64,
    pub issued: u64,
    pub completed: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct SendLists {
    pending: VecDeque<OutboundSend>,
    active: Vec<OutboundSend>,
}

/// Pending and active sends behind a single lock.
///
/// A record moves from pending to active inside one critical section, so it
/// is always visible in exactly one of the two lists.
#[derive(Debug, Default)]
pub struct SendTracker {
    lists: Mutex<SendLists>,
    drained: Signal,
    queued: AtomicU64,
    issued: AtomicU64,
    completed: AtomicU64,
    failures: AtomicU64,
}

impl SendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a send. Never blocks on the transport.
    pub fn push(&self, send: OutboundSend) {
        trace!(dest = send.dest, tag = %send.tag, bytes = send.payload.len(), "queued send");
        let mut lists = lock(&self.lists);
        lists.pending.push_back(send);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of pending and active sends.
    pub fn outstanding(&self) -> (usize, usize) {
        let lists = lock(&self.lists);
        (lists.pending.len(), lists.active.len())
    }

    /// Whether any outbound work remains.
    pub fn is_busy(&self) -> bool {
        let lists = lock(&self.lists);
        !lists.pending.is_empty() || !lists.active.is_empty()
    }

    /// Issue every pending send on the transport.
    ///
    /// A send the transport refuses stays pending with its failure count
    /// bumped and is retried on the next call.
    pub fn issue_pending(&self, transport: &dyn Transport) {
        let mut lists = lock(&self.lists);
        let mut refused = VecDeque::new();
        while let Some(mut send) = lists.pending.pop_front() {
            match transport.isend(send.dest, send.tag, &send.payload) {
                Ok(handle) => {
                    send.start_time = Some(now());
                    send.handle = Some(handle);
                    self.issued.fetch_add(1, Ordering::Relaxed);
                    lists.active.push(send);
                }
                Err(e) => {
                    send.failures += 1;
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        dest = send.dest,
                        tag = %send.tag,
                        failures = send.failures,
                        error = %e,
                        "send could not be issued"
                    );
                    refused.push_back(send);
                }
            }
        }
        lists.pending = refused;
    }

    /// Reclaim completed active sends.
    pub fn collect_active(&self, transport: &dyn Transport) {
        let mut lists = lock(&self.lists);
        if lists.active.is_empty() {
            return;
        }
        trace!(active = lists.active.len(), "testing active sends");

        let mut index = 0;
        while index < lists.active.len() {
            let send = &mut lists.active[index];
            let finished = match send.handle.as_ref() {
                Some(handle) => transport.test(handle),
                None => Ok(false),
            };
            match finished {
                Ok(true) => {
                    let send = lists.active.swap_remove(index);
                    if send.failures > 0 {
                        info!(
                            dest = send.dest,
                            bytes = send.payload.len(),
                            failures = send.failures,
                            "send succeeded after failures"
                        );
                    }
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => index += 1,
                Err(e) => {
                    send.failures += 1;
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        dest = send.dest,
                        tag = %send.tag,
                        failures = send.failures,
                        error = %e,
                        "send completion test failed"
                    );
                    index += 1;
                }
            }
        }

        if lists.pending.is_empty() && lists.active.is_empty() {
            debug!("all sends drained");
            self.drained.notify();
        }
    }

    /// Block until no outbound work remains or `keep_waiting` turns false.
    ///
    /// Returns `true` if the tracker drained.
    pub fn wait_drained(&self, poll: Duration, keep_waiting: impl Fn() -> bool) -> bool {
        loop {
            let seen = self.drained.generation();
            if !self.is_busy() {
                return true;
            }
            if !keep_waiting() {
                return false;
            }
            self.drained.wait(seen, poll);
        }
    }

    pub fn stats(&self) -> SendStats {
        SendStats {
            queued: self.queued.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
