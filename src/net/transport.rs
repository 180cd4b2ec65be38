//! Transport channel abstraction.
//!
//! Wraps a collective message-passing transport: non-blocking probe and
//! receive, non-blocking send, and completion testing for in-flight sends.
//! [`LocalCluster`] provides an in-process mesh used for single-host runs and
//! tests.

use crate::core::{lock, Error, Rank, Result};
use crate::net::message::Tag;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Header of a message that is ready to be received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub source: Rank,
    pub tag: Tag,
    /// Advertised payload length in bytes
    pub len: usize,
}

/// Handle of an in-flight send.
#[derive(Clone, Debug)]
pub struct SendHandle {
    id: u64,
    done: Arc<AtomicBool>,
}

impl SendHandle {
    /// Create a handle with its completion flag.
    pub fn new(id: u64) -> (Self, Arc<AtomicBool>) {
        let done = Arc::new(AtomicBool::new(false));
        (
            Self {
                id,
                done: Arc::clone(&done),
            },
            done,
        )
    }

    /// Create a handle that is already complete.
    pub fn completed(id: u64) -> Self {
        Self {
            id,
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Collective message-passing transport.
///
/// Only the network loop calls `probe`, `recv`, `isend` and `test`.
pub trait Transport: Send + Sync {
    /// Rank of this process.
    fn rank(&self) -> Rank;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Non-blocking probe for a message from any source with any tag.
    fn probe(&self) -> Result<Option<Probe>>;

    /// Receive exactly the message described by a previous probe.
    fn recv(&self, probe: &Probe) -> Result<Vec<u8>>;

    /// Start a non-blocking send.
    fn isend(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<SendHandle>;

    /// Test whether a send has completed.
    fn test(&self, handle: &SendHandle) -> Result<bool>;

    /// Tear down the transport. Called once at shutdown.
    fn finalize(&self) -> Result<()>;
}

/// A message in flight inside a [`LocalCluster`].
#[derive(Debug)]
struct Envelope {
    source: Rank,
    tag: Tag,
    data: Vec<u8>,
}

/// In-process mesh of ranks connected by unbounded channels.
pub struct LocalCluster;

impl LocalCluster {
    /// Build a fully connected group of `size` transports, indexed by rank.
    pub fn new(size: usize) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        let senders = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                peers: Arc::clone(&senders),
                inbox: Mutex::new(LocalInbox {
                    receiver: inbox,
                    staged: VecDeque::new(),
                }),
                next_send: Mutex::new(0),
                finalized: AtomicBool::new(false),
            })
            .collect()
    }
}

struct LocalInbox {
    receiver: UnboundedReceiver<Envelope>,
    /// Messages pulled off the channel by `probe` but not yet received
    staged: VecDeque<Envelope>,
}

/// One rank of a [`LocalCluster`].
pub struct LocalTransport {
    rank: Rank,
    peers: Arc<Vec<UnboundedSender<Envelope>>>,
    inbox: Mutex<LocalInbox>,
    next_send: Mutex<u64>,
    finalized: AtomicBool,
}

impl LocalTransport {
    /// Whether `finalize` has been called.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(Error::Transport(format!(
                "rank {} transport already finalized",
                self.rank
            )));
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn probe(&self) -> Result<Option<Probe>> {
        self.check_open()?;
        let mut inbox = lock(&self.inbox);
        if inbox.staged.is_empty() {
            match inbox.receiver.try_recv() {
                Ok(envelope) => inbox.staged.push_back(envelope),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(Error::Transport("local mesh disconnected".to_string()))
                }
            }
        }
        Ok(inbox.staged.front().map(|e| Probe {
            source: e.source,
            tag: e.tag,
            len: e.data.len(),
        }))
    }

    fn recv(&self, probe: &Probe) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut inbox = lock(&self.inbox);
        let position = inbox
            .staged
            .iter()
            .position(|e| e.source == probe.source && e.tag == probe.tag)
            .ok_or_else(|| {
                Error::Transport(format!(
                    "no staged message from {} with tag {}",
                    probe.source, probe.tag
                ))
            })?;
        let envelope = inbox
            .staged
            .remove(position)
            .ok_or_else(|| Error::Internal("staged message vanished".to_string()))?;
        if envelope.data.len() != probe.len {
            return Err(Error::Transport(format!(
                "advertised {} bytes, found {}",
                probe.len,
                envelope.data.len()
            )));
        }
        Ok(envelope.data)
    }

    fn isend(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<SendHandle> {
        self.check_open()?;
        let peer = self.peers.get(dest).ok_or(Error::InvalidRank {
            rank: dest,
            size: self.peers.len(),
        })?;
        peer.send(Envelope {
            source: self.rank,
            tag,
            data: payload.to_vec(),
        })
        .map_err(|_| Error::Transport(format!("rank {} is gone", dest)))?;

        let mut next = lock(&self.next_send);
        *next += 1;
        Ok(SendHandle::completed(*next))
    }

    fn test(&self, handle: &SendHandle) -> Result<bool> {
        Ok(handle.is_done())
    }

    fn finalize(&self) -> Result<()> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}
