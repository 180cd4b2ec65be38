//! Response table.
//!
//! Buffers messages that bypass the request queue (replies, barrier
//! acknowledgements, control messages) in FIFOs keyed by tag and source.
//! Each tag bucket has its own lock shared by every source of that tag.

use crate::core::{lock, Error, Rank, Result, Source};
use crate::net::message::{Tag, MAX_TAGS};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Bucket = HashMap<Rank, VecDeque<Vec<u8>>>;

/// Per (tag, source) FIFO buffers of raw payloads.
#[derive(Debug)]
pub struct ResponseTable {
    buckets: Vec<Mutex<Bucket>>,
    size: usize,
}

impl ResponseTable {
    /// Create a table for a group of `size` ranks.
    pub fn new(size: usize) -> Self {
        Self {
            buckets: (0..MAX_TAGS).map(|_| Mutex::new(HashMap::new())).collect(),
            size,
        }
    }

    fn bucket(&self, tag: Tag) -> Result<&Mutex<Bucket>> {
        tag.index()
            .and_then(|i| self.buckets.get(i))
            .ok_or(Error::UnknownTag(tag.0))
    }

    /// Append a payload at the back of the (tag, source) FIFO.
    pub fn push(&self, tag: Tag, source: Rank, data: Vec<u8>) -> Result<()> {
        lock(self.bucket(tag)?)
            .entry(source)
            .or_default()
            .push_back(data);
        Ok(())
    }

    /// Pop the oldest payload for (tag, source). With [`Source::Any`] ranks
    /// are scanned in ascending order and the first non-empty FIFO wins.
    pub fn pop(&self, source: Source, tag: Tag) -> Result<Option<(Rank, Vec<u8>)>> {
        if let Source::Rank(rank) = source {
            if rank >= self.size {
                return Err(Error::InvalidRank {
                    rank,
                    size: self.size,
                });
            }
        }
        let mut bucket = lock(self.bucket(tag)?);
        let found = match source {
            Source::Rank(rank) => bucket
                .get_mut(&rank)
                .and_then(VecDeque::pop_front)
                .map(|data| (rank, data)),
            Source::Any => (0..self.size).find_map(|rank| {
                bucket
                    .get_mut(&rank)
                    .and_then(VecDeque::pop_front)
                    .map(|data| (rank, data))
            }),
        };
        Ok(found)
    }

    /// Number of buffered payloads for a tag across all sources.
    pub fn len(&self, tag: Tag) -> usize {
        self.bucket(tag)
            .map(|b| lock(b).values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Whether nothing is buffered for `tag`.
    pub fn is_empty(&self, tag: Tag) -> bool {
        self.len(tag) == 0
    }
}
