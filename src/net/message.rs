//! Message tags, tagged payloads and the structured request/response records.
//!
//! Payloads travel as opaque byte strings; the records below are encoded with
//! bincode and only decoded where the engine needs a field (the routing key)
//! or where a handler consumes the request.

use crate::core::{Error, Rank, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound (exclusive) on tag values understood by the engine.
pub const MAX_TAGS: usize = 32;

/// Small integer identifying a message's semantic type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub i32);

impl Tag {
    pub const PUT_REQUEST: Tag = Tag(1);
    pub const GET_REQUEST: Tag = Tag(2);
    pub const PUT_RESPONSE: Tag = Tag(3);
    pub const GET_RESPONSE: Tag = Tag(4);
    pub const UPDATE_REQUEST: Tag = Tag(5);
    pub const SHARD_ASSIGNMENT: Tag = Tag(6);
    pub const REGISTER_WORKER: Tag = Tag(7);
    pub const WORKER_SHUTDOWN: Tag = Tag(8);
    /// Barrier acknowledgement.
    pub const EMPTY: Tag = Tag(9);

    /// Slot index for per-tag tables, or `None` if the tag is outside the known range.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok().filter(|i| *i < MAX_TAGS)
    }

    /// Requests are scheduled through the request queue.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Tag::PUT_REQUEST | Tag::GET_REQUEST | Tag::UPDATE_REQUEST
        )
    }

    /// Control messages are logged on receipt ahead of routing.
    pub fn is_control(self) -> bool {
        matches!(self, Tag::SHARD_ASSIGNMENT | Tag::WORKER_SHUTDOWN)
    }

    /// Human readable name for known tags.
    pub fn name(self) -> &'static str {
        match self {
            Tag::PUT_REQUEST => "PUT_REQUEST",
            Tag::GET_REQUEST => "GET_REQUEST",
            Tag::PUT_RESPONSE => "PUT_RESPONSE",
            Tag::GET_RESPONSE => "GET_RESPONSE",
            Tag::UPDATE_REQUEST => "UPDATE_REQUEST",
            Tag::SHARD_ASSIGNMENT => "SHARD_ASSIGNMENT",
            Tag::REGISTER_WORKER => "REGISTER_WORKER",
            Tag::WORKER_SHUTDOWN => "WORKER_SHUTDOWN",
            Tag::EMPTY => "EMPTY",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// A raw payload together with its tag and the rank it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedMessage {
    pub tag: Tag,
    pub source: Rank,
    pub data: Vec<u8>,
}

impl TaggedMessage {
    pub fn new(tag: Tag, source: Rank, data: Vec<u8>) -> Self {
        Self { tag, source, data }
    }

    /// Decode the payload into a record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode(self.tag, &self.data)
    }
}

/// A stored parameter value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    /// Number of updates applied since initialisation
    pub version: u64,
    /// Parameter contents
    pub data: Vec<f32>,
}

impl ParamValue {
    pub fn new(data: Vec<f32>) -> Self {
        Self { version: 0, data }
    }
}

/// Put (and update) request record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: ParamValue,
}

/// Get request record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

/// Reply to a put or update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub key: String,
    pub accepted: bool,
}

/// Reply to a get; `value` is `None` when the key is unknown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub key: String,
    pub value: Option<ParamValue>,
}

/// Assignment of table shards to worker ranks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub table: u32,
    /// `(shard, owner rank)` pairs
    pub assignments: Vec<(u32, Rank)>,
}

/// Payload-less message used for barrier acknowledgements and shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyMessage;

/// A fully decoded request, as handed to request handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Put { source: Rank, body: PutRequest },
    Get { source: Rank, body: GetRequest },
    Update { source: Rank, body: PutRequest },
}

impl Request {
    /// Decode a scheduled message according to its tag.
    pub fn decode(msg: &TaggedMessage) -> Result<Self> {
        match msg.tag {
            Tag::PUT_REQUEST => Ok(Request::Put {
                source: msg.source,
                body: msg.decode()?,
            }),
            Tag::GET_REQUEST => Ok(Request::Get {
                source: msg.source,
                body: msg.decode()?,
            }),
            Tag::UPDATE_REQUEST => Ok(Request::Update {
                source: msg.source,
                body: msg.decode()?,
            }),
            other => Err(Error::UnknownTag(other.0)),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Request::Put { body, .. } | Request::Update { body, .. } => &body.key,
            Request::Get { body, .. } => &body.key,
        }
    }

    pub fn source(&self) -> Rank {
        match self {
            Request::Put { source, .. }
            | Request::Get { source, .. }
            | Request::Update { source, .. } => *source,
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Request::Put { .. } => Tag::PUT_REQUEST,
            Request::Get { .. } => Tag::GET_REQUEST,
            Request::Update { .. } => Tag::UPDATE_REQUEST,
        }
    }
}

/// Extract the routing key of a request payload.
pub fn extract_key(tag: Tag, data: &[u8]) -> Result<String> {
    match tag {
        Tag::GET_REQUEST => Ok(decode::<GetRequest>(tag, data)?.key),
        Tag::PUT_REQUEST | Tag::UPDATE_REQUEST => Ok(decode::<PutRequest>(tag, data)?.key),
        other => Err(Error::UnknownTag(other.0)),
    }
}

/// Encode a record for the wire.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(record)?)
}

/// Decode a record, reporting failures as malformed messages for `tag`.
pub fn decode<T: DeserializeOwned>(tag: Tag, data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| Error::MalformedMessage {
        tag: tag.0,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_classification() {
        assert!(Tag::PUT_REQUEST.is_request());
        assert!(Tag::UPDATE_REQUEST.is_request());
        assert!(!Tag::PUT_RESPONSE.is_request());
        assert!(Tag::WORKER_SHUTDOWN.is_control());
        assert_eq!(Tag(-1).index(), None);
        assert_eq!(Tag(MAX_TAGS as i32).index(), None);
        assert_eq!(Tag::EMPTY.index(), Some(9));
    }

    #[test]
    fn test_extract_key() {
        let put = PutRequest {
            key: "fc1/weight".to_string(),
            value: ParamValue::new(vec![1.0, 2.0]),
        };
        let data = encode(&put).unwrap();
        assert_eq!(extract_key(Tag::PUT_REQUEST, &data).unwrap(), "fc1/weight");

        let get = encode(&GetRequest {
            key: "fc1/bias".to_string(),
        })
        .unwrap();
        assert_eq!(extract_key(Tag::GET_REQUEST, &get).unwrap(), "fc1/bias");
    }

    #[test]
    fn test_extract_key_malformed() {
        let result = extract_key(Tag::PUT_REQUEST, &[0xff, 0x01]);
        assert!(matches!(
            result,
            Err(Error::MalformedMessage { tag: 1, .. })
        ));
    }

    #[test]
    fn test_extract_key_non_request() {
        let result = extract_key(Tag::PUT_RESPONSE, &[]);
        assert!(matches!(result, Err(Error::UnknownTag(3))));
    }

    #[test]
    fn test_request_decode() {
        let data = encode(&GetRequest {
            key: "k".to_string(),
        })
        .unwrap();
        let msg = TaggedMessage::new(Tag::GET_REQUEST, 4, data);
        let request = Request::decode(&msg).unwrap();

        assert_eq!(request.key(), "k");
        assert_eq!(request.source(), 4);
        assert_eq!(request.tag(), Tag::GET_REQUEST);
    }
}
