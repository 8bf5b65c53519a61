use std::fmt::{Display, Formatter};

use bytes::Bytes;

// The messages exchanged between replicas (and the blob persisted to stable
// storage) are prost messages so that any transport or storage backend can
// move them as opaque bytes. There is no generated code; the field tags are
// declared inline.

// Identifies a log entry by its position and the leader term under which it
// was accepted. Two entries with the same id are guaranteed identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryId {
    pub term: u64,
    pub index: u64,
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "(term={},index={})", self.term, self.index)
    }
}

// A single replicated log entry. Indexing is 1-based and dense; index 0 is
// the sentinel "before first" and never holds an entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Entry {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(uint64, tag = "2")]
    pub index: u64,

    // Opaque command payload, interpreted only by the consuming service.
    #[prost(bytes = "bytes", tag = "3")]
    pub command: Bytes,
}

impl Entry {
    pub fn id(&self) -> EntryId {
        EntryId {
            term: self.term,
            index: self.index,
        }
    }
}

// Sent by candidates to gather votes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(uint64, tag = "2")]
    pub candidate_id: u64,

    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,

    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(bool, tag = "2")]
    pub granted: bool,
}

// Sent by the leader to replicate entries; with an empty entry list this
// doubles as the heartbeat.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(uint64, tag = "2")]
    pub leader_id: u64,

    // The entry immediately before the shipped entries. The follower accepts
    // the entries only if its log matches at this position.
    #[prost(uint64, tag = "3")]
    pub prev_log_index: u64,

    #[prost(uint64, tag = "4")]
    pub prev_log_term: u64,

    #[prost(message, repeated, tag = "5")]
    pub entries: Vec<Entry>,

    #[prost(uint64, tag = "6")]
    pub leader_commit: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(bool, tag = "2")]
    pub success: bool,

    // Conflict hints, only meaningful on a log-mismatch rejection. They let
    // the leader rewind its next index by whole terms instead of one entry
    // at a time. A conflict_term of 0 means the follower's log was simply
    // too short.
    #[prost(uint64, tag = "3")]
    pub conflict_index: u64,

    #[prost(uint64, tag = "4")]
    pub conflict_term: u64,
}

// The triple a replica persists to stable storage, packaged as one blob.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DurableState {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(uint64, optional, tag = "2")]
    pub voted_for: Option<u64>,

    #[prost(message, repeated, tag = "3")]
    pub entries: Vec<Entry>,
}

// One message per committed entry, delivered on the replica's output
// channel in strictly ascending index order.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyMessage {
    pub valid: bool,
    pub command: Bytes,
    pub index: u64,
    pub term: u64,
}
