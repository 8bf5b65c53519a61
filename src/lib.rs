// This crate implements the core of a Raft consensus replica, based on the
// paper at https://raft.github.io/raft.pdf: the follower/candidate/leader
// role machine, leader election, log replication with conflict-hint
// back-off, commit advancement, and in-order delivery of committed commands
// to an output channel.
//
// Users of this crate supply the two external collaborators as traits: a
// transport handle per peer (RaftClient) and a durable blob store
// (Persister). The replica guarantees that all members of the cluster
// deliver the same sequence of committed commands, in the same order, on
// their respective output channels.

mod consensus;
mod log;
mod message;
mod persistence;
mod transport;

mod error;
pub use error::{RaftError, RaftResult};

pub use consensus::{Options, Replica, HEARTBEAT_MS, MAX_ELECTION_MS, MIN_ELECTION_MS};
pub use message::{
    AppendRequest, AppendResponse, ApplyMessage, Entry, EntryId, VoteRequest, VoteResponse,
};
pub use persistence::{FilePersister, MemoryPersister, PersistenceError, Persister};
pub use transport::RaftClient;

pub mod testing;
