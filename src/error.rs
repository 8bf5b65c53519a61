use thiserror::Error;

/// A specialized `Result` type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Structured error type used throughout the crate.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader")]
    NotLeader,

    #[error("Replica has been stopped")]
    Stopped,

    #[error("RPC error from peer {peer}: {source}")]
    Transport {
        peer: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl RaftError {
    pub(crate) fn unreachable(peer: usize) -> Self {
        Self::Transport {
            peer,
            source: "peer unreachable".into(),
        }
    }
}
