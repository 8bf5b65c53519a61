use async_trait::async_trait;

use crate::error::RaftResult;
use crate::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};

/// A handle on which to issue remote calls to one peer replica. The
/// transport behind the handle owns delivery, encoding, and timeouts; the
/// only contract the replica relies on is that every call eventually
/// returns, with either the peer's reply or an error. An error means "no
/// reply" and is never fatal: the caller retries on its next heartbeat or
/// back-off signal.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn vote(&self, request: VoteRequest) -> RaftResult<VoteResponse>;
    async fn append(&self, request: AppendRequest) -> RaftResult<AppendResponse>;
}
