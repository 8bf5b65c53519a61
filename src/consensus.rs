use std::cmp::min;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_std::channel::Sender;
use async_std::sync::{Arc, Mutex};
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{RaftError, RaftResult};
use crate::log::LogStore;
use crate::message::{
    AppendRequest, AppendResponse, ApplyMessage, EntryId, VoteRequest, VoteResponse,
};
use crate::persistence::{decode_durable_state, encode_durable_state, Persister};
use crate::transport::RaftClient;

// Interval at which a leader contacts every follower, even without new
// entries. Must be well under the election timeout range.
pub const HEARTBEAT_MS: u64 = 100;

// Bounds for the randomized election timeout. A fresh draw is taken every
// time the deadline is reset, which keeps repeated split votes unlikely.
pub const MIN_ELECTION_MS: u64 = 500;
pub const MAX_ELECTION_MS: u64 = 1000;

// How often the timer drivers wake up to check their deadlines.
const TICK_MS: u64 = 10;

// Parameters used to configure the behavior of a single replica.
#[derive(Debug, Clone)]
pub struct Options {
    // Interval between leader heartbeats to each follower.
    pub heartbeat_ms: u64,

    // Bounds for the randomized election timeout draw. Must satisfy
    // min_election_ms < max_election_ms.
    pub min_election_ms: u64,

    // See above.
    pub max_election_ms: u64,

    // Seed for the replica's random generator. Absent means seeding from
    // entropy; tests inject a value for reproducible timeout draws.
    pub seed: Option<u64>,
}

impl Options {
    pub fn default() -> Self {
        Options {
            heartbeat_ms: HEARTBEAT_MS,
            min_election_ms: MIN_ELECTION_MS,
            max_election_ms: MAX_ELECTION_MS,
            seed: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

// Holds the state a leader tracks about one follower. Used to decide which
// entries to ship to that follower.
#[derive(Debug, Clone, PartialEq)]
struct FollowerPosition {
    // Next log index to send to the follower.
    next_index: u64,

    // Highest index known to be replicated on the follower.
    match_index: u64,
}

impl Display for FollowerPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "(next={},match={})", self.next_index, self.match_index)
    }
}

// The full mutable state of a replica, guarded by a single mutex. Drivers
// and handlers take the lock for every inspection or mutation and release
// it around remote calls, channel sends, and sleeps.
struct ReplicaState {
    options: Options,
    id: usize,
    peer_count: usize,

    role: RaftRole,

    // Durable fields; persisted before any RPC or reply reveals them.
    term: u64,
    voted_for: Option<usize>,
    log: LogStore,

    commit_index: u64,
    last_applied: u64,

    // One position per peer, indexed by peer id; the own slot is unused.
    // Meaningful only while leader, reinitialized on every election win.
    followers: Vec<FollowerPosition>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,

    rng: SmallRng,
    persister: Arc<dyn Persister>,

    // Wakeups for the per-peer replication streams and the apply driver.
    replication_signals: Arc<Vec<Notify>>,
    commit_signal: Arc<Notify>,
}

impl ReplicaState {
    // Writes the durable triple to stable storage. Must be called, while
    // still holding the lock, after any change to term, vote, or log and
    // before the change becomes externally visible. A failed save cannot be
    // reconciled with the durability invariant, so it aborts.
    async fn persist(&mut self) {
        let blob = encode_durable_state(self.term, self.voted_for, self.log.entries());
        let persister = self.persister.clone();
        if let Err(error) = persister.save(blob).await {
            panic!("replica {}: failed to save durable state: {}", self.id, error);
        }
    }

    fn majority(&self) -> usize {
        self.peer_count / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        let timeout_ms = self
            .rng
            .gen_range(self.options.min_election_ms..self.options.max_election_ms);
        self.election_deadline = Instant::now() + Duration::from_millis(timeout_ms);
    }

    fn wake_replication_streams(&self) {
        for (peer, signal) in self.replication_signals.iter().enumerate() {
            if peer != self.id {
                signal.notify_one();
            }
        }
    }

    // Adopts a higher term observed in a request or reply: clears the vote,
    // reverts to follower, persists. Does not touch the election deadline;
    // only evidence of a live leader or a granted vote does that.
    async fn adopt_term(&mut self, term: u64) {
        debug_assert!(term > self.term, "terms never decrease");
        debug!(term, old_term = self.term, role = ?self.role, "adopting newer term");
        self.term = term;
        self.voted_for = None;
        self.role = RaftRole::Follower;
        self.persist().await;
    }

    // Turns this replica into a candidate for a fresh term and returns the
    // vote request its election should send out.
    async fn begin_election(&mut self) -> VoteRequest {
        self.role = RaftRole::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.persist().await;
        self.reset_election_deadline();
        info!(term = self.term, "starting election");

        let last = self.log.last_entry_id();
        VoteRequest {
            term: self.term,
            candidate_id: self.id as u64,
            last_log_index: last.index,
            last_log_term: last.term,
        }
    }

    // Called on winning an election. Follower positions start optimistic
    // (next is our own next index) and are corrected by reply traffic.
    fn become_leader(&mut self) {
        info!(term = self.term, "won election, becoming leader");
        self.role = RaftRole::Leader;
        self.followers = vec![
            FollowerPosition {
                next_index: self.log.last_index() + 1,
                match_index: 0,
            };
            self.peer_count
        ];
        self.heartbeat_deadline = Instant::now() + Duration::from_millis(self.options.heartbeat_ms);

        // The initial round of (possibly empty) appends announces the new
        // leader without waiting for the first heartbeat tick.
        self.wake_replication_streams();
    }

    // Returns an append request for the supplied peer, shipping everything
    // from the peer's next index through the end of our log. Must only be
    // called as leader.
    fn create_append_request(&self, peer: usize) -> AppendRequest {
        let next_index = self.followers[peer].next_index;
        debug_assert!(next_index >= 1 && next_index <= self.log.last_index() + 1);
        let prev_log_index = next_index - 1;

        AppendRequest {
            term: self.term,
            leader_id: self.id as u64,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next_index),
            leader_commit: self.commit_index,
        }
    }

    // Called when, as a leader, we know the follower's entries up to (and
    // including) match_index agree with ours.
    fn record_follower_match(&mut self, peer: usize, match_index: u64) {
        let follower = &mut self.followers[peer];
        follower.match_index = follower.match_index.max(match_index);
        follower.next_index = follower.match_index + 1;
        debug!(peer, position = %follower, "updated follower position");
    }

    // Rewinds the next index for a peer that rejected an append because of
    // a log mismatch. The hints let us skip whole terms: we jump to just
    // past our last entry of the conflicting term, or to the follower's
    // first index of that term if we hold none of it.
    fn rewind_next_index(&mut self, peer: usize, conflict_term: u64, conflict_index: u64) {
        let probe = self.followers[peer].next_index.saturating_sub(1);
        let next_index = if conflict_term > 0 {
            match self.log.last_index_of_term(probe, conflict_term) {
                Some(index) => index + 1,
                None => conflict_index,
            }
        } else {
            conflict_index
        };

        let follower = &mut self.followers[peer];
        let old_next = follower.next_index;
        follower.next_index = next_index.max(1);
        debug!(peer, old_next, position = %follower, "rewound follower position");
    }

    // Scans follower positions for the highest index replicated to a
    // majority and promotes the commit index to it. Only entries of the
    // current term are eligible: counting replicas alone could commit a
    // prior-term entry that a future leader is still allowed to overwrite.
    fn advance_commit_index(&mut self) {
        debug_assert_eq!(self.role, RaftRole::Leader);
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            if self.log.term_at(candidate) == Some(self.term)
                && self.replicated_to_majority(candidate)
            {
                debug!(
                    from = self.commit_index,
                    to = candidate,
                    "advanced commit index"
                );
                self.commit_index = candidate;
                self.commit_signal.notify_one();
                return;
            }
            candidate -= 1;
        }
    }

    fn replicated_to_majority(&self, index: u64) -> bool {
        // The own log always matches itself.
        let mut count = 1;
        for (peer, follower) in self.followers.iter().enumerate() {
            if peer != self.id && follower.match_index >= index {
                count += 1;
            }
        }
        count >= self.majority()
    }
}

// A single Raft cluster participant. All mutable state lives behind one
// mutex; the public surface and the background drivers share it.
pub struct Replica {
    id: usize,
    peers: Arc<Vec<Arc<dyn RaftClient>>>,
    state: Arc<Mutex<ReplicaState>>,
    apply_tx: Sender<ApplyMessage>,
    replication_signals: Arc<Vec<Notify>>,
    commit_signal: Arc<Notify>,
}

impl Replica {
    // Constructs a replica with the supplied peer handles, reloading any
    // durable state the persister holds. Call `start` to launch the
    // drivers; until then the replica only serves inbound requests.
    pub async fn new(
        peers: Vec<Arc<dyn RaftClient>>,
        id: usize,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMessage>,
        options: Options,
    ) -> RaftResult<Replica> {
        let peer_count = peers.len();
        let rng = match options.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let blob = persister
            .load()
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;
        let (term, voted_for, entries) = match blob.as_ref().and_then(decode_durable_state) {
            Some((term, voted_for, entries)) => {
                info!(id, term, entries = entries.len(), "restored durable state");
                (term, voted_for, entries)
            }
            None => (0, None, Vec::new()),
        };

        let replication_signals: Arc<Vec<Notify>> =
            Arc::new((0..peer_count).map(|_| Notify::new()).collect());
        let commit_signal = Arc::new(Notify::new());

        let heartbeat_ms = options.heartbeat_ms;
        let mut state = ReplicaState {
            options,
            id,
            peer_count,
            role: RaftRole::Follower,
            term,
            voted_for,
            log: LogStore::restore(entries),
            commit_index: 0,
            last_applied: 0,
            followers: Vec::new(),
            election_deadline: Instant::now(),
            heartbeat_deadline: Instant::now() + Duration::from_millis(heartbeat_ms),
            rng,
            persister,
            replication_signals: replication_signals.clone(),
            commit_signal: commit_signal.clone(),
        };
        state.reset_election_deadline();

        Ok(Replica {
            id,
            peers: Arc::new(peers),
            state: Arc::new(Mutex::new(state)),
            apply_tx,
            replication_signals,
            commit_signal,
        })
    }

    // Launches the background drivers: the election and heartbeat tickers,
    // one replication stream per peer, and the apply driver.
    pub async fn start(&self) {
        {
            let state = self.state.lock().await;
            debug!(term = state.term, "starting drivers");
        }

        let span = info_span!(parent: None, "election", replica = self.id);
        tokio::spawn(
            Self::election_loop(self.state.clone(), self.peers.clone()).instrument(span),
        );

        let span = info_span!(parent: None, "heartbeat", replica = self.id);
        tokio::spawn(Self::heartbeat_loop(self.state.clone()).instrument(span));

        for peer in 0..self.peers.len() {
            if peer == self.id {
                continue;
            }
            let span = info_span!(parent: None, "replicate", replica = self.id, peer);
            tokio::spawn(
                Self::replication_loop(
                    self.state.clone(),
                    self.peers.clone(),
                    self.replication_signals.clone(),
                    peer,
                )
                .instrument(span),
            );
        }

        let span = info_span!(parent: None, "apply", replica = self.id);
        tokio::spawn(
            Self::apply_loop(
                self.state.clone(),
                self.commit_signal.clone(),
                self.apply_tx.clone(),
            )
            .instrument(span),
        );
    }

    // Submits a command for replication. As leader, appends the entry to
    // the local log, persists it, wakes the replication streams, and
    // returns the assigned id immediately; commitment is not guaranteed
    // until the entry is later delivered on the output channel.
    pub async fn propose(&self, command: Bytes) -> RaftResult<EntryId> {
        let mut state = self.state.lock().await;
        if state.role != RaftRole::Leader {
            // A stopped replica is just one more way of not being the
            // leader; callers see a single outcome.
            return Err(RaftError::NotLeader);
        }

        let term = state.term;
        let id = state.log.append_command(term, command);
        state.persist().await;
        state.wake_replication_streams();
        debug!(entry = %id, "accepted new command");
        Ok(id)
    }

    // Returns the current term and whether this replica believes it is the
    // leader.
    pub async fn state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.term, state.role == RaftRole::Leader)
    }

    // Stops the replica. All drivers observe the transition and exit; the
    // operation is idempotent and in-flight requests are left to drain.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.role == RaftRole::Stopped {
            return;
        }
        info!(term = state.term, role = ?state.role, "stopping");
        state.role = RaftRole::Stopped;

        for signal in self.replication_signals.iter() {
            signal.notify_one();
        }
        self.commit_signal.notify_one();
    }

    // Inbound RequestVote. Grants the vote iff we have not voted for a
    // competing candidate this term and the candidate's log is at least as
    // up-to-date as ours.
    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        if state.role == RaftRole::Stopped {
            return VoteResponse {
                term: state.term,
                granted: false,
            };
        }

        if request.term > state.term {
            state.adopt_term(request.term).await;
        }
        if request.term < state.term {
            return VoteResponse {
                term: state.term,
                granted: false,
            };
        }

        let candidate = request.candidate_id as usize;
        let candidate_last = EntryId {
            term: request.last_log_term,
            index: request.last_log_index,
        };
        let vote_free = match state.voted_for {
            None => true,
            Some(voted) => voted == candidate,
        };
        let granted = vote_free && state.log.up_to_date(candidate_last);

        if granted {
            state.voted_for = Some(candidate);
            state.persist().await;
            state.reset_election_deadline();
            debug!(term = state.term, candidate, "granted vote");
        } else {
            debug!(
                term = state.term,
                candidate,
                voted_for = ?state.voted_for,
                "denied vote"
            );
        }

        VoteResponse {
            term: state.term,
            granted,
        }
    }

    // Inbound AppendEntries: heartbeat, log replication, and commit
    // adoption, all in one.
    pub async fn handle_append_entries(&self, request: AppendRequest) -> AppendResponse {
        let mut state = self.state.lock().await;
        if state.role == RaftRole::Stopped {
            return AppendResponse {
                term: state.term,
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            };
        }

        if request.term > state.term {
            state.adopt_term(request.term).await;
        }
        if request.term < state.term {
            return AppendResponse {
                term: state.term,
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            };
        }

        // Equal terms from here on: the sender is the one legitimate leader
        // of our current term.
        if state.role == RaftRole::Candidate {
            debug!(term = state.term, "observed elected leader, standing down");
            state.role = RaftRole::Follower;
        }
        state.reset_election_deadline();

        // Consistency check at the previous position. On a mismatch the
        // reply carries hints that let the leader rewind by whole terms.
        let prev = request.prev_log_index;
        if prev > state.log.last_index() {
            return AppendResponse {
                term: state.term,
                success: false,
                conflict_index: state.log.last_index() + 1,
                conflict_term: 0,
            };
        }
        if prev >= 1 {
            // prev is within our log here, so the lookup always succeeds.
            let local_term = state.log.term_at(prev).unwrap_or(0);
            if local_term != request.prev_log_term {
                let conflict_index = state.log.first_index_of_term(prev, local_term);
                return AppendResponse {
                    term: state.term,
                    success: false,
                    conflict_index,
                    conflict_term: local_term,
                };
            }
        }

        // Walk the shipped entries against the local log. The first term
        // disagreement truncates the local suffix; everything beyond our
        // end is appended. Entries whose prefix already matches are left
        // untouched so a stale duplicate can never shorten the log.
        let mut changed = false;
        for entry in &request.entries {
            match state.log.term_at(entry.index) {
                Some(local_term) if local_term == entry.term => continue,
                Some(_) => {
                    debug!(index = entry.index, "truncating conflicting suffix");
                    state.log.truncate_from(entry.index);
                    state.log.append(entry.clone());
                    changed = true;
                }
                None => {
                    state.log.append(entry.clone());
                    changed = true;
                }
            }
        }
        if changed {
            state.persist().await;
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = min(request.leader_commit, state.log.last_index());
            debug!(commit_index = state.commit_index, "adopted leader commit");
            state.commit_signal.notify_one();
        }

        AppendResponse {
            term: state.term,
            success: true,
            conflict_index: 0,
            conflict_term: 0,
        }
    }

    // Periodically checks whether the election deadline has passed and, if
    // so, starts a new election. Exits once the replica is stopped.
    async fn election_loop(
        arc_state: Arc<Mutex<ReplicaState>>,
        peers: Arc<Vec<Arc<dyn RaftClient>>>,
    ) {
        loop {
            let request = {
                let mut state = arc_state.lock().await;
                match state.role {
                    RaftRole::Stopped => return,
                    RaftRole::Follower | RaftRole::Candidate
                        if Instant::now() >= state.election_deadline =>
                    {
                        Some(state.begin_election().await)
                    }
                    _ => None,
                }
            };

            if let Some(request) = request {
                let span = info_span!("ballot", term = request.term);
                tokio::spawn(
                    Self::run_election(arc_state.clone(), peers.clone(), request).instrument(span),
                );
            }

            sleep(Duration::from_millis(TICK_MS)).await;
        }
    }

    // Collects votes for one election. Replies are matched against the term
    // the election started with; any change of term (or role) ends the
    // election silently.
    async fn run_election(
        arc_state: Arc<Mutex<ReplicaState>>,
        peers: Arc<Vec<Arc<dyn RaftClient>>>,
        request: VoteRequest,
    ) {
        let term = request.term;
        let candidate = request.candidate_id as usize;
        let majority = peers.len() / 2 + 1;

        // We vote for ourselves.
        let mut tally = 1;
        if tally >= majority {
            let mut state = arc_state.lock().await;
            if state.term == term && state.role == RaftRole::Candidate {
                state.become_leader();
            }
            return;
        }

        let mut replies: FuturesUnordered<_> = peers
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != candidate)
            .map(|(peer, client)| {
                let client = client.clone();
                let request = request.clone();
                async move { (peer, client.vote(request).await) }
            })
            .collect();

        while let Some((peer, result)) = replies.next().await {
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    // No reply counts as no vote; the next election retries.
                    warn!(peer, "vote request failed: {}", error);
                    continue;
                }
            };

            let mut state = arc_state.lock().await;
            if state.term != term || state.role != RaftRole::Candidate {
                // The world has moved on while this ballot was in flight.
                return;
            }
            if response.term > state.term {
                state.adopt_term(response.term).await;
                return;
            }
            if response.granted {
                tally += 1;
                debug!(peer, tally, "received vote");
                if tally >= majority {
                    state.become_leader();
                    return;
                }
            }
        }
    }

    // While leader, wakes every replication stream at the heartbeat
    // cadence. The streams ship whatever suffix each follower is missing;
    // an empty append doubles as the heartbeat itself.
    async fn heartbeat_loop(arc_state: Arc<Mutex<ReplicaState>>) {
        loop {
            {
                let mut state = arc_state.lock().await;
                match state.role {
                    RaftRole::Stopped => return,
                    RaftRole::Leader if Instant::now() >= state.heartbeat_deadline => {
                        state.heartbeat_deadline =
                            Instant::now() + Duration::from_millis(state.options.heartbeat_ms);
                        state.wake_replication_streams();
                    }
                    _ => (),
                }
            }
            sleep(Duration::from_millis(TICK_MS)).await;
        }
    }

    // The logical replication stream for one peer. Each wakeup ships
    // entries from the peer's next index until the peer is caught up, the
    // leadership is lost, or the peer stops answering. Mismatch replies
    // rewind the next index and retry immediately.
    async fn replication_loop(
        arc_state: Arc<Mutex<ReplicaState>>,
        peers: Arc<Vec<Arc<dyn RaftClient>>>,
        signals: Arc<Vec<Notify>>,
        peer: usize,
    ) {
        let client = peers[peer].clone();
        loop {
            signals[peer].notified().await;

            loop {
                let (request, term) = {
                    let state = arc_state.lock().await;
                    match state.role {
                        RaftRole::Stopped => return,
                        RaftRole::Leader => (state.create_append_request(peer), state.term),
                        _ => break,
                    }
                };

                // The call happens without holding the lock; the reply is
                // only honored if the term is still the one we sent under.
                let result = client.append(request.clone()).await;

                let mut state = arc_state.lock().await;
                if state.role == RaftRole::Stopped {
                    return;
                }
                if state.term != term || state.role != RaftRole::Leader {
                    break;
                }

                let response = match result {
                    Ok(response) => response,
                    Err(error) => {
                        debug!(peer, "append failed: {}", error);
                        break;
                    }
                };

                if response.term > state.term {
                    state.adopt_term(response.term).await;
                    break;
                }

                if response.success {
                    let matched = request.prev_log_index + request.entries.len() as u64;
                    state.record_follower_match(peer, matched);
                    state.advance_commit_index();
                    if state.followers[peer].next_index > state.log.last_index() {
                        break;
                    }
                } else {
                    state.rewind_next_index(peer, response.conflict_term, response.conflict_index);
                }
            }
        }
    }

    // Delivers committed entries on the output channel, in index order. The
    // lock is dropped for the send itself: the channel consumer may block
    // arbitrarily long, and the rest of the replica must keep making
    // progress meanwhile.
    async fn apply_loop(
        arc_state: Arc<Mutex<ReplicaState>>,
        commit_signal: Arc<Notify>,
        apply_tx: Sender<ApplyMessage>,
    ) {
        loop {
            let pending = {
                let state = arc_state.lock().await;
                if state.role == RaftRole::Stopped {
                    return;
                }
                if state.last_applied < state.commit_index {
                    Some(state.log.entry_at(state.last_applied + 1).clone())
                } else {
                    None
                }
            };

            let entry = match pending {
                Some(entry) => entry,
                None => {
                    commit_signal.notified().await;
                    continue;
                }
            };

            let message = ApplyMessage {
                valid: true,
                command: entry.command.clone(),
                index: entry.index,
                term: entry.term,
            };
            if apply_tx.send(message).await.is_err() {
                // The consumer is gone; there is nobody left to deliver to.
                warn!("output channel closed, stopping apply driver");
                return;
            }

            let mut state = arc_state.lock().await;
            debug_assert_eq!(state.last_applied + 1, entry.index);
            state.last_applied = entry.index;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_std::channel::{unbounded, Receiver};
    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::persistence::MemoryPersister;

    use super::*;

    // Peer handle used by handler-level tests, where no outbound traffic is
    // expected at all.
    struct UnreachableClient {
        peer: usize,
    }

    #[async_trait]
    impl RaftClient for UnreachableClient {
        async fn vote(&self, _: VoteRequest) -> RaftResult<VoteResponse> {
            Err(RaftError::unreachable(self.peer))
        }

        async fn append(&self, _: AppendRequest) -> RaftResult<AppendResponse> {
            Err(RaftError::unreachable(self.peer))
        }
    }

    // Timeouts high enough that no driver ever fires during a unit test.
    fn create_options_for_testing() -> Options {
        Options {
            heartbeat_ms: 100_000_000,
            min_election_ms: 100_000_000,
            max_election_ms: 200_000_000,
            seed: Some(17),
        }
    }

    fn create_peers(count: usize) -> Vec<Arc<dyn RaftClient>> {
        (0..count)
            .map(|peer| Arc::new(UnreachableClient { peer }) as Arc<dyn RaftClient>)
            .collect()
    }

    async fn create_replica() -> (Replica, Receiver<ApplyMessage>) {
        create_replica_with_persister(Arc::new(MemoryPersister::new())).await
    }

    async fn create_replica_with_persister(
        persister: Arc<dyn Persister>,
    ) -> (Replica, Receiver<ApplyMessage>) {
        let (apply_tx, apply_rx) = unbounded();
        let replica = Replica::new(
            create_peers(3),
            0,
            persister,
            apply_tx,
            create_options_for_testing(),
        )
        .await
        .expect("create");
        (replica, apply_rx)
    }

    fn entry(term: u64, index: u64, payload: &'static [u8]) -> crate::message::Entry {
        crate::message::Entry {
            term,
            index,
            command: Bytes::from_static(payload),
        }
    }

    fn vote_request(term: u64, candidate: usize, last: EntryId) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate as u64,
            last_log_index: last.index,
            last_log_term: last.term,
        }
    }

    fn append_request(
        term: u64,
        prev: EntryId,
        entries: Vec<crate::message::Entry>,
        leader_commit: u64,
    ) -> AppendRequest {
        AppendRequest {
            term,
            leader_id: 1,
            prev_log_index: prev.index,
            prev_log_term: prev.term,
            entries,
            leader_commit,
        }
    }

    fn sentinel() -> EntryId {
        EntryId { term: 0, index: 0 }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (replica, _apply_rx) = create_replica().await;
        let state = replica.state.lock().await;
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.term, 0);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.log.last_index(), 0);
    }

    #[tokio::test]
    async fn test_vote_granted_and_recorded() {
        let (replica, _apply_rx) = create_replica().await;
        let response = replica
            .handle_request_vote(vote_request(1, 2, sentinel()))
            .await;

        assert!(response.granted);
        assert_eq!(response.term, 1);

        let state = replica.state.lock().await;
        assert_eq!(state.term, 1);
        assert_eq!(state.voted_for, Some(2));
        assert_eq!(state.role, RaftRole::Follower);
    }

    #[tokio::test]
    async fn test_vote_denied_when_already_voted() {
        let (replica, _apply_rx) = create_replica().await;
        assert!(
            replica
                .handle_request_vote(vote_request(1, 2, sentinel()))
                .await
                .granted
        );

        // A competing candidate in the same term is refused...
        let response = replica
            .handle_request_vote(vote_request(1, 1, sentinel()))
            .await;
        assert!(!response.granted);

        // ... while the original candidate may ask again.
        let response = replica
            .handle_request_vote(vote_request(1, 2, sentinel()))
            .await;
        assert!(response.granted);
    }

    #[tokio::test]
    async fn test_vote_rejects_stale_term() {
        let (replica, _apply_rx) = create_replica().await;
        replica
            .handle_request_vote(vote_request(5, 2, sentinel()))
            .await;

        let response = replica
            .handle_request_vote(vote_request(3, 1, sentinel()))
            .await;
        assert!(!response.granted);
        assert_eq!(response.term, 5);
    }

    #[tokio::test]
    async fn test_vote_denied_when_log_stale() {
        let (replica, _apply_rx) = create_replica().await;

        // Seed the log with an entry from term 2.
        let response = replica
            .handle_append_entries(append_request(
                2,
                sentinel(),
                vec![entry(2, 1, b"seed")],
                0,
            ))
            .await;
        assert!(response.success);

        // A candidate for a later term whose log ends in term 1 is behind.
        let response = replica
            .handle_request_vote(vote_request(3, 2, EntryId { term: 1, index: 4 }))
            .await;
        assert!(!response.granted);
        assert_eq!(response.term, 3);

        // The same election with an up-to-date log succeeds.
        let response = replica
            .handle_request_vote(vote_request(3, 2, EntryId { term: 2, index: 1 }))
            .await;
        assert!(response.granted);
    }

    #[tokio::test]
    async fn test_vote_higher_term_adopted_and_persisted() {
        let persister = Arc::new(MemoryPersister::new());
        let (replica, _apply_rx) = create_replica_with_persister(persister.clone()).await;

        replica
            .handle_request_vote(vote_request(7, 2, sentinel()))
            .await;

        let blob = persister.load().await.expect("load").expect("blob");
        let (term, voted_for, _) = decode_durable_state(&blob).expect("decode");
        assert_eq!(term, 7);
        assert_eq!(voted_for, Some(2));
    }

    #[tokio::test]
    async fn test_restart_preserves_vote() {
        let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());
        {
            let (replica, _apply_rx) = create_replica_with_persister(persister.clone()).await;
            assert!(
                replica
                    .handle_request_vote(vote_request(5, 2, sentinel()))
                    .await
                    .granted
            );
        }

        // After a restart over the same stable storage, the vote binds.
        let (replica, _apply_rx) = create_replica_with_persister(persister).await;
        {
            let state = replica.state.lock().await;
            assert_eq!(state.term, 5);
            assert_eq!(state.voted_for, Some(2));
        }
        let response = replica
            .handle_request_vote(vote_request(5, 1, sentinel()))
            .await;
        assert!(!response.granted);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_term() {
        let (replica, _apply_rx) = create_replica().await;
        replica
            .handle_request_vote(vote_request(4, 2, sentinel()))
            .await;

        let response = replica
            .handle_append_entries(append_request(3, sentinel(), Vec::new(), 0))
            .await;
        assert!(!response.success);
        assert_eq!(response.term, 4);
    }

    #[tokio::test]
    async fn test_append_accepts_heartbeat() {
        let (replica, _apply_rx) = create_replica().await;
        let response = replica
            .handle_append_entries(append_request(1, sentinel(), Vec::new(), 0))
            .await;
        assert!(response.success);
        assert_eq!(response.term, 1);
    }

    #[tokio::test]
    async fn test_append_reports_missing_prefix() {
        let (replica, _apply_rx) = create_replica().await;
        let response = replica
            .handle_append_entries(append_request(
                2,
                EntryId { term: 2, index: 5 },
                vec![entry(2, 6, b"future")],
                0,
            ))
            .await;

        assert!(!response.success);
        assert_eq!(response.conflict_index, 1);
        assert_eq!(response.conflict_term, 0);
    }

    #[tokio::test]
    async fn test_append_reports_conflicting_term() {
        let (replica, _apply_rx) = create_replica().await;

        // Local log terms: [1, 2, 2].
        replica
            .handle_append_entries(append_request(
                2,
                sentinel(),
                vec![entry(1, 1, b"a"), entry(2, 2, b"b"), entry(2, 3, b"c")],
                0,
            ))
            .await;

        // A leader whose log holds term 3 at index 3 conflicts; the hint
        // names our conflicting term and where its run begins.
        let response = replica
            .handle_append_entries(append_request(
                3,
                EntryId { term: 3, index: 3 },
                Vec::new(),
                0,
            ))
            .await;

        assert!(!response.success);
        assert_eq!(response.conflict_term, 2);
        assert_eq!(response.conflict_index, 2);
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let (replica, _apply_rx) = create_replica().await;

        replica
            .handle_append_entries(append_request(
                1,
                sentinel(),
                vec![entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"c")],
                0,
            ))
            .await;

        // A newer leader replaces everything after index 1.
        let response = replica
            .handle_append_entries(append_request(
                2,
                EntryId { term: 1, index: 1 },
                vec![entry(2, 2, b"x")],
                0,
            ))
            .await;
        assert!(response.success);

        let state = replica.state.lock().await;
        assert_eq!(state.log.last_index(), 2);
        assert_eq!(state.log.term_at(2), Some(2));
        assert_eq!(state.log.entry_at(2).command.as_ref(), b"x");
    }

    #[tokio::test]
    async fn test_append_duplicate_does_not_truncate() {
        let (replica, _apply_rx) = create_replica().await;

        let request = append_request(
            1,
            sentinel(),
            vec![entry(1, 1, b"a"), entry(1, 2, b"b")],
            0,
        );
        assert!(replica.handle_append_entries(request.clone()).await.success);

        // A delayed duplicate carrying a shorter prefix must not shorten
        // the log.
        let shorter = append_request(1, sentinel(), vec![entry(1, 1, b"a")], 0);
        assert!(replica.handle_append_entries(shorter).await.success);

        let state = replica.state.lock().await;
        assert_eq!(state.log.last_index(), 2);
    }

    #[tokio::test]
    async fn test_append_adopts_leader_commit() {
        let (replica, _apply_rx) = create_replica().await;

        replica
            .handle_append_entries(append_request(
                1,
                sentinel(),
                vec![entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"c")],
                2,
            ))
            .await;
        {
            let state = replica.state.lock().await;
            assert_eq!(state.commit_index, 2);
        }

        // The adopted commit index is capped by the local log.
        replica
            .handle_append_entries(append_request(
                1,
                EntryId { term: 1, index: 3 },
                Vec::new(),
                5,
            ))
            .await;
        let state = replica.state.lock().await;
        assert_eq!(state.commit_index, 3);
    }

    #[tokio::test]
    async fn test_applies_committed_entries_in_order() {
        let (replica, apply_rx) = create_replica().await;
        replica.start().await;

        replica
            .handle_append_entries(append_request(
                1,
                sentinel(),
                vec![entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"c")],
                3,
            ))
            .await;

        for expected_index in 1..=3u64 {
            let message = tokio::time::timeout(Duration::from_secs(1), apply_rx.recv())
                .await
                .expect("timeout")
                .expect("recv");
            assert!(message.valid);
            assert_eq!(message.index, expected_index);
            assert_eq!(message.term, 1);
        }

        replica.shutdown().await;
    }

    #[tokio::test]
    async fn test_propose_requires_leadership() {
        let (replica, _apply_rx) = create_replica().await;
        let result = replica.propose(Bytes::from_static(b"command")).await;
        assert!(matches!(result, Err(RaftError::NotLeader)));

        // A killed replica still answers gracefully, as a non-leader.
        replica.shutdown().await;
        let result = replica.propose(Bytes::from_static(b"command")).await;
        assert!(matches!(result, Err(RaftError::NotLeader)));
    }

    #[tokio::test]
    async fn test_propose_appends_and_wakes_streams() {
        let (replica, _apply_rx) = create_replica().await;
        {
            let mut state = replica.state.lock().await;
            state.term = 3;
            state.become_leader();
        }

        let id = replica
            .propose(Bytes::from_static(b"command"))
            .await
            .expect("propose");
        assert_eq!(id, EntryId { term: 3, index: 1 });

        let state = replica.state.lock().await;
        assert_eq!(state.log.last_index(), 1);
    }

    #[tokio::test]
    async fn test_commit_advancement_requires_current_term() {
        let (replica, _apply_rx) = create_replica().await;
        let mut state = replica.state.lock().await;

        state.log.append(entry(1, 1, b"old"));
        state.log.append(entry(2, 2, b"new"));
        state.term = 2;
        state.become_leader();

        // Index 1 is replicated to a majority, but it belongs to an older
        // term and must not be committed by counting alone.
        state.followers[1].match_index = 1;
        state.advance_commit_index();
        assert_eq!(state.commit_index, 0);

        // Once a current-term entry reaches a majority, everything below it
        // commits with it.
        state.followers[1].match_index = 2;
        state.advance_commit_index();
        assert_eq!(state.commit_index, 2);
    }

    #[tokio::test]
    async fn test_rewind_uses_conflict_hints() {
        let (replica, _apply_rx) = create_replica().await;
        let mut state = replica.state.lock().await;

        // Leader log terms: [1, 1, 4, 4].
        for (index, term) in [(1u64, 1u64), (2, 1), (3, 4), (4, 4)] {
            state.log.append(entry(term, index, b"x"));
        }
        state.term = 4;
        state.become_leader();

        // The follower reported a term we also hold: resume just past our
        // last entry of that term.
        state.followers[1].next_index = 5;
        state.rewind_next_index(1, 1, 1);
        assert_eq!(state.followers[1].next_index, 3);

        // A term we hold nothing of: adopt the follower's first index.
        state.followers[1].next_index = 5;
        state.rewind_next_index(1, 2, 2);
        assert_eq!(state.followers[1].next_index, 2);

        // A too-short follower log reports no conflicting term at all.
        state.followers[1].next_index = 5;
        state.rewind_next_index(1, 0, 3);
        assert_eq!(state.followers[1].next_index, 3);

        // The next index never drops below 1.
        state.followers[1].next_index = 1;
        state.rewind_next_index(1, 0, 0);
        assert_eq!(state.followers[1].next_index, 1);
    }

    #[tokio::test]
    async fn test_restores_durable_state() {
        let persister = Arc::new(MemoryPersister::new());
        persister
            .save(encode_durable_state(
                6,
                Some(1),
                &[entry(4, 1, b"a"), entry(6, 2, b"b")],
            ))
            .await
            .expect("save");

        let (replica, _apply_rx) = create_replica_with_persister(persister).await;
        let state = replica.state.lock().await;
        assert_eq!(state.term, 6);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.log.last_entry_id(), EntryId { term: 6, index: 2 });

        // Commit and apply state is volatile and starts over.
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (replica, _apply_rx) = create_replica().await;
        replica.start().await;
        replica.shutdown().await;
        replica.shutdown().await;

        let (term, is_leader) = replica.state().await;
        assert_eq!(term, 0);
        assert!(!is_leader);
    }
}
