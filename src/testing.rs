// An in-process cluster for exercising replicas against each other without
// a real transport: every peer handle is a loopback client routed through a
// shared network object. The network supports disconnecting a replica (both
// directions, modeling a partition), crashing it, and restarting it over
// the blob its persister retained.

use std::time::Duration;

use async_std::channel::unbounded;
use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use crate::consensus::{Options, Replica};
use crate::error::{RaftError, RaftResult};
use crate::message::{
    AppendRequest, AppendResponse, ApplyMessage, EntryId, VoteRequest, VoteResponse,
};
use crate::persistence::{MemoryPersister, Persister};
use crate::transport::RaftClient;

// Tracks which replicas are alive and reachable. A `None` replica slot is a
// crashed process; a false connected bit drops traffic in both directions.
struct Network {
    replicas: Vec<Option<Arc<Replica>>>,
    connected: Vec<bool>,
}

impl Network {
    fn route(&self, src: usize, dst: usize) -> RaftResult<Arc<Replica>> {
        if !self.connected[src] || !self.connected[dst] {
            return Err(RaftError::unreachable(dst));
        }
        self.replicas[dst]
            .clone()
            .ok_or_else(|| RaftError::unreachable(dst))
    }
}

// The peer handle given to each replica: delivers calls by invoking the
// target's handlers directly, subject to the network's connectivity.
struct LoopbackClient {
    network: Arc<Mutex<Network>>,
    src: usize,
    dst: usize,
}

impl LoopbackClient {
    async fn target(&self) -> RaftResult<Arc<Replica>> {
        self.network.lock().await.route(self.src, self.dst)
    }
}

#[async_trait]
impl RaftClient for LoopbackClient {
    async fn vote(&self, request: VoteRequest) -> RaftResult<VoteResponse> {
        let target = self.target().await?;
        // The handler runs on its own task: a caller abandoning the call
        // must not cancel the server-side processing halfway through, just
        // like with a real transport.
        let handler = tokio::spawn(async move { target.handle_request_vote(request).await });
        handler.await.map_err(|e| RaftError::Transport {
            peer: self.dst,
            source: Box::new(e),
        })
    }

    async fn append(&self, request: AppendRequest) -> RaftResult<AppendResponse> {
        let target = self.target().await?;
        let handler = tokio::spawn(async move { target.handle_append_entries(request).await });
        handler.await.map_err(|e| RaftError::Transport {
            peer: self.dst,
            source: Box::new(e),
        })
    }
}

// A collection of replicas wired up through a shared loopback network. In a
// real deployment the participants live on different machines; the cluster
// manages all of them in one process for convenience.
pub struct Cluster {
    options: Options,
    network: Arc<Mutex<Network>>,
    persisters: Vec<Arc<MemoryPersister>>,
    applied: Vec<Arc<Mutex<Vec<ApplyMessage>>>>,
}

impl Cluster {
    // Returns a running cluster of the supplied size: all replicas booted,
    // connected, and with their drivers started.
    pub async fn new(size: usize, options: Options) -> Cluster {
        let network = Arc::new(Mutex::new(Network {
            replicas: vec![None; size],
            connected: vec![true; size],
        }));
        let cluster = Cluster {
            options,
            network,
            persisters: (0..size).map(|_| Arc::new(MemoryPersister::new())).collect(),
            applied: (0..size).map(|_| Arc::new(Mutex::new(Vec::new()))).collect(),
        };
        for id in 0..size {
            cluster.boot(id).await;
        }
        cluster
    }

    pub fn size(&self) -> usize {
        self.persisters.len()
    }

    // Creates and starts the replica with the supplied id, wiring its
    // output channel into the cluster's applied record. Used both for the
    // initial boot and for a restart after a crash, in which case the
    // replica reloads whatever its persister retained.
    async fn boot(&self, id: usize) {
        let clients: Vec<Arc<dyn RaftClient>> = (0..self.size())
            .map(|dst| {
                Arc::new(LoopbackClient {
                    network: self.network.clone(),
                    src: id,
                    dst,
                }) as Arc<dyn RaftClient>
            })
            .collect();

        let (apply_tx, apply_rx) = unbounded();
        let sink = self.applied[id].clone();
        tokio::spawn(async move {
            while let Ok(message) = apply_rx.recv().await {
                sink.lock().await.push(message);
            }
        });

        let mut options = self.options.clone();
        options.seed = options.seed.map(|seed| seed + id as u64);

        let persister: Arc<dyn Persister> = self.persisters[id].clone();
        let replica = Arc::new(
            Replica::new(clients, id, persister, apply_tx, options)
                .await
                .expect("replica"),
        );
        replica.start().await;

        let mut network = self.network.lock().await;
        network.replicas[id] = Some(replica);
        network.connected[id] = true;
    }

    async fn replica(&self, id: usize) -> Option<Arc<Replica>> {
        self.network.lock().await.replicas[id].clone()
    }

    // Submits a command at the supplied replica, which processes it even
    // while partitioned (clients talk to their local replica directly).
    pub async fn propose(&self, id: usize, command: Bytes) -> RaftResult<EntryId> {
        match self.replica(id).await {
            Some(replica) => replica.propose(command).await,
            None => Err(RaftError::Stopped),
        }
    }

    pub async fn get_state(&self, id: usize) -> Option<(u64, bool)> {
        match self.replica(id).await {
            Some(replica) => Some(replica.state().await),
            None => None,
        }
    }

    // Returns the ids of all live, connected replicas currently claiming
    // leadership.
    pub async fn leaders(&self) -> Vec<usize> {
        let mut result = Vec::new();
        for id in 0..self.size() {
            if !self.network.lock().await.connected[id] {
                continue;
            }
            if let Some((_, true)) = self.get_state(id).await {
                result.push(id);
            }
        }
        result
    }

    // Polls until exactly one connected replica claims leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let leaders = self.leaders().await;
            if leaders.len() == 1 {
                return Some(leaders[0]);
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }

    // Cuts the replica off in both directions. It stays alive and keeps
    // its state; reconnect heals the partition.
    pub async fn disconnect(&self, id: usize) {
        self.network.lock().await.connected[id] = false;
    }

    pub async fn reconnect(&self, id: usize) {
        self.network.lock().await.connected[id] = true;
    }

    // Stops the replica and removes it from the network. Its persister
    // keeps the durable blob for a later restart.
    pub async fn crash(&self, id: usize) {
        let replica = {
            let mut network = self.network.lock().await;
            network.connected[id] = false;
            network.replicas[id].take()
        };
        if let Some(replica) = replica {
            replica.shutdown().await;
        }
    }

    // Boots a fresh replica over the persister of a previously crashed one.
    pub async fn restart(&self, id: usize) {
        self.boot(id).await;
    }

    // Returns every apply message the replica has delivered so far, in
    // delivery order, accumulated across restarts.
    pub async fn applied(&self, id: usize) -> Vec<ApplyMessage> {
        self.applied[id].lock().await.clone()
    }

    // Polls until the replica has delivered an apply message at the
    // supplied index. Returns the message, or None on timeout.
    pub async fn wait_for_applied(
        &self,
        id: usize,
        index: u64,
        timeout: Duration,
    ) -> Option<ApplyMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(message) = self
                .applied(id)
                .await
                .into_iter()
                .find(|m| m.index == index)
            {
                return Some(message);
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }

    pub async fn shutdown(&self) {
        for id in 0..self.size() {
            if let Some(replica) = self.replica(id).await {
                replica.shutdown().await;
            }
        }
    }
}

// Encodes an integer test command as an opaque payload.
pub fn command(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

// Recovers the integer from an applied test command.
pub fn command_value(message: &ApplyMessage) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(message.command.as_ref());
    u64::from_be_bytes(raw)
}
