pub mod tasks;

use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::network::protocol::{self, Request, Response};
use crate::raft::election;
use crate::raft::log as raft_log;
use crate::raft::rpc::{AppendEntriesRequest, InstallSnapshotRequest, RequestVoteRequest};
use crate::raft::state::{ConsensusState, Role};
use crate::raft::types::{LogEntry, LogIndex, Operation, Term};
use crate::storage::{SnapshotManager, WriteAheadLog};
use crate::store::KvStore;
use crate::util::errors::{LogKvError, Result};

/// One replicated key-value server.
///
/// All background activity (acceptor, election timer, per-follower
/// replicators, applier) runs as tokio tasks holding an `Arc<Server>`;
/// consensus state sits behind a single mutex that is never held across
/// network I/O.
pub struct Server {
    config: ServerConfig,
    state: Mutex<ConsensusState>,
    wal: WriteAheadLog,
    snapshots: SnapshotManager,
    store: KvStore,

    /// Published commit_index; the applier waits on it.
    commit_tx: watch::Sender<LogIndex>,
    /// Published last_applied; client PUTs wait on it.
    applied_tx: watch::Sender<LogIndex>,
    /// Wakes replicator tasks when the leader log grows or leadership starts.
    replicate: Notify,
    /// Flipped once; every loop exits at its next suspension point.
    shutdown_tx: watch::Sender<bool>,
    /// Set when a durability failure makes continuing unsafe.
    fatal: AtomicBool,
    /// Long-running task handles, joined on shutdown.
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Handle returned by [`Server::start`]: inspect and stop a running server.
#[derive(Clone)]
pub struct ServerHandle {
    server: Arc<Server>,
    local_addr: SocketAddr,
}

impl Server {
    /// Run the startup sequence and spawn all server tasks.
    ///
    /// Metadata, then snapshot, then WAL replay; the server always enters
    /// the cluster as a follower.
    pub async fn start(config: ServerConfig) -> Result<ServerHandle> {
        config.validate().map_err(LogKvError::InvalidConfig)?;
        fs::create_dir_all(&config.data_dir)?;

        let wal = WriteAheadLog::open(config.wal_path(), config.wal_meta_path())?;
        let snapshots = SnapshotManager::new(config.snapshot_dir(), config.server_id)?;
        let store = KvStore::new();

        let mut state = ConsensusState::new(config.server_id);
        let (term, voted_for) = wal.load_metadata();
        state.current_term = term;
        state.voted_for = voted_for;

        if let Some((pairs, meta)) = snapshots.load_latest() {
            wal.set_snapshot_floor(meta.last_included_index, meta.last_included_term);
            store.restore(pairs);
            state.last_applied = meta.last_included_index;
            state.commit_index = meta.last_included_index;
            tracing::info!(
                last_included_index = meta.last_included_index,
                pairs = meta.data_size,
                "restored state from snapshot"
            );
        }

        let mut replayed = 0u64;
        for entry in wal.entries_from(state.last_applied + 1) {
            let index = entry.index;
            if entry.op == Operation::Put {
                store.put(entry.key, entry.value);
            }
            state.last_applied = index;
            replayed += 1;
        }
        state.commit_index = state.commit_index.max(state.last_applied);
        if replayed > 0 {
            tracing::info!(replayed, last_applied = state.last_applied, "replayed log");
        }
        state.last_heartbeat_at = Instant::now();

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let (commit_tx, _) = watch::channel(state.commit_index);
        let (applied_tx, _) = watch::channel(state.last_applied);
        let (shutdown_tx, _) = watch::channel(false);

        let server = Arc::new(Server {
            config,
            state: Mutex::new(state),
            wal,
            snapshots,
            store,
            commit_tx,
            applied_tx,
            replicate: Notify::new(),
            shutdown_tx,
            fatal: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        {
            let mut task_handles = server.tasks.lock().unwrap();
            task_handles.push(tokio::spawn(accept_loop(server.clone(), listener)));
            task_handles.push(tokio::spawn(tasks::election_loop(server.clone())));
            task_handles.push(tokio::spawn(tasks::applier_loop(server.clone())));
            for peer in server.config.peers.clone() {
                task_handles.push(tokio::spawn(tasks::replicator_loop(server.clone(), peer)));
            }
        }

        tracing::info!(
            server_id = server.config.server_id,
            port = local_addr.port(),
            peers = server.config.peers.len(),
            "logkv server running"
        );

        Ok(ServerHandle { server, local_addr })
    }

    /// Route one parsed request. Dispatch is exhaustive over the protocol.
    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::ClientPut { key, value } => self.handle_client_put(key, value).await,
            Request::ClientGet { key } => match self.store.get(&key) {
                Some(value) => Response::Value(value),
                None => Response::NotFound,
            },
            Request::Heartbeat { term } => self.handle_heartbeat(term),
            Request::RequestVote(request) => self.handle_request_vote(request),
            Request::AppendEntries(request) => self.handle_append_entries(request),
            Request::InstallSnapshot(request) => self.handle_install_snapshot(request).await,
            Request::ReplPut { index, key, value } => self.handle_repl_put(index, key, value),
            Request::Unknown { verb } => {
                tracing::debug!(verb, "unknown command");
                Response::UnknownCmd
            }
        }
    }

    /// Leader path for a client PUT: assign the next index, make the entry
    /// durable, wake the replicators, then wait until the entry has been
    /// committed and applied (or time out; the entry stays in the log and
    /// may still commit later).
    async fn handle_client_put(&self, key: String, value: String) -> Response {
        let index = {
            let mut state = self.state.lock().unwrap();
            if !state.is_leader() {
                return Response::NotLeader;
            }

            let (last_index, _) = self.wal.last_info();
            let index = last_index + 1;
            let entry = LogEntry::put(index, state.current_term, key, value);
            if let Err(e) = self.wal.append(entry) {
                drop(state);
                return self.durability_failure(e);
            }

            if self.config.peers.is_empty() {
                // single-server cluster commits immediately
                state.commit_index = index;
                self.commit_tx.send_replace(index);
            }
            index
        };

        self.replicate.notify_waiters();

        let mut applied = self.applied_tx.subscribe();
        let result = timeout(
            self.config.replication_timeout(),
            applied.wait_for(|&applied| applied >= index),
        )
        .await;
        match result {
            Ok(Ok(_)) => Response::Ok,
            _ => {
                tracing::warn!(index, "replication timed out");
                Response::Timeout
            }
        }
    }

    fn handle_heartbeat(&self, term: Term) -> Response {
        let mut state = self.state.lock().unwrap();
        if term > state.current_term {
            state.update_term(term);
            if let Err(e) = self.wal.save_metadata(state.current_term, None) {
                drop(state);
                return self.durability_failure(e);
            }
        }
        if term == state.current_term {
            state.last_heartbeat_at = Instant::now();
            if state.role == Role::Candidate {
                state.role = Role::Follower;
                state.votes_received.clear();
            }
        }
        Response::OkTerm(state.current_term)
    }

    fn handle_request_vote(&self, request: RequestVoteRequest) -> Response {
        let mut state = self.state.lock().unwrap();
        match election::handle_request_vote(&mut state, &self.wal, request) {
            Ok(response) => {
                if response.vote_granted {
                    state.last_heartbeat_at = Instant::now();
                    Response::VoteGranted(response.term)
                } else {
                    Response::VoteDenied(response.term)
                }
            }
            Err(e) => {
                drop(state);
                self.durability_failure(e)
            }
        }
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> Response {
        let mut state = self.state.lock().unwrap();
        let commit_before = state.commit_index;
        match raft_log::handle_append_entries(&mut state, &self.wal, request) {
            Ok(response) => {
                if state.commit_index > commit_before {
                    self.commit_tx.send_replace(state.commit_index);
                }
                if response.success {
                    Response::AppendOk {
                        term: response.term,
                        match_index: response.match_index,
                    }
                } else {
                    Response::AppendFail(response.term)
                }
            }
            Err(LogKvError::LogInconsistency) => Response::AppendFail(state.current_term),
            Err(e) => {
                drop(state);
                self.durability_failure(e)
            }
        }
    }

    async fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> Response {
        {
            let mut state = self.state.lock().unwrap();
            if request.term < state.current_term {
                return Response::SnapshotOk(state.current_term);
            }
            if request.term > state.current_term {
                state.update_term(request.term);
                if let Err(e) = self.wal.save_metadata(state.current_term, None) {
                    drop(state);
                    return self.durability_failure(e);
                }
            }
            state.leader_hint = Some(request.leader_id);
            state.last_heartbeat_at = Instant::now();
            if state.role != Role::Follower {
                state.role = Role::Follower;
                state.votes_received.clear();
            }
        }

        let installed = match self
            .snapshots
            .write_chunk(request.offset, &request.data, request.done)
        {
            Ok(installed) => installed,
            Err(e) => {
                tracing::warn!(error = %e, "failed to stage snapshot chunk");
                return Response::Error("snapshot chunk rejected".to_string());
            }
        };

        if let Some(meta) = installed {
            let Some((pairs, _)) = self.snapshots.load_latest() else {
                return Response::Error("installed snapshot unreadable".to_string());
            };
            if let Err(e) = self
                .wal
                .install_snapshot(meta.last_included_index, meta.last_included_term)
            {
                return self.durability_failure(e);
            }
            self.store.restore(pairs);

            let mut state = self.state.lock().unwrap();
            state.voted_for = None;
            state.last_applied = state.last_applied.max(meta.last_included_index);
            state.commit_index = state.commit_index.max(meta.last_included_index);
            self.commit_tx.send_replace(state.commit_index);
            self.applied_tx.send_replace(state.last_applied);
            tracing::info!(
                last_included_index = meta.last_included_index,
                "snapshot installed from leader"
            );
        }

        let term = self.state.lock().unwrap().current_term;
        Response::SnapshotOk(term)
    }

    /// Legacy single-entry replication: treat `REPL_PUT` as an
    /// AppendEntries of one entry in our current term, anchored on the
    /// local predecessor, and acknowledge with the legacy token.
    fn handle_repl_put(&self, index: LogIndex, key: String, value: String) -> Response {
        let mut state = self.state.lock().unwrap();
        let (last_index, _) = self.wal.last_info();
        if index == 0 || index > last_index + 1 {
            return Response::AppendFail(state.current_term);
        }

        let prev_log_index = index - 1;
        let request = AppendEntriesRequest {
            term: state.current_term,
            leader_id: state.leader_hint.unwrap_or(0),
            prev_log_index,
            prev_log_term: self.wal.term_at(prev_log_index),
            entries: vec![LogEntry::put(index, state.current_term, key, value)],
            leader_commit: index,
        };

        let commit_before = state.commit_index;
        match raft_log::handle_append_entries(&mut state, &self.wal, request) {
            Ok(response) if response.success => {
                if state.commit_index > commit_before {
                    self.commit_tx.send_replace(state.commit_index);
                }
                Response::Ack
            }
            Ok(response) => Response::AppendFail(response.term),
            Err(LogKvError::LogInconsistency) => Response::AppendFail(state.current_term),
            Err(e) => {
                drop(state);
                self.durability_failure(e)
            }
        }
    }

    /// A WAL or metadata write failed: durability is uncertain, so the
    /// server stops acknowledging and shuts down with an error.
    fn durability_failure(&self, err: LogKvError) -> Response {
        tracing::error!(error = %err, "durability failure, shutting down");
        self.fatal.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        Response::Error("durability failure".to_string())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let response = match protocol::read_request(&mut reader).await {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request");
                Response::Error(e.to_string())
            }
        };

        let mut line = response.to_line();
        line.push('\n');
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "failed to write response");
        }
    }
}

async fn accept_loop(server: Arc<Server>, listener: TcpListener) {
    let mut shutdown = server.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let server = server.clone();
                    tokio::spawn(server.handle_connection(stream));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn role(&self) -> Role {
        self.server.state.lock().unwrap().role
    }

    pub fn current_term(&self) -> Term {
        self.server.state.lock().unwrap().current_term
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Signal every task to stop at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.server.shutdown_tx.send(true);
    }

    /// Wait for all background tasks to exit after [`shutdown`].
    ///
    /// [`shutdown`]: ServerHandle::shutdown
    pub async fn join(&self) {
        let handles: Vec<_> = self.server.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Wait until the server has been told to stop; `Err` means it stopped
    /// because a durability failure made continuing unsafe.
    pub async fn wait(&self) -> Result<()> {
        let mut shutdown = self.server.shutdown_tx.subscribe();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        if self.server.fatal.load(Ordering::SeqCst) {
            return Err(LogKvError::Io(std::io::Error::other(
                "server stopped after durability failure",
            )));
        }
        Ok(())
    }
}
