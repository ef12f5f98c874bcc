//! Background tasks: election timer, per-follower replicators (doubling as
//! the heartbeat sender), and the applier. Each holds an `Arc<Server>` and
//! exits at its next suspension point once shutdown is signalled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::sleep;

use super::Server;
use crate::config::Peer;
use crate::network::transport;
use crate::raft::election;
use crate::raft::log as raft_log;
use crate::raft::rpc::{AppendEntriesRequest, InstallSnapshotRequest};
use crate::raft::state::Role;
use crate::raft::types::Operation;

const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

enum Step {
    Idle,
    Append(AppendEntriesRequest),
    Snapshot,
}

/// Follower-side liveness detection: sleep a fresh random interval, then
/// campaign if the leader has been silent for that long.
pub(crate) async fn election_loop(server: Arc<Server>) {
    let mut shutdown = server.shutdown_tx.subscribe();
    loop {
        let wait = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(
                server.config.election_timeout_min_ms..=server.config.election_timeout_max_ms,
            ))
        };

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(wait) => {}
        }

        let should_campaign = {
            let state = server.state.lock().unwrap();
            state.role != Role::Leader && state.last_heartbeat_at.elapsed() >= wait
        };
        if should_campaign {
            run_election(&server).await;
        }
    }
}

/// One election round: bump the term, vote for ourselves (durably), then
/// broadcast RequestVote and tally responses until won or superseded.
async fn run_election(server: &Arc<Server>) {
    let (request, election_term) = {
        let mut state = server.state.lock().unwrap();
        state.become_candidate();
        if let Err(e) = server.wal.save_metadata(state.current_term, state.voted_for) {
            drop(state);
            server.durability_failure(e);
            return;
        }
        state.last_heartbeat_at = Instant::now();
        (
            election::create_request_vote(&state, &server.wal),
            state.current_term,
        )
    };

    tracing::info!(term = election_term, "election started");

    // A single-server cluster is its own majority.
    {
        let mut state = server.state.lock().unwrap();
        if state.current_term == election_term
            && state.is_candidate()
            && state.has_majority(server.config.cluster_size())
        {
            let (last_index, _) = server.wal.last_info();
            state.become_leader(last_index, &server.config.peers);
            drop(state);
            server.replicate.notify_waiters();
            return;
        }
    }

    let mut votes = JoinSet::new();
    for peer in &server.config.peers {
        let addr = peer.address.clone();
        let request = request.clone();
        let per_op = server.config.rpc_timeout();
        votes.spawn(async move {
            let response = transport::send_request_vote(&addr, &request, per_op).await;
            (addr, response)
        });
    }

    while let Some(joined) = votes.join_next().await {
        let Ok((addr, Ok(response))) = joined else {
            continue;
        };

        let won = {
            let mut state = server.state.lock().unwrap();
            if state.current_term != election_term || !state.is_candidate() {
                return;
            }
            match election::handle_vote_response(
                &mut state,
                &server.wal,
                &addr,
                response,
                server.config.cluster_size(),
            ) {
                Ok(won) => {
                    if won {
                        let (last_index, _) = server.wal.last_info();
                        state.become_leader(last_index, &server.config.peers);
                    }
                    won
                }
                Err(e) => {
                    drop(state);
                    server.durability_failure(e);
                    return;
                }
            }
        };

        if won {
            // Leader entry action: immediate heartbeat to every follower.
            server.replicate.notify_waiters();
            return;
        }
    }
}

/// Per-follower replication: wake on new leader entries or the heartbeat
/// interval, send AppendEntries built from `next_index`, and fold the
/// response back in. Switches to InstallSnapshot when the follower needs
/// entries that were compacted away.
pub(crate) async fn replicator_loop(server: Arc<Server>, peer: Peer) {
    let addr = peer.address;
    let mut shutdown = server.shutdown_tx.subscribe();
    let mut backlog = false;

    loop {
        if !backlog {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = server.replicate.notified() => {}
                _ = sleep(server.config.heartbeat_interval()) => {}
            }
        }
        backlog = false;
        if *shutdown.borrow() {
            return;
        }

        let step = {
            let state = server.state.lock().unwrap();
            if !state.is_leader() {
                Step::Idle
            } else {
                let next = state.next_index.get(&addr).copied().unwrap_or(1);
                if next < server.wal.first_index() {
                    Step::Snapshot
                } else {
                    Step::Append(raft_log::create_append_entries(&state, &server.wal, &addr))
                }
            }
        };

        match step {
            Step::Idle => continue,
            Step::Snapshot => send_snapshot(&server, &addr).await,
            Step::Append(request) => {
                let sent_term = request.term;
                let had_entries = !request.entries.is_empty();

                let response = match transport::send_append_entries(
                    &addr,
                    &request,
                    server.config.rpc_timeout(),
                )
                .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "peer unavailable");
                        continue;
                    }
                };

                let mut state = server.state.lock().unwrap();
                if state.current_term != sent_term {
                    continue;
                }
                let commit_before = state.commit_index;
                let success = response.success;
                if let Err(e) = raft_log::handle_append_entries_response(
                    &mut state,
                    &server.wal,
                    &addr,
                    response,
                    server.config.cluster_size(),
                ) {
                    drop(state);
                    server.durability_failure(e);
                    return;
                }
                if state.commit_index > commit_before {
                    server.commit_tx.send_replace(state.commit_index);
                }

                // Keep draining a lagging follower without waiting a tick.
                if state.is_leader() {
                    let next = state.next_index.get(&addr).copied().unwrap_or(0);
                    let (last_index, _) = server.wal.last_info();
                    if next <= last_index && (had_entries || !success) {
                        backlog = true;
                    }
                }
            }
        }
    }
}

/// Stream the latest snapshot to a follower in chunks.
async fn send_snapshot(server: &Arc<Server>, addr: &str) {
    let Some(meta) = server.snapshots.metadata() else {
        return;
    };
    let (term, leader_id) = {
        let state = server.state.lock().unwrap();
        if !state.is_leader() {
            return;
        }
        (state.current_term, state.server_id)
    };

    tracing::info!(
        peer = %addr,
        last_included_index = meta.last_included_index,
        "follower is behind the log, sending snapshot"
    );

    let mut offset = 0u64;
    loop {
        let chunk = match server.snapshots.read_chunk(offset, SNAPSHOT_CHUNK_SIZE) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read snapshot chunk");
                return;
            }
        };
        let done = chunk.len() < SNAPSHOT_CHUNK_SIZE;
        let len = chunk.len() as u64;

        let request = InstallSnapshotRequest {
            term,
            leader_id,
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            offset,
            data: chunk,
            done,
        };

        match transport::send_install_snapshot(addr, &request, server.config.rpc_timeout()).await {
            Ok(response) if response.term > term => {
                let mut state = server.state.lock().unwrap();
                if response.term > state.current_term {
                    state.update_term(response.term);
                    if let Err(e) = server.wal.save_metadata(state.current_term, None) {
                        drop(state);
                        server.durability_failure(e);
                    }
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "snapshot transfer interrupted");
                return;
            }
        }

        offset += len;
        if done {
            let mut state = server.state.lock().unwrap();
            if state.is_leader() && state.current_term == term {
                state
                    .next_index
                    .insert(addr.to_string(), meta.last_included_index + 1);
                let matched = state.match_index.entry(addr.to_string()).or_insert(0);
                *matched = (*matched).max(meta.last_included_index);
            }
            return;
        }
    }
}

/// Drain committed entries into the KV store in index order, then consider
/// compacting the log behind a fresh snapshot.
pub(crate) async fn applier_loop(server: Arc<Server>) {
    let mut commit_rx = server.commit_tx.subscribe();
    let mut shutdown = server.shutdown_tx.subscribe();
    loop {
        apply_committed(&server);
        maybe_snapshot(&server);

        tokio::select! {
            _ = shutdown.changed() => return,
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn apply_committed(server: &Server) {
    loop {
        let entry = {
            let mut state = server.state.lock().unwrap();
            if state.last_applied >= state.commit_index {
                None
            } else {
                let index = state.last_applied + 1;
                match server.wal.get(index) {
                    Some(entry) => {
                        state.last_applied = index;
                        Some(entry)
                    }
                    None => {
                        tracing::error!(index, "committed entry missing from log");
                        None
                    }
                }
            }
        };

        let Some(entry) = entry else { break };
        let index = entry.index;
        match entry.op {
            Operation::Put => server.store.put(entry.key, entry.value),
            // Delete is reserved on the wire but not applied.
            Operation::Delete => {}
        }
        server.applied_tx.send_replace(index);
    }
}

/// Snapshot trigger: once enough applied entries sit above the compaction
/// floor, capture the store and discard the covered prefix. Failures here
/// are non-fatal; the log keeps growing and we retry on the next pass.
fn maybe_snapshot(server: &Server) {
    let (last_applied, first_index) = {
        let state = server.state.lock().unwrap();
        (state.last_applied, server.wal.first_index())
    };
    if last_applied < first_index {
        return;
    }
    if last_applied - first_index + 1 < server.config.snapshot_threshold {
        return;
    }

    let last_term = server.wal.term_at(last_applied);
    let data = server.store.snapshot();
    if let Err(e) = server.snapshots.create(&data, last_applied, last_term) {
        tracing::warn!(error = %e, "snapshot creation failed, will retry");
        return;
    }
    if let Err(e) = server.wal.discard_before(last_applied) {
        tracing::warn!(error = %e, "log compaction failed, snapshot kept");
    }
}
