use std::time::Instant;

use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use super::state::{ConsensusState, Role};
use crate::storage::WriteAheadLog;
use crate::util::errors::Result;

/// Handle an incoming AppendEntries RPC (heartbeat when `entries` is empty).
///
/// Accepted entries are durable in the WAL before the success response is
/// produced. Conflicting suffixes are truncated and replaced.
pub fn handle_append_entries(
    state: &mut ConsensusState,
    wal: &WriteAheadLog,
    request: AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    if request.term > state.current_term {
        state.update_term(request.term);
        wal.save_metadata(state.current_term, None)?;
    }

    if request.term < state.current_term {
        tracing::debug!(
            server_id = state.server_id,
            leader = request.leader_id,
            "rejected AppendEntries: stale term {} < {}",
            request.term,
            state.current_term
        );
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: 0,
        });
    }

    // Valid leader contact for this term.
    state.leader_hint = Some(request.leader_id);
    state.last_heartbeat_at = Instant::now();
    if state.role != Role::Follower {
        // Same-term step down keeps voted_for: we already voted this term.
        tracing::info!(
            server_id = state.server_id,
            leader = request.leader_id,
            term = state.current_term,
            "yielding to leader"
        );
        state.role = Role::Follower;
        state.votes_received.clear();
    }

    // Log consistency: we must hold prev_log_index with prev_log_term.
    if request.prev_log_index > 0
        && wal.term_at(request.prev_log_index) != request.prev_log_term
    {
        tracing::debug!(
            server_id = state.server_id,
            prev_log_index = request.prev_log_index,
            prev_log_term = request.prev_log_term,
            "rejected AppendEntries: log mismatch"
        );
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: 0,
        });
    }

    let new_count = request.entries.len() as u64;
    for (i, entry) in request.entries.into_iter().enumerate() {
        match wal.get(entry.index) {
            Some(existing) if existing.term == entry.term => {
                // Already have it; Log Matching makes it identical.
            }
            Some(_) => {
                tracing::info!(
                    server_id = state.server_id,
                    index = entry.index,
                    "conflicting entry, truncating suffix"
                );
                wal.truncate_from(entry.index)?;
                wal.append(entry)?;
            }
            None => {
                if i == 0 {
                    tracing::debug!(
                        server_id = state.server_id,
                        count = new_count,
                        "appending entries from leader"
                    );
                }
                wal.append(entry)?;
            }
        }
    }

    let match_index = request.prev_log_index + new_count;
    if request.leader_commit > state.commit_index {
        let (last_index, _) = wal.last_info();
        state.commit_index = request.leader_commit.min(last_index);
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index,
    })
}

/// Fold an AppendEntries response from the follower at `from` into leader
/// state: advance match/next on success, back next off by one on failure,
/// and try to advance the commit index.
pub fn handle_append_entries_response(
    state: &mut ConsensusState,
    wal: &WriteAheadLog,
    from: &str,
    response: AppendEntriesResponse,
    cluster_size: usize,
) -> Result<()> {
    if response.term > state.current_term {
        state.update_term(response.term);
        wal.save_metadata(state.current_term, None)?;
        return Ok(());
    }

    if !state.is_leader() || response.term < state.current_term {
        return Ok(());
    }

    if response.success {
        if let Some(match_idx) = state.match_index.get_mut(from) {
            *match_idx = (*match_idx).max(response.match_index);
        }
        if let Some(next_idx) = state.next_index.get_mut(from) {
            *next_idx = response.match_index + 1;
        }
        advance_commit_index(state, wal, cluster_size);
    } else if let Some(next_idx) = state.next_index.get_mut(from) {
        if *next_idx > 1 {
            *next_idx -= 1;
        }
        tracing::debug!(
            server_id = state.server_id,
            from,
            next_index = *next_idx,
            "follower rejected entries, backing off"
        );
    }

    Ok(())
}

/// Advance `commit_index` to the highest N replicated on a majority whose
/// entry carries the current term.
pub fn advance_commit_index(
    state: &mut ConsensusState,
    wal: &WriteAheadLog,
    cluster_size: usize,
) -> bool {
    let old_commit = state.commit_index;
    let (last_index, _) = wal.last_info();
    let majority = cluster_size / 2 + 1;

    for n in (state.commit_index + 1)..=last_index {
        if wal.term_at(n) != state.current_term {
            continue;
        }
        let replicated = 1 + state
            .match_index
            .values()
            .filter(|&&match_idx| match_idx >= n)
            .count();
        if replicated >= majority {
            state.commit_index = n;
        }
    }

    if state.commit_index > old_commit {
        tracing::info!(
            server_id = state.server_id,
            commit_index = state.commit_index,
            "advanced commit index"
        );
        true
    } else {
        false
    }
}

/// Build the AppendEntries for one follower from its `next_index`.
pub fn create_append_entries(
    state: &ConsensusState,
    wal: &WriteAheadLog,
    follower: &str,
) -> AppendEntriesRequest {
    let (last_index, _) = wal.last_info();
    let next_index = state
        .next_index
        .get(follower)
        .copied()
        .unwrap_or(last_index + 1);

    let prev_log_index = next_index.saturating_sub(1);
    let prev_log_term = wal.term_at(prev_log_index);

    AppendEntriesRequest {
        term: state.current_term,
        leader_id: state.server_id,
        prev_log_index,
        prev_log_term,
        entries: wal.entries_from(next_index),
        leader_commit: state.commit_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::LogEntry;
    use tempfile::TempDir;

    fn wal_in(dir: &TempDir) -> WriteAheadLog {
        WriteAheadLog::open(dir.path().join("wal.log"), dir.path().join("wal.meta")).unwrap()
    }

    #[test]
    fn appends_entries_from_leader() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::put(1, 1, "a", "1")],
                leader_commit: 0,
            },
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(response.match_index, 1);
        assert_eq!(wal.last_info(), (1, 1));
        assert_eq!(state.leader_hint, Some(2));
    }

    #[test]
    fn rejects_stale_term() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 2;

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        )
        .unwrap();

        assert!(!response.success);
        assert_eq!(response.term, 2);
    }

    #[test]
    fn rejects_missing_prev_entry() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![LogEntry::put(6, 1, "a", "1")],
                leader_commit: 0,
            },
        )
        .unwrap();

        assert!(!response.success);
    }

    #[test]
    fn conflicting_suffix_is_truncated_and_replaced() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 1, "b", "2")).unwrap();
        wal.append(LogEntry::put(3, 1, "c", "3")).unwrap();

        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 2,
                leader_id: 2,
                prev_log_index: 2,
                prev_log_term: 1,
                entries: vec![
                    LogEntry::put(3, 2, "c", "30"),
                    LogEntry::put(4, 2, "d", "4"),
                ],
                leader_commit: 0,
            },
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(response.match_index, 4);
        let entries = wal.entries_from(1);
        assert_eq!(
            entries,
            vec![
                LogEntry::put(1, 1, "a", "1"),
                LogEntry::put(2, 1, "b", "2"),
                LogEntry::put(3, 2, "c", "30"),
                LogEntry::put(4, 2, "d", "4"),
            ]
        );
    }

    #[test]
    fn duplicate_entries_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let request = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::put(1, 1, "a", "1"), LogEntry::put(2, 1, "b", "2")],
            leader_commit: 0,
        };

        handle_append_entries(&mut state, &wal, request.clone()).unwrap();
        let response = handle_append_entries(&mut state, &wal, request).unwrap();

        assert!(response.success);
        assert_eq!(wal.entries_from(1).len(), 2);
    }

    #[test]
    fn commit_index_follows_leader_commit() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::put(1, 1, "a", "1")],
                leader_commit: 5,
            },
        )
        .unwrap();

        assert!(response.success);
        // clamped to the last entry we actually hold
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn heartbeat_yields_candidate_without_clearing_vote() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.become_candidate();
        assert_eq!(state.current_term, 1);

        let response = handle_append_entries(
            &mut state,
            &wal,
            AppendEntriesRequest {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn quorum_advances_commit_only_for_current_term() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 2, "b", "2")).unwrap();

        let mut state = ConsensusState::new(1);
        state.current_term = 1;
        state.become_candidate();
        assert_eq!(state.current_term, 2);
        state.become_leader(
            2,
            &[
                crate::config::Peer::new("127.0.0.1:8081"),
                crate::config::Peer::new("127.0.0.1:8082"),
            ],
        );

        // one follower caught up through index 1 only: entry 1 is from an
        // older term, so nothing commits
        handle_append_entries_response(
            &mut state,
            &wal,
            "127.0.0.1:8081",
            AppendEntriesResponse {
                term: 2,
                success: true,
                match_index: 1,
            },
            3,
        )
        .unwrap();
        assert_eq!(state.commit_index, 0);

        // once a majority holds index 2 (current term), both commit
        handle_append_entries_response(
            &mut state,
            &wal,
            "127.0.0.1:8082",
            AppendEntriesResponse {
                term: 2,
                success: true,
                match_index: 2,
            },
            3,
        )
        .unwrap();
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn failed_response_backs_off_next_index() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 1, "b", "2")).unwrap();

        let mut state = ConsensusState::new(1);
        state.become_candidate();
        state.become_leader(2, &[crate::config::Peer::new("127.0.0.1:8081")]);
        assert_eq!(state.next_index["127.0.0.1:8081"], 3);

        handle_append_entries_response(
            &mut state,
            &wal,
            "127.0.0.1:8081",
            AppendEntriesResponse {
                term: 1,
                success: false,
                match_index: 0,
            },
            2,
        )
        .unwrap();

        assert_eq!(state.next_index["127.0.0.1:8081"], 2);
    }

    #[test]
    fn create_append_entries_carries_suffix() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 1, "b", "2")).unwrap();

        let mut state = ConsensusState::new(1);
        state.become_candidate();
        state.become_leader(2, &[crate::config::Peer::new("127.0.0.1:8081")]);
        state.next_index.insert("127.0.0.1:8081".to_string(), 2);

        let request = create_append_entries(&state, &wal, "127.0.0.1:8081");
        assert_eq!(request.prev_log_index, 1);
        assert_eq!(request.prev_log_term, 1);
        assert_eq!(request.entries.len(), 1);
        assert_eq!(request.entries[0].index, 2);
    }
}
