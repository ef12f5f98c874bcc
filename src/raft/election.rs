use super::rpc::{RequestVoteRequest, RequestVoteResponse};
use super::state::ConsensusState;
use crate::storage::WriteAheadLog;
use crate::util::errors::Result;

/// Handle an incoming RequestVote RPC.
///
/// Any vote we grant is persisted to the metadata sidecar before the
/// response is produced, so a crash-restart cannot grant a different vote
/// in the same term.
pub fn handle_request_vote(
    state: &mut ConsensusState,
    wal: &WriteAheadLog,
    request: RequestVoteRequest,
) -> Result<RequestVoteResponse> {
    tracing::debug!(
        server_id = state.server_id,
        candidate = request.candidate_id,
        term = request.term,
        "received RequestVote"
    );

    if request.term > state.current_term {
        state.update_term(request.term);
        wal.save_metadata(state.current_term, None)?;
    }

    if request.term < state.current_term {
        tracing::debug!(
            server_id = state.server_id,
            candidate = request.candidate_id,
            "denied vote: stale term {} < {}",
            request.term,
            state.current_term
        );
        return Ok(RequestVoteResponse {
            term: state.current_term,
            vote_granted: false,
        });
    }

    let can_vote =
        state.voted_for.is_none() || state.voted_for == Some(request.candidate_id);

    let (last_log_index, last_log_term) = wal.last_info();
    let log_up_to_date = request.last_log_term > last_log_term
        || (request.last_log_term == last_log_term && request.last_log_index >= last_log_index);

    let vote_granted = can_vote && log_up_to_date;
    if vote_granted {
        state.voted_for = Some(request.candidate_id);
        wal.save_metadata(state.current_term, state.voted_for)?;
        tracing::info!(
            server_id = state.server_id,
            candidate = request.candidate_id,
            term = request.term,
            "granted vote"
        );
    } else {
        tracing::debug!(
            server_id = state.server_id,
            candidate = request.candidate_id,
            can_vote,
            log_up_to_date,
            "denied vote"
        );
    }

    Ok(RequestVoteResponse {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle a RequestVote response from the peer at `from`.
///
/// Returns true if this response completed a majority and we became leader;
/// the caller initializes follower indices and starts heartbeats.
pub fn handle_vote_response(
    state: &mut ConsensusState,
    wal: &WriteAheadLog,
    from: &str,
    response: RequestVoteResponse,
    cluster_size: usize,
) -> Result<bool> {
    if response.term > state.current_term {
        state.update_term(response.term);
        wal.save_metadata(state.current_term, None)?;
        return Ok(false);
    }

    if !state.is_candidate() || response.term < state.current_term {
        return Ok(false);
    }

    if response.vote_granted {
        state.record_vote(from);
        tracing::debug!(
            server_id = state.server_id,
            from,
            votes = state.votes_received.len() + 1,
            cluster_size,
            "vote received"
        );

        if state.has_majority(cluster_size) {
            tracing::info!(
                server_id = state.server_id,
                term = state.current_term,
                "won election"
            );
            return Ok(true);
        }
    }

    Ok(false)
}

/// Build the RequestVote this candidate broadcasts.
pub fn create_request_vote(state: &ConsensusState, wal: &WriteAheadLog) -> RequestVoteRequest {
    let (last_log_index, last_log_term) = wal.last_info();
    RequestVoteRequest {
        term: state.current_term,
        candidate_id: state.server_id,
        last_log_index,
        last_log_term,
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
    fn grants_vote_to_up_to_date_candidate() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);

        let response = handle_request_vote(
            &mut state,
            &wal,
            RequestVoteRequest {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();

        assert!(response.vote_granted);
        assert_eq!(state.voted_for, Some(2));
        // the vote was durable before the reply
        assert_eq!(wal.load_metadata(), (1, Some(2)));
    }

    #[test]
    fn denies_vote_when_already_voted() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 1;
        state.voted_for = Some(2);

        let response = handle_request_vote(
            &mut state,
            &wal,
            RequestVoteRequest {
                term: 1,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();

        assert!(!response.vote_granted);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn denies_vote_to_stale_term() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.current_term = 5;

        let response = handle_request_vote(
            &mut state,
            &wal,
            RequestVoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();

        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn denies_vote_to_candidate_with_shorter_log() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 1, "b", "2")).unwrap();

        let mut state = ConsensusState::new(1);
        state.current_term = 1;

        let response = handle_request_vote(
            &mut state,
            &wal,
            RequestVoteRequest {
                term: 2,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 1,
            },
        )
        .unwrap();

        assert!(!response.vote_granted);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn higher_log_term_beats_longer_log() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        wal.append(LogEntry::put(1, 1, "a", "1")).unwrap();
        wal.append(LogEntry::put(2, 1, "b", "2")).unwrap();

        let mut state = ConsensusState::new(1);
        state.current_term = 2;

        let response = handle_request_vote(
            &mut state,
            &wal,
            RequestVoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 1,
                last_log_term: 2,
            },
        )
        .unwrap();

        assert!(response.vote_granted);
    }

    #[test]
    fn majority_of_vote_responses_wins() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.become_candidate();

        let won = handle_vote_response(
            &mut state,
            &wal,
            "127.0.0.1:8081",
            RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
            3,
        )
        .unwrap();

        assert!(won);
    }

    #[test]
    fn higher_term_response_steps_candidate_down() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let mut state = ConsensusState::new(1);
        state.become_candidate();

        let won = handle_vote_response(
            &mut state,
            &wal,
            "127.0.0.1:8081",
            RequestVoteResponse {
                term: 9,
                vote_granted: false,
            },
            3,
        )
        .unwrap();

        assert!(!won);
        assert_eq!(state.current_term, 9);
        assert!(!state.is_candidate());
        assert_eq!(wal.load_metadata(), (9, None));
    }
}
