use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::types::{LogIndex, ServerId, Term};
use crate::config::Peer;

/// The three roles a server can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives entries from the leader, votes when asked
    Follower,
    /// Requesting votes for leadership
    Candidate,
    /// Assigns indices, replicates entries, sends heartbeats
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Shared consensus state, guarded by the server's single consensus mutex.
///
/// `current_term` and `voted_for` are mirrored on disk by the WAL metadata
/// sidecar; callers persist before acting on new values.
#[derive(Debug)]
pub struct ConsensusState {
    /// Latest term this server has seen
    pub current_term: Term,
    /// Candidate that received our vote in the current term, if any
    pub voted_for: Option<ServerId>,
    /// Current role
    pub role: Role,
    /// Highest log index known to be committed
    pub commit_index: LogIndex,
    /// Highest log index applied to the KV store
    pub last_applied: LogIndex,
    /// Last leader we accepted contact from, for client redirection
    pub leader_hint: Option<ServerId>,
    /// This server's id
    pub server_id: ServerId,

    /// Per-follower next entry to send, keyed by peer address (leader only)
    pub next_index: HashMap<String, LogIndex>,
    /// Per-follower highest replicated index, keyed by peer address (leader only)
    pub match_index: HashMap<String, LogIndex>,

    /// Peer addresses that granted us a vote this election (candidate only)
    pub votes_received: HashSet<String>,

    /// Monotonic timestamp of the last accepted leader contact
    pub last_heartbeat_at: Instant,
}

impl ConsensusState {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
            server_id,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            last_heartbeat_at: Instant::now(),
        }
    }

    /// Transition to follower for `term`.
    pub fn become_follower(&mut self, term: Term, leader: Option<ServerId>) {
        tracing::info!(
            server_id = self.server_id,
            term,
            "transitioning to Follower"
        );
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_hint = leader;
        self.votes_received.clear();
    }

    /// Transition to candidate: bump the term and vote for ourselves.
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.server_id);
        self.leader_hint = None;
        self.votes_received.clear();

        tracing::info!(
            server_id = self.server_id,
            term = self.current_term,
            "transitioning to Candidate"
        );
    }

    /// Transition to leader, reinitializing per-follower indices.
    pub fn become_leader(&mut self, last_log_index: LogIndex, peers: &[Peer]) {
        tracing::info!(
            server_id = self.server_id,
            term = self.current_term,
            "transitioning to Leader"
        );

        self.role = Role::Leader;
        self.leader_hint = Some(self.server_id);

        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.address.clone(), last_log_index + 1);
            self.match_index.insert(peer.address.clone(), 0);
        }

        self.votes_received.clear();
    }

    /// Record a granted vote from a peer.
    pub fn record_vote(&mut self, from: &str) {
        self.votes_received.insert(from.to_string());
    }

    /// Whether granted votes plus our own reach a majority of the cluster.
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() + 1 >= cluster_size / 2 + 1
    }

    /// Step down if `term` is newer. Returns true if we did.
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            tracing::info!(
                server_id = self.server_id,
                old_term = self.current_term,
                new_term = term,
                "observed higher term"
            );
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.role == Role::Candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<Peer> {
        vec![Peer::new("127.0.0.1:8081"), Peer::new("127.0.0.1:8082")]
    }

    #[test]
    fn starts_as_follower() {
        let state = ConsensusState::new(1);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn candidate_votes_for_self() {
        let mut state = ConsensusState::new(1);
        state.become_candidate();
        assert_eq!(state.role, Role::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn majority_counts_own_vote() {
        let mut state = ConsensusState::new(1);
        state.become_candidate();
        // 3-server cluster: one granted vote plus our own is a majority
        assert!(!state.has_majority(3));
        state.record_vote("127.0.0.1:8081");
        assert!(state.has_majority(3));
    }

    #[test]
    fn leader_reinitializes_follower_indices() {
        let mut state = ConsensusState::new(1);
        state.become_candidate();
        state.become_leader(7, &peers());
        assert_eq!(state.next_index["127.0.0.1:8081"], 8);
        assert_eq!(state.match_index["127.0.0.1:8082"], 0);
    }

    #[test]
    fn higher_term_forces_step_down() {
        let mut state = ConsensusState::new(1);
        state.become_candidate();
        assert!(state.update_term(5));
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert!(!state.update_term(5));
    }
}
