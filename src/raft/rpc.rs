use serde::{Deserialize, Serialize};

use super::types::{LogEntry, LogIndex, ServerId, Term};

/// RequestVote RPC - invoked by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting the vote
    pub candidate_id: ServerId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,
    /// True means the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - invoked by the leader to replicate entries and as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,
    /// So followers can redirect clients
    pub leader_id: ServerId,
    /// Index of the entry immediately preceding the new ones
    pub prev_log_index: LogIndex,
    /// Term of the prev_log_index entry
    pub prev_log_term: Term,
    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,
    /// True if the follower matched prev_log_index/prev_log_term
    pub success: bool,
    /// Highest index known replicated on the follower when success is true
    pub match_index: LogIndex,
}

/// InstallSnapshot RPC - leader catches up a follower whose log was compacted away
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,
    /// Log position the snapshot supersedes
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Byte offset of this chunk within the snapshot file
    pub offset: u64,
    /// Raw chunk bytes
    pub data: Vec<u8>,
    /// True when this is the final chunk
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}
