//! Line-oriented wire protocol.
//!
//! Every message is one `\n`-terminated line of space-separated tokens;
//! `APPEND_ENTRIES` is followed by one line per entry and
//! `INSTALL_SNAPSHOT` by a raw byte payload.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::types::{parse_u64, LogEntry, LogIndex, Term};
use crate::util::errors::{LogKvError, Result};

/// One inbound request, dispatched exhaustively by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ClientPut { key: String, value: String },
    ClientGet { key: String },
    Heartbeat { term: Term },
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    /// Legacy single-entry replication message.
    ReplPut { index: LogIndex, key: String, value: String },
    Unknown { verb: String },
}

/// One outbound response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    OkTerm(Term),
    Value(String),
    NotFound,
    NotLeader,
    Timeout,
    Error(String),
    UnknownCmd,
    VoteGranted(Term),
    VoteDenied(Term),
    AppendOk { term: Term, match_index: LogIndex },
    AppendFail(Term),
    SnapshotOk(Term),
    Ack,
}

impl Response {
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::OkTerm(term) => format!("OK {}", term),
            Response::Value(value) => value.clone(),
            Response::NotFound => "NOT_FOUND".to_string(),
            Response::NotLeader => "NOT_LEADER".to_string(),
            Response::Timeout => "TIMEOUT".to_string(),
            Response::Error(reason) => format!("ERROR {}", reason),
            Response::UnknownCmd => "UNKNOWN_CMD".to_string(),
            Response::VoteGranted(term) => format!("VOTE_GRANTED {}", term),
            Response::VoteDenied(term) => format!("VOTE_DENIED {}", term),
            Response::AppendOk { term, match_index } => {
                format!("AE_OK {} {}", term, match_index)
            }
            Response::AppendFail(term) => format!("AE_FAIL {}", term),
            Response::SnapshotOk(term) => format!("IS_OK {}", term),
            Response::Ack => "ACK".to_string(),
        }
    }
}

/// Read and parse one request from a connection.
///
/// Multi-line messages (`APPEND_ENTRIES`, `INSTALL_SNAPSHOT`) consume their
/// trailing entry lines / payload bytes here, so dispatch sees one complete
/// request.
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(LogKvError::Protocol("empty request".to_string()));
    }

    let mut tokens = line.split_whitespace();
    let verb = tokens
        .next()
        .ok_or_else(|| LogKvError::Protocol("blank request line".to_string()))?;

    match verb {
        "PUT" => {
            let key = required(tokens.next(), "key")?;
            let value = required(tokens.next(), "value")?;
            reject_trailing(tokens.next())?;
            Ok(Request::ClientPut { key, value })
        }
        "GET" => {
            let key = required(tokens.next(), "key")?;
            reject_trailing(tokens.next())?;
            Ok(Request::ClientGet { key })
        }
        "HEARTBEAT" => {
            let term = parse_u64(tokens.next(), "term")?;
            reject_trailing(tokens.next())?;
            Ok(Request::Heartbeat { term })
        }
        "REQUEST_VOTE" => {
            let term = parse_u64(tokens.next(), "term")?;
            let candidate_id = parse_u64(tokens.next(), "candidate_id")?;
            let last_log_index = parse_u64(tokens.next(), "last_log_index")?;
            let last_log_term = parse_u64(tokens.next(), "last_log_term")?;
            reject_trailing(tokens.next())?;
            Ok(Request::RequestVote(RequestVoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            }))
        }
        "APPEND_ENTRIES" => {
            let term = parse_u64(tokens.next(), "term")?;
            let leader_id = parse_u64(tokens.next(), "leader_id")?;
            let prev_log_index = parse_u64(tokens.next(), "prev_index")?;
            let prev_log_term = parse_u64(tokens.next(), "prev_term")?;
            let leader_commit = parse_u64(tokens.next(), "leader_commit")?;
            let count = parse_u64(tokens.next(), "entry count")? as usize;
            reject_trailing(tokens.next())?;

            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let mut entry_line = String::new();
                if reader.read_line(&mut entry_line).await? == 0 {
                    return Err(LogKvError::Protocol(
                        "truncated AppendEntries body".to_string(),
                    ));
                }
                entries.push(LogEntry::parse_line(entry_line.trim_end())?);
            }

            Ok(Request::AppendEntries(AppendEntriesRequest {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            }))
        }
        "INSTALL_SNAPSHOT" => {
            let term = parse_u64(tokens.next(), "term")?;
            let leader_id = parse_u64(tokens.next(), "leader_id")?;
            let last_included_index = parse_u64(tokens.next(), "last_included_index")?;
            let last_included_term = parse_u64(tokens.next(), "last_included_term")?;
            let offset = parse_u64(tokens.next(), "offset")?;
            let len = parse_u64(tokens.next(), "len")? as usize;
            let done = match tokens.next() {
                Some("0") => false,
                Some("1") => true,
                _ => return Err(LogKvError::Protocol("invalid done flag".to_string())),
            };
            reject_trailing(tokens.next())?;

            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .await
                .map_err(|_| LogKvError::Protocol("truncated snapshot chunk".to_string()))?;

            Ok(Request::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                offset,
                data,
                done,
            }))
        }
        "REPL_PUT" => {
            let index = parse_u64(tokens.next(), "index")?;
            let key = required(tokens.next(), "key")?;
            let value = required(tokens.next(), "value")?;
            reject_trailing(tokens.next())?;
            Ok(Request::ReplPut { index, key, value })
        }
        other => Ok(Request::Unknown {
            verb: other.to_string(),
        }),
    }
}

fn required(token: Option<&str>, field: &str) -> Result<String> {
    token
        .map(str::to_string)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LogKvError::Protocol(format!("missing {}", field)))
}

fn reject_trailing(token: Option<&str>) -> Result<()> {
    match token {
        Some(extra) => Err(LogKvError::Protocol(format!(
            "unexpected token: {}",
            extra
        ))),
        None => Ok(()),
    }
}

// -- outbound encoding, used by the transport --

pub fn encode_request_vote(request: &RequestVoteRequest) -> String {
    format!(
        "REQUEST_VOTE {} {} {} {}\n",
        request.term, request.candidate_id, request.last_log_index, request.last_log_term
    )
}

pub fn encode_append_entries(request: &AppendEntriesRequest) -> String {
    let mut message = format!(
        "APPEND_ENTRIES {} {} {} {} {} {}\n",
        request.term,
        request.leader_id,
        request.prev_log_index,
        request.prev_log_term,
        request.leader_commit,
        request.entries.len()
    );
    for entry in &request.entries {
        message.push_str(&entry.to_line());
        message.push('\n');
    }
    message
}

/// Header line for an InstallSnapshot message; the chunk bytes follow it on
/// the wire verbatim.
pub fn encode_install_snapshot_header(request: &InstallSnapshotRequest) -> String {
    format!(
        "INSTALL_SNAPSHOT {} {} {} {} {} {} {}\n",
        request.term,
        request.leader_id,
        request.last_included_index,
        request.last_included_term,
        request.offset,
        request.data.len(),
        if request.done { 1 } else { 0 }
    )
}

// -- response parsing, used by the transport --

pub fn parse_vote_response(line: &str) -> Result<RequestVoteResponse> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("VOTE_GRANTED") => Ok(RequestVoteResponse {
            term: parse_u64(tokens.next(), "term")?,
            vote_granted: true,
        }),
        Some("VOTE_DENIED") => Ok(RequestVoteResponse {
            term: parse_u64(tokens.next(), "term")?,
            vote_granted: false,
        }),
        _ => Err(LogKvError::Protocol(format!(
            "unexpected vote response: {}",
            line
        ))),
    }
}

pub fn parse_append_entries_response(line: &str) -> Result<AppendEntriesResponse> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("AE_OK") => Ok(AppendEntriesResponse {
            term: parse_u64(tokens.next(), "term")?,
            success: true,
            match_index: parse_u64(tokens.next(), "match_index")?,
        }),
        Some("AE_FAIL") => Ok(AppendEntriesResponse {
            term: parse_u64(tokens.next(), "term")?,
            success: false,
            match_index: 0,
        }),
        _ => Err(LogKvError::Protocol(format!(
            "unexpected AppendEntries response: {}",
            line
        ))),
    }
}

pub fn parse_install_snapshot_response(line: &str) -> Result<InstallSnapshotResponse> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("IS_OK") => Ok(InstallSnapshotResponse {
            term: parse_u64(tokens.next(), "term")?,
        }),
        _ => Err(LogKvError::Protocol(format!(
            "unexpected InstallSnapshot response: {}",
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(input: &str) -> Result<Request> {
        let mut reader = input.as_bytes();
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn parses_client_put() {
        assert_eq!(
            parse("PUT alpha 42\n").await.unwrap(),
            Request::ClientPut {
                key: "alpha".to_string(),
                value: "42".to_string()
            }
        );
    }

    #[tokio::test]
    async fn parses_client_get() {
        assert_eq!(
            parse("GET alpha\n").await.unwrap(),
            Request::ClientGet {
                key: "alpha".to_string()
            }
        );
    }

    #[tokio::test]
    async fn rejects_put_with_missing_value() {
        assert!(parse("PUT alpha\n").await.is_err());
    }

    #[tokio::test]
    async fn rejects_put_with_embedded_whitespace() {
        // a value containing a space reads as a trailing token
        assert!(parse("PUT alpha 4 2\n").await.is_err());
    }

    #[tokio::test]
    async fn unknown_verb_is_not_an_error() {
        assert_eq!(
            parse("FROB x\n").await.unwrap(),
            Request::Unknown {
                verb: "FROB".to_string()
            }
        );
    }

    #[tokio::test]
    async fn parses_append_entries_with_body() {
        let request = parse("APPEND_ENTRIES 2 1 2 1 1 2\n3 2 PUT c 30\n4 2 PUT d 4\n")
            .await
            .unwrap();
        match request {
            Request::AppendEntries(req) => {
                assert_eq!(req.term, 2);
                assert_eq!(req.leader_id, 1);
                assert_eq!(req.prev_log_index, 2);
                assert_eq!(req.prev_log_term, 1);
                assert_eq!(req.leader_commit, 1);
                assert_eq!(req.entries.len(), 2);
                assert_eq!(req.entries[1], LogEntry::put(4, 2, "d", "4"));
            }
            other => panic!("expected AppendEntries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_truncated_append_entries_body() {
        assert!(parse("APPEND_ENTRIES 2 1 0 0 0 2\n1 2 PUT a 1\n").await.is_err());
    }

    #[tokio::test]
    async fn parses_install_snapshot_with_payload() {
        let request = parse("INSTALL_SNAPSHOT 3 1 10 2 0 5 1\nhello").await.unwrap();
        match request {
            Request::InstallSnapshot(req) => {
                assert_eq!(req.term, 3);
                assert_eq!(req.last_included_index, 10);
                assert_eq!(req.offset, 0);
                assert_eq!(req.data, b"hello");
                assert!(req.done);
            }
            other => panic!("expected InstallSnapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_trailing_tokens_on_peer_verbs() {
        assert!(parse("REPL_PUT 1 a 1 extra\n").await.is_err());
        assert!(parse("HEARTBEAT 2 extra\n").await.is_err());
        assert!(parse("REQUEST_VOTE 1 2 0 0 extra\n").await.is_err());
        assert!(parse("APPEND_ENTRIES 1 1 0 0 0 0 extra\n").await.is_err());
        assert!(parse("INSTALL_SNAPSHOT 1 1 0 0 0 0 1 extra\n").await.is_err());
    }

    #[tokio::test]
    async fn parses_legacy_repl_put() {
        assert_eq!(
            parse("REPL_PUT 4 beta 7\n").await.unwrap(),
            Request::ReplPut {
                index: 4,
                key: "beta".to_string(),
                value: "7".to_string()
            }
        );
    }

    #[test]
    fn append_entries_round_trips_through_encoder() {
        let request = AppendEntriesRequest {
            term: 2,
            leader_id: 1,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![LogEntry::put(3, 2, "c", "30")],
            leader_commit: 1,
        };
        assert_eq!(
            encode_append_entries(&request),
            "APPEND_ENTRIES 2 1 2 1 1 1\n3 2 PUT c 30\n"
        );
    }

    #[test]
    fn response_lines() {
        assert_eq!(Response::Ok.to_line(), "OK");
        assert_eq!(Response::NotLeader.to_line(), "NOT_LEADER");
        assert_eq!(Response::Value("42".to_string()).to_line(), "42");
        assert_eq!(
            Response::AppendOk {
                term: 2,
                match_index: 4
            }
            .to_line(),
            "AE_OK 2 4"
        );
        assert_eq!(Response::VoteDenied(3).to_line(), "VOTE_DENIED 3");
        assert_eq!(Response::Error("bad request".to_string()).to_line(), "ERROR bad request");
    }

    #[test]
    fn vote_response_parses_both_ways() {
        assert!(parse_vote_response("VOTE_GRANTED 4").unwrap().vote_granted);
        assert!(!parse_vote_response("VOTE_DENIED 4").unwrap().vote_granted);
        assert!(parse_vote_response("NOPE").is_err());
    }

    #[test]
    fn append_response_parses_both_ways() {
        let ok = parse_append_entries_response("AE_OK 2 7").unwrap();
        assert!(ok.success);
        assert_eq!(ok.match_index, 7);
        let fail = parse_append_entries_response("AE_FAIL 3").unwrap();
        assert!(!fail.success);
    }
}
