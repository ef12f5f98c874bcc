//! Outbound peer RPCs.
//!
//! One short-lived TCP connection per request/response, each bounded by the
//! per-operation timeout. A timeout or connection failure just means the
//! peer is unavailable for this attempt; callers retry on the next
//! heartbeat or replication tick.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol;
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::util::errors::{LogKvError, Result};

pub async fn send_request_vote(
    addr: &str,
    request: &RequestVoteRequest,
    per_op: Duration,
) -> Result<RequestVoteResponse> {
    let line = exchange(addr, protocol::encode_request_vote(request).into_bytes(), per_op).await?;
    protocol::parse_vote_response(&line)
}

pub async fn send_append_entries(
    addr: &str,
    request: &AppendEntriesRequest,
    per_op: Duration,
) -> Result<AppendEntriesResponse> {
    let line = exchange(
        addr,
        protocol::encode_append_entries(request).into_bytes(),
        per_op,
    )
    .await?;
    protocol::parse_append_entries_response(&line)
}

pub async fn send_install_snapshot(
    addr: &str,
    request: &InstallSnapshotRequest,
    per_op: Duration,
) -> Result<InstallSnapshotResponse> {
    let mut payload = protocol::encode_install_snapshot_header(request).into_bytes();
    payload.extend_from_slice(&request.data);
    let line = exchange(addr, payload, per_op).await?;
    protocol::parse_install_snapshot_response(&line)
}

/// Connect, send the payload, and read the single response line, each step
/// bounded by `per_op`.
async fn exchange(addr: &str, payload: Vec<u8>, per_op: Duration) -> Result<String> {
    let mut stream = timeout(per_op, TcpStream::connect(addr))
        .await
        .map_err(|_| LogKvError::Timeout)??;

    stream.write_all(&payload).await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = timeout(per_op, reader.read_line(&mut line))
        .await
        .map_err(|_| LogKvError::Timeout)??;
    if n == 0 {
        return Err(LogKvError::Protocol(
            "peer closed connection without responding".to_string(),
        ));
    }

    Ok(line.trim_end().to_string())
}
