use std::io;

use crate::raft::types::Term;

#[derive(Debug)]
pub enum LogKvError {
    Io(io::Error),
    Protocol(String),
    NotLeader,
    Timeout,
    StaleTerm(Term),
    LogInconsistency,
    CorruptSnapshot(String),
    InvalidConfig(String),
}

impl std::fmt::Display for LogKvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKvError::Io(err) => write!(f, "io error: {}", err),
            LogKvError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            LogKvError::NotLeader => write!(f, "not the leader"),
            LogKvError::Timeout => write!(f, "operation timed out"),
            LogKvError::StaleTerm(term) => write!(f, "stale term, current is {}", term),
            LogKvError::LogInconsistency => write!(f, "log inconsistency detected"),
            LogKvError::CorruptSnapshot(msg) => write!(f, "corrupt snapshot: {}", msg),
            LogKvError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for LogKvError {}

impl From<io::Error> for LogKvError {
    fn from(err: io::Error) -> Self {
        LogKvError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, LogKvError>;
