use serde::{Deserialize, Serialize};

use crate::util::errors::{LogKvError, Result};

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices
pub type LogIndex = u64;

/// Server identifier
pub type ServerId = u64;

/// The operation carried by a log entry.
///
/// `Delete` is reserved on the wire but never routed by the dispatcher and
/// never applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PUT",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "PUT" => Ok(Operation::Put),
            "DELETE" => Ok(Operation::Delete),
            other => Err(LogKvError::Protocol(format!(
                "unknown operation: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log
    pub index: LogIndex,
    /// The term when this entry was created
    pub term: Term,
    /// The operation to apply
    pub op: Operation,
    /// Key, non-empty, no whitespace or newlines
    pub key: String,
    /// Value, no whitespace or newlines
    pub value: String,
}

impl LogEntry {
    pub fn put(
        index: LogIndex,
        term: Term,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            index,
            term,
            op: Operation::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Encode as one WAL / wire line: `<index> <term> <op> <key> <value>`.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.index, self.term, self.op, self.key, self.value
        )
    }

    /// Parse a single entry line. Exactly five whitespace-separated tokens
    /// are accepted; anything else is rejected.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let index = parse_u64(tokens.next(), "index")?;
        let term = parse_u64(tokens.next(), "term")?;
        let op = Operation::parse(
            tokens
                .next()
                .ok_or_else(|| LogKvError::Protocol("missing operation".to_string()))?,
        )?;
        let key = tokens
            .next()
            .ok_or_else(|| LogKvError::Protocol("missing key".to_string()))?
            .to_string();
        let value = tokens
            .next()
            .ok_or_else(|| LogKvError::Protocol("missing value".to_string()))?
            .to_string();

        if key.is_empty() {
            return Err(LogKvError::Protocol("empty key".to_string()));
        }
        if tokens.next().is_some() {
            return Err(LogKvError::Protocol(format!(
                "trailing tokens in entry line: {}",
                line
            )));
        }

        Ok(Self {
            index,
            term,
            op,
            key,
            value,
        })
    }
}

pub(crate) fn parse_u64(token: Option<&str>, field: &str) -> Result<u64> {
    token
        .ok_or_else(|| LogKvError::Protocol(format!("missing {}", field)))?
        .parse::<u64>()
        .map_err(|_| LogKvError::Protocol(format!("invalid {}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_line_round_trip() {
        let entry = LogEntry::put(3, 2, "alpha", "42");
        let line = entry.to_line();
        assert_eq!(line, "3 2 PUT alpha 42");
        assert_eq!(LogEntry::parse_line(&line).unwrap(), entry);
    }

    #[test]
    fn rejects_unindexed_legacy_lines() {
        // The old two-token-prefix format carries no index/term.
        assert!(LogEntry::parse_line("PUT alpha 42").is_err());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(LogEntry::parse_line("1 1 PUT a b extra").is_err());
    }

    #[test]
    fn rejects_unknown_operation() {
        assert!(LogEntry::parse_line("1 1 MERGE a b").is_err());
    }
}
