use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::raft::types::{LogEntry, LogIndex, ServerId, Term};
use crate::util::errors::{LogKvError, Result};

/// Append-only write-ahead log with indexed, termed entries.
///
/// One entry per text line, `<index> <term> <op> <key> <value>`. The full
/// file is scanned once at startup to rebuild the in-memory cache; appends
/// go to stable storage before returning. Truncation and compaction rewrite
/// the file through a temp file plus atomic rename so a crash leaves the old
/// file intact.
///
/// A metadata sidecar holds `<current_term> <voted_for>` (`-1` for none)
/// with the same durability guarantee.
pub struct WriteAheadLog {
    inner: Mutex<WalInner>,
}

struct WalInner {
    path: PathBuf,
    meta_path: PathBuf,
    file: File,
    entries: Vec<LogEntry>,
    /// Index of the oldest entry still in the log; `snapshot_index + 1`
    /// once compaction has run.
    first_log_index: LogIndex,
    /// Position covered by the latest snapshot, (0, 0) when none.
    snapshot_index: LogIndex,
    snapshot_term: Term,
    /// Cached copy of the metadata sidecar.
    meta_term: Term,
    meta_voted_for: Option<ServerId>,
}

impl WriteAheadLog {
    /// Open (or create) the log at `path` with its metadata sidecar at
    /// `meta_path`, scanning existing entries into memory.
    ///
    /// A line that does not parse, a gap in indices, or a decreasing term is
    /// fatal: the log cannot be trusted.
    pub fn open(path: impl Into<PathBuf>, meta_path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta_path = meta_path.into();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let mut entries: Vec<LogEntry> = Vec::new();
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry = LogEntry::parse_line(&line)
                .map_err(|e| LogKvError::Protocol(format!("corrupt log line: {}", e)))?;
            if let Some(last) = entries.last() {
                if entry.index != last.index + 1 {
                    return Err(LogKvError::Protocol(format!(
                        "log gap: {} follows {}",
                        entry.index, last.index
                    )));
                }
                if entry.term < last.term {
                    return Err(LogKvError::Protocol(format!(
                        "log term regression at index {}",
                        entry.index
                    )));
                }
            }
            entries.push(entry);
        }

        let first_log_index = entries.first().map(|e| e.index).unwrap_or(1);
        let (meta_term, meta_voted_for) = read_metadata_file(&meta_path)?;

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            first_log_index,
            "opened write-ahead log"
        );

        Ok(Self {
            inner: Mutex::new(WalInner {
                path,
                meta_path,
                file,
                entries,
                first_log_index,
                snapshot_index: 0,
                snapshot_term: 0,
                meta_term,
                meta_voted_for,
            }),
        })
    }

    /// Append one entry; on return it is on stable storage.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let (last_index, last_term) = inner.last_info();
        if entry.index != last_index + 1 {
            return Err(LogKvError::LogInconsistency);
        }
        if entry.term < last_term {
            return Err(LogKvError::LogInconsistency);
        }

        inner.file.write_all(entry.to_line().as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.file.sync_all()?;

        if inner.entries.is_empty() {
            inner.first_log_index = entry.index;
        }
        inner.entries.push(entry);
        Ok(())
    }

    /// Entry at `index`, if still present in the log.
    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner.get(index).cloned()
    }

    /// Term of the entry at `index`, falling back to the snapshot floor.
    /// Returns 0 when the position is unknown.
    pub fn term_at(&self, index: LogIndex) -> Term {
        let inner = self.inner.lock().unwrap();
        if index == inner.snapshot_index {
            return inner.snapshot_term;
        }
        inner.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// `(last_index, last_term)` of the highest covered position, whether in
    /// the log or in the snapshot it was compacted into. `(0, 0)` when empty.
    pub fn last_info(&self) -> (LogIndex, Term) {
        self.inner.lock().unwrap().last_info()
    }

    /// Index of the oldest entry still in the log.
    pub fn first_index(&self) -> LogIndex {
        self.inner.lock().unwrap().first_log_index
    }

    /// Copy of all entries with `index >= start`.
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        let start = start.max(inner.first_log_index);
        match inner.offset_of(start) {
            Some(offset) => inner.entries[offset..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Remove all entries with `index >= index`, durably.
    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            return Ok(());
        }
        let offset = if index <= inner.first_log_index {
            0
        } else {
            match inner.offset_of(index) {
                Some(offset) => offset,
                None => return Ok(()),
            }
        };
        inner.entries.truncate(offset);
        if inner.entries.is_empty() {
            inner.first_log_index = inner.snapshot_index + 1;
        }
        inner.rewrite()?;
        tracing::info!(index, "truncated log suffix");
        Ok(())
    }

    /// Remove all entries with `index <= index` after a successful snapshot,
    /// advancing `first_log_index`. Durable before returning.
    pub fn discard_before(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if index < inner.first_log_index {
            return Ok(());
        }
        if let Some(term) = inner.get(index).map(|e| e.term) {
            inner.snapshot_index = index;
            inner.snapshot_term = term;
        }
        let keep_from = inner.offset_of(index + 1).unwrap_or(inner.entries.len());
        inner.entries.drain(..keep_from);
        inner.first_log_index = index + 1;
        inner.rewrite()?;
        tracing::info!(index, "discarded log prefix");
        Ok(())
    }

    /// Replace the whole log with an installed snapshot's coverage: clear
    /// all entries, move `first_log_index` past `last_index`, and persist
    /// metadata with the vote cleared so later log-matching uses
    /// `last_term`.
    pub fn install_snapshot(&self, last_index: LogIndex, last_term: Term) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.snapshot_index = last_index;
        inner.snapshot_term = last_term;
        inner.first_log_index = last_index + 1;
        inner.rewrite()?;
        inner.meta_voted_for = None;
        inner.write_metadata()?;
        tracing::info!(last_index, last_term, "installed snapshot over log");
        Ok(())
    }

    /// Seed the compaction floor from snapshot metadata found at startup.
    pub fn set_snapshot_floor(&self, last_index: LogIndex, last_term: Term) {
        let mut inner = self.inner.lock().unwrap();
        if last_index <= inner.snapshot_index {
            return;
        }
        inner.snapshot_index = last_index;
        inner.snapshot_term = last_term;
        if inner.entries.is_empty() {
            inner.first_log_index = last_index + 1;
        }
    }

    /// Durably persist `(current_term, voted_for)` to the sidecar.
    pub fn save_metadata(&self, term: Term, voted_for: Option<ServerId>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.meta_term = term;
        inner.meta_voted_for = voted_for;
        inner.write_metadata()
    }

    /// `(current_term, voted_for)` as last persisted; `(0, None)` when the
    /// sidecar does not exist yet.
    pub fn load_metadata(&self) -> (Term, Option<ServerId>) {
        let inner = self.inner.lock().unwrap();
        (inner.meta_term, inner.meta_voted_for)
    }
}

impl WalInner {
    fn last_info(&self) -> (LogIndex, Term) {
        match self.entries.last() {
            Some(entry) => (entry.index, entry.term),
            None => (self.snapshot_index, self.snapshot_term),
        }
    }

    fn offset_of(&self, index: LogIndex) -> Option<usize> {
        if index < self.first_log_index {
            return None;
        }
        let offset = (index - self.first_log_index) as usize;
        (offset < self.entries.len()).then_some(offset)
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.offset_of(index).map(|o| &self.entries[o])
    }

    /// Rewrite the log file from the in-memory cache: temp file, flush,
    /// atomic rename, directory sync. On failure the old file is untouched.
    fn rewrite(&mut self) -> Result<()> {
        let tmp = sibling(&self.path, ".tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in &self.entries {
                out.write_all(entry.to_line().as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }

    fn write_metadata(&self) -> Result<()> {
        let voted = self
            .meta_voted_for
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-1".to_string());
        let tmp = sibling(&self.meta_path, ".tmp");
        {
            let mut out = File::create(&tmp)?;
            writeln!(out, "{} {}", self.meta_term, voted)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.meta_path)?;
        sync_parent_dir(&self.meta_path)?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

fn read_metadata_file(path: &Path) -> Result<(Term, Option<ServerId>)> {
    if !path.exists() {
        return Ok((0, None));
    }
    let contents = fs::read_to_string(path)?;
    let mut tokens = contents.split_whitespace();
    let term = tokens
        .next()
        .and_then(|t| t.parse::<Term>().ok())
        .ok_or_else(|| LogKvError::Protocol("corrupt metadata file".to_string()))?;
    let voted = match tokens.next() {
        Some("-1") => None,
        Some(id) => Some(id.parse::<ServerId>().map_err(|_| {
            LogKvError::Protocol("corrupt voted_for in metadata file".to_string())
        })?),
        None => return Err(LogKvError::Protocol("corrupt metadata file".to_string())),
    };
    Ok((term, voted))
}
