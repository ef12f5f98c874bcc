use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::raft::types::{LogIndex, ServerId, Term};
use crate::util::errors::{LogKvError, Result};

const SNAPSHOT_MAGIC: &str = "LOGKV_SNAPSHOT_V1";
const SNAPSHOTS_TO_KEEP: usize = 2;

/// Log position and size covered by a snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Highest log index whose effects the snapshot captures
    pub last_included_index: LogIndex,
    /// Term of that entry
    pub last_included_term: Term,
    /// Number of key-value pairs in the body
    pub data_size: usize,
}

/// Owns the snapshot directory for one server id.
///
/// Snapshots are written to `temp_<server_id>.snap` and atomically renamed
/// to `snapshot_<server_id>_idx_<last_index>.snap`, so a crash mid-write
/// never clobbers the previous snapshot. The same temp file stages chunks
/// arriving from a leader during catch-up.
pub struct SnapshotManager {
    inner: Mutex<SnapshotInner>,
}

struct SnapshotInner {
    dir: PathBuf,
    server_id: ServerId,
    temp_path: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: impl Into<PathBuf>, server_id: ServerId) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let temp_path = dir.join(format!("temp_{}.snap", server_id));
        Ok(Self {
            inner: Mutex::new(SnapshotInner {
                dir,
                server_id,
                temp_path,
            }),
        })
    }

    /// Atomically write a snapshot covering the log up to
    /// `(last_index, last_term)`. On any failure the previous snapshot is
    /// left intact.
    pub fn create(
        &self,
        data: &HashMap<String, String>,
        last_index: LogIndex,
        last_term: Term,
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();

        tracing::info!(
            last_index,
            last_term,
            pairs = data.len(),
            "creating snapshot"
        );

        {
            let mut out = File::create(&inner.temp_path)?;
            writeln!(out, "{}", SNAPSHOT_MAGIC)?;
            writeln!(out, "{} {} {}", last_index, last_term, data.len())?;
            for (key, value) in data {
                writeln!(out, "{} {}", key.len(), value.len())?;
                writeln!(out, "{}", key)?;
                writeln!(out, "{}", value)?;
            }
            out.sync_all()?;
        }

        let final_path = inner.snapshot_path(last_index);
        fs::rename(&inner.temp_path, &final_path)?;
        File::open(&inner.dir)?.sync_all()?;

        tracing::info!(path = %final_path.display(), "snapshot created");
        inner.cleanup(SNAPSHOTS_TO_KEEP);
        Ok(())
    }

    /// Load the newest readable snapshot for this server id.
    ///
    /// A corrupt file is skipped with a warning and the next older one is
    /// tried; `None` means no usable snapshot exists.
    pub fn load_latest(&self) -> Option<(HashMap<String, String>, SnapshotMetadata)> {
        let inner = self.inner.lock().unwrap();
        for (_, path) in inner.snapshots_newest_first() {
            match read_snapshot(&path) {
                Ok(loaded) => {
                    tracing::info!(path = %path.display(), "loaded snapshot");
                    return Some(loaded);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "rejecting snapshot");
                }
            }
        }
        None
    }

    /// Header of the newest readable snapshot, without reading the body.
    pub fn metadata(&self) -> Option<SnapshotMetadata> {
        let inner = self.inner.lock().unwrap();
        for (_, path) in inner.snapshots_newest_first() {
            if let Ok(meta) = read_header(&path) {
                return Some(meta);
            }
        }
        None
    }

    /// Read up to `max` bytes of the newest snapshot starting at `offset`,
    /// for chunked transfer to a lagging follower.
    pub fn read_chunk(&self, offset: u64, max: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let Some((_, path)) = inner.snapshots_newest_first().into_iter().next() else {
            return Err(LogKvError::CorruptSnapshot("no snapshot to read".to_string()));
        };
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; max];
        let mut read = 0;
        while read < max {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Stage one received chunk into the temp file. When `is_last` is set,
    /// the header is parsed to pick the final name and the file is renamed
    /// into place; the covered position is returned so the caller can
    /// install it.
    pub fn write_chunk(
        &self,
        offset: u64,
        data: &[u8],
        is_last: bool,
    ) -> Result<Option<SnapshotMetadata>> {
        let inner = self.inner.lock().unwrap();

        let mut file = if offset == 0 {
            File::create(&inner.temp_path)?
        } else {
            OpenOptions::new().write(true).open(&inner.temp_path)?
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if !is_last {
            return Ok(None);
        }

        let meta = read_header(&inner.temp_path)?;
        let final_path = inner.snapshot_path(meta.last_included_index);
        fs::rename(&inner.temp_path, &final_path)?;
        File::open(&inner.dir)?.sync_all()?;
        tracing::info!(
            last_index = meta.last_included_index,
            "received and installed snapshot"
        );
        inner.cleanup(SNAPSHOTS_TO_KEEP);
        Ok(Some(meta))
    }
}

impl SnapshotInner {
    fn snapshot_path(&self, last_index: LogIndex) -> PathBuf {
        self.dir
            .join(format!("snapshot_{}_idx_{}.snap", self.server_id, last_index))
    }

    /// Snapshot files for this server id, newest first. Filenames that do
    /// not match the grammar are ignored.
    fn snapshots_newest_first(&self) -> Vec<(LogIndex, PathBuf)> {
        let prefix = format!("snapshot_{}_idx_", self.server_id);
        let mut found = Vec::new();

        let Ok(dir) = fs::read_dir(&self.dir) else {
            return found;
        };
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(index) = rest.strip_suffix(".snap") else {
                continue;
            };
            if let Ok(index) = index.parse::<LogIndex>() {
                found.push((index, entry.path()));
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found
    }

    fn cleanup(&self, keep: usize) {
        for (_, path) in self.snapshots_newest_first().into_iter().skip(keep) {
            tracing::info!(path = %path.display(), "deleting old snapshot");
            let _ = fs::remove_file(path);
        }
    }
}

fn read_header(path: &PathBuf) -> Result<SnapshotMetadata> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = String::new();
    reader.read_line(&mut magic)?;
    if magic.trim_end() != SNAPSHOT_MAGIC {
        return Err(LogKvError::CorruptSnapshot(format!(
            "bad magic in {}",
            path.display()
        )));
    }

    let mut header = String::new();
    reader.read_line(&mut header)?;
    let mut tokens = header.split_whitespace();
    let parse = |t: Option<&str>| -> Result<u64> {
        t.and_then(|t| t.parse().ok())
            .ok_or_else(|| LogKvError::CorruptSnapshot("bad header".to_string()))
    };
    let last_included_index = parse(tokens.next())?;
    let last_included_term = parse(tokens.next())?;
    let data_size = parse(tokens.next())? as usize;

    Ok(SnapshotMetadata {
        last_included_index,
        last_included_term,
        data_size,
    })
}

fn read_snapshot(path: &PathBuf) -> Result<(HashMap<String, String>, SnapshotMetadata)> {
    let meta = read_header(path)?;

    let mut reader = BufReader::new(File::open(path)?);
    let mut skip = String::new();
    reader.read_line(&mut skip)?;
    skip.clear();
    reader.read_line(&mut skip)?;

    let mut data = HashMap::with_capacity(meta.data_size);
    for _ in 0..meta.data_size {
        let mut lens = String::new();
        if reader.read_line(&mut lens)? == 0 {
            return Err(LogKvError::CorruptSnapshot("truncated body".to_string()));
        }
        let mut tokens = lens.split_whitespace();
        let key_len = tokens
            .next()
            .and_then(|t| t.parse::<usize>().ok())
            .ok_or_else(|| LogKvError::CorruptSnapshot("bad pair header".to_string()))?;
        let value_len = tokens
            .next()
            .and_then(|t| t.parse::<usize>().ok())
            .ok_or_else(|| LogKvError::CorruptSnapshot("bad pair header".to_string()))?;

        let key = read_exact_line(&mut reader, key_len)?;
        let value = read_exact_line(&mut reader, value_len)?;
        data.insert(key, value);
    }

    Ok((data, meta))
}

fn read_exact_line(reader: &mut impl BufRead, expected: usize) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(LogKvError::CorruptSnapshot("truncated body".to_string()));
    }
    let text = line.trim_end_matches('\n');
    if text.len() != expected {
        return Err(LogKvError::CorruptSnapshot(format!(
            "length mismatch: declared {}, found {}",
            expected,
            text.len()
        )));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_data() -> HashMap<String, String> {
        let mut data = HashMap::new();
        data.insert("alpha".to_string(), "42".to_string());
        data.insert("beta".to_string(), "7".to_string());
        data
    }

    #[test]
    fn create_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1).unwrap();

        manager.create(&sample_data(), 10, 2).unwrap();

        let (data, meta) = manager.load_latest().unwrap();
        assert_eq!(data, sample_data());
        assert_eq!(
            meta,
            SnapshotMetadata {
                last_included_index: 10,
                last_included_term: 2,
                data_size: 2
            }
        );
    }

    #[test]
    fn latest_snapshot_wins() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1).unwrap();

        manager.create(&sample_data(), 10, 2).unwrap();
        let mut newer = sample_data();
        newer.insert("gamma".to_string(), "9".to_string());
        manager.create(&newer, 25, 3).unwrap();

        let meta = manager.metadata().unwrap();
        assert_eq!(meta.last_included_index, 25);
        let (data, _) = manager.load_latest().unwrap();
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn cleanup_keeps_two_most_recent() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1).unwrap();

        for idx in [10, 20, 30] {
            manager.create(&sample_data(), idx, 1).unwrap();
        }

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"snapshot_1_idx_20.snap".to_string()));
        assert!(names.contains(&"snapshot_1_idx_30.snap".to_string()));
    }

    #[test]
    fn interrupted_create_leaves_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1).unwrap();
        manager.create(&sample_data(), 10, 2).unwrap();

        // simulate a crash mid-write: a half-written temp file is left behind
        fs::write(dir.path().join("temp_1.snap"), "LOGKV_SNAPSHOT_V1\n25 3").unwrap();

        let (_, meta) = manager.load_latest().unwrap();
        assert_eq!(meta.last_included_index, 10);
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_older() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1).unwrap();
        manager.create(&sample_data(), 10, 2).unwrap();

        // a newer snapshot whose body was cut short
        fs::write(
            dir.path().join("snapshot_1_idx_20.snap"),
            "LOGKV_SNAPSHOT_V1\n20 3 5\n1 1\na\n",
        )
        .unwrap();

        let (data, meta) = manager.load_latest().unwrap();
        assert_eq!(meta.last_included_index, 10);
        assert_eq!(data, sample_data());
    }

    #[test]
    fn ignores_other_servers_snapshots() {
        let dir = TempDir::new().unwrap();
        let manager_one = SnapshotManager::new(dir.path(), 1).unwrap();
        let manager_two = SnapshotManager::new(dir.path(), 2).unwrap();

        manager_two.create(&sample_data(), 50, 4).unwrap();
        assert!(manager_one.load_latest().is_none());
        assert!(manager_one.metadata().is_none());
    }

    #[test]
    fn chunked_transfer_reassembles_snapshot() {
        let dir_leader = TempDir::new().unwrap();
        let dir_follower = TempDir::new().unwrap();
        let leader = SnapshotManager::new(dir_leader.path(), 1).unwrap();
        let follower = SnapshotManager::new(dir_follower.path(), 2).unwrap();

        leader.create(&sample_data(), 10, 2).unwrap();

        let mut offset = 0u64;
        loop {
            let chunk = leader.read_chunk(offset, 8).unwrap();
            let done = chunk.len() < 8;
            let installed = follower.write_chunk(offset, &chunk, done).unwrap();
            offset += chunk.len() as u64;
            if done {
                let meta = installed.unwrap();
                assert_eq!(meta.last_included_index, 10);
                break;
            }
            assert!(installed.is_none());
        }

        let (data, _) = follower.load_latest().unwrap();
        assert_eq!(data, sample_data());
    }
}
