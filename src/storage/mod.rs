pub mod snapshot;
pub mod wal;

pub use snapshot::{SnapshotManager, SnapshotMetadata};
pub use wal::WriteAheadLog;
