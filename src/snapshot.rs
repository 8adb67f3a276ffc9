use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::error::SnapshotError;
use crate::storage::MarketStore;

const PREFIX: &str = "market_snapshot_";
const EXTENSION: &str = "duckdb";

/// Timestamped file copies of the database with bounded retention.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    db_path: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

impl SnapshotManager {
    pub fn new(db_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            db_path: db_path.into(),
            backup_dir: backup_dir.into(),
            max_backups,
        }
    }

    /// Checkpoints an open store, then snapshots its file.
    pub fn snapshot_store(&self, store: &MarketStore) -> Result<PathBuf, SnapshotError> {
        store.checkpoint()?;
        self.perform_snapshot()
    }

    pub fn perform_snapshot(&self) -> Result<PathBuf, SnapshotError> {
        self.perform_snapshot_at(Utc::now())
    }

    /// Copies the database to `market_snapshot_YYYYMMDD_HHMMSS.duckdb` and
    /// drops the oldest copies beyond the retention limit.
    ///
    /// # Errors
    /// [`SnapshotError::DatabaseMissing`] when there is nothing to copy, or an
    /// I/O error from the copy itself. Failing to delete an old copy is only
    /// logged.
    pub fn perform_snapshot_at(&self, at: DateTime<Utc>) -> Result<PathBuf, SnapshotError> {
        if !self.db_path.is_file() {
            return Err(SnapshotError::DatabaseMissing(
                self.db_path.display().to_string(),
            ));
        }
        fs::create_dir_all(&self.backup_dir)?;

        let file_name = format!("{PREFIX}{}.{EXTENSION}", at.format("%Y%m%d_%H%M%S"));
        let target = self.backup_dir.join(file_name);
        let bytes = fs::copy(&self.db_path, &target)?;
        info!(path = %target.display(), bytes, "snapshot created");

        self.rotate()?;
        Ok(target)
    }

    /// Snapshot files currently kept, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            if !is_snapshot_file(&path) {
                continue;
            }
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path));
        }
        files.sort();

        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    fn rotate(&self) -> Result<(), SnapshotError> {
        let files = self.list_snapshots()?;
        let excess = files.len().saturating_sub(self.max_backups.max(1));

        for path in files.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed old snapshot"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove old snapshot"),
            }
        }
        Ok(())
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(PREFIX));
    name_matches && path.extension().is_some_and(|ext| ext == EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn missing_database_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path().join("absent.duckdb"), dir.path().join("b"), 4);

        assert!(matches!(
            manager.perform_snapshot(),
            Err(SnapshotError::DatabaseMissing(_))
        ));
    }

    #[test]
    fn snapshot_copies_the_file_with_a_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("market.duckdb");
        fs::write(&db, b"contents").unwrap();
        let manager = SnapshotManager::new(&db, dir.path().join("backups"), 4);
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 3, 4, 5).unwrap();

        let path = manager.perform_snapshot_at(at).unwrap();

        assert!(path.ends_with("market_snapshot_20240201_030405.duckdb"));
        assert_eq!(fs::read(&path).unwrap(), b"contents");
    }

    #[test]
    fn rotation_keeps_the_newest_copies() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("market.duckdb");
        fs::write(&db, b"contents").unwrap();
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("notes.txt"), b"keep me").unwrap();
        let manager = SnapshotManager::new(&db, &backups, 2);
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        for minute in 0..4 {
            manager
                .perform_snapshot_at(start + Duration::minutes(minute))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let kept: Vec<String> = manager
            .list_snapshots()
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        assert_eq!(
            kept,
            vec![
                "market_snapshot_20240201_000200.duckdb",
                "market_snapshot_20240201_000300.duckdb"
            ]
        );
        assert!(backups.join("notes.txt").exists());
    }

    #[test]
    fn open_store_can_be_snapshotted() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarketStore::open(dir.path().join("market.duckdb")).unwrap();
        let manager = SnapshotManager::new(store.path(), dir.path().join("backups"), 4);

        let path = manager.snapshot_store(&store).unwrap();

        assert!(path.is_file());
        assert_eq!(manager.list_snapshots().unwrap().len(), 1);
    }
}
