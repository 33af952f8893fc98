//! Job records as JSON files, one per job, behind a recency cache.

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use miette::{Context, IntoDiagnostic, Result};
use moka::{policy::EvictionPolicy, sync::Cache};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{io::write_atomic, types::JobRecord};

/// Every record file name starts with this prefix, followed by the uuid.
const RECORD_PREFIX: &str = "video-";
const RECORD_EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

/// Durable storage for job records, one self-contained document per key.
///
/// Writes replace the whole record. Failures are never raised: reads
/// report an absent record and writes report `false`, leaving the caller
/// to decide whether to retry.
pub trait RecordStore: Send + Sync {
    /// Get the record, going through any cache in front of the storage.
    fn get(&self, key: &Uuid) -> Option<JobRecord>;

    /// Get the record straight from the storage, refreshing the cache.
    ///
    /// Used before acting on ownership-sensitive fields that another
    /// program may have written.
    fn reload(&self, key: &Uuid) -> Option<JobRecord>;

    /// Replace the whole record stored under `key`.
    fn set(&self, key: &Uuid, record: &JobRecord) -> bool;

    /// Read the stored record, change it and write it back, with no other
    /// `set` or `update` of the key in between, whatever program runs it.
    ///
    /// `apply` returns whether the changed record must be written. Return
    /// whether it was. An absent record is left absent.
    fn update(&self, key: &Uuid, apply: &mut dyn FnMut(&mut JobRecord) -> bool) -> bool;

    /// Remove the record. Removing an absent record succeeds.
    fn delete(&self, key: &Uuid) -> bool;

    /// Keys of every persisted record, in no particular order.
    fn keys(&self) -> Vec<Uuid>;
}

/// [`RecordStore`] keeping each record as a JSON file in a directory,
/// behind a bounded, time-expiring LRU cache.
pub struct FileStore {
    dir: PathBuf,
    cache: Cache<Uuid, JobRecord>,
}

impl FileStore {
    /// Open the store in `dir`, creating the directory if needed.
    pub fn open(dir: &Path, capacity: u64, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .into_diagnostic()
            .wrap_err_with(|| format!("Could not create records directory {}", dir.display()))?;

        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Ok(Self {
            dir: dir.to_path_buf(),
            cache,
        })
    }

    pub fn path_for(&self, key: &Uuid) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{key}.{RECORD_EXTENSION}"))
    }

    fn lock_path(&self, key: &Uuid) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{key}.{LOCK_EXTENSION}"))
    }

    /// Hold the key until the returned file is dropped.
    fn lock(&self, key: &Uuid) -> std::io::Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(key))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn write_file(&self, key: &Uuid, record: &JobRecord) -> bool {
        let path = self.path_for(key);
        let written = serde_json::to_vec_pretty(record)
            .map_err(std::io::Error::other)
            .and_then(|data| write_atomic(&path, &data));

        match written {
            Ok(()) => {
                debug!("Record {key} saved with status {}", record.status);
                self.cache.insert(*key, record.clone());
                true
            }
            Err(err) => {
                warn!("Could not write record {}: {err}", path.display());
                self.cache.invalidate(key);
                false
            }
        }
    }

    fn read_file(&self, key: &Uuid) -> Option<JobRecord> {
        let path = self.path_for(key);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Could not read record {}: {err}", path.display());
                return None;
            }
        };

        match serde_json::from_slice::<JobRecord>(&data) {
            Ok(record) => {
                self.cache.insert(*key, record.clone());
                Some(record)
            }
            Err(err) => {
                warn!("Record {} is not valid: {err}", path.display());
                None
            }
        }
    }
}

/// Parse the key out of a record file name, if it is one.
fn key_from_file_name(name: &str) -> Option<Uuid> {
    let stem = name
        .strip_prefix(RECORD_PREFIX)?
        .strip_suffix(RECORD_EXTENSION)?
        .strip_suffix('.')?;
    Uuid::parse_str(stem).ok()
}

impl RecordStore for FileStore {
    fn get(&self, key: &Uuid) -> Option<JobRecord> {
        if let Some(record) = self.cache.get(key) {
            trace!("Record {key} served from cache");
            return Some(record);
        }
        self.read_file(key)
    }

    fn reload(&self, key: &Uuid) -> Option<JobRecord> {
        self.cache.invalidate(key);
        self.read_file(key)
    }

    fn set(&self, key: &Uuid, record: &JobRecord) -> bool {
        let _lock = match self.lock(key) {
            Ok(lock) => lock,
            Err(err) => {
                warn!("Could not lock record {key}: {err}");
                self.cache.invalidate(key);
                return false;
            }
        };
        self.write_file(key, record)
    }

    fn update(&self, key: &Uuid, apply: &mut dyn FnMut(&mut JobRecord) -> bool) -> bool {
        let _lock = match self.lock(key) {
            Ok(lock) => lock,
            Err(err) => {
                warn!("Could not lock record {key}: {err}");
                return false;
            }
        };

        let Some(mut record) = self.reload(key) else {
            return false;
        };
        if !apply(&mut record) {
            trace!("Record {key} left unchanged");
            return false;
        }
        self.write_file(key, &record)
    }

    fn delete(&self, key: &Uuid) -> bool {
        let path = self.path_for(key);
        self.cache.invalidate(key);
        let _ = std::fs::remove_file(self.lock_path(key));

        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Record {key} deleted");
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                warn!("Could not delete record {}: {err}", path.display());
                false
            }
        }
    }

    fn keys(&self) -> Vec<Uuid> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Could not list records in {}: {err}", self.dir.display());
                return vec![];
            }
        };

        entries
            .flatten()
            .filter_map(|entry| key_from_file_name(&entry.file_name().to_string_lossy()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    fn open(dir: &Path) -> FileStore {
        FileStore::open(dir, 16, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn missing_record_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open(dir.path()).get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn set_then_get_from_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let record = JobRecord::new("https://example.com/v", "best");

        assert!(open(dir.path()).set(&record.uuid, &record));

        // A new instance has an empty cache and must read the file
        let store = open(dir.path());
        assert_eq!(store.get(&record.uuid), Some(record.clone()));
        assert!(store
            .path_for(&record.uuid)
            .ends_with(format!("video-{}.json", record.uuid)));
    }

    #[test]
    fn reload_sees_writes_from_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = JobRecord::new("u", "f");

        let first = open(dir.path());
        let second = open(dir.path());
        assert!(first.set(&record.uuid, &record));
        assert_eq!(second.get(&record.uuid).unwrap().status, Status::Standby);

        record.status = Status::Downloading;
        assert!(first.set(&record.uuid, &record));

        // The cached copy is stale until reloaded
        assert_eq!(second.get(&record.uuid).unwrap().status, Status::Standby);
        assert_eq!(second.reload(&record.uuid).unwrap().status, Status::Downloading);
        assert_eq!(second.get(&record.uuid).unwrap().status, Status::Downloading);
    }

    #[test]
    fn corrupt_record_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let key = Uuid::new_v4();
        std::fs::write(store.path_for(&key), b"{ not json").unwrap();
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn failed_write_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join("records");
        let store = open(&records);
        let mut record = JobRecord::new("u", "f");
        assert!(store.set(&record.uuid, &record));

        std::fs::remove_dir_all(&records).unwrap();
        record.status = Status::Failed;
        assert!(!store.set(&record.uuid, &record));

        // Neither the old cached value nor the unwritten one is served
        assert!(store.get(&record.uuid).is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let record = JobRecord::new("u", "f");
        assert!(store.set(&record.uuid, &record));

        assert!(store.delete(&record.uuid));
        assert!(store.get(&record.uuid).is_none());
        assert!(store.delete(&record.uuid));
    }

    #[test]
    fn update_writes_only_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let record = JobRecord::new("u", "f");
        assert!(store.set(&record.uuid, &record));

        assert!(!store.update(&record.uuid, &mut |r| {
            r.status = Status::Failed;
            false
        }));
        assert_eq!(store.reload(&record.uuid), Some(record.clone()));

        assert!(store.update(&record.uuid, &mut |r| {
            r.status = Status::Downloading;
            true
        }));
        assert_eq!(store.reload(&record.uuid).unwrap().status, Status::Downloading);

        let absent = Uuid::new_v4();
        assert!(!store.update(&absent, &mut |_| true));
        assert!(store.reload(&absent).is_none());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let record = JobRecord::new("u", "f");
        assert!(open(dir.path()).set(&record.uuid, &record));

        // One store per thread, like separate programs sharing the directory
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let store = open(dir.path());
                let key = record.uuid;
                scope.spawn(move || {
                    for _ in 0..10 {
                        assert!(store.update(&key, &mut |r| {
                            r.title.push('x');
                            true
                        }));
                    }
                });
            }
        });

        let stored = open(dir.path()).get(&record.uuid).unwrap();
        assert_eq!(stored.title.len(), 40);
    }

    #[test]
    fn keys_ignore_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let record = JobRecord::new("u", "f");
        assert!(store.set(&record.uuid, &record));
        std::fs::write(dir.path().join("videos.list"), b"").unwrap();
        std::fs::write(dir.path().join("video-nope.json"), b"{}").unwrap();

        assert_eq!(store.keys(), vec![record.uuid]);
    }
}
