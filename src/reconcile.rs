//! Bring the record store and the video index back in agreement.

use std::fs;

use tracing::{debug, info, warn};

use crate::{
    index::VideoIndex,
    outside::{process, MediaInspector},
    result::Result,
    store::RecordStore,
    types::{Progress, Status},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Orphan records deleted plus index entries dropped
    pub removed: usize,
    /// Records refreshed from their media file
    pub refreshed: usize,
}

/// Bring the store, the index and the media files back in agreement.
///
/// Records missing from the index are deleted, index entries without a
/// record are dropped, and listed jobs are refreshed from their file.
/// Recordings and jobs whose process still runs are never touched, nor
/// is anything whose file cannot be read.
pub fn reconcile(
    store: &dyn RecordStore,
    index: &mut VideoIndex,
    inspector: &dyn MediaInspector,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for key in store.keys() {
        if index.contains(&key) {
            continue;
        }
        if let Some(record) = store.reload(&key) {
            if record.status == Status::Recording {
                debug!("Unlisted job {key} is recording, kept");
                continue;
            }
            if let Some(pid) = running_pid(record.download.pid) {
                debug!("Unlisted job {key} is owned by running process {pid}, kept");
                continue;
            }
        }
        if store.delete(&key) {
            info!("Deleted orphan record {key}");
            report.removed += 1;
        }
    }

    let dropped = index.retain(|id| store.reload(id).is_some())?;
    if dropped > 0 {
        info!("Dropped {dropped} index entries without record");
    }
    report.removed += dropped;

    for id in index.ids().to_vec() {
        let Some(mut record) = store.reload(&id) else {
            continue;
        };
        if record.status == Status::Recording {
            continue;
        }
        if let Some(pid) = running_pid(record.download.pid) {
            debug!("Job {id} is owned by running process {pid}, skipped");
            continue;
        }
        let Some(path) = record.file.path.clone() else {
            continue;
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) => {
                debug!("Could not stat {} for job {id}: {err}", path.display());
                continue;
            }
        };

        record.status = Status::Completed;
        record.error = None;
        record.download.pid = None;
        record.download.progress = Progress::DONE;
        record.file.size = Some(meta.len());
        match inspector.inspect(&path) {
            Ok(media) => record.file.media = media,
            Err(err) => debug!("Could not inspect {}: {err}", path.display()),
        }
        record.touch();

        if store.set(&id, &record) {
            report.refreshed += 1;
        } else {
            warn!("Could not refresh job {id}");
        }
    }

    Ok(report)
}

fn running_pid(pid: Option<u32>) -> Option<u32> {
    pid.filter(|pid| process::is_alive(*pid))
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use uuid::Uuid;

    use super::*;
    use crate::{result::bail, store::FileStore, types::JobRecord, types::MediaInfo};

    struct NoInspector;

    impl MediaInspector for NoInspector {
        fn inspect(&self, _path: &Path) -> Result<MediaInfo> {
            bail("no inspection in tests")
        }

        fn repair(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: FileStore,
        index: VideoIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let records = dir.path().join("records");
            let store = FileStore::open(&records, 16, Duration::from_secs(60)).unwrap();
            let index = VideoIndex::read_or_create(records.join("videos.list")).unwrap();
            Self { dir, store, index }
        }

        fn add(&mut self, listed: bool, f: impl FnOnce(&mut JobRecord)) -> JobRecord {
            let mut record = JobRecord::new("https://example.com/v", "best");
            f(&mut record);
            assert!(self.store.set(&record.uuid, &record));
            if listed {
                self.index.push(record.uuid).unwrap();
            }
            record
        }

        fn media(&self, name: &str, content: &[u8]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn run(&mut self) -> ReconcileReport {
            reconcile(&self.store, &mut self.index, &NoInspector).unwrap()
        }
    }

    #[test]
    fn orphan_records_are_deleted() {
        let mut fx = Fixture::new();
        let listed = [fx.add(true, |_| ()), fx.add(true, |_| ())];
        let orphan = fx.add(false, |_| ());
        let before: Vec<Vec<u8>> = listed
            .iter()
            .map(|r| fs::read(fx.store.path_for(&r.uuid)).unwrap())
            .collect();

        let report = fx.run();

        assert_eq!(report, ReconcileReport { removed: 1, refreshed: 0 });
        assert!(!fx.store.path_for(&orphan.uuid).exists());
        for (record, content) in listed.iter().zip(before) {
            assert_eq!(fs::read(fx.store.path_for(&record.uuid)).unwrap(), content);
        }
    }

    #[test]
    fn unlisted_recording_is_kept() {
        let mut fx = Fixture::new();
        let recording = fx.add(false, |r| {
            r.status = Status::Recording;
            r.is_live = true;
        });

        assert_eq!(fx.run().removed, 0);
        assert_eq!(fx.store.reload(&recording.uuid), Some(recording));
    }

    #[cfg(unix)]
    #[test]
    fn running_jobs_are_left_alone() {
        let mut fx = Fixture::new();
        let file = fx.media("partial.mp4", b"0123");
        let mut running = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = running.id();

        let listed = fx.add(true, |r| {
            r.status = Status::Downloading;
            r.download.pid = Some(pid);
            r.file.set_path(&file);
        });
        let unlisted = fx.add(false, |r| {
            r.status = Status::Downloading;
            r.download.pid = Some(pid);
        });

        let report = fx.run();
        running.kill().unwrap();
        running.wait().unwrap();

        assert_eq!(report, ReconcileReport { removed: 0, refreshed: 0 });
        assert_eq!(fx.store.reload(&listed.uuid), Some(listed));
        assert_eq!(fx.store.reload(&unlisted.uuid), Some(unlisted));
    }

    #[test]
    fn entries_without_record_are_dropped() {
        let mut fx = Fixture::new();
        let kept = fx.add(true, |_| ());
        fx.index.push(Uuid::new_v4()).unwrap();

        assert_eq!(fx.run().removed, 1);
        assert_eq!(fx.index.ids(), &[kept.uuid]);
    }

    #[test]
    fn finished_files_are_refreshed() {
        let mut fx = Fixture::new();
        let file = fx.media("done.mp4", b"0123456789");
        let missing = fx.dir.path().join("missing.mp4");

        let done = fx.add(true, |r| {
            r.status = Status::Failed;
            r.error = Some("ERROR: interrupted".into());
            r.file.set_path(&file);
        });
        let gone = fx.add(true, |r| {
            r.status = Status::Downloading;
            r.file.set_path(&missing);
        });
        let recording = fx.add(true, |r| {
            r.status = Status::Recording;
            r.is_live = true;
            r.file.set_path(&file);
        });

        let report = fx.run();
        assert_eq!(report, ReconcileReport { removed: 0, refreshed: 1 });

        let done = fx.store.reload(&done.uuid).unwrap();
        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.error, None);
        assert_eq!(done.file.size, Some(10));
        assert_eq!(done.download.progress, Progress::DONE);

        assert_eq!(fx.store.reload(&gone.uuid), Some(gone));
        assert_eq!(fx.store.reload(&recording.uuid), Some(recording));

        // Running it again changes nothing more
        let report = fx.run();
        assert_eq!(report.removed, 0);
        assert_eq!(fx.store.reload(&done.uuid).unwrap().status, Status::Completed);
    }
}
