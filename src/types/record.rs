use std::{
    fmt::Display,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{MediaInfo, Metadata, Progress};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Standby,
    Downloading,
    Recording,
    Merging,
    Completed,
    Failed,
    /// The output file was already present; informational, not an error
    Already,
}

impl Status {
    /// Whether no further line of output can change the status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Already)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Standby => "standby",
            Status::Downloading => "downloading",
            Status::Recording => "recording",
            Status::Merging => "merging",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Already => "already",
        })
    }
}

/// Where the media lands on disk, and what it contains once finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(flatten)]
    pub media: MediaInfo,
}

impl FileInfo {
    /// Point the record at a new file, keeping `name` in sync with `path`.
    pub fn set_path(&mut self, path: &Path) {
        self.name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        self.path = Some(path.to_path_buf());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub current: u32,
    pub count: u32,
}

/// Volatile transfer state, rewritten often while a process runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    /// Process currently owning the job, if any
    #[serde(default)]
    pub pid: Option<u32>,

    #[serde(default)]
    pub progress: Progress,

    #[serde(default)]
    pub speed: Option<String>,

    #[serde(default)]
    pub filesize: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<Playlist>,
}

/// Persisted state of one download or recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub uuid: Uuid,
    pub status: Status,
    pub url: String,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub is_live: bool,

    /// Format selection passed to the transfer tool, reused on restart
    pub format: String,

    #[serde(default)]
    pub file: FileInfo,
    #[serde(default)]
    pub download: DownloadInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRecord {
    pub fn new(url: impl Into<String>, format: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            uuid: Uuid::new_v4(),
            status: Status::Standby,
            url: url.into(),
            title: String::new(),
            description: String::new(),
            thumbnail: String::new(),
            is_live: false,
            format: format.into(),
            file: FileInfo::default(),
            download: DownloadInfo::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    /// Copy the descriptive fields from a probe.
    ///
    /// Finished VOD jobs keep what they had; live jobs are always refreshed.
    pub fn apply_metadata(&mut self, metadata: &Metadata) {
        if self.status.is_terminal() && !self.is_live && !metadata.is_live {
            return;
        }
        self.title = metadata.title.clone();
        self.description = metadata.description.clone();
        self.thumbnail = metadata.thumbnail.clone();
        self.is_live = metadata.is_live;
    }

    /// Move to `failed`, keeping only the first line of the message.
    pub fn fail(&mut self, message: &str) {
        let line = message.lines().map(str::trim).find(|l| !l.is_empty());
        self.status = Status::Failed;
        self.error = Some(line.unwrap_or("Unknown error").to_owned());
        self.download.pid = None;
    }

    /// Forget everything about the previous process before a new launch.
    pub fn reset_for_restart(&mut self) {
        self.status = Status::Standby;
        self.error = None;
        self.download = DownloadInfo::default();
    }

    /// A transfer that has not reported anything for `threshold`.
    ///
    /// Live recordings can stay silent for long stretches and are never stuck.
    pub fn is_stuck(&self, now: i64, threshold: Duration) -> bool {
        let silent_for = now.saturating_sub(self.updated_at);
        matches!(self.status, Status::Downloading | Status::Merging)
            && silent_for >= threshold.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_with_camel_case_fields() {
        let mut record = JobRecord::new("https://example.com/v", "best");
        record.is_live = true;
        record.download.pid = Some(42);
        record.file.set_path(Path::new("/downloads/Title (abc).mp4"));
        record.file.media.codec_name = Some("h264".into());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "standby");
        assert_eq!(json["isLive"], true);
        assert_eq!(json["download"]["pid"], 42);
        assert_eq!(json["download"]["progress"], "0");
        assert_eq!(json["file"]["name"], "Title (abc).mp4");
        assert_eq!(json["file"]["codecName"], "h264");
        assert!(json.get("error").is_none());
        assert!(json.get("createdAt").is_some());

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn fail_keeps_first_line_and_releases_pid() {
        let mut record = JobRecord::new("u", "f");
        record.download.pid = Some(7);
        record.fail("ERROR: Video unavailable\nsecond line");
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.error.as_deref(), Some("ERROR: Video unavailable"));
        assert_eq!(record.download.pid, None);
    }

    #[test]
    fn finished_vod_metadata_is_immutable() {
        let mut record = JobRecord::new("u", "f");
        record.status = Status::Completed;
        record.title = "Old".into();

        let metadata = Metadata {
            title: "New".into(),
            ..Default::default()
        };
        record.apply_metadata(&metadata);
        assert_eq!(record.title, "Old");

        record.is_live = true;
        record.apply_metadata(&Metadata {
            title: "New".into(),
            is_live: true,
            ..Default::default()
        });
        assert_eq!(record.title, "New");
    }

    #[test]
    fn stuck_only_applies_to_silent_transfers() {
        let mut record = JobRecord::new("u", "f");
        record.status = Status::Downloading;
        let threshold = Duration::from_secs(60);

        assert!(!record.is_stuck(record.updated_at + 1_000, threshold));
        assert!(record.is_stuck(record.updated_at + 61_000, threshold));

        record.status = Status::Recording;
        assert!(!record.is_stuck(record.updated_at + 61_000, threshold));
    }

    #[test]
    fn touch_never_goes_backwards() {
        let mut record = JobRecord::new("u", "f");
        record.updated_at = i64::MAX - 1;
        record.touch();
        assert_eq!(record.updated_at, i64::MAX - 1);
    }
}
