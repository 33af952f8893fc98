use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use miette::{bail, Context, IntoDiagnostic, Result};
use serde::Deserialize;
use tracing::debug;

use crate::types::Container;

/// Configuration file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "mediajobs.toml";

/// Prefix of the environment variables overriding the configuration file
pub const ENV_PREFIX: &str = "MEDIAJOBS";

/// Name of the index file, stored next to the records
const INDEX_FILE: &str = "videos.list";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the media files are written
    pub downloads_dir: PathBuf,
    /// Where the job records and the index are kept
    pub records_dir: PathBuf,

    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,

    /// Format selection used when a job does not ask for one
    pub default_format: String,
    pub output_template: String,
    pub merge_container: Container,

    pub persist_interval_ms: u64,
    pub cache_capacity: u64,
    pub cache_ttl_secs: u64,
    pub stop_timeout_secs: u64,
    pub stuck_after_secs: u64,

    /// Cookie file handed to the download tool
    pub cookies: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            records_dir: PathBuf::from("records"),
            ytdlp: PathBuf::from("yt-dlp"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            default_format: "bestvideo*+bestaudio/best".to_owned(),
            output_template: "%(title)s (%(id)s).%(ext)s".to_owned(),
            merge_container: Container::Mp4,
            persist_interval_ms: 500,
            cache_capacity: 256,
            cache_ttl_secs: 600,
            stop_timeout_secs: 10,
            stuck_after_secs: 120,
            cookies: None,
        }
    }
}

impl Settings {
    /// Layer the defaults, the configuration file and the environment.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .into_diagnostic()
            .wrap_err("Could not load the configuration")?
            .try_deserialize()
            .into_diagnostic()
            .wrap_err("Invalid configuration")?;

        settings.validate()?;
        debug!("Loaded settings: {settings:?}");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("persist_interval_ms", self.persist_interval_ms),
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("stuck_after_secs", self.stuck_after_secs),
            ("cache_capacity", self.cache_capacity),
        ];
        for (key, value) in intervals {
            if value == 0 {
                bail!("'{key}' must not be zero");
            }
        }
        Ok(())
    }

    /// Create the working directories and make them absolute,
    /// so that the paths printed by the download tool can be recognized.
    pub fn prepare_dirs(&mut self) -> Result<()> {
        for dir in [&mut self.downloads_dir, &mut self.records_dir] {
            std::fs::create_dir_all(&*dir)
                .into_diagnostic()
                .wrap_err_with(|| format!("Could not create directory {}", dir.display()))?;
            *dir = dir
                .canonicalize()
                .into_diagnostic()
                .wrap_err_with(|| format!("Could not resolve directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.records_dir.join(INDEX_FILE)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}
