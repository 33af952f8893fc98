use std::path::{Path, PathBuf};

use tracing::debug;

use super::command::{assert_success_command, run_command, Capture, FFXXX_DEFAULT_ARGS};
use crate::{
    io::sibling_tempfile,
    result::{bail, err_msg, Error, Result},
    types::MediaInfo,
};

pub trait MediaInspector: Send + Sync {
    /// Extract the technical attributes of a finished file.
    fn inspect(&self, path: &Path) -> Result<MediaInfo>;

    /// Re-mux a file whose container index may be incomplete, e.g. an
    /// interrupted live recording. The original is only replaced once the
    /// repaired copy is fully written.
    fn repair(&self, path: &Path) -> Result<()>;
}

/// Interface for the [ffmpeg and ffprobe](https://ffmpeg.org) programs
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    /// Verify that the `ffmpeg` and `ffprobe` binaries are reachable
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Result<Self> {
        let this = Self::unchecked(ffmpeg, ffprobe);
        assert_success_command(&this.ffmpeg, |cmd| cmd.arg("-version"))?;
        assert_success_command(&this.ffprobe, |cmd| cmd.arg("-version"))?;

        Ok(this)
    }

    pub fn unchecked(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

impl MediaInspector for Ffmpeg {
    fn inspect(&self, path: &Path) -> Result<MediaInfo> {
        let res = run_command(
            &self.ffprobe,
            |cmd| {
                cmd.args(FFXXX_DEFAULT_ARGS)
                    .args(["-show_streams", "-show_format"])
                    .args(["-of", "json"])
                    .arg(path)
            },
            Capture::STDOUT,
        )?;

        if !res.status.success() {
            return bail(format!("ffprobe could not read {}", path.display()));
        }

        let stdout = String::from_utf8_lossy(&res.stdout);
        MediaInfo::from_ffprobe_json(&stdout)
            .map_err(|err| err_msg(format!("Could not parse ffprobe output: {err}")))
    }

    fn repair(&self, path: &Path) -> Result<()> {
        // Must live until the persist below, its drop deletes the file
        let tmp = sibling_tempfile(path)?;

        debug!("Repairing {} through {}", path.display(), tmp.path().display());
        assert_success_command(&self.ffmpeg, |cmd| {
            cmd.args(FFXXX_DEFAULT_ARGS)
                .arg("-y")
                .arg("-i")
                .arg(path)
                .args(["-map", "0", "-c", "copy"])
                .arg(tmp.path())
        })
        .map_err(|err| err.wrap_err_with(|| format!("Could not repair {}", path.display())))?;

        tmp.persist(path).map_err(|err| Error::from(err.error))?;
        Ok(())
    }
}
