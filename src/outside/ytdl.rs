use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{
    command::{assert_success_command, run_command, Capture},
    process::ProcessHandle,
};
use crate::{
    result::{Error, Result},
    types::{Container, Metadata},
};

/// Reported when the tool fails without saying why.
const GENERIC_PROBE_ERROR: &str = "Could not fetch the video information";

/// Everything needed to launch one transfer.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub url: &'a str,
    pub format: &'a str,
    pub output_dir: &'a Path,
    pub output_template: &'a str,
    pub container: Container,
    pub is_live: bool,
}

/// Interface for discovering and downloading videos
pub trait Downloader: Send + Sync {
    /// Fetch the video metadata without downloading anything.
    fn probe(&self, url: &str) -> Result<Metadata>;

    /// Start the transfer, returning as soon as the process runs.
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<ProcessHandle>;
}

/// Interface for the [yt-dlp](https://github.com/yt-dlp/yt-dlp) program
#[derive(Debug, Clone)]
pub struct Ytdl {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl Ytdl {
    /// Verify that the binary is reachable
    pub fn new(program: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Result<Self> {
        let ytdl = Self::unchecked(program, cookies);
        assert_success_command(&ytdl.program, |cmd| cmd.arg("--version"))
            .map_err(|err| err.wrap_err_with(|| format!("{} not found", ytdl.program.display())))?;
        Ok(ytdl)
    }

    /// Build the handle without checking the binary, for commands that may not need it
    pub fn unchecked(program: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies,
        }
    }

    /// Build the transfer arguments. The URL is always the last argument.
    pub fn launch_args(&self, request: &LaunchRequest<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            // One progress report per line instead of carriage returns
            "--newline".into(),
            "--no-colors".into(),
            "-f".into(),
            request.format.into(),
            "-P".into(),
            request.output_dir.into(),
            "-o".into(),
            request.output_template.into(),
            "--merge-output-format".into(),
            request.container.as_str().into(),
            // Print the final path once every post-processor is done
            "--print".into(),
            "after_move:filepath".into(),
            "--no-simulate".into(),
            "--no-quiet".into(),
        ];

        if request.is_live {
            args.push("--no-part".into());
        }

        if let Some(cookies) = &self.cookies {
            args.push("--cookies".into());
            args.push(cookies.into());
        }

        args.push("--".into());
        args.push(request.url.into());
        args
    }
}

/// Pick the most useful line of the tool's diagnostic output.
fn probe_error_message(stderr: &str) -> String {
    let lines = || stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    lines()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines().next())
        .unwrap_or(GENERIC_PROBE_ERROR)
        .to_owned()
}

impl Downloader for Ytdl {
    fn probe(&self, url: &str) -> Result<Metadata> {
        let res = run_command(
            &self.program,
            |cmd| {
                cmd.arg("--no-warnings")
                    .arg("-J")
                    .args(self.cookies.iter().flat_map(|c| [OsString::from("--cookies"), c.into()]))
                    .arg("--")
                    .arg(url)
            },
            Capture::STDOUT | Capture::STDERR,
        )
        .map_err(|err| Error::Probe(err.summary()))?;

        let stdout = String::from_utf8_lossy(&res.stdout);
        if !res.status.success() || stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&res.stderr);
            return Err(Error::Probe(probe_error_message(&stderr)));
        }

        let metadata = Metadata::from_json(&stdout).map_err(|err| {
            debug!("Invalid probe output for {url}: {err}");
            Error::Probe(GENERIC_PROBE_ERROR.into())
        })?;

        debug!(
            "Probed {url}: '{}' (live: {}, {} formats)",
            metadata.title,
            metadata.is_live,
            metadata.formats.len()
        );
        Ok(metadata)
    }

    fn launch(&self, request: &LaunchRequest<'_>) -> Result<ProcessHandle> {
        ProcessHandle::spawn(&self.program, &self.launch_args(request))
    }
}
