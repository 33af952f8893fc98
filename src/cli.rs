use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use uuid::Uuid;

use crate::{config::Settings, outside::StopSignal, types::Container};

macro_rules! arg_env {
    ($v:literal) => {
        concat!("MEDIAJOBS_", $v)
    };
}

/// Download and record web videos through yt-dlp.
/// Every job is tracked in its own record, so its progress survives restarts.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// The path to the configuration file. Defaults to `mediajobs.toml` when present
    #[arg(long, global = true, env = arg_env!("CONFIG"))]
    pub config: Option<PathBuf>,

    /// Log more, can be repeated
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log less, can be repeated
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub quiet: u8,

    /// The directory where the media files are written
    #[arg(long, global = true, env = arg_env!("DOWNLOADS_DIR"))]
    pub downloads_dir: Option<PathBuf>,

    /// The directory where the job records and the index are kept
    #[arg(long, global = true, env = arg_env!("RECORDS_DIR"))]
    pub records_dir: Option<PathBuf>,

    /// The container separate video and audio streams are merged into
    #[arg(long, global = true, value_enum, env = arg_env!("MERGE_CONTAINER"))]
    pub merge_container: Option<Container>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a job for the URL and follow it until the process exits
    Add {
        url: String,

        /// The format selection, defaults to the configured one
        #[arg(long, short)]
        format: Option<String>,
    },

    /// Stop the job's process if any, then start it again
    Restart { uuid: Uuid },

    /// Signal the job's process
    Stop {
        uuid: Uuid,

        /// The signal number: 2 (interrupt), 15 (terminate) or 9 (kill, skips any cleanup)
        #[arg(long, short, default_value = "2", value_parser = parse_signal)]
        signal: StopSignal,

        /// Kill the process if it is still there after the stop timeout
        #[arg(long)]
        force: bool,
    },

    /// Print the listed jobs
    List,

    /// Stop the job and forget it. The media file is kept
    Remove { uuid: Uuid },

    /// Delete orphan records and refresh the listed ones from their files
    Reconcile,

    /// Print the metadata of a video as JSON, without downloading it
    Probe { url: String },
}

fn parse_signal(s: &str) -> Result<StopSignal, String> {
    let number: i32 = s.parse().map_err(|_| format!("'{s}' is not a signal number"))?;
    StopSignal::from_number(number)
        .ok_or_else(|| format!("signal {number} cannot stop a job, use 2, 15 or 9"))
}

impl Args {
    /// Apply the flags given explicitly, on top of the loaded settings.
    pub fn override_settings(&self, settings: &mut Settings) {
        if let Some(dir) = &self.downloads_dir {
            settings.downloads_dir = dir.clone();
        }
        if let Some(dir) = &self.records_dir {
            settings.records_dir = dir.clone();
        }
        if let Some(container) = self.merge_container {
            settings.merge_container = container;
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn stop_parses_signals() {
        let id = Uuid::new_v4().to_string();
        let args = Args::try_parse_from(["mediajobs", "stop", &id, "--signal", "9"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Stop {
                signal: StopSignal::Kill,
                force: false,
                ..
            }
        ));

        let args = Args::try_parse_from(["mediajobs", "stop", &id]).unwrap();
        assert!(matches!(
            args.command,
            Command::Stop {
                signal: StopSignal::Interrupt,
                ..
            }
        ));

        assert!(Args::try_parse_from(["mediajobs", "stop", &id, "--signal", "1"]).is_err());
        assert!(Args::try_parse_from(["mediajobs", "stop", "not-a-uuid"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let args = Args::try_parse_from([
            "mediajobs",
            "list",
            "--downloads-dir",
            "/srv/media",
            "--merge-container",
            "webm",
            "-vv",
        ])
        .unwrap();

        let mut settings = Settings::default();
        args.override_settings(&mut settings);
        assert_eq!(settings.downloads_dir, PathBuf::from("/srv/media"));
        assert_eq!(settings.merge_container, Container::Webm);
        assert_eq!(settings.records_dir, Settings::default().records_dir);
        assert_eq!(args.verbose, 2);
    }
}
