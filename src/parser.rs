//! Recover the progress of a job from the output of its download process.
//!
//! Every line is first classified into an [`Event`] without looking at the
//! job, then the event is reduced into the [`JobRecord`]. The reduction
//! tells whether the change must be persisted right away or may be
//! coalesced with the next ones through a [`Throttle`].

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    patterns,
    types::{ByteSize, JobRecord, Playlist, Progress, Status, TransferRate},
};

/// Which lines are looked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Until the destination of the transfer is known
    Initial,
    /// From the destination until the process exits
    Progress,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub is_live: bool,
    /// Where the final files land, used to recognize bare final paths
    pub output_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AlreadyDownloaded { path: PathBuf },
    Error { message: String },
    Destination { path: PathBuf },
    Progress {
        progress: Option<Progress>,
        speed: Option<TransferRate>,
        filesize: Option<ByteSize>,
    },
    Playlist { current: u32, count: u32 },
    /// Post-processing started. Live fixups do not announce the final path.
    Merging { path: Option<PathBuf> },
    /// The file was moved to its final location without ending the job
    Moved { path: PathBuf },
    /// The final file path, printed once a video is done
    Finished { path: PathBuf },
}

/// How urgently a reduced event must reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    /// A status transition, written right away
    Immediate,
    /// A volatile update, written at a bounded rate
    Throttled,
    /// Nothing changed
    Skip,
}

/// Classify a line of output. Unrecognized lines give `None`.
pub fn classify(line: &str, phase: Phase, ctx: &ParseContext<'_>) -> Option<Event> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }

    match phase {
        Phase::Initial => classify_initial(line, ctx),
        Phase::Progress if ctx.is_live => classify_recording(line, ctx),
        Phase::Progress => classify_download(line, ctx),
    }
}

fn path_capture(re: &regex::Regex, line: &str) -> Option<PathBuf> {
    re.captures(line).map(|caps| PathBuf::from(&caps["path"]))
}

fn classify_initial(line: &str, ctx: &ParseContext<'_>) -> Option<Event> {
    if let Some(path) = path_capture(patterns::already(), line) {
        return Some(Event::AlreadyDownloaded { path });
    }
    if patterns::is_error(line) {
        return Some(Event::Error {
            message: line.to_owned(),
        });
    }

    let destination = path_capture(patterns::destination(), line).or_else(|| {
        ctx.is_live
            .then(|| path_capture(patterns::ffmpeg_output(), line))
            .flatten()
    });
    if let Some(path) = destination {
        return Some(Event::Destination { path });
    }

    classify_playlist(line)
}

fn classify_download(line: &str, ctx: &ParseContext<'_>) -> Option<Event> {
    if let Some(caps) = patterns::progress().captures(line) {
        return Some(Event::Progress {
            progress: caps["percent"].parse().ok(),
            speed: caps.name("speed").and_then(|s| s.as_str().parse().ok()),
            filesize: caps["size"].parse().ok(),
        });
    }
    if let Some(path) = path_capture(patterns::merger(), line) {
        return Some(Event::Merging { path: Some(path) });
    }
    if let Some(path) = path_capture(patterns::destination(), line) {
        return Some(Event::Destination { path });
    }
    if let Some(event) = classify_playlist(line) {
        return Some(event);
    }
    if let Some(path) = final_path(line, ctx) {
        return Some(Event::Finished { path });
    }
    if patterns::is_error(line) {
        return Some(Event::Error {
            message: line.to_owned(),
        });
    }
    None
}

fn classify_recording(line: &str, ctx: &ParseContext<'_>) -> Option<Event> {
    if patterns::fixup().is_match(line) {
        return Some(Event::Merging { path: None });
    }
    if let Some(path) = path_capture(patterns::moved(), line).or_else(|| final_path(line, ctx)) {
        return Some(Event::Moved { path });
    }
    if patterns::ffmpeg_stats().is_match(line) {
        return Some(Event::Progress {
            progress: None,
            // ffmpeg's kB are 1024 bytes
            filesize: patterns::ffmpeg_size()
                .captures(line)
                .and_then(|caps| caps["size"].parse::<u64>().ok())
                .map(|kb| ByteSize::from_bytes(kb * 1024)),
            speed: patterns::ffmpeg_bitrate()
                .captures(line)
                .and_then(|caps| caps["kbits"].parse::<f64>().ok())
                .map(TransferRate::from_kbits_per_sec),
        });
    }
    if patterns::is_error(line) {
        return Some(Event::Error {
            message: line.to_owned(),
        });
    }
    None
}

fn classify_playlist(line: &str) -> Option<Event> {
    let caps = patterns::playlist().captures(line)?;
    Some(Event::Playlist {
        current: caps["current"].parse().ok()?,
        count: caps["count"].parse().ok()?,
    })
}

/// A line that is nothing but a path inside the output directory.
fn final_path(line: &str, ctx: &ParseContext<'_>) -> Option<PathBuf> {
    if line.starts_with('[') {
        return None;
    }
    let path = Path::new(line);
    (path.is_absolute() && path.starts_with(ctx.output_dir)).then(|| path.to_path_buf())
}

/// Apply an event to the record.
///
/// Once the record reached a terminal status, nothing changes anymore.
pub fn reduce(record: &mut JobRecord, event: Event) -> Persist {
    if record.status.is_terminal() {
        return Persist::Skip;
    }

    let persist = match event {
        Event::AlreadyDownloaded { path } => {
            record.file.set_path(&path);
            record.status = Status::Already;
            record.download.pid = None;
            record.download.progress = Progress::DONE;
            Persist::Immediate
        }
        Event::Error { message } => {
            record.fail(&message);
            Persist::Immediate
        }
        Event::Destination { path } => {
            let status = if record.is_live {
                Status::Recording
            } else {
                Status::Downloading
            };
            if record.file.path.as_deref() == Some(path.as_path()) && record.status == status {
                Persist::Skip
            } else {
                record.file.set_path(&path);
                record.status = status;
                Persist::Immediate
            }
        }
        Event::Progress {
            progress,
            speed,
            filesize,
        } => {
            let mut changed = false;

            // Never move backwards, e.g. when the audio stream starts after the video
            if let Some(progress) = progress.filter(|p| *p > record.download.progress) {
                record.download.progress = progress;
                changed = true;
            }
            if let Some(speed) = speed.map(|s| s.to_string()) {
                changed |= record.download.speed.as_ref() != Some(&speed);
                record.download.speed = Some(speed);
            }
            if let Some(filesize) = filesize.map(|s| s.to_string()) {
                changed |= record.download.filesize.as_ref() != Some(&filesize);
                record.download.filesize = Some(filesize);
            }

            if changed {
                Persist::Throttled
            } else {
                Persist::Skip
            }
        }
        Event::Playlist { current, count } => {
            let playlist = Playlist { current, count };
            if record.download.playlist == Some(playlist) {
                Persist::Skip
            } else {
                record.download.playlist = Some(playlist);
                Persist::Throttled
            }
        }
        Event::Merging { path } => {
            if let Some(path) = path {
                record.file.set_path(&path);
                record.download.progress = Progress::DONE;
            }
            record.status = Status::Merging;
            Persist::Immediate
        }
        Event::Moved { path } => {
            record.file.set_path(&path);
            Persist::Immediate
        }
        // Items of a playlist before the last one leave the process running
        Event::Finished { path }
            if record.download.playlist.is_some_and(|p| p.current < p.count) =>
        {
            record.file.set_path(&path);
            record.status = Status::Downloading;
            Persist::Immediate
        }
        Event::Finished { path } => {
            record.file.set_path(&path);
            record.status = Status::Completed;
            record.download.pid = None;
            record.download.progress = Progress::DONE;
            Persist::Immediate
        }
    };

    if persist != Persist::Skip {
        record.touch();
    }
    persist
}

/// Bound the rate of writes for volatile updates.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            pending: false,
        }
    }

    /// Whether a volatile update may be written now.
    /// A refused update is remembered as pending.
    pub fn admit(&mut self, now: Instant) -> bool {
        let open = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if open {
            self.last = Some(now);
            self.pending = false;
        } else {
            self.pending = true;
        }
        open
    }

    /// Whether a pending update waited long enough and must be written now.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        if self.pending && self.remaining(now) == Some(Duration::ZERO) {
            self.last = Some(now);
            self.pending = false;
            true
        } else {
            false
        }
    }

    /// Time left before a pending update is due, `None` if nothing is pending.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if !self.pending {
            return None;
        }
        let elapsed = self
            .last
            .map_or(self.interval, |last| now.saturating_duration_since(last));
        Some(self.interval.saturating_sub(elapsed))
    }

    /// Forget the pending update, it was written along with something else.
    pub fn clear(&mut self) {
        self.pending = false;
    }
}

/// Result of feeding one line to an [`OutputParser`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Step {
    /// The record must be persisted now
    pub write: bool,
    /// The transfer just started: first destination found
    pub started: bool,
}

/// Line-by-line parser for one process, switching phase on the first destination.
#[derive(Debug)]
pub struct OutputParser {
    phase: Phase,
    is_live: bool,
    output_dir: PathBuf,
    throttle: Throttle,
}

impl OutputParser {
    pub fn new(is_live: bool, output_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            phase: Phase::Initial,
            is_live,
            output_dir: output_dir.into(),
            throttle: Throttle::new(interval),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn feed(&mut self, record: &mut JobRecord, line: &str, now: Instant) -> Step {
        let ctx = ParseContext {
            is_live: self.is_live,
            output_dir: &self.output_dir,
        };
        let Some(event) = classify(line, self.phase, &ctx) else {
            return Step::default();
        };
        trace!("{:?} line classified as {event:?}", self.phase);

        let is_destination = matches!(event, Event::Destination { .. });
        let write = match reduce(record, event) {
            Persist::Immediate => {
                self.throttle.clear();
                true
            }
            Persist::Throttled => self.throttle.admit(now),
            Persist::Skip => return Step::default(),
        };

        let started = is_destination && self.phase == Phase::Initial;
        if started {
            self.phase = Phase::Progress;
        }
        Step { write, started }
    }

    /// How long to wait for the next line before a pending update is due.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.throttle.remaining(now)
    }

    pub fn flush_due(&mut self, now: Instant) -> bool {
        self.throttle.flush_due(now)
    }
}
