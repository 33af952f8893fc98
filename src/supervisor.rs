//! Drive one job: probe, launch, follow the output, stop and restart.
//!
//! While a process runs, its monitor thread is the only writer of the job
//! record. Every other operation goes through the store and the pid it
//! holds, so a job can be stopped or restarted by another program.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    outside::{
        process, Downloader, LaunchRequest, MediaInspector, ProcessEvent, ProcessHandle,
        StopSignal,
    },
    parser::{OutputParser, Phase},
    result::{Error, Result},
    store::RecordStore,
    types::{JobRecord, Metadata, Progress, Status},
};

/// The collaborators shared by every job.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RecordStore>,
    pub downloader: Arc<dyn Downloader>,
    pub inspector: Arc<dyn MediaInspector>,
    pub settings: Arc<Settings>,
}

pub struct JobSupervisor {
    id: Uuid,
    services: Services,
    /// Probed once per supervisor
    metadata: Option<Metadata>,
}

/// What [`JobSupervisor::kill`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The job's process was sent the signal
    Signaled,
    /// No process runs the job: none recorded, or its pid now runs something else
    NotRunning,
    /// The job's process could not be signaled
    Failed,
}

/// Follow a job whose process was started by this program.
pub struct JobHandle {
    pid: u32,
    thread: JoinHandle<JobRecord>,
    started: Receiver<JobRecord>,
}

impl JobHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the transfer announced its destination.
    /// Return `None` if the process ended before that.
    pub fn wait_started(&self) -> Option<JobRecord> {
        self.started.recv().ok()
    }

    /// Block until the process exited and its final state was handled.
    pub fn wait(self) -> Option<JobRecord> {
        match self.thread.join() {
            Ok(record) => Some(record),
            Err(_) => {
                error!("Monitor of process {} panicked", self.pid);
                None
            }
        }
    }
}

impl JobSupervisor {
    pub fn new(id: Uuid, services: Services) -> Self {
        Self {
            id,
            services,
            metadata: None,
        }
    }

    /// Persist a new `standby` job and return its supervisor.
    pub fn create(services: Services, url: &str, format: Option<&str>) -> Result<(Self, JobRecord)> {
        let format = format.unwrap_or(&services.settings.default_format);
        let record = JobRecord::new(url, format);

        if !services.store.set(&record.uuid, &record) {
            return Err(Error::Persistence(format!("Could not save job {}", record.uuid)));
        }
        info!("Created job {} for {url}", record.uuid);
        Ok((Self::new(record.uuid, services), record))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The job as currently stored.
    pub fn record(&self) -> Option<JobRecord> {
        self.services.store.reload(&self.id)
    }

    /// Fetch the metadata of the video, once.
    pub fn probe(&mut self, url: &str) -> Result<&Metadata> {
        let metadata = match self.metadata.take() {
            Some(metadata) => metadata,
            None => self.services.downloader.probe(url)?,
        };
        Ok(self.metadata.insert(metadata))
    }

    /// Launch the transfer and return as soon as its output is followed.
    ///
    /// Failures end up in the record as a `failed` status and give `None`.
    pub fn start(&mut self, is_restart: bool) -> Option<JobHandle> {
        let store = self.services.store.clone();
        let Some(mut record) = store.reload(&self.id) else {
            warn!("Job {} does not exist", self.id);
            return None;
        };

        if is_restart {
            record.reset_for_restart();
        } else if let Some(pid) = record.download.pid {
            if process::verify_ownership(pid, &record.url, &record.format) {
                warn!("Job {} is already running as process {pid}", self.id);
                return None;
            }
            record.download.pid = None;
        }

        let url = record.url.clone();
        match self.probe(&url) {
            Ok(metadata) => record.apply_metadata(metadata),
            Err(err) => {
                warn!("Could not probe {url}: {err}");
                self.abort(&mut record, &err);
                return None;
            }
        }

        let settings = &self.services.settings;
        let request = LaunchRequest {
            url: &record.url,
            format: &record.format,
            output_dir: &settings.downloads_dir,
            output_template: &settings.output_template,
            container: settings.merge_container,
            is_live: record.is_live,
        };
        let handle = match self.services.downloader.launch(&request) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("Could not launch the download of {url}: {err}");
                self.abort(&mut record, &err);
                return None;
            }
        };

        let pid = handle.pid();
        record.download.pid = Some(pid);
        record.touch();
        if !store.set(&self.id, &record) {
            // Nobody could ever stop a process missing from the record
            error!("Could not record process {pid} for job {}, killing it", self.id);
            process::signal(pid, StopSignal::Kill);
            return None;
        }
        info!("Job {} started as process {pid}", self.id);

        let (started_send, started) = bounded(1);
        let monitor = Monitor {
            parser: OutputParser::new(
                record.is_live,
                &settings.downloads_dir,
                settings.persist_interval(),
            ),
            id: self.id,
            pid,
            store,
            inspector: self.services.inspector.clone(),
            record,
            started: Some(started_send),
        };

        let short_id: String = self.id.to_string().chars().take(8).collect();
        let thread = thread::Builder::new()
            .name(format!("job-{short_id}"))
            .spawn(move || monitor.run(handle));

        match thread {
            Ok(thread) => Some(JobHandle {
                pid,
                thread,
                started,
            }),
            Err(err) => {
                error!("Could not start the monitor of job {}: {err}", self.id);
                process::signal(pid, StopSignal::Kill);
                if let Some(mut record) = self.services.store.reload(&self.id) {
                    self.abort(&mut record, &Error::Spawn(err.to_string()));
                }
                None
            }
        }
    }

    /// Mark the job failed with the error, without any process attached.
    fn abort(&self, record: &mut JobRecord, err: &Error) {
        record.fail(&err.summary());
        record.touch();
        if !self.services.store.set(&self.id, record) {
            warn!("Could not record the failure of job {}", self.id);
        }
    }

    /// Signal the process recorded for the job.
    ///
    /// A pid no longer running the job's command is cleared without signal.
    pub fn kill(&self, signal: StopSignal) -> KillOutcome {
        let Some(record) = self.services.store.reload(&self.id) else {
            return KillOutcome::NotRunning;
        };
        let Some(pid) = record.download.pid else {
            debug!("Job {} has no process", self.id);
            return KillOutcome::NotRunning;
        };

        if !process::verify_ownership(pid, &record.url, &record.format) {
            info!("{}, job {} considered stopped", Error::StaleOwnership { pid }, self.id);
            self.release(pid);
            return KillOutcome::NotRunning;
        }
        if process::signal(pid, signal) {
            KillOutcome::Signaled
        } else {
            KillOutcome::Failed
        }
    }

    /// Stop the job's process, waiting up to `timeout` for it to exit.
    /// With `force`, a process still there is then killed.
    ///
    /// Return whether the job is left without a process.
    pub fn stop(&self, signal: StopSignal, timeout: Duration, force: bool) -> bool {
        let Some(record) = self.services.store.reload(&self.id) else {
            return true;
        };
        let Some(pid) = record.download.pid else {
            return true;
        };

        match self.kill(signal) {
            KillOutcome::Signaled => (),
            KillOutcome::NotRunning => return true,
            KillOutcome::Failed => {
                let stopped = !process::is_alive(pid);
                if stopped {
                    self.release(pid);
                }
                return stopped;
            }
        }

        let mut gone = process::wait_gone(pid, timeout);
        if !gone && force && signal != StopSignal::Kill {
            warn!("Process {pid} still running after {timeout:?}, killing it");
            process::signal(pid, StopSignal::Kill);
            gone = process::wait_gone(pid, timeout);
        }

        if gone {
            self.release(pid);
        } else {
            warn!("Process {pid} of job {} is still running", self.id);
        }
        gone
    }

    /// Stop whatever process runs the job, then launch a new one with the
    /// same url and format.
    pub fn restart(&mut self) -> Option<JobHandle> {
        let timeout = self.services.settings.stop_timeout();
        if !self.stop(StopSignal::Interrupt, timeout, true) {
            warn!("Job {} not restarted, its process would not stop", self.id);
            return None;
        }
        self.start(true)
    }

    /// Clear the pid, unless the job moved on in the meantime.
    ///
    /// The monitor of the process may have written its final state already,
    /// so only the pid is changed, on the record as stored right now.
    fn release(&self, pid: u32) {
        let released = self.services.store.update(&self.id, &mut |record| {
            if record.download.pid != Some(pid) {
                return false;
            }
            record.download.pid = None;
            record.touch();
            true
        });
        if released {
            debug!("Process {pid} cleared from job {}", self.id);
        }
    }
}

/// Follows the output of one process and keeps its job record up to date.
struct Monitor {
    id: Uuid,
    pid: u32,
    store: Arc<dyn RecordStore>,
    inspector: Arc<dyn MediaInspector>,
    record: JobRecord,
    parser: OutputParser,
    started: Option<Sender<JobRecord>>,
}

impl Monitor {
    fn run(mut self, handle: ProcessHandle) -> JobRecord {
        let events = handle.events();
        loop {
            let event = match self.parser.poll_timeout(Instant::now()) {
                Some(timeout) => match events.recv_timeout(timeout) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        if self.parser.flush_due(Instant::now()) {
                            self.commit();
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => ProcessEvent::Exit(None),
                },
                None => events.recv().unwrap_or(ProcessEvent::Exit(None)),
            };

            match event {
                ProcessEvent::Line { stream, line } => {
                    trace!("{stream:?}: {line}");
                    let step = self.parser.feed(&mut self.record, &line, Instant::now());
                    if step.write {
                        self.commit();
                    }
                    if step.started {
                        info!("Job {} is {}", self.id, self.record.status);
                        if let Some(started) = self.started.take() {
                            let _ = started.send(self.record.clone());
                        }
                    }
                }
                ProcessEvent::Exit(code) => {
                    self.on_exit(code);
                    return self.record;
                }
            }
        }
    }

    fn on_exit(&mut self, code: Option<i32>) {
        debug!("Process {} of job {} exited with {code:?}", self.pid, self.id);
        self.record.download.pid = None;

        match self.parser.phase() {
            Phase::Initial if !self.record.status.is_terminal() => {
                let code = code.map_or_else(|| "unknown".to_owned(), |c| c.to_string());
                self.record
                    .fail(&format!("download process exited with status {code}"));
            }
            Phase::Initial => (),
            Phase::Progress => {
                if !matches!(self.record.status, Status::Failed | Status::Already) {
                    self.finish();
                }
            }
        }

        self.record.touch();
        self.commit();
        info!("Job {} ended as {}", self.id, self.record.status);
    }

    /// Complete the job from its file on disk, if it is there.
    fn finish(&mut self) {
        let Some(path) = self.record.file.path.clone() else {
            return;
        };

        if self.record.is_live && path.is_file() {
            if let Err(err) = self.inspector.repair(&path) {
                warn!("Could not repair {}: {err}", path.display());
            }
        }

        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!("Could not stat {}, leaving the job as is: {err}", path.display());
                return;
            }
        };

        self.record.status = Status::Completed;
        self.record.error = None;
        self.record.download.progress = Progress::DONE;
        self.record.file.size = Some(size);

        match self.inspector.inspect(&path) {
            Ok(media) => self.record.file.media = media,
            Err(err) => debug!("Could not inspect {}: {err}", path.display()),
        }
    }

    /// Persist the record, unless a newer process owns the job.
    fn commit(&mut self) {
        let (pid, record) = (self.pid, &self.record);
        let mut owner = None;
        let written = self.store.update(&self.id, &mut |stored| {
            if let Some(other) = stored.download.pid.filter(|other| *other != pid) {
                owner = Some(other);
                return false;
            }
            *stored = record.clone();
            true
        });

        match owner {
            Some(other) => debug!(
                "Job {} now belongs to process {other}, dropping the update",
                self.id
            ),
            None if !written => warn!("Could not persist job {}", self.id),
            None => (),
        }
    }
}
