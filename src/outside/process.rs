//! Ownership of spawned processes, and pid-based control of them.
//!
//! A [`ProcessHandle`] exists only inside the program that spawned the
//! process. Everything else goes through the pid stored in the job record,
//! so that a job can still be stopped after the supervising program
//! restarted.

use std::{
    ffi::{OsStr, OsString},
    io::{self, BufRead, BufReader, Read},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, error, info};

use crate::result::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of output, without its line terminator
    Line { stream: Stream, line: String },

    /// The process exited after all its output has been delivered.
    /// `None` when it was killed by a signal or could not be waited on.
    Exit(Option<i32>),
}

/// A running external process whose output is delivered line by line.
///
/// Lines from both streams arrive on a single channel in the order they
/// were read, and [`ProcessEvent::Exit`] is always the last event.
pub struct ProcessHandle {
    pid: u32,
    events: Receiver<ProcessEvent>,
}

impl ProcessHandle {
    pub fn spawn<S: AsRef<OsStr>>(program: S, args: &[OsString]) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Spawning command: {cmd:?}");
        let mut child = cmd.spawn().map_err(|err| Error::Spawn(err.to_string()))?;
        let pid = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            return Err(Error::Spawn("Output streams were not captured".into()));
        };

        let (send, events) = unbounded();
        let readers = [
            spawn_line_reader(pid, Stream::Stdout, stdout, send.clone()),
            spawn_line_reader(pid, Stream::Stderr, stderr, send.clone()),
        ];

        let waiter = thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                // Drain the output before reporting the exit
                for reader in readers.into_iter().flatten() {
                    let _ = reader.join();
                }
                let code = match child.wait() {
                    Ok(status) => {
                        debug!("Process {pid} exited with {status}");
                        status.code()
                    }
                    Err(err) => {
                        error!("Error waiting for process {pid}: {err}");
                        None
                    }
                };
                let _ = send.send(ProcessEvent::Exit(code));
            });

        if let Err(err) = waiter {
            signal(pid, StopSignal::Kill);
            return Err(Error::Spawn(format!("Could not watch process {pid}: {err}")));
        }

        Ok(Self { pid, events })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn events(&self) -> &Receiver<ProcessEvent> {
        &self.events
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    pid: u32,
    stream: Stream,
    reader: R,
    send: Sender<ProcessEvent>,
) -> Option<JoinHandle<()>> {
    let name = match stream {
        Stream::Stdout => format!("out-{pid}"),
        Stream::Stderr => format!("err-{pid}"),
    };

    let res = thread::Builder::new().name(name).spawn(move || {
        let res = for_each_line(BufReader::new(reader), |line| {
            send.send(ProcessEvent::Line { stream, line }).is_ok()
        });
        if let Err(err) = res {
            debug!("Stopped reading {stream:?} of process {pid}: {err}");
        }
    });

    match res {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("Could not start {stream:?} reader for process {pid}: {err}");
            None
        }
    }
}

/// Call `on_line` with every non-empty line, until it returns `false`.
///
/// Both `\n` and `\r` end a line: ffmpeg rewrites its statistics line
/// in place with a carriage return.
fn for_each_line<R: BufRead>(
    mut reader: R,
    mut on_line: impl FnMut(String) -> bool,
) -> io::Result<()> {
    let mut pending = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if buf.is_empty() {
            break;
        }

        let (used, ended) = match buf.iter().position(|b| matches!(*b, b'\n' | b'\r')) {
            Some(end) => {
                pending.extend_from_slice(&buf[..end]);
                (end + 1, true)
            }
            None => {
                pending.extend_from_slice(buf);
                (buf.len(), false)
            }
        };
        reader.consume(used);

        if ended && !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();
            if !on_line(line) {
                return Ok(());
            }
        }
    }

    if !pending.is_empty() {
        on_line(String::from_utf8_lossy(&pending).into_owned());
    }
    Ok(())
}

/// Signals used to stop a job's process.
///
/// [`StopSignal::Interrupt`] lets the tool finalize what it wrote (finish
/// muxing, fix a livestream container). [`StopSignal::Kill`] skips any
/// cleanup and is the last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    #[default]
    Interrupt,
    Terminate,
    Kill,
}

impl StopSignal {
    /// Map a POSIX signal number to a supported stop signal.
    pub fn from_number(number: i32) -> Option<Self> {
        match number {
            2 => Some(Self::Interrupt),
            15 => Some(Self::Terminate),
            9 => Some(Self::Kill),
            _ => None,
        }
    }

    pub fn number(self) -> i32 {
        match self {
            Self::Interrupt => 2,
            Self::Terminate => 15,
            Self::Kill => 9,
        }
    }

    fn as_sysinfo(self) -> sysinfo::Signal {
        match self {
            Self::Interrupt => sysinfo::Signal::Interrupt,
            Self::Terminate => sysinfo::Signal::Term,
            Self::Kill => sysinfo::Signal::Kill,
        }
    }
}

fn load_process(pid: u32, with_cmd: bool) -> (System, Pid) {
    let pid = Pid::from_u32(pid);
    let mut kind = ProcessRefreshKind::nothing();
    if with_cmd {
        kind = kind.with_cmd(UpdateKind::Always);
    }

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
    (system, pid)
}

/// Send a signal to a process. Return whether it was delivered.
pub fn signal(pid: u32, signal: StopSignal) -> bool {
    let (system, sys_pid) = load_process(pid, false);
    let Some(process) = system.process(sys_pid) else {
        debug!("Process {pid} not found, signal {} not sent", signal.number());
        return false;
    };

    info!("Sending signal {} to process {pid}", signal.number());
    process.kill_with(signal.as_sysinfo()).unwrap_or(false)
}

/// Whether the process still runs. Zombies count as gone.
pub fn is_alive(pid: u32) -> bool {
    let (system, sys_pid) = load_process(pid, false);
    system
        .process(sys_pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Poll until the process is gone or the timeout elapses. Return whether it is gone.
pub fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Check that `pid` still runs the job's command, by looking for the job
/// URL and format selection on its live command line.
///
/// A pid recycled by the OS for an unrelated process fails this check.
pub fn verify_ownership(pid: u32, expected_url: &str, expected_format: &str) -> bool {
    let (system, sys_pid) = load_process(pid, true);
    let Some(process) = system.process(sys_pid) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return false;
    }

    let args: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let owned = args.iter().any(|a| a == expected_url) && args.iter().any(|a| a == expected_format);

    if !owned {
        debug!("Process {pid} runs {args:?}, not the expected job");
    }
    owned
}
