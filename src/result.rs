use std::fmt::Display;

use miette::miette;

/// Errors exchanged between the supervision components.
///
/// Anything that ends up in a job record goes through [`Error::summary`],
/// which keeps it to a single line.
#[derive(Debug)]
pub enum Error {
    /// The metadata probe produced no usable output or reported an error line.
    Probe(String),

    /// The transfer process could not be started.
    Spawn(String),

    /// The recorded pid now belongs to an unrelated process.
    StaleOwnership { pid: u32 },

    /// A record or index file could not be read or written.
    Persistence(String),

    Miette(miette::Report),
}

impl From<miette::Report> for Error {
    fn from(err: miette::Report) -> Self {
        Error::Miette(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Miette(miette::Report::msg(err))
    }
}

impl From<Error> for miette::Report {
    fn from(err: Error) -> Self {
        match err {
            Error::Probe(msg) => miette!("Could not probe the video: {msg}"),
            Error::Spawn(msg) => miette!("Could not start the download: {msg}"),
            Error::StaleOwnership { pid } => {
                miette!("Process {pid} does not belong to this job anymore")
            }
            Error::Persistence(msg) => miette!("Could not persist the job: {msg}"),
            Error::Miette(err) => err,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Probe(msg) | Error::Spawn(msg) | Error::Persistence(msg) => f.write_str(msg),
            Error::StaleOwnership { pid } => write!(f, "process {pid} is not the job's process"),
            Error::Miette(report) => write!(f, "{report}"),
        }
    }
}

impl Error {
    pub fn wrap_err_with<D, F>(self, f: F) -> Error
    where
        D: Display + Send + Sync + 'static,
        F: FnOnce() -> D,
    {
        match self {
            Error::Miette(report) => Error::Miette(report.wrap_err(f())),
            err => err,
        }
    }

    /// Short, single-line description suitable for a record's `error` field.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        let line = text.lines().map(str::trim).find(|l| !l.is_empty());
        line.unwrap_or("Unknown error").to_owned()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn err_msg<D: Display + std::fmt::Debug + Send + Sync + 'static>(msg: D) -> Error {
    Error::Miette(miette::Report::msg(msg))
}

pub fn bail<T, D: Display + std::fmt::Debug + Send + Sync + 'static>(msg: D) -> Result<T> {
    Err(err_msg(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keeps_first_non_empty_line() {
        let err = Error::Probe("\nERROR: Video unavailable\nThis video is private".into());
        assert_eq!(err.summary(), "ERROR: Video unavailable");
    }

    #[test]
    fn wrap_err_leaves_domain_errors_alone() {
        let err = Error::Spawn("no such file".into()).wrap_err_with(|| "context");
        assert!(matches!(err, Error::Spawn(msg) if msg == "no such file"));
    }
}
