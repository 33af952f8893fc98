use std::str::FromStr;

use miette::{Context, IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use time::{
    format_description::{self, FormatItem},
    OffsetDateTime, UtcOffset,
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{format, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
    FmtSubscriber,
};

/// Environment variable overriding the verbosity flags
pub const LOG_ENV: &str = "MEDIAJOBS_LOG";

/// Pick the level from the `-v`/`-q` counts, unless the environment sets one.
pub fn level_from_flags(verbose: u8, quiet: u8) -> Level {
    if let Some(level) = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
    {
        return level;
    }

    match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => Level::ERROR,
        -1 => Level::WARN,
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize the logging system
pub fn init_logging(level: Level) -> Result<()> {
    // The offset cannot always be read once threads run, fall back to UTC then
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let logger = JobLogger::new(local_offset)?;

    let subscriber = FmtSubscriber::builder()
        .event_format(logger)
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .into_diagnostic()
        .wrap_err("Setting default subscriber failed")
}

/// Print `HH:MM:SS LEVEL thread message`, the thread telling which job logs
struct JobLogger {
    offset: UtcOffset,
    time_format: Vec<FormatItem<'static>>,
}

impl JobLogger {
    fn new(offset: UtcOffset) -> Result<Self> {
        let time_format = format_description::parse("[hour]:[minute]:[second]")
            .into_diagnostic()
            .wrap_err("Invalid log time format")?;
        Ok(Self {
            offset,
            time_format,
        })
    }
}

impl<S, N> FormatEvent<S, N> for JobLogger
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let now = OffsetDateTime::now_utc().to_offset(self.offset).time();
        let now = now.format(&self.time_format).map_err(|_| std::fmt::Error)?;
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        if writer.has_ansi_escapes() {
            let level = match *metadata.level() {
                Level::ERROR => metadata.level().red().to_string(),
                Level::WARN => metadata.level().yellow().to_string(),
                Level::DEBUG => metadata.level().blue().to_string(),
                Level::TRACE => metadata.level().purple().to_string(),
                _ => metadata.level().green().to_string(),
            };

            write!(&mut writer, "{} {:>5} {} ", now, level, thread_name.yellow())?;
        } else {
            write!(&mut writer, "{} {:>5} {} ", now, metadata.level(), thread_name)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_the_level() {
        if std::env::var_os(LOG_ENV).is_some() {
            return;
        }
        assert_eq!(level_from_flags(0, 0), Level::INFO);
        assert_eq!(level_from_flags(1, 0), Level::DEBUG);
        assert_eq!(level_from_flags(3, 0), Level::TRACE);
        assert_eq!(level_from_flags(0, 1), Level::WARN);
        assert_eq!(level_from_flags(0, 5), Level::ERROR);
        assert_eq!(level_from_flags(2, 2), Level::INFO);
    }
}
