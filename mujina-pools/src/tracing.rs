//! Log output setup.
//!
//! Call [`init_journald_or_stdout`] once at startup. Code that wants all the
//! level macros in one import can `use crate::tracing::prelude::*`.
//!
//! On a terminal each event prints as `HH:MM:SS LEVEL target: message`, with
//! structured fields (pool, failures, job ids...) on an indented second line.

use std::{env, fmt};
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Prefix stripped from our own targets.
const CRATE_PREFIX: &str = "mujina_pools::";

/// Whether stderr is the stream systemd advertised in `JOURNAL_STREAM`.
///
/// The variable holds `device:inode`; it only counts if stderr still points
/// at that file, otherwise output was redirected after launch.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };

    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev == expected_dev && stat.st_ino == expected_ino
}

/// Install the global subscriber: journald under systemd, stdout otherwise.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry().with(layer).init();
                    return;
                }
                Err(e) => eprintln!("journald unavailable ({}), logging to stdout", e),
            }
        }
    }

    use_stdout();
    trace!("Logging to stdout");
}

// RUST_LOG filters; without it everything at INFO and above is shown.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .fmt_fields(DefaultFields::new())
                .event_format(PoolFormatter),
        )
        .init();
}

struct PoolFormatter;

/// Collects an event's message and fields as strings.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
            return;
        }

        // Some("pool:3333") reads better as pool:3333
        let cleaned = formatted
            .strip_prefix("Some(")
            .and_then(|inner| inner.strip_suffix(')'))
            .map(str::to_string)
            .unwrap_or(formatted);
        self.fields.push((field.name(), cleaned));
    }
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("\x1b[31m", "ERROR"),
        Level::WARN => ("\x1b[33m", "WARN "),
        Level::INFO => ("\x1b[32m", "INFO "),
        Level::DEBUG => ("\x1b[34m", "DEBUG"),
        Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl<S, N> FormatEvent<S, N> for PoolFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, label) = level_style(*event.metadata().level());
        write!(writer, " {}{}\x1b[0m ", color, label)?;

        // Events bridged from the log crate carry their real target in a field
        let target = event.metadata().target();
        let target = match target.strip_prefix(CRATE_PREFIX) {
            Some(ours) => ours.to_string(),
            None if target == "log" => visitor
                .fields
                .iter()
                .find(|(k, _)| *k == "log.target")
                .map(|(_, v)| v.trim_matches('"').to_string())
                .unwrap_or_else(|| target.to_string()),
            None => target.to_string(),
        };
        write!(writer, "{}: ", target)?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }

        let mut fields = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log."))
            .peekable();

        if fields.peek().is_some() {
            // Align under the target column: 8 for the time, 7 for the level
            write!(writer, "\n\x1b[90m               ")?;
            for (i, (key, value)) in fields.enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_labels_align() {
        for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
            assert_eq!(level_style(level).1.len(), 5);
        }
    }
}
