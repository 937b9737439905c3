//! Logger initialization for the server.

use std::{io::IsTerminal, str::FromStr, sync::Once};

use jiff::Timestamp;
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};

static INIT: Once = Once::new();

const RESET: &str = "\x1b[0m";

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[90m",
    }
}

/// One line per record: UTC timestamp, right-aligned level, message.
/// Levels are colored only when stderr is a terminal.
#[derive(Debug)]
struct LineLayout {
    color: bool,
}

impl Layout for LineLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        // Timestamps are instants, not zoned datetimes, so they render as
        // UTC with a Z suffix; precision is capped at microseconds.
        let now = Timestamp::now();
        let level = record.level();

        let line = if self.color {
            format!("{now:.6} {}{level:>5}{RESET}  {}", level_color(level), record.args())
        } else {
            format!("{now:.6} {level:>5}  {}", record.args())
        };

        Ok(line.into_bytes())
    }
}

/// Initialize the logger. The filter is a string like "info" or
/// "proxy=debug,cluster=debug".
pub(crate) fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |d| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter should be valid"));

                let layout = LineLayout {
                    color: std::io::stderr().is_terminal(),
                };

                d.filter(filter).append(Stderr::default().with_layout(layout))
            })
            .apply();
    });
}
