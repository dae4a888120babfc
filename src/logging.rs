use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Console event formatter: the bare message, colored by level.
///
/// Progress lines and the run report print without timestamps or targets;
/// warnings and errors get a short label so they survive `--no-color`.
#[derive(Debug, Clone, Copy)]
pub struct ColorizedFormatter {
    color: bool,
}

impl ColorizedFormatter {
    pub fn new(color: bool) -> Self {
        Self { color }
    }
}

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let mut line = String::from(level_label(level));
        ctx.format_fields(Writer::new(&mut line), event)?;

        if !self.color {
            return writeln!(writer, "{}", line);
        }
        let line = match level {
            Level::INFO => line.normal(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red().bold(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };
        writeln!(writer, "{}", line)
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::WARN => "warning: ",
        Level::ERROR => "error: ",
        _ => "",
    }
}

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// Console output goes through [`ColorizedFormatter`]. With `log_file` set, a
/// plain timestamped copy is appended to that file through a non-blocking
/// writer whose guard must live until the program exits.
pub fn init_tracing(
    verbose: u8,
    quiet: bool,
    color: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    let console = tracing_subscriber::fmt::layer().event_format(ColorizedFormatter::new(color));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
