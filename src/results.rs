use crate::error::SummaryError;
use crate::metrics::{self, HistogramBucket, LatencyCollector, LatencyStats};
use crate::utils::percentage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

/// How a client's publish session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    PublishComplete,
    PublishFail,
    TimeoutExceeded,
    ConnectFailed,
}

impl Event {
    pub fn is_error(self) -> bool {
        !matches!(self, Event::PublishComplete)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::PublishComplete => "PublishComplete",
            Event::PublishFail => "PublishFailed",
            Event::TimeoutExceeded => "TimeoutExceeded",
            Event::ConnectFailed => "ConnectFailed",
        };
        f.write_str(name)
    }
}

/// Terminal record of one client's publish phase
#[derive(Debug, Clone)]
pub struct ClientResult {
    pub client_id: String,
    pub event: Event,
    pub is_error: bool,
    pub messages_published: usize,
    /// Time since this client's session started
    pub elapsed: Duration,
    pub ack_latency: LatencyCollector,
}

impl ClientResult {
    pub fn new(
        client_id: impl Into<String>,
        event: Event,
        messages_published: usize,
        elapsed: Duration,
        ack_latency: LatencyCollector,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            event,
            is_error: event.is_error(),
            messages_published,
            elapsed,
            ack_latency,
        }
    }

    /// Messages per second; only completed sessions have a throughput
    pub fn throughput(&self) -> Option<f64> {
        if self.event != Event::PublishComplete {
            return None;
        }
        // a session that finished inside one clock tick still has a finite rate
        let secs = self.elapsed.max(Duration::from_micros(1)).as_secs_f64();
        Some(self.messages_published as f64 / secs)
    }
}

/// Aggregate statistics of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    /// Set by the run controller, empty straight out of [`build_summary`]
    #[serde(default)]
    pub run_id: String,
    /// Run start; the Unix epoch until the run controller stamps it
    pub timestamp: DateTime<Utc>,
    pub clients: usize,
    pub total_messages: usize,
    pub messages_published: usize,
    pub collected: usize,
    pub completed: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub connect_failed: usize,
    pub publish_failed: usize,
    pub timeout_exceeded: usize,
    /// Ascending msg/sec of every completed client
    pub throughput: Vec<f64>,
    pub throughput_median: f64,
    pub histogram: Vec<HistogramBucket>,
    pub ack_latency: Option<LatencyStats>,
}

impl Summary {
    pub fn fastest(&self) -> f64 {
        self.throughput.last().copied().unwrap_or(0.0)
    }

    pub fn slowest(&self) -> f64 {
        self.throughput.first().copied().unwrap_or(0.0)
    }

    pub fn published_rate(&self) -> f64 {
        percentage(self.messages_published, self.total_messages)
    }

    pub fn completed_rate(&self) -> f64 {
        percentage(self.completed, self.clients)
    }
}

/// Aggregate per-client results into a [`Summary`].
///
/// ## Parameters
/// - `clients`: configured client count, the denominator of every rate
/// - `messages_per_client`: messages each session was asked to publish
/// - `results`: whatever the publish phase collected, possibly fewer than
///   `clients`
///
/// ## Errors
/// [`SummaryError::Empty`] when nothing was collected and
/// [`SummaryError::Infeasible`] when no session completed.
pub fn build_summary(
    clients: usize,
    messages_per_client: usize,
    results: &[ClientResult],
) -> Result<Summary, SummaryError> {
    if results.is_empty() {
        return Err(SummaryError::Empty);
    }

    let mut throughput: Vec<f64> = results.iter().filter_map(ClientResult::throughput).collect();
    if throughput.is_empty() {
        return Err(SummaryError::Infeasible);
    }
    throughput.sort_by(f64::total_cmp);

    let count = |event: Event| results.iter().filter(|r| r.event == event).count();
    let completed = count(Event::PublishComplete);
    let errors = results.iter().filter(|r| r.is_error).count();

    let mut latency = results[0].ack_latency.fresh();
    for result in results {
        latency.merge(&result.ack_latency);
    }

    let throughput_median = metrics::median(&throughput).unwrap_or(0.0);
    let histogram = metrics::build_histogram(&throughput, completed);

    Ok(Summary {
        run_id: String::new(),
        timestamp: DateTime::default(),
        clients,
        total_messages: clients * messages_per_client,
        messages_published: results.iter().map(|r| r.messages_published).sum(),
        collected: results.len(),
        completed,
        errors,
        error_rate: percentage(errors, clients),
        connect_failed: count(Event::ConnectFailed),
        publish_failed: count(Event::PublishFail),
        timeout_exceeded: count(Event::TimeoutExceeded),
        throughput,
        throughput_median,
        histogram,
        ack_latency: latency.stats(),
    })
}

/// Write the run report to `out`, bypassing the log filter.
pub fn write_report<W: io::Write>(out: &mut W, summary: &Summary) -> io::Result<()> {
    writeln!(out, "{}", SummaryDisplay(summary))?;
    out.flush()
}

/// Human-readable run report
pub struct SummaryDisplay<'a>(pub &'a Summary);

impl fmt::Display for SummaryDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;

        writeln!(f)?;
        writeln!(f, "# Configuration")?;
        writeln!(f, "Concurrent Clients: {}", s.clients)?;
        writeln!(f, "Total Messages:     {}", s.total_messages)?;
        writeln!(f)?;

        writeln!(f, "# Results")?;
        writeln!(
            f,
            "Published Messages: {} ({:.0}%)",
            s.messages_published,
            s.published_rate()
        )?;
        writeln!(f, "Completed:          {} ({:.0}%)", s.completed, s.completed_rate())?;
        writeln!(f, "Errors:             {} ({:.0}%)", s.errors, s.error_rate)?;
        if s.errors > 0 {
            for (label, n) in [
                ("ConnectFailed", s.connect_failed),
                ("PublishFailed", s.publish_failed),
                ("TimeoutExceeded", s.timeout_exceeded),
            ] {
                writeln!(
                    f,
                    "- {:<17} {} ({:.0}%)",
                    format!("{}:", label),
                    n,
                    percentage(n, s.errors)
                )?;
            }
        }
        if s.collected < s.clients {
            writeln!(f, "Missing Results:    {}", s.clients - s.collected)?;
        }
        writeln!(f)?;

        writeln!(f, "# Publishing Throughput")?;
        writeln!(f, "Fastest: {:.0} msg/sec", s.fastest())?;
        writeln!(f, "Slowest: {:.0} msg/sec", s.slowest())?;
        writeln!(f, "Median:  {:.0} msg/sec", s.throughput_median)?;
        if let Some(lat) = &s.ack_latency {
            writeln!(
                f,
                "Ack Latency: min {:.2}ms, p50 {:.2}ms, p95 {:.2}ms, p99 {:.2}ms, max {:.2}ms",
                lat.min_us as f64 / 1_000.0,
                lat.p50_us as f64 / 1_000.0,
                lat.p95_us as f64 / 1_000.0,
                lat.p99_us as f64 / 1_000.0,
                lat.max_us as f64 / 1_000.0,
            )?;
        }
        writeln!(f)?;

        for bucket in s.histogram.iter().filter(|b| b.count > 0) {
            writeln!(
                f,
                "  < {:.0} msg/sec  {:.0}%",
                bucket.upper_bound,
                bucket.cumulative * 100.0
            )?;
        }
        Ok(())
    }
}
