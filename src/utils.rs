//! # Utility Functions
//!
//! Formatters for human-readable output, validation of run parameters, and
//! the device naming scheme shared by provisioning and the load run.
//!
//! ## Usage Examples
//!
//! ```rust
//! use tbload::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_secs(5)), "5s");
//! assert_eq!(device_name(7), "_tbload_device_7");
//! validate_concurrency(100)?;
//! # Ok(())
//! # }
//! ```

use crate::defaults::{DEVICE_NAME_PREFIX, MAX_CONCURRENCY};
use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Random v4 UUID tagging a run's log lines and saved summary
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Name of the provisioned device with sequence number `index`
pub fn device_name(index: usize) -> String {
    format!("{}_{}", DEVICE_NAME_PREFIX, index)
}

/// Sequence number encoded in the trailing `_<n>` of a device name
pub fn device_seq_no(name: &str) -> Option<usize> {
    name.rsplit_once('_')?.1.parse().ok()
}

/// Render a timeout or elapsed time for the run banner
///
/// Sub-second values keep millisecond precision; longer ones are shown in
/// whole minutes and seconds once they pass a minute.
///
/// ```rust
/// # use tbload::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
/// assert_eq!(format_duration(Duration::from_secs(10)), "10s");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 if duration.subsec_micros() < 1_000 => format!("{}µs", duration.as_micros()),
        0 => format!("{}ms", duration.as_millis()),
        1..=59 if duration.subsec_millis() == 0 => format!("{}s", secs),
        1..=59 => format!("{:.3}s", duration.as_secs_f64()),
        _ => format!("{}m {}s", secs / 60, secs % 60),
    }
}

/// `part` as a percentage of `whole`; zero when `whole` is zero
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

/// Validate the number of simulated devices driven at once
///
/// ## Validation Rules
///
/// - **Minimum**: 1 client
/// - **Maximum**: [`MAX_CONCURRENCY`] clients, one socket and one task each
pub fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        anyhow::bail!("Concurrency cannot be zero");
    }
    if concurrency > MAX_CONCURRENCY {
        anyhow::bail!(
            "Concurrency {} is too high (maximum {})",
            concurrency,
            MAX_CONCURRENCY
        );
    }
    Ok(())
}

/// Validate the per-client message count
pub fn validate_message_num(message_num: usize) -> Result<()> {
    if message_num == 0 {
        anyhow::bail!("Message count cannot be zero");
    }
    Ok(())
}

/// Validate that a timeout leaves room for any work at all
pub fn validate_timeout(name: &str, timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        anyhow::bail!("{} cannot be zero", name);
    }
    Ok(())
}
