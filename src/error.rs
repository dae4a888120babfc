//! Error types shared across the load engine.
//!
//! Per-client failures (`ClientError`, `ConnectError`) stay inside the task
//! that produced them and are turned into data. Phase-level failures
//! (`RunError`) abort a run before publishing starts, and aggregation failures
//! (`SummaryError`) abort reporting only.

use crate::client::packet::ConnackCode;
use thiserror::Error;

/// Failure of a single broker client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection refused by broker: {0}")]
    Refused(ConnackCode),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("connection closed by broker")]
    ConnectionClosed,
}

/// Outcome of a whole connect attempt, retries included.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect failed: {0}")]
    Failed(#[source] ClientError),

    #[error("mqtt client connect timeout")]
    Timeout,
}

/// Phase-level failures that abort a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("startNum[{start}] out of range[0-{provisioned}]")]
    StartOutOfRange { start: usize, provisioned: usize },

    #[error("no provisioned devices fall in range [{start}-{end}]")]
    NoDevicesSelected { start: usize, end: usize },

    #[error("only {connected}/{total} devices connected!")]
    ConnectPhaseTimeout { connected: usize, total: usize },

    #[error("only {connected}/{total} devices connected!")]
    NotAllConnected { connected: usize, total: usize },
}

/// Failures of the result aggregator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SummaryError {
    #[error("no results collected")]
    Empty,

    #[error("no feasible results found")]
    Infeasible,
}

/// Failures of the local device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store is corrupted: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("cannot encode {key} for the store: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("device[{0}] not exist")]
    DeviceNotFound(String),

    #[error("device[{name}] has empty {field} in store")]
    IncompleteDevice { name: String, field: &'static str },

    #[error("{0} not exist, run `tbload init` first")]
    MissingKey(&'static str),
}

/// Failures while talking to the ThingsBoard REST API.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not found")]
    NotFound,

    #[error("login rejected for user {0}")]
    LoginRejected(String),

    #[error("not logged in to the ThingsBoard server")]
    NotLoggedIn,

    #[error("create device[{name}] failed: {body}")]
    CreateFailed { name: String, body: String },

    #[error("device's authToken is empty for device id {0}")]
    EmptyAuthToken(String),

    #[error("device name '{0}' does not end with a sequence number")]
    BadDeviceName(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
