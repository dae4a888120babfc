//! # tbload Library
//!
//! A concurrent MQTT load generator for ThingsBoard. It simulates many devices,
//! each holding its own broker connection, publishing telemetry as fast as the
//! broker acknowledges it, and reports throughput and error statistics.
//!
//! ## Architecture Overview
//!
//! - `client`: broker client abstraction and the MQTT 3.1.1 implementation
//! - `connection`: connection phase coordinator with per-client retry
//! - `session`: per-client publish session
//! - `runner`: load run controller tying the phases together
//! - `results` / `metrics`: aggregation, throughput histogram, ack latency
//! - `store` / `provision`: local device store and ThingsBoard REST provisioning
//! - `cli`, `logging`, `utils`: binary plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tbload::client::{ClientOptions, MqttClient};
//! use tbload::runner::{LoadRunner, RunConfig};
//! use tbload::store::DeviceStore;
//! use tbload::QoS;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = DeviceStore::open("tbload_store.json")?;
//!     let config = RunConfig {
//!         broker_url: "tcp://localhost:1883".to_string(),
//!         message_num: 10,
//!         timeout: Duration::from_secs(10),
//!         concurrency: 100,
//!         start_num: 0,
//!         connect_timeout: None,
//!         qos: QoS::AtLeastOnce,
//!     };
//!
//!     let runner = LoadRunner::new(config);
//!     let outcome = runner
//!         .run(&store, |device, broker| {
//!             MqttClient::new(ClientOptions::new(&device.client_id, &device.auth_token, broker.clone()))
//!         })
//!         .await?;
//!
//!     println!("completed: {:?}", outcome.summary.map(|s| s.completed));
//!     Ok(())
//! }
//! ```

/// Broker client trait, bounded waits, and the MQTT client
///
/// The engine only talks to brokers through the `BrokerClient` trait, so the
/// phases can be exercised against scripted clients as well as real sockets.
pub mod client;

/// Command-line interface and configuration
pub mod cli;

/// Connection phase coordinator
///
/// Connects every client concurrently, retrying attempts that hang, and
/// reports whether all of them came online within the total timeout.
pub mod connection;

/// Error taxonomy for clients, phases, aggregation, and collaborators
pub mod error;

pub mod logging;

/// Throughput histogram, median, and ack latency statistics
pub mod metrics;

/// ThingsBoard REST provisioning of test devices
pub mod provision;

/// Per-client results, run summary, and the text report
pub mod results;

/// Load run controller
pub mod runner;

/// Publish session for one connected client
pub mod session;

/// Local JSON device store and credential provider
pub mod store;

pub mod utils;

pub use client::{BrokerClient, MqttClient, QoS};
pub use error::{ClientError, ConnectError, RunError, SummaryError};
pub use results::{ClientResult, Event, Summary, SummaryDisplay};
pub use runner::{LoadRunner, RunConfig, RunOutcome};

/// The current version of tbload
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default messages published by each client
    pub const MESSAGE_NUM: usize = 10;

    /// Default connect phase and publish session limit, in seconds
    pub const TIMEOUT: &str = "10";

    /// Default number of simulated devices driven at once
    pub const CONCURRENCY: usize = 1;

    /// Default sequence number of the first device
    pub const START_NUM: usize = 0;

    /// Default number of devices `init` provisions
    pub const DEVICE_NUM: usize = 10;

    /// Upper bound on concurrency; every client holds one socket and one task
    pub const MAX_CONCURRENCY: usize = 50_000;

    /// Default local store file
    pub const STORE_FILE: &str = "tbload_store.json";

    /// MQTT keep-alive advertised in CONNECT. Zero turns the broker's idle
    /// timer off: clients sit silent between phases and never send PINGREQ.
    pub const KEEP_ALIVE: Duration = Duration::ZERO;

    /// ThingsBoard device telemetry topic
    pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";

    /// Telemetry key every simulated device reports
    pub const TELEMETRY_KEY: &str = "_tbload_key";

    /// Prefix of provisioned device names, followed by `_<seq_no>`
    pub const DEVICE_NAME_PREFIX: &str = "_tbload_device";

    /// How long a reported publish task gets to hand its client back
    pub const TASK_GRACE: Duration = Duration::from_millis(500);

    /// Limit on closing one client at the end of a run
    pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
}
