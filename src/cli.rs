use crate::client::QoS;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// tbload - MQTT load generator for ThingsBoard
#[derive(Parser, Debug)]
#[clap(name = "tbload", version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Local device store file
    #[clap(long, global = true, default_value = crate::defaults::STORE_FILE)]
    pub store: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colored console output
    #[clap(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision test devices on the ThingsBoard server
    Init(InitArgs),

    /// Show what the local store holds
    Info(InfoArgs),

    /// Run the MQTT publish load test
    Run(RunArgs),

    /// Delete provisioned devices and the local store
    Clean,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct InitArgs {
    /// ThingsBoard server base URL, e.g. http://localhost:8080
    #[clap(long)]
    pub server_host: String,

    /// Tenant administrator username
    #[clap(long)]
    pub username: String,

    /// Tenant administrator password
    #[clap(long)]
    pub password: String,

    /// Number of devices to provision
    #[clap(long, default_value_t = crate::defaults::DEVICE_NUM)]
    pub device_num: usize,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct InfoArgs {
    /// Print every stored key and value
    #[clap(short = 'd', long)]
    pub detail: bool,

    /// Print the summary of the last run
    #[clap(short = 's', long)]
    pub summary: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// MQTT broker URL, e.g. tcp://localhost:1883
    #[clap(long)]
    pub broker_url: String,

    /// Messages each client publishes
    #[clap(long, default_value_t = crate::defaults::MESSAGE_NUM)]
    pub message_num: usize,

    /// Connect phase limit and per-client publish limit (e.g. "10", "10s", "500ms")
    #[clap(long, value_parser = parse_timeout, default_value = crate::defaults::TIMEOUT)]
    pub timeout: Duration,

    /// Number of devices driven at once
    #[clap(long, default_value_t = crate::defaults::CONCURRENCY)]
    pub concurrent: usize,

    /// Sequence number of the first device to use
    #[clap(long, default_value_t = crate::defaults::START_NUM)]
    pub start_num: usize,

    /// Limit for a single connect attempt; 0 uses --timeout
    #[clap(long, value_parser = parse_timeout)]
    pub connect_timeout: Option<Duration>,

    /// Publish QoS level
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub qos: u8,
}

impl RunArgs {
    pub fn qos(&self) -> QoS {
        QoS::from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }
}

/// Timeout in seconds, optionally suffixed with `ms`, `s` or `m`
fn parse_timeout(s: &str) -> Result<Duration, String> {
    const UNITS: [(&str, f64); 3] = [("ms", 0.001), ("s", 1.0), ("m", 60.0)];

    let s = s.trim();
    let (value, scale) = UNITS
        .iter()
        .find_map(|(suffix, scale)| s.strip_suffix(suffix).map(|v| (v, *scale)))
        .unwrap_or((s, 1.0));

    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a timeout (try 10, 2.5s, 500ms, 1m)", s))?;
    Duration::try_from_secs_f64(seconds * scale).map_err(|e| format!("'{}': {}", s, e))
}
