//! # Load Run Controller
//!
//! Drives one load run end to end:
//!
//! 1. Select the provisioned devices for `[start_num, start_num + concurrency)`
//! 2. Build one broker client per device
//! 3. Connect them all; abort unless every client came online
//! 4. Run one publish session per client and collect the results, bounded by
//!    twice the message timeout
//! 5. Disconnect every client still in hand and aggregate a summary
//!
//! Each phase spawns one task per client. Tasks own their client while they
//! run and hand it back when they finish, so the controller can disconnect it.
//! A client whose task outlives its phase is disconnected when the task ends.

use crate::cli::RunArgs;
use crate::client::{BrokerAddress, BrokerClient, QoS};
use crate::connection::{close_client, connect_all, ConnectTimeouts};
use crate::error::{RunError, SummaryError};
use crate::results::{build_summary, ClientResult, Summary};
use crate::session::PublishSession;
use crate::store::{CredentialProvider, DeviceCredentials};
use crate::utils;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Configuration of one load run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub broker_url: String,
    pub message_num: usize,
    /// Total connect time and per-client publish time
    pub timeout: Duration,
    pub concurrency: usize,
    pub start_num: usize,
    /// Single connect attempt limit; `None` uses `timeout`
    pub connect_timeout: Option<Duration>,
    pub qos: QoS,
}

/// Inclusive range of device sequence numbers taking part in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRange {
    pub start: usize,
    pub end: usize,
}

impl DeviceRange {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, seq_no: usize) -> bool {
        (self.start..=self.end).contains(&seq_no)
    }
}

impl RunConfig {
    /// Create a run configuration from CLI arguments
    ///
    /// ## Errors
    /// Zero message counts, zero timeouts and concurrency outside
    /// `1..=MAX_CONCURRENCY` are rejected before anything connects.
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        utils::validate_message_num(args.message_num)?;
        utils::validate_concurrency(args.concurrent)?;
        utils::validate_timeout("timeout", args.timeout)?;
        BrokerAddress::parse(&args.broker_url)?;

        Ok(Self {
            broker_url: args.broker_url.clone(),
            message_num: args.message_num,
            timeout: args.timeout,
            concurrency: args.concurrent,
            start_num: args.start_num,
            connect_timeout: args.connect_timeout,
            qos: args.qos(),
        })
    }

    pub fn connect_timeouts(&self) -> ConnectTimeouts {
        ConnectTimeouts::new(self.timeout, self.connect_timeout)
    }

    /// How long the controller waits for publish results
    pub fn collection_timeout(&self) -> Duration {
        self.timeout * 2
    }

    /// Resolve the devices taking part, clamping concurrency to what was
    /// provisioned.
    pub fn device_range(&self, provisioned: usize) -> Result<DeviceRange, RunError> {
        if self.start_num >= provisioned {
            return Err(RunError::StartOutOfRange {
                start: self.start_num,
                provisioned,
            });
        }
        if self.concurrency == 0 {
            return Err(RunError::NoDevicesSelected {
                start: self.start_num,
                end: self.start_num,
            });
        }

        let mut end = self.start_num + self.concurrency - 1;
        if end >= provisioned {
            end = provisioned - 1;
            warn!(
                "concurrency[{}] exceeds the {} provisioned devices from startNum[{}]; real concurrent number will be {}",
                self.concurrency,
                provisioned,
                self.start_num,
                end - self.start_num + 1
            );
        }
        Ok(DeviceRange {
            start: self.start_num,
            end,
        })
    }
}

/// Helper struct for displaying the run configuration
struct RunConfigDisplay<'a> {
    config: &'a RunConfig,
    range: DeviceRange,
}

impl<'a> std::fmt::Display for RunConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting load run against: {}", self.config.broker_url)?;
        writeln!(
            f,
            "  Devices:            {} ({}..={})",
            self.range.len(),
            self.range.start,
            self.range.end
        )?;
        writeln!(f, "  Messages / Client:  {}", self.config.message_num)?;
        writeln!(f, "  QoS:                {}", self.config.qos.level())?;
        writeln!(
            f,
            "  Timeout:            {}",
            utils::format_duration(self.config.timeout)
        )?;
        let timeouts = self.config.connect_timeouts();
        writeln!(
            f,
            "  Connect Attempt:    {}",
            utils::format_duration(timeouts.per_attempt)
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub config: RunConfig,
    pub results: Vec<ClientResult>,
    /// Aggregation can fail while raw results are still worth keeping
    pub summary: Result<Summary, SummaryError>,
}

pub struct LoadRunner {
    config: RunConfig,
}

impl LoadRunner {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Read credentials of every device in the run's range, ordered by
    /// sequence number.
    pub fn select_devices<P: CredentialProvider>(&self, provider: &P) -> Result<Vec<DeviceCredentials>> {
        let provisioned = provider.provisioned_count()?;
        let range = self.config.device_range(provisioned)?;

        let mut selected = Vec::with_capacity(range.len());
        for seq_no in range.start..=range.end {
            let name = utils::device_name(seq_no);
            let credentials = provider
                .credentials(&name)
                .with_context(|| format!("loading credentials for {}", name))?;
            debug!("get {:?}", credentials);
            if range.contains(credentials.seq_no) {
                selected.push(credentials);
            }
        }
        if selected.is_empty() {
            return Err(RunError::NoDevicesSelected {
                start: range.start,
                end: range.end,
            }
            .into());
        }
        selected.sort_by_key(|c| c.seq_no);
        Ok(selected)
    }

    /// Run the load test with credentials from `provider`.
    ///
    /// ## Parameters
    /// - `provider`: source of device credentials
    /// - `make_client`: builds the broker client for one device
    ///
    /// ## Errors
    /// Invalid device selection and an incomplete connection phase abort the
    /// run. Aggregation failures do not; they are carried in
    /// [`RunOutcome::summary`].
    pub async fn run<P, C, F>(&self, provider: &P, mut make_client: F) -> Result<RunOutcome>
    where
        P: CredentialProvider,
        C: BrokerClient,
        F: FnMut(&DeviceCredentials, &BrokerAddress) -> C,
    {
        let broker = BrokerAddress::parse(&self.config.broker_url)?;
        let devices = self.select_devices(provider)?;
        let range = DeviceRange {
            start: devices[0].seq_no,
            end: devices[devices.len() - 1].seq_no,
        };
        info!(
            "{}",
            RunConfigDisplay {
                config: &self.config,
                range,
            }
        );

        let clients: Vec<C> = devices
            .iter()
            .map(|device| make_client(device, &broker))
            .collect();
        info!("{} clients init", clients.len());
        self.execute(clients).await
    }

    /// Drive an already-built client set through both phases.
    pub async fn execute<C: BrokerClient>(&self, clients: Vec<C>) -> Result<RunOutcome> {
        let run_id = utils::generate_run_id();
        let started_at = Utc::now();
        let total = clients.len();
        info!("run {} starting with {} clients", run_id, total);

        let report = connect_all(clients, self.config.connect_timeouts()).await;
        if let Err(e) = report.verdict() {
            disconnect_all(report.into_clients()).await;
            return Err(e.into());
        }
        info!("all {} devices connected!", total);

        info!("sending messages...");
        let (results, clients) = self.publish_phase(report.into_clients()).await?;
        info!("received {}", results.len());
        disconnect_all(clients).await;

        let summary = build_summary(total, self.config.message_num, &results).map(|mut s| {
            s.run_id = run_id.clone();
            s.timestamp = started_at;
            s
        });
        Ok(RunOutcome {
            run_id,
            config: self.config.clone(),
            results,
            summary,
        })
    }

    /// Run one session per client and collect results until all arrived or
    /// the collection timeout fired.
    ///
    /// ## Returns
    /// The collected results and the clients whose sessions finished; the
    /// rest are disconnected in the background once their task ends.
    async fn publish_phase<C: BrokerClient>(
        &self,
        clients: Vec<C>,
    ) -> Result<(Vec<ClientResult>, Vec<C>)> {
        let session = Arc::new(PublishSession::new(
            self.config.message_num,
            self.config.timeout,
            self.config.qos,
        )?);
        let expected = clients.len();
        let (tx, mut rx) = mpsc::channel(expected.max(1));

        let handles: Vec<JoinHandle<C>> = clients
            .into_iter()
            .map(|mut client| {
                let tx = tx.clone();
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session.run_and_report(&mut client, &tx).await;
                    client
                })
            })
            .collect();
        drop(tx);

        let timer = sleep(self.config.collection_timeout());
        tokio::pin!(timer);
        let mut results = Vec::with_capacity(expected);

        while results.len() < expected {
            tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Some(result) => results.push(result),
                    None => break,
                },
                _ = &mut timer => {
                    warn!("receive timeout...");
                    break;
                }
            }
        }

        // sessions that reported are about to return their client
        let grace = Instant::now() + crate::defaults::TASK_GRACE;
        let mut finished = Vec::with_capacity(handles.len());
        for mut handle in handles {
            match timeout_at(grace, &mut handle).await {
                Ok(Ok(client)) => finished.push(client),
                Ok(Err(e)) => warn!("publish task failed: {}", e),
                Err(_) => {
                    debug!("publish task still running, closing its client when it ends");
                    let _ = close_when_done(handle);
                }
            }
        }
        Ok((results, finished))
    }
}

/// Disconnect clients concurrently, each bounded by the disconnect grace.
async fn disconnect_all<C: BrokerClient>(clients: Vec<C>) {
    let mut closing = JoinSet::new();
    for mut client in clients {
        closing.spawn(async move { close_client(&mut client).await });
    }
    while closing.join_next().await.is_some() {}
}

/// Disconnect the client of a detached task once the task hands it back.
fn close_when_done<C: BrokerClient>(handle: JoinHandle<C>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match handle.await {
            Ok(mut client) => close_client(&mut client).await,
            Err(e) => warn!("publish task failed: {}", e),
        }
    })
}
