//! Connection phase: bring every client online before anything is published.
//!
//! Each client is connected in its own task. A client keeps retrying while its
//! per-attempt wait runs out, stops on the first definite error, and gives up
//! once the total timeout has passed. Outcomes come back over one bounded
//! channel and are raced against a phase timer of the same total timeout.

use crate::client::{settle, BrokerClient, Settled};
use crate::error::{ClientError, ConnectError, RunError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Where one client's connection attempt currently stands
#[derive(Debug)]
pub enum ConnectState {
    Attempting { attempt: u32 },
    Succeeded,
    DefiniteFailure(ClientError),
    TimedOut,
}

impl ConnectState {
    pub fn start() -> Self {
        ConnectState::Attempting { attempt: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectState::Attempting { .. })
    }

    /// Give up before issuing another attempt once the total deadline passed.
    pub fn on_deadline_check(self, deadline_passed: bool) -> Self {
        match self {
            ConnectState::Attempting { .. } if deadline_passed => ConnectState::TimedOut,
            other => other,
        }
    }

    /// Advance after one `connect` call settled.
    pub fn on_settled(self, outcome: Settled<()>, deadline_passed: bool) -> Self {
        match self {
            ConnectState::Attempting { attempt } => match outcome {
                Settled::Done(()) => ConnectState::Succeeded,
                Settled::Failed(e) => ConnectState::DefiniteFailure(e),
                Settled::TimedOut if deadline_passed => ConnectState::TimedOut,
                Settled::TimedOut => ConnectState::Attempting {
                    attempt: attempt + 1,
                },
            },
            terminal => terminal,
        }
    }

    pub fn into_result(self) -> Result<(), ConnectError> {
        match self {
            ConnectState::Succeeded => Ok(()),
            ConnectState::DefiniteFailure(e) => Err(ConnectError::Failed(e)),
            ConnectState::TimedOut | ConnectState::Attempting { .. } => Err(ConnectError::Timeout),
        }
    }
}

/// Connection phase time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTimeouts {
    pub total: Duration,
    pub per_attempt: Duration,
}

impl ConnectTimeouts {
    /// A missing or zero per-attempt timeout falls back to the total timeout
    pub fn new(total: Duration, per_attempt: Option<Duration>) -> Self {
        Self {
            total,
            per_attempt: per_attempt.filter(|d| !d.is_zero()).unwrap_or(total),
        }
    }
}

/// Connect one client, retrying attempts that hang until `timeouts.total`.
pub async fn connect_and_wait<C: BrokerClient>(
    client: &mut C,
    timeouts: ConnectTimeouts,
) -> Result<(), ConnectError> {
    let deadline = Instant::now() + timeouts.total;
    let mut state = ConnectState::start();

    loop {
        let now = Instant::now();
        state = state.on_deadline_check(now >= deadline);
        let attempt = match &state {
            ConnectState::Attempting { attempt } => *attempt,
            _ => break,
        };
        if attempt > 1 {
            warn!("client[{}] connect retry {}", client.id(), attempt);
        }

        let wait = timeouts.per_attempt.min(deadline.saturating_duration_since(now));
        let outcome = settle(wait, client.connect()).await;
        state = state.on_settled(outcome, Instant::now() >= deadline);
        if state.is_terminal() {
            break;
        }
    }

    state.into_result()
}

/// One client handed back by its connect task
pub struct ConnectOutcome<C> {
    pub client: C,
    pub result: Result<(), ConnectError>,
}

/// Return a client to the coordinator, or close it if the phase already
/// ended and nobody will.
async fn hand_back<C: BrokerClient>(tx: &mpsc::Sender<ConnectOutcome<C>>, outcome: ConnectOutcome<C>) {
    if let Err(SendError(mut late)) = tx.send(outcome).await {
        debug!("client[{}] reported after the connect phase ended", late.client.id());
        close_client(&mut late.client).await;
    }
}

/// Disconnect one client, bounded by the disconnect grace.
pub(crate) async fn close_client<C: BrokerClient>(client: &mut C) {
    match timeout(crate::defaults::DISCONNECT_GRACE, client.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("client[{}] disconnect failed: {}", client.id(), e),
        Err(_) => debug!("client[{}] disconnect timed out", client.id()),
    }
}

/// What the connection phase achieved
pub struct ConnectionPhaseReport<C> {
    pub expected: usize,
    pub connected: Vec<C>,
    pub failed: Vec<(C, ConnectError)>,
    /// The phase timer fired before every outcome arrived
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl<C> ConnectionPhaseReport<C> {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            connected: Vec::with_capacity(expected),
            failed: Vec::new(),
            timed_out: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn collected(&self) -> usize {
        self.connected.len() + self.failed.len()
    }

    /// Publishing only starts when every client is online.
    pub fn verdict(&self) -> Result<(), RunError> {
        let connected = self.connected_count();
        let total = self.expected;
        if self.timed_out {
            return Err(RunError::ConnectPhaseTimeout { connected, total });
        }
        if connected < total {
            return Err(RunError::NotAllConnected { connected, total });
        }
        Ok(())
    }

    /// Every client that came back, connected ones first
    pub fn into_clients(self) -> Vec<C> {
        let mut clients = self.connected;
        clients.extend(self.failed.into_iter().map(|(client, _)| client));
        clients
    }
}

/// Connect all clients concurrently.
///
/// ## Returns
/// A report of which clients connected. Clients whose task had not reported
/// when the phase timer fired are disconnected by their own task.
pub async fn connect_all<C: BrokerClient>(
    clients: Vec<C>,
    timeouts: ConnectTimeouts,
) -> ConnectionPhaseReport<C> {
    let expected = clients.len();
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel(expected.max(1));

    for mut client in clients {
        let tx = tx.clone();
        tokio::spawn(async move {
            info!("client[{}] begin connect..", client.id());
            let result = connect_and_wait(&mut client, timeouts).await;
            match &result {
                Ok(()) => info!("client[{}] connected = true", client.id()),
                Err(e) => info!("client[{}] connected = false: {}", client.id(), e),
            }
            hand_back(&tx, ConnectOutcome { client, result }).await;
        });
    }
    drop(tx);

    let mut report = ConnectionPhaseReport::new(expected);
    let timer = tokio::time::sleep(timeouts.total);
    tokio::pin!(timer);

    while report.collected() < expected {
        tokio::select! {
            biased;
            outcome = rx.recv() => match outcome {
                Some(ConnectOutcome { client, result: Ok(()) }) => report.connected.push(client),
                Some(ConnectOutcome { client, result: Err(e) }) => report.failed.push((client, e)),
                None => break,
            },
            _ = &mut timer => {
                warn!("connect phase timeout..");
                report.timed_out = true;
                break;
            }
        }
    }

    report.elapsed = started.elapsed();
    info!(
        "connect phase finished: {}/{} connected in {:?}",
        report.connected_count(),
        expected,
        report.elapsed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::packet::ConnackCode;
    use crate::client::scripted::{ConnectScript, PublishScript, ScriptedClient};

    fn scripted(id: usize, connect: ConnectScript) -> ScriptedClient {
        ScriptedClient::new(format!("dev{}", id), connect, PublishScript::AckAll)
    }

    #[test]
    fn test_state_transitions() {
        let state = ConnectState::start().on_settled(Settled::TimedOut, false);
        assert!(matches!(state, ConnectState::Attempting { attempt: 2 }));

        let state = state.on_settled(Settled::Done(()), false);
        assert!(matches!(state, ConnectState::Succeeded));
        // terminal states absorb everything
        let state = state.on_deadline_check(true);
        assert!(state.into_result().is_ok());

        let state = ConnectState::start().on_settled(
            Settled::Failed(ClientError::Refused(ConnackCode::BadUsernameOrPassword)),
            false,
        );
        assert!(state.is_terminal());
        assert!(matches!(state.into_result(), Err(ConnectError::Failed(_))));

        let state = ConnectState::start().on_settled(Settled::TimedOut, true);
        assert!(matches!(state.into_result(), Err(ConnectError::Timeout)));

        let state = ConnectState::Attempting { attempt: 4 }.on_deadline_check(true);
        assert!(matches!(state, ConnectState::TimedOut));
    }

    #[test]
    fn test_per_attempt_defaults_to_total() {
        let total = Duration::from_secs(10);
        assert_eq!(ConnectTimeouts::new(total, None).per_attempt, total);
        assert_eq!(ConnectTimeouts::new(total, Some(Duration::ZERO)).per_attempt, total);
        assert_eq!(
            ConnectTimeouts::new(total, Some(Duration::from_secs(2))).per_attempt,
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_attempts_are_retried() {
        let mut client = scripted(0, ConnectScript::HangThenAccept(2));
        let probe = client.probe();
        let timeouts = ConnectTimeouts::new(Duration::from_secs(10), Some(Duration::from_secs(1)));

        let started = Instant::now();
        connect_and_wait(&mut client, timeouts).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(probe.connect_attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_definite_failure_is_not_retried() {
        let mut client = scripted(0, ConnectScript::Refuse);
        let probe = client.probe();
        let timeouts = ConnectTimeouts::new(Duration::from_secs(10), Some(Duration::from_secs(1)));

        let err = connect_and_wait(&mut client, timeouts).await.unwrap_err();
        assert!(matches!(err, ConnectError::Failed(ClientError::Refused(_))));
        assert_eq!(probe.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout_ends_attempts() {
        let mut client = scripted(0, ConnectScript::Hang);
        let probe = client.probe();
        let timeouts = ConnectTimeouts::new(Duration::from_secs(3), Some(Duration::from_secs(1)));

        let err = connect_and_wait(&mut client, timeouts).await.unwrap_err();
        assert!(matches!(err, ConnectError::Timeout));
        assert_eq!(err.to_string(), "mqtt client connect timeout");
        assert_eq!(probe.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_success() {
        let clients: Vec<_> = (0..8)
            .map(|i| scripted(i, ConnectScript::AcceptAfter(Duration::from_millis(10 * i as u64))))
            .collect();
        let report = connect_all(clients, ConnectTimeouts::new(Duration::from_secs(5), None)).await;

        assert_eq!(report.connected_count(), 8);
        assert!(!report.timed_out);
        assert!(report.verdict().is_ok());
        assert!(report.into_clients().iter().all(|c| c.is_connected()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolving_connect_returns_at_timeout() {
        let clients: Vec<_> = (0..4).map(|i| scripted(i, ConnectScript::Hang)).collect();
        let started = Instant::now();
        let report =
            connect_all(clients, ConnectTimeouts::new(Duration::from_millis(100), None)).await;

        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(report.connected_count(), 0);
        let err = report.verdict().unwrap_err();
        assert_eq!(err.to_string(), "only 0/4 devices connected!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_aborts() {
        let clients = vec![
            scripted(0, ConnectScript::Accept),
            scripted(1, ConnectScript::Refuse),
            scripted(2, ConnectScript::Accept),
        ];
        let report = connect_all(clients, ConnectTimeouts::new(Duration::from_secs(5), None)).await;

        assert_eq!(report.collected(), 3);
        assert_eq!(
            report.verdict(),
            Err(RunError::NotAllConnected {
                connected: 2,
                total: 3
            })
        );
        assert_eq!(report.into_clients().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcome_disconnects_client() {
        let mut client = scripted(0, ConnectScript::Accept);
        client.connect().await.unwrap();
        let probe = client.probe();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        hand_back(&tx, ConnectOutcome { client, result: Ok(()) }).await;
        assert_eq!(probe.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_outcome_keeps_client_open() {
        let mut client = scripted(0, ConnectScript::Accept);
        client.connect().await.unwrap();
        let probe = client.probe();

        let (tx, mut rx) = mpsc::channel(1);
        hand_back(&tx, ConnectOutcome { client, result: Ok(()) }).await;
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.client.is_connected());
        assert_eq!(probe.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_no_clients() {
        let report = connect_all(
            Vec::<ScriptedClient>::new(),
            ConnectTimeouts::new(Duration::from_secs(1), None),
        )
        .await;
        assert!(report.verdict().is_ok());
        assert!(!report.timed_out);
    }
}
