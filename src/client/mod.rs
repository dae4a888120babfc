use crate::error::ClientError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub mod mqtt;
pub mod packet;
#[cfg(test)]
pub(crate) mod scripted;

pub use mqtt::MqttClient;
pub use packet::QoS;

/// Default MQTT port when the broker URL does not carry one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Host and port of the broker under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `tcp://host:port`, `mqtt://host:port`, `host:port` or `host`
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let trimmed = url.trim();
        let rest = match trimmed.split_once("://") {
            Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
            Some(_) => return Err(ClientError::InvalidAddress(url.to_string())),
            None => trimmed,
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(ClientError::InvalidAddress(url.to_string()));
        }

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ClientError::InvalidAddress(url.to_string()))?;
                if host.is_empty() {
                    return Err(ClientError::InvalidAddress(url.to_string()));
                }
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: rest.to_string(),
                port: DEFAULT_MQTT_PORT,
            }),
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity and connection settings for one simulated device
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub broker: BrokerAddress,
    pub keep_alive: Duration,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>, username: impl Into<String>, broker: BrokerAddress) -> Self {
        let username = username.into();
        Self {
            client_id: client_id.into(),
            username: if username.is_empty() {
                None
            } else {
                Some(username)
            },
            password: None,
            broker,
            keep_alive: crate::defaults::KEEP_ALIVE,
        }
    }
}

/// Broker client interface driven by the load engine.
///
/// Every operation is a cancellable future: the engine bounds each call with
/// [`settle`] and simply drops the future when the wait runs out.
#[async_trait]
pub trait BrokerClient: Send + 'static {
    /// Client identifier presented to the broker
    fn id(&self) -> &str;

    /// Whether the last connect was acknowledged and the link is still up
    fn is_connected(&self) -> bool;

    /// Open a fresh session with the broker
    async fn connect(&mut self) -> Result<(), ClientError>;

    /// Publish one message and wait for the acknowledgement its QoS requires
    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), ClientError>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<(), ClientError>;
}

/// How a bounded wait on a broker operation ended
#[derive(Debug)]
pub enum Settled<T> {
    Done(T),
    Failed(ClientError),
    TimedOut,
}

impl<T> Settled<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Settled::Done(_))
    }
}

/// Wait up to `wait` for `op` to settle.
pub async fn settle<T, F>(wait: Duration, op: F) -> Settled<T>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(wait, op).await {
        Ok(Ok(value)) => Settled::Done(value),
        Ok(Err(e)) => Settled::Failed(e),
        Err(_) => Settled::TimedOut,
    }
}
