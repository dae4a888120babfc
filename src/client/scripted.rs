//! Scripted in-memory broker client for exercising the engine without sockets.

use super::{BrokerClient, QoS};
use crate::client::packet::ConnackCode;
use crate::error::ClientError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum ConnectScript {
    Accept,
    Refuse,
    Hang,
    /// Hang on the first `n` attempts, then accept
    HangThenAccept(usize),
    AcceptAfter(Duration),
}

#[derive(Debug, Clone, Copy)]
pub enum PublishScript {
    AckAll,
    AckAfter(Duration),
    /// Fail the publish with this zero-based index
    FailAt(usize),
    /// Never settle the publish with this zero-based index
    HangAt(usize),
}

/// Shared view of what a scripted client did.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    pub connect_attempts: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

impl Probe {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

pub struct ScriptedClient {
    id: String,
    connect: ConnectScript,
    publish: PublishScript,
    connected: bool,
    published: usize,
    probe: Probe,
}

impl ScriptedClient {
    pub fn new(id: impl Into<String>, connect: ConnectScript, publish: PublishScript) -> Self {
        Self {
            id: id.into(),
            connect,
            publish,
            connected: false,
            published: 0,
            probe: Probe::default(),
        }
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    /// Pretend the broker dropped the link.
    pub fn sever(&mut self) {
        self.connected = false;
    }
}

#[async_trait]
impl BrokerClient for ScriptedClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        let attempt = self.probe.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.connect {
            ConnectScript::Accept => {}
            ConnectScript::Refuse => {
                return Err(ClientError::Refused(ConnackCode::NotAuthorized));
            }
            ConnectScript::Hang => std::future::pending::<()>().await,
            ConnectScript::HangThenAccept(n) => {
                if attempt <= n {
                    std::future::pending::<()>().await;
                }
            }
            ConnectScript::AcceptAfter(delay) => tokio::time::sleep(delay).await,
        }
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, _topic: &str, payload: &[u8], _qos: QoS) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        let index = self.published;
        match self.publish {
            PublishScript::AckAll => {}
            PublishScript::AckAfter(delay) => tokio::time::sleep(delay).await,
            PublishScript::FailAt(at) if at == index => {
                return Err(ClientError::Protocol("scripted publish failure".to_string()));
            }
            PublishScript::HangAt(at) if at == index => std::future::pending::<()>().await,
            _ => {}
        }
        self.published += 1;
        self.probe.payloads.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.connected = false;
        self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
