use super::packet::{self, Connect, ConnackCode, Packet, QoS};
use super::{BrokerClient, ClientOptions};
use crate::error::ClientError;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// MQTT 3.1.1 client over a plain TCP connection.
///
/// Inbound bytes are accumulated in `read_buf` and split into frames there, so
/// a wait that is cancelled halfway through a packet never loses framing.
pub struct MqttClient {
    options: ClientOptions,
    stream: Option<TcpStream>,
    read_buf: Vec<u8>,
    connected: bool,
    last_packet_id: u16,
}

impl MqttClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            stream: None,
            read_buf: Vec::with_capacity(READ_CHUNK),
            connected: false,
            last_packet_id: 0,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn next_packet_id(&mut self) -> u16 {
        self.last_packet_id = self.last_packet_id.wrapping_add(1);
        if self.last_packet_id == 0 {
            self.last_packet_id = 1;
        }
        self.last_packet_id
    }

    fn drop_link(&mut self) {
        self.stream = None;
        self.connected = false;
        self.read_buf.clear();
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.drop_link();
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Packet, ClientError> {
        loop {
            if let Some(frame) = packet::split_frame(&mut self.read_buf)? {
                return Packet::decode(&frame);
            }

            let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
            let mut chunk = [0u8; READ_CHUNK];
            let read = stream.read(&mut chunk).await;
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.drop_link();
                    return Err(e.into());
                }
            };
            if n == 0 {
                self.drop_link();
                return Err(ClientError::ConnectionClosed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    fn id(&self) -> &str {
        &self.options.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected && self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        // every attempt starts from a fresh socket
        self.drop_link();

        let broker = &self.options.broker;
        debug!("client[{}] dialing {}", self.options.client_id, broker);
        let stream = TcpStream::connect((broker.host.as_str(), broker.port)).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let mut buf = Vec::new();
        packet::encode_connect(
            &Connect {
                client_id: &self.options.client_id,
                username: self.options.username.as_deref(),
                password: self.options.password.as_deref(),
                keep_alive_secs: self.options.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            },
            &mut buf,
        )?;
        self.write_bytes(&buf).await?;

        match self.read_packet().await? {
            Packet::ConnAck {
                code: ConnackCode::Accepted,
                ..
            } => {
                self.connected = true;
                debug!("client[{}] CONNACK accepted", self.options.client_id);
                Ok(())
            }
            Packet::ConnAck { code, .. } => {
                self.drop_link();
                Err(ClientError::Refused(code))
            }
            other => {
                self.drop_link();
                Err(ClientError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other
                )))
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let packet_id = match qos {
            QoS::AtLeastOnce => self.next_packet_id(),
            QoS::AtMostOnce => 0,
        };
        let mut buf = Vec::with_capacity(topic.len() + payload.len() + 8);
        packet::encode_publish(topic, payload, qos, packet_id, &mut buf)?;
        self.write_bytes(&buf).await?;

        if qos == QoS::AtMostOnce {
            return Ok(());
        }

        loop {
            match self.read_packet().await? {
                Packet::PubAck { packet_id: acked } if acked == packet_id => return Ok(()),
                Packet::PubAck { packet_id: acked } => {
                    debug!(
                        "client[{}] skipping stale PUBACK {} (waiting for {})",
                        self.options.client_id, acked, packet_id
                    );
                }
                other => {
                    debug!(
                        "client[{}] ignoring {:?} while waiting for PUBACK",
                        self.options.client_id, other
                    );
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_none() {
            return Ok(());
        }
        if self.connected {
            let mut buf = Vec::with_capacity(2);
            packet::encode_disconnect(&mut buf);
            // the link may already be half dead; closing it is what matters
            let _ = self.write_bytes(&buf).await;
        }
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
        self.drop_link();
        debug!("client[{}] disconnected", self.options.client_id);
        Ok(())
    }
}
