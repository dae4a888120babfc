//! Publish session: one connected client publishing its share of telemetry.

use crate::client::{settle, BrokerClient, QoS, Settled};
use crate::defaults::{TELEMETRY_KEY, TELEMETRY_TOPIC};
use crate::metrics::LatencyCollector;
use crate::results::{ClientResult, Event};
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Millisecond timestamps for one session, strictly increasing.
#[derive(Debug, Clone)]
pub struct TimestampClock {
    last_ms: i64,
}

impl TimestampClock {
    pub fn starting_at(start_ms: i64) -> Self {
        Self { last_ms: start_ms }
    }

    pub fn starting_now() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    /// The first tick is the start time plus one
    pub fn tick(&mut self) -> i64 {
        self.last_ms += 1;
        self.last_ms
    }
}

/// Telemetry document published by every simulated device
pub fn telemetry_payload(ts: i64) -> Vec<u8> {
    json!({ "ts": ts, "values": { TELEMETRY_KEY: 1.4 } })
        .to_string()
        .into_bytes()
}

/// Settings shared by every session of a run
#[derive(Debug, Clone)]
pub struct PublishSession {
    message_num: usize,
    timeout: Duration,
    topic: String,
    qos: QoS,
    latency_template: LatencyCollector,
}

impl PublishSession {
    /// Create a session publishing `message_num` messages within `timeout`
    pub fn new(message_num: usize, timeout: Duration, qos: QoS) -> Result<Self> {
        Ok(Self {
            message_num,
            timeout,
            topic: TELEMETRY_TOPIC.to_string(),
            qos,
            latency_template: LatencyCollector::new()?,
        })
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish every message on `client` and report how the session ended.
    ///
    /// The session deadline is its start plus the message timeout, so each
    /// publish waits at most for the time the session has left. Only
    /// acknowledged publishes are counted.
    pub async fn run<C: BrokerClient>(&self, client: &mut C) -> ClientResult {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut clock = TimestampClock::starting_now();
        let mut latency = self.latency_template.fresh();
        let mut published = 0;

        let client_id = client.id().to_string();
        let finish = |event: Event, published: usize, latency: LatencyCollector| {
            ClientResult::new(&client_id, event, published, started.elapsed(), latency)
        };

        if !client.is_connected() {
            warn!("client[{}] lost its connection before publishing", client.id());
            return finish(Event::ConnectFailed, 0, latency);
        }

        for _ in 0..self.message_num {
            let now = Instant::now();
            if now >= deadline {
                warn!("client[{}] timeout after {} messages", client.id(), published);
                return finish(Event::TimeoutExceeded, published, latency);
            }

            let payload = telemetry_payload(clock.tick());
            let wait = deadline.saturating_duration_since(now);
            match settle(wait, client.publish(&self.topic, &payload, self.qos)).await {
                Settled::Done(()) => {
                    published += 1;
                    latency.record(now.elapsed());
                }
                Settled::TimedOut => {
                    warn!("client[{}] timeout waiting for ack", client.id());
                    return finish(Event::TimeoutExceeded, published, latency);
                }
                Settled::Failed(e) => {
                    warn!("client[{}] publish failed: {}", client.id(), e);
                    return finish(Event::PublishFail, published, latency);
                }
            }
        }

        debug!("client[{}] published {} messages", client.id(), published);
        finish(Event::PublishComplete, published, latency)
    }

    /// Run the session and hand its result to the collector.
    pub async fn run_and_report<C: BrokerClient>(
        &self,
        client: &mut C,
        results: &mpsc::Sender<ClientResult>,
    ) {
        let result = self.run(client).await;
        if results.send(result).await.is_err() {
            debug!("client[{}] result arrived after collection ended", client.id());
        }
    }
}
