#![allow(dead_code)]

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tbload::client::packet::{self, CONNECT, DISCONNECT, PUBLISH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the fake broker answers CONNECT
#[derive(Debug, Clone, Copy)]
pub enum BrokerBehavior {
    Accept,
    /// Answer with this CONNACK return code
    Refuse(u8),
    /// Never answer
    Silent,
}

#[derive(Debug, Default)]
pub struct BrokerCounters {
    pub connects: AtomicUsize,
    pub publishes: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub usernames: Mutex<Vec<String>>,
    pub keep_alives: Mutex<Vec<u16>>,
    pub topics: Mutex<Vec<String>>,
}

/// In-process MQTT broker speaking just enough 3.1.1 for the load engine
pub struct FakeBroker {
    pub addr: SocketAddr,
    pub counters: Arc<BrokerCounters>,
}

impl FakeBroker {
    pub async fn start(behavior: BrokerBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let counters = Arc::new(BrokerCounters::default());

        let shared = Arc::clone(&counters);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counters = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, behavior, counters).await;
                });
            }
        });

        Ok(Self { addr, counters })
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> usize {
        self.counters.publishes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }
}

fn read_str(body: &[u8], at: usize) -> Option<(String, usize)> {
    let len = u16::from_be_bytes([*body.get(at)?, *body.get(at + 1)?]) as usize;
    let bytes = body.get(at + 2..at + 2 + len)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), at + 2 + len))
}

fn connect_keep_alive(body: &[u8]) -> Option<u16> {
    let (_, at) = read_str(body, 0)?;
    Some(u16::from_be_bytes([*body.get(at + 2)?, *body.get(at + 3)?]))
}

fn connect_username(body: &[u8]) -> Option<String> {
    // protocol name, level, flags, keep-alive
    let (_, at) = read_str(body, 0)?;
    let flags = *body.get(at + 1)?;
    let (_, at) = read_str(body, at + 4)?;
    if flags & 0x80 == 0 {
        return None;
    }
    read_str(body, at).map(|(name, _)| name)
}

async fn serve(
    mut stream: TcpStream,
    behavior: BrokerBehavior,
    counters: Arc<BrokerCounters>,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(frame) = packet::split_frame(&mut buf)? {
            match frame.packet_type() {
                CONNECT => {
                    counters.connects.fetch_add(1, Ordering::SeqCst);
                    if let Some(secs) = connect_keep_alive(&frame.body) {
                        counters.keep_alives.lock().unwrap().push(secs);
                    }
                    if let Some(name) = connect_username(&frame.body) {
                        counters.usernames.lock().unwrap().push(name);
                    }
                    match behavior {
                        BrokerBehavior::Accept => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?,
                        BrokerBehavior::Refuse(code) => {
                            stream.write_all(&[0x20, 0x02, 0x00, code]).await?
                        }
                        BrokerBehavior::Silent => {}
                    }
                }
                PUBLISH => {
                    counters.publishes.fetch_add(1, Ordering::SeqCst);
                    let (topic, at) = read_str(&frame.body, 0).unwrap_or_default();
                    counters.topics.lock().unwrap().push(topic);
                    if (frame.flags() >> 1) & 0x03 == 1 {
                        let id = [frame.body[at], frame.body[at + 1]];
                        stream.write_all(&[0x40, 0x02, id[0], id[1]]).await?;
                    }
                }
                DISCONNECT => {
                    counters.disconnects.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                _ => {}
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Canned HTTP response for the fake ThingsBoard server
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub body: String,
}

impl CannedResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

/// Request line, auth header and body of one request the fake server saw
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering `METHOD path` (query string excluded)
/// from a routing table; unknown routes get 404.
pub struct FakeThingsBoard {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl FakeThingsBoard {
    pub async fn start(routes: HashMap<String, CannedResponse>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve_http(stream, routes, log).await;
                });
            }
        });

        Ok(Self { addr, seen })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn serve_http(
    mut stream: TcpStream,
    routes: Arc<HashMap<String, CannedResponse>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();

    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name == "x-authorization" {
                authorization = Some(value.trim().to_string());
            }
        }
    }
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();

    let key = format!("{} {}", method, path);
    seen.lock().unwrap().push(SeenRequest {
        method,
        path,
        authorization,
        body,
    });

    let response = routes.get(&key).cloned().unwrap_or(CannedResponse {
        status: 404,
        body: String::new(),
    });
    let reply = format!(
        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        response.status,
        response.body.len(),
        response.body
    );
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
