//! Minimal MQTT 3.1.1 packet codec.
//!
//! Only the packets a publishing client needs are covered: CONNECT, PUBLISH
//! and DISCONNECT are encoded; CONNACK, PUBACK and PINGRESP are decoded. Any
//! other inbound packet is surfaced as [`Packet::Other`] and ignored by the
//! client.

use crate::error::ClientError;
use std::fmt;

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    /// Map a numeric level to a supported QoS. Level 2 is not supported.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    Unknown(u8),
}

impl From<u8> for ConnackCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ConnackCode::Accepted,
            1 => ConnackCode::UnacceptableProtocolVersion,
            2 => ConnackCode::IdentifierRejected,
            3 => ConnackCode::ServerUnavailable,
            4 => ConnackCode::BadUsernameOrPassword,
            5 => ConnackCode::NotAuthorized,
            other => ConnackCode::Unknown(other),
        }
    }
}

impl fmt::Display for ConnackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnackCode::Accepted => write!(f, "accepted"),
            ConnackCode::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            ConnackCode::IdentifierRejected => write!(f, "identifier rejected"),
            ConnackCode::ServerUnavailable => write!(f, "server unavailable"),
            ConnackCode::BadUsernameOrPassword => write!(f, "bad user name or password"),
            ConnackCode::NotAuthorized => write!(f, "not authorized"),
            ConnackCode::Unknown(code) => write!(f, "unknown return code {}", code),
        }
    }
}

/// Fields of an outbound CONNECT packet.
#[derive(Debug, Clone)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keep_alive_secs: u16,
}

/// One complete control packet split off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// First byte: packet type in the high nibble, flags in the low nibble.
    pub header: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn packet_type(&self) -> u8 {
        self.header >> 4
    }

    pub fn flags(&self) -> u8 {
        self.header & 0x0f
    }
}

/// Inbound packets the client reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        code: ConnackCode,
    },
    PubAck {
        packet_id: u16,
    },
    PingResp,
    Other(u8),
}

impl Packet {
    pub fn decode(frame: &Frame) -> Result<Packet, ClientError> {
        match frame.packet_type() {
            CONNACK => {
                if frame.body.len() != 2 {
                    return Err(ClientError::Protocol(format!(
                        "CONNACK body must be 2 bytes, got {}",
                        frame.body.len()
                    )));
                }
                Ok(Packet::ConnAck {
                    session_present: frame.body[0] & 0x01 == 0x01,
                    code: ConnackCode::from(frame.body[1]),
                })
            }
            PUBACK => {
                if frame.body.len() != 2 {
                    return Err(ClientError::Protocol(format!(
                        "PUBACK body must be 2 bytes, got {}",
                        frame.body.len()
                    )));
                }
                Ok(Packet::PubAck {
                    packet_id: u16::from_be_bytes([frame.body[0], frame.body[1]]),
                })
            }
            PINGRESP => Ok(Packet::PingResp),
            other => Ok(Packet::Other(other)),
        }
    }
}

pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) -> Result<(), ClientError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ClientError::Protocol(format!(
            "packet too large: {} bytes",
            len
        )));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length varint from the start of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded
/// length and the number of bytes it occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, ClientError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 {
            return Err(ClientError::Protocol(
                "remaining length exceeds 4 bytes".to_string(),
            ));
        }
        value += (*byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(ClientError::Protocol(
            "remaining length exceeds 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

fn put_str(value: &str, buf: &mut Vec<u8>) -> Result<(), ClientError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ClientError::Protocol(format!("string too long: {} bytes", value.len())))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn finish_packet(header: u8, body: &[u8], buf: &mut Vec<u8>) -> Result<(), ClientError> {
    buf.push(header);
    encode_remaining_length(body.len(), buf)?;
    buf.extend_from_slice(body);
    Ok(())
}

pub fn encode_connect(connect: &Connect<'_>, buf: &mut Vec<u8>) -> Result<(), ClientError> {
    let mut body = Vec::with_capacity(16 + connect.client_id.len());
    put_str(PROTOCOL_NAME, &mut body)?;
    body.push(PROTOCOL_LEVEL);

    // clean session
    let mut flags = 0x02u8;
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive_secs.to_be_bytes());

    put_str(connect.client_id, &mut body)?;
    if let Some(username) = connect.username {
        put_str(username, &mut body)?;
    }
    if let Some(password) = connect.password {
        put_str(password, &mut body)?;
    }

    finish_packet(CONNECT << 4, &body, buf)
}

/// Encode a PUBLISH. `packet_id` is only written for QoS 1.
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    packet_id: u16,
    buf: &mut Vec<u8>,
) -> Result<(), ClientError> {
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 4);
    put_str(topic, &mut body)?;
    if qos == QoS::AtLeastOnce {
        body.extend_from_slice(&packet_id.to_be_bytes());
    }
    body.extend_from_slice(payload);

    let header = (PUBLISH << 4) | (qos.level() << 1);
    finish_packet(header, &body, buf)
}

pub fn encode_disconnect(buf: &mut Vec<u8>) {
    buf.push(DISCONNECT << 4);
    buf.push(0);
}

/// Split one complete frame off the front of `buf`, leaving any trailing
/// bytes in place. Returns `Ok(None)` if `buf` does not yet hold a whole frame.
pub fn split_frame(buf: &mut Vec<u8>) -> Result<Option<Frame>, ClientError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (len, consumed) = match decode_remaining_length(&buf[1..])? {
        Some(decoded) => decoded,
        None => return Ok(None),
    };
    let total = 1 + consumed + len;
    if buf.len() < total {
        return Ok(None);
    }

    let header = buf[0];
    let body = buf[1 + consumed..total].to_vec();
    buf.drain(..total);
    Ok(Some(Frame { header, body }))
}
