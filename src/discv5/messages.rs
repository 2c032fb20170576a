use crate::types::NodeRecord;
use bytes::Bytes;
use rlp::{DecoderError, Rlp, RlpStream};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Length of the random per-request identifier.
pub const REQUEST_ID_LENGTH: usize = 8;

const PING_KIND: u8 = 0x01;
const PONG_KIND: u8 = 0x02;
const FIND_NODE_KIND: u8 = 0x03;
const NODES_KIND: u8 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("empty message payload")]
    Empty,
    #[error("unknown message kind {0:#x}")]
    UnknownKind(u8),
    #[error(transparent)]
    Rlp(#[from] DecoderError),
}

/// A decrypted protocol message: one kind byte followed by the RLP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Nodes(NodesMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub req_id: Bytes,
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMessage {
    pub req_id: Bytes,
    pub enr_seq: u64,
    /// The address the corresponding PING was received from, so the pinger
    /// can learn its external address.
    pub recipient_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub req_id: Bytes,
    pub distance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesMessage {
    pub req_id: Bytes,
    /// Number of NODES packets this response is split into.
    pub total: u64,
    pub nodes: Vec<NodeRecord>,
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Ping(_) => PING_KIND,
            Message::Pong(_) => PONG_KIND,
            Message::FindNode(_) => FIND_NODE_KIND,
            Message::Nodes(_) => NODES_KIND,
        }
    }

    pub fn req_id(&self) -> &Bytes {
        match self {
            Message::Ping(m) => &m.req_id,
            Message::Pong(m) => &m.req_id,
            Message::FindNode(m) => &m.req_id,
            Message::Nodes(m) => &m.req_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        match self {
            Message::Ping(m) => {
                stream.begin_list(2);
                stream.append(&m.req_id.to_vec());
                stream.append(&m.enr_seq);
            }
            Message::Pong(m) => {
                stream.begin_list(4);
                stream.append(&m.req_id.to_vec());
                stream.append(&m.enr_seq);
                stream.append(&ip_octets(&m.recipient_addr.ip()));
                stream.append(&m.recipient_addr.port());
            }
            Message::FindNode(m) => {
                stream.begin_list(2);
                stream.append(&m.req_id.to_vec());
                stream.append(&m.distance);
            }
            Message::Nodes(m) => {
                stream.begin_list(3);
                stream.append(&m.req_id.to_vec());
                stream.append(&m.total);
                stream.append_list(&m.nodes);
            }
        }
        let body = stream.out();
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(self.kind());
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Message, MessageDecodeError> {
        let (&kind, body) = payload.split_first().ok_or(MessageDecodeError::Empty)?;
        let rlp = Rlp::new(body);
        let req_id = Bytes::from(rlp.val_at::<Vec<u8>>(0)?);
        match kind {
            PING_KIND => Ok(Message::Ping(PingMessage {
                req_id,
                enr_seq: rlp.val_at(1)?,
            })),
            PONG_KIND => {
                let ip = decode_ip(&rlp.val_at::<Vec<u8>>(2)?)?;
                let port: u16 = rlp.val_at(3)?;
                Ok(Message::Pong(PongMessage {
                    req_id,
                    enr_seq: rlp.val_at(1)?,
                    recipient_addr: SocketAddr::new(ip, port),
                }))
            }
            FIND_NODE_KIND => Ok(Message::FindNode(FindNodeMessage {
                req_id,
                distance: rlp.val_at(1)?,
            })),
            NODES_KIND => Ok(Message::Nodes(NodesMessage {
                req_id,
                total: rlp.val_at(1)?,
                nodes: rlp.list_at(2)?,
            })),
            other => Err(MessageDecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Ping(_) => write!(f, "PING"),
            Message::Pong(_) => write!(f, "PONG"),
            Message::FindNode(m) => write!(f, "FINDNODE(d={})", m.distance),
            Message::Nodes(m) => write!(f, "NODES({}/{})", m.nodes.len(), m.total),
        }
    }
}

fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn decode_ip(bytes: &[u8]) -> Result<IpAddr, MessageDecodeError> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(MessageDecodeError::Rlp(DecoderError::Custom(
            "invalid ip length",
        ))),
    }
}
