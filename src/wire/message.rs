use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::DecodeError;
use crate::node::{NodeId, Peer, Token, ID_LEN, TOKEN_LEN};

/// Magic prefix opening every datagram.
pub const MAGIC: [u8; 8] = [0xAF, 0x40, 0x0D, 0x34, 0xA7, 0x88, 0x37, 0x2D];

/// Prefix of the retired wire format, recognized only to report
/// [`DecodeError::OldVersion`].
pub const LEGACY_MAGIC: [u8; 10] = *b"EDHT-KDM-\x00";

/// Correlation tag echoed verbatim between a query and its response.
pub type Tag = u16;

const KIND_QUERY: u8 = b'q';
const KIND_RESPONSE: u8 = b'r';
const KIND_ERROR: u8 = b'e';

const FAMILY_V4: u8 = 0x04;
const FAMILY_V6: u8 = 0x06;

/// A query body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    FindValue { target: NodeId },
    Store { token: Token, id: NodeId, port: u16 },
}

/// A response body.
///
/// `Ping` is empty on the wire; the envelope's sender id carries identity.
/// Both find responses include the 8-byte token the responder would accept
/// on a later `Store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping,
    FindNode { token: Token, peers: Vec<Peer> },
    FindValue { token: Token, endpoints: Vec<SocketAddr> },
    Store,
}

/// An error body: a numeric code and an opaque message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u16,
    pub message: Bytes,
}

/// The body of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Query(Query),
    Response(Response),
    Error(RemoteError),
}

/// A complete wire message: correlation tag, sender id, and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: Tag,
    pub sender: NodeId,
    pub payload: Payload,
}

impl Envelope {
    pub fn query(tag: Tag, sender: NodeId, query: Query) -> Self {
        Self {
            tag,
            sender,
            payload: Payload::Query(query),
        }
    }

    pub fn response(tag: Tag, sender: NodeId, response: Response) -> Self {
        Self {
            tag,
            sender,
            payload: Payload::Response(response),
        }
    }

    pub fn error(tag: Tag, sender: NodeId, code: u16, message: impl Into<Bytes>) -> Self {
        Self {
            tag,
            sender,
            payload: Payload::Error(RemoteError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Encodes the message into a complete datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAGIC.len() + 2 + ID_LEN + 64);
        buf.put_slice(&MAGIC);
        buf.put_u16(self.tag);
        buf.put_slice(self.sender.as_bytes());

        match &self.payload {
            Payload::Query(query) => {
                buf.put_u8(KIND_QUERY);
                query.encode(&mut buf);
            }
            Payload::Response(response) => {
                buf.put_u8(KIND_RESPONSE);
                response.encode(&mut buf);
            }
            Payload::Error(err) => {
                buf.put_u8(KIND_ERROR);
                buf.put_u16(err.code);
                buf.put_slice(&err.message);
            }
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.starts_with(&LEGACY_MAGIC) {
            return Err(DecodeError::OldVersion);
        }
        if !data.starts_with(&MAGIC) {
            // A short prefix of a known magic is truncation, not junk.
            if MAGIC.starts_with(data) || LEGACY_MAGIC.starts_with(data) {
                return Err(DecodeError::Truncated);
            }
            return Err(DecodeError::BadMagic);
        }

        let mut buf = &data[MAGIC.len()..];
        need(&buf, 2)?;
        let tag = buf.get_u16();
        let sender = get_id(&mut buf)?;

        need(&buf, 1)?;
        let payload = match buf.get_u8() {
            KIND_QUERY => Payload::Query(Query::decode(&mut buf)?),
            KIND_RESPONSE => Payload::Response(Response::decode(&mut buf)?),
            KIND_ERROR => {
                need(&buf, 2)?;
                let code = buf.get_u16();
                let message = Bytes::copy_from_slice(buf);
                Payload::Error(RemoteError { code, message })
            }
            kind => return Err(DecodeError::UnknownKind(kind)),
        };

        Ok(Self {
            tag,
            sender,
            payload,
        })
    }
}

impl Query {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Query::Ping => {
                buf.put_u8(b'p');
            }
            Query::FindNode { target } => {
                buf.put_u8(b'f');
                buf.put_u8(b'n');
                buf.put_slice(target.as_bytes());
            }
            Query::FindValue { target } => {
                buf.put_u8(b'f');
                buf.put_u8(b'v');
                buf.put_slice(target.as_bytes());
            }
            Query::Store { token, id, port } => {
                buf.put_u8(b's');
                buf.put_slice(token);
                buf.put_slice(id.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        match buf.get_u8() {
            b'p' => Ok(Query::Ping),
            b'f' => {
                need(buf, 1)?;
                match buf.get_u8() {
                    b'n' => Ok(Query::FindNode {
                        target: get_id(buf)?,
                    }),
                    b'v' => Ok(Query::FindValue {
                        target: get_id(buf)?,
                    }),
                    mode => Err(DecodeError::UnknownBody(mode)),
                }
            }
            b's' => {
                let token = get_token(buf)?;
                let id = get_id(buf)?;
                need(buf, 2)?;
                let port = buf.get_u16();
                Ok(Query::Store { token, id, port })
            }
            body => Err(DecodeError::UnknownBody(body)),
        }
    }
}

impl Response {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Response::Ping => {
                buf.put_u8(b'p');
            }
            Response::FindNode { token, peers } => {
                debug_assert!(peers.len() <= u8::MAX as usize);
                buf.put_u8(b'f');
                buf.put_u8(b'n');
                buf.put_slice(token);
                buf.put_u8(peers.len() as u8);
                for peer in peers {
                    put_peer(buf, peer);
                }
            }
            Response::FindValue { token, endpoints } => {
                debug_assert!(endpoints.len() <= u8::MAX as usize);
                buf.put_u8(b'f');
                buf.put_u8(b'v');
                buf.put_slice(token);
                buf.put_u8(endpoints.len() as u8);
                for addr in endpoints {
                    put_endpoint(buf, addr);
                }
            }
            Response::Store => {
                buf.put_u8(b's');
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        match buf.get_u8() {
            b'p' => Ok(Response::Ping),
            b'f' => {
                need(buf, 1)?;
                match buf.get_u8() {
                    b'n' => {
                        let token = get_token(buf)?;
                        need(buf, 1)?;
                        let count = buf.get_u8() as usize;
                        let mut peers = Vec::with_capacity(count);
                        for _ in 0..count {
                            peers.push(get_peer(buf)?);
                        }
                        Ok(Response::FindNode { token, peers })
                    }
                    b'v' => {
                        let token = get_token(buf)?;
                        need(buf, 1)?;
                        let count = buf.get_u8() as usize;
                        let mut endpoints = Vec::with_capacity(count);
                        for _ in 0..count {
                            endpoints.push(get_endpoint(buf)?);
                        }
                        Ok(Response::FindValue { token, endpoints })
                    }
                    mode => Err(DecodeError::UnknownBody(mode)),
                }
            }
            b's' => Ok(Response::Store),
            body => Err(DecodeError::UnknownBody(body)),
        }
    }
}

fn need(buf: &impl Buf, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    Ok(())
}

fn get_id(buf: &mut &[u8]) -> Result<NodeId, DecodeError> {
    need(buf, ID_LEN)?;
    let mut id = [0u8; ID_LEN];
    buf.copy_to_slice(&mut id);
    Ok(NodeId(id))
}

fn get_token(buf: &mut &[u8]) -> Result<Token, DecodeError> {
    need(buf, TOKEN_LEN)?;
    let mut token = [0u8; TOKEN_LEN];
    buf.copy_to_slice(&mut token);
    Ok(token)
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}

fn family_of(addr: &SocketAddr) -> u8 {
    match addr {
        SocketAddr::V4(_) => FAMILY_V4,
        SocketAddr::V6(_) => FAMILY_V6,
    }
}

fn put_peer(buf: &mut BytesMut, peer: &Peer) {
    buf.put_u8(family_of(&peer.addr));
    buf.put_slice(peer.id.as_bytes());
    put_addr(buf, &peer.addr);
}

fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    buf.put_u8(family_of(addr));
    put_addr(buf, addr);
}

fn get_addr(buf: &mut &[u8], family: u8) -> Result<SocketAddr, DecodeError> {
    let ip = match family {
        FAMILY_V4 => {
            need(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            need(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => return Err(DecodeError::UnknownFamily(family)),
    };
    let port = buf.get_u16();
    Ok(SocketAddr::new(ip, port))
}

fn get_peer(buf: &mut &[u8]) -> Result<Peer, DecodeError> {
    need(buf, 1)?;
    let family = buf.get_u8();
    if family != FAMILY_V4 && family != FAMILY_V6 {
        return Err(DecodeError::UnknownFamily(family));
    }
    let id = get_id(buf)?;
    let addr = get_addr(buf, family)?;
    Ok(Peer::new(id, addr))
}

fn get_endpoint(buf: &mut &[u8]) -> Result<SocketAddr, DecodeError> {
    need(buf, 1)?;
    let family = buf.get_u8();
    get_addr(buf, family)
}
