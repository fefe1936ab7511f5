use std::fmt;
use std::net::SocketAddr;

use rand::Rng as _;

/// Width of a node identifier in bytes.
pub const ID_LEN: usize = 32;

/// Width of a store token in bytes.
pub const TOKEN_LEN: usize = 8;

/// Opaque token issued by a remote peer alongside find responses and echoed
/// back on a subsequent `Store`.
pub type Token = [u8; TOKEN_LEN];

/// A 256-bit node identifier.
///
/// Identifiers are opaque to the DHT; callers typically derive them from
/// content hashes. Distances between identifiers are computed with the XOR
/// metric in [`crate::metric`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Generates a uniformly random identifier.
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Builds an identifier from a byte slice, which must be exactly 32
    /// bytes. Shorter legacy identifiers are rejected, not widened.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A known DHT peer: identifier plus UDP endpoint.
///
/// Two peers are the same peer only if id, address, and port all match; a
/// node that moves endpoints counts as a distinct peer during a lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({:?} @ {})", self.id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_node_id_generate() {
        let id1 = NodeId::generate();
        let id2 = NodeId::generate();
        assert_ne!(id1.0, id2.0);
    }

    #[test]
    fn test_node_id_from_bytes() {
        let bytes = [7u8; ID_LEN];
        let id = NodeId::from_bytes(&bytes).unwrap();
        assert_eq!(id.0, bytes);
    }

    #[test]
    fn test_node_id_rejects_legacy_width() {
        assert!(NodeId::from_bytes(&[1u8; 20]).is_none());
        assert!(NodeId::from_bytes(&[1u8; 33]).is_none());
    }

    #[test]
    fn test_peer_identity_includes_endpoint() {
        let id = NodeId::generate();
        let a = Peer::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000));
        let b = Peer::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4001));
        assert_ne!(a, b);
    }
}
