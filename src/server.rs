//! UDP peer: socket loop, query handling, and the real lookup transport.
//!
//! The server owns the socket, the routing table, and the per-id endpoint
//! store. Outbound queries are correlated to responses by the 16-bit tag;
//! inbound queries are answered inline. Store authorization uses rotating
//! secret tokens so only peers we recently answered can store through us.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::lookup::{Lookup, Reply, Transport, ALPHA};
use crate::metric;
use crate::node::{NodeId, Peer, Token};
use crate::routing::RoutingTable;
use crate::wire::{DecodeError, Envelope, Payload, Query, Response, Tag};

const QUERY_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_PENDING_QUERIES: usize = 100;
const TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);
const BUCKET_REFRESH: Duration = Duration::from_secs(15 * 60);
const ENDPOINT_LIFETIME: Duration = Duration::from_secs(30 * 60);
const MAX_ENDPOINTS_PER_ID: usize = 1000;

/// Error code sent when a `Store` carries a token we never issued.
const STORE_REJECTED: u16 = 203;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("query timed out")]
    Timeout,

    #[error("too many in-flight queries")]
    RateLimited,

    #[error("remote error {code}")]
    Remote { code: u16, message: Bytes },
}

struct PendingQuery {
    sender: mpsc::Sender<Result<Response, ServerError>>,
}

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

struct StoredEndpoint {
    addr: SocketAddr,
    stored_at: Instant,
}

/// Endpoints announced against an id. Re-announcing refreshes the entry;
/// entries expire after [`ENDPOINT_LIFETIME`].
struct EndpointStore {
    entries: HashMap<NodeId, Vec<StoredEndpoint>>,
}

impl EndpointStore {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn add(&mut self, id: NodeId, addr: SocketAddr) {
        let endpoints = self.entries.entry(id).or_default();
        let now = Instant::now();

        endpoints.retain(|e| now.duration_since(e.stored_at) < ENDPOINT_LIFETIME);
        endpoints.retain(|e| e.addr != addr);

        if endpoints.len() < MAX_ENDPOINTS_PER_ID {
            endpoints.push(StoredEndpoint {
                addr,
                stored_at: now,
            });
        }
    }

    fn get(&mut self, id: &NodeId) -> Vec<SocketAddr> {
        let now = Instant::now();
        match self.entries.get_mut(id) {
            Some(endpoints) => {
                endpoints.retain(|e| now.duration_since(e.stored_at) < ENDPOINT_LIFETIME);
                endpoints.iter().map(|e| e.addr).collect()
            }
            None => Vec::new(),
        }
    }
}

/// A DHT peer bound to a UDP port.
///
/// ```no_run
/// use edht::{NodeId, Server};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = std::sync::Arc::new(Server::bind(6881).await?);
///
/// let runner = server.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// server.bootstrap(&["198.51.100.7:6881".parse()?]).await;
/// let endpoints = server.get(NodeId::generate()).await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    socket: UdpSocket,
    id: NodeId,
    routing: RoutingTable,
    pending: RwLock<HashMap<Tag, PendingQuery>>,
    port: u16,
    secrets: RwLock<TokenSecrets>,
    store: RwLock<EndpointStore>,
}

impl Server {
    pub async fn bind(port: u16) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_addr = socket.local_addr()?;
        let id = NodeId::generate();

        info!("dht peer bound to {} with id {}", local_addr, id);

        Ok(Self {
            socket,
            id,
            routing: RoutingTable::new(id),
            pending: RwLock::new(HashMap::new()),
            port: local_addr.port(),
            secrets: RwLock::new(TokenSecrets::new()),
            store: RwLock::new(EndpointStore::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Pings the given seeds, then fills the table with a lookup for our own
    /// id. Unreachable seeds are logged and skipped.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) {
        info!("bootstrapping from {} seed(s)", seeds.len());

        for &addr in seeds {
            if let Err(err) = self.ping(addr).await {
                warn!("bootstrap seed {} unreachable: {}", addr, err);
            }
        }

        self.lookup_nodes(self.id).await;
        info!(
            "bootstrap complete, {} peers in routing table",
            self.routing.len()
        );
    }

    /// Checks that a peer is alive; any well-formed response counts.
    pub async fn ping(&self, addr: SocketAddr) -> Result<(), ServerError> {
        self.send_query(addr, Query::Ping).await.map(|_| ())
    }

    /// Iterative find-node lookup, closest respondents first.
    pub async fn lookup_nodes(&self, target: NodeId) -> Vec<Peer> {
        Lookup::new(&self.routing, self).find_node(target).await
    }

    /// Fetches the endpoints the network associates with `target`.
    pub async fn get(&self, target: NodeId) -> Vec<SocketAddr> {
        Lookup::new(&self.routing, self)
            .find_value(target)
            .await
            .endpoints
    }

    /// Associates `(our ip as seen by each peer, port)` with `target` on the
    /// closest token-bearing respondents. Returns how many accepted.
    pub async fn announce(&self, target: NodeId, port: u16) -> usize {
        let found = Lookup::new(&self.routing, self).find_value(target).await;

        let mut candidates = found.store;
        candidates.sort_by_key(|(peer, _)| metric::distance(&peer.id, &target));
        candidates.truncate(ALPHA);

        let stores = candidates.iter().map(|(peer, token)| async move {
            self.send_query(
                peer.addr,
                Query::Store {
                    token: *token,
                    id: target,
                    port,
                },
            )
            .await
        });

        let accepted = join_all(stores)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(Response::Store)))
            .count();

        debug!("announced {} to {} peer(s)", target, accepted);
        accepted
    }

    async fn send_query(
        &self,
        addr: SocketAddr,
        query: Query,
    ) -> Result<Response, ServerError> {
        let (tx, mut rx) = mpsc::channel(1);

        let tag = {
            let mut pending = self.pending.write();
            if pending.len() >= MAX_PENDING_QUERIES {
                return Err(ServerError::RateLimited);
            }

            let mut tag: Tag = rand::rng().random();
            while pending.contains_key(&tag) {
                tag = rand::rng().random();
            }
            pending.insert(tag, PendingQuery { sender: tx });
            tag
        };

        let data = Envelope::query(tag, self.id, query).encode();
        let result = async {
            self.socket.send_to(&data, addr).await?;

            match timeout(QUERY_TIMEOUT, rx.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) | Err(_) => Err(ServerError::Timeout),
            }
        }
        .await;

        self.pending.write().remove(&tag);
        result
    }

    /// Serves the socket until an I/O error. Also rotates token secrets and
    /// refreshes stale buckets on their intervals.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; 65535];
        let mut refresh = tokio::time::interval(BUCKET_REFRESH);
        let mut rotation = tokio::time::interval(TOKEN_ROTATION);

        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rotation.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        refresh.tick().await;
        rotation.tick().await;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, from) = result?;
                    if let Err(err) = self.process(&buf[..n], from).await {
                        debug!("dropping datagram from {}: {}", from, err);
                    }
                }
                _ = refresh.tick() => {
                    self.refresh_stale_buckets().await;
                }
                _ = rotation.tick() => {
                    self.rotate_token_secret();
                }
            }
        }
    }

    /// Feeds one raw datagram into the peer. `run` calls this for every
    /// packet it receives; embedders driving their own socket can call it
    /// directly. Fails only when the bytes do not decode.
    pub async fn process(&self, data: &[u8], from: SocketAddr) -> Result<(), ServerError> {
        let envelope = Envelope::decode(data)?;
        self.handle_envelope(envelope, from).await;
        Ok(())
    }

    async fn handle_envelope(&self, envelope: Envelope, from: SocketAddr) {
        self.routing.add(Peer::new(envelope.sender, from));

        match envelope.payload {
            Payload::Response(response) => {
                self.routing.mark_seen(&envelope.sender);
                let pending = self.pending.read();
                if let Some(query) = pending.get(&envelope.tag) {
                    let _ = query.sender.try_send(Ok(response));
                }
            }
            Payload::Error(err) => {
                let pending = self.pending.read();
                if let Some(query) = pending.get(&envelope.tag) {
                    let _ = query.sender.try_send(Err(ServerError::Remote {
                        code: err.code,
                        message: err.message,
                    }));
                }
            }
            Payload::Query(query) => {
                let reply = self.answer(envelope.tag, query, from);
                let _ = self.socket.send_to(&reply.encode(), from).await;
            }
        }
    }

    fn answer(&self, tag: Tag, query: Query, from: SocketAddr) -> Envelope {
        match query {
            Query::Ping => Envelope::response(tag, self.id, Response::Ping),
            Query::FindNode { target } => {
                let token = self.issue_token(&from);
                let peers = self.routing.closest_to(&target, ALPHA);
                Envelope::response(tag, self.id, Response::FindNode { token, peers })
            }
            Query::FindValue { target } => {
                let token = self.issue_token(&from);
                let mut endpoints = self.store.write().get(&target);
                endpoints.truncate(ALPHA);

                if endpoints.is_empty() {
                    let peers = self.routing.closest_to(&target, ALPHA);
                    Envelope::response(tag, self.id, Response::FindNode { token, peers })
                } else {
                    Envelope::response(tag, self.id, Response::FindValue { token, endpoints })
                }
            }
            Query::Store { token, id, port } => {
                if self.validate_token(&from, &token) {
                    self.store.write().add(id, SocketAddr::new(from.ip(), port));
                    Envelope::response(tag, self.id, Response::Store)
                } else {
                    debug!("rejecting store from {}: invalid token", from);
                    Envelope::error(
                        tag,
                        self.id,
                        STORE_REJECTED,
                        Bytes::from_static(b"invalid token"),
                    )
                }
            }
        }
    }

    async fn refresh_stale_buckets(&self) {
        let stale = self.routing.stale_buckets();
        if stale.is_empty() {
            return;
        }

        debug!("refreshing {} stale bucket(s)", stale.len());

        for bucket_idx in stale {
            let target = self.routing.random_id_in_bucket(bucket_idx);
            self.lookup_nodes(target).await;
        }
    }

    fn issue_token(&self, addr: &SocketAddr) -> Token {
        token_for(&self.secrets.read().current, addr)
    }

    fn validate_token(&self, addr: &SocketAddr, token: &Token) -> bool {
        let secrets = self.secrets.read();
        token_for(&secrets.current, addr) == *token
            || token_for(&secrets.previous, addr) == *token
    }

    pub fn rotate_token_secret(&self) {
        self.secrets.write().rotate();
        debug!("store token secret rotated");
    }
}

/// Tokens commit to the requester's IP but not its port, so a peer can store
/// through a different source port than it queried from.
fn token_for(secret: &[u8; 16], addr: &SocketAddr) -> Token {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().to_string().as_bytes());

    let digest = hasher.finalize();
    let mut token = [0u8; 8];
    token.copy_from_slice(&digest[..8]);
    token
}

#[async_trait]
impl Transport for Server {
    async fn find_node(&self, peer: &Peer, target: NodeId) -> Reply {
        self.find_reply(peer, Query::FindNode { target }).await
    }

    async fn find_value(&self, peer: &Peer, target: NodeId) -> Reply {
        self.find_reply(peer, Query::FindValue { target }).await
    }
}

impl Server {
    /// Normalizes every failure into a [`Reply`] value; lookups never see
    /// transport errors.
    async fn find_reply(&self, peer: &Peer, query: Query) -> Reply {
        match self.send_query(peer.addr, query).await {
            Ok(Response::FindNode { token, peers }) => Reply::Nodes { token, peers },
            Ok(Response::FindValue { token, endpoints }) => Reply::Values { token, endpoints },
            Ok(other) => {
                debug!("unexpected find reply from {}: {:?}", peer.addr, other);
                Reply::Timeout
            }
            Err(ServerError::Remote { code, message }) => Reply::Failed { code, message },
            Err(ServerError::Timeout) => {
                self.routing.mark_failed(&peer.id);
                Reply::Timeout
            }
            Err(err) => {
                debug!("find query to {} failed: {}", peer.addr, err);
                Reply::Timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DecodeError;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn local_addr(server: &Server) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.port())
    }

    async fn spawn_server() -> Arc<Server> {
        let server = Arc::new(Server::bind(0).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        server
    }

    #[tokio::test]
    async fn test_ping_learns_both_sides() {
        let a = spawn_server().await;
        let b = spawn_server().await;

        a.ping(local_addr(&b)).await.unwrap();

        assert_eq!(a.routing().len(), 1);
        assert_eq!(b.routing().len(), 1);
        assert_eq!(a.routing().closest_to(&b.id(), 1)[0].id, b.id());
    }

    #[tokio::test]
    async fn test_lookup_finds_known_peer() {
        let a = spawn_server().await;
        let b = spawn_server().await;

        a.ping(local_addr(&b)).await.unwrap();

        let found = a.lookup_nodes(NodeId::generate()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id());
    }

    #[tokio::test]
    async fn test_announce_then_get_round_trip() {
        let a = spawn_server().await;
        let b = spawn_server().await;
        let target = NodeId::generate();

        a.ping(local_addr(&b)).await.unwrap();

        let accepted = a.announce(target, 7777).await;
        assert_eq!(accepted, 1);

        let endpoints = a.get(target).await;
        assert_eq!(
            endpoints,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7777)]
        );
    }

    #[tokio::test]
    async fn test_store_with_bogus_token_rejected() {
        let b = spawn_server().await;

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let store = Envelope::query(
            0x7777,
            NodeId::generate(),
            Query::Store {
                token: [0; 8],
                id: NodeId::generate(),
                port: 9999,
            },
        );
        socket.send_to(&store.encode(), local_addr(&b)).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let reply = Envelope::decode(&buf[..n]).unwrap();

        assert_eq!(reply.tag, 0x7777);
        match reply.payload {
            Payload::Error(err) => assert_eq!(err.code, STORE_REJECTED),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_legacy_datagrams_are_dropped() {
        let b = spawn_server().await;

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        socket.send_to(b"EDHT-KDM-\x00\x00", local_addr(&b)).await.unwrap();
        socket.send_to(b"garbage", local_addr(&b)).await.unwrap();

        // The server must still answer well-formed traffic afterwards.
        let ping = Envelope::query(0x0001, NodeId::generate(), Query::Ping);
        socket.send_to(&ping.encode(), local_addr(&b)).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let reply = Envelope::decode(&buf[..n]).unwrap();
        assert_eq!(reply.tag, 0x0001);
        assert_eq!(reply.payload, Payload::Response(Response::Ping));
    }

    #[tokio::test]
    async fn test_process_surfaces_decode_errors() {
        let server = Server::bind(0).await.unwrap();
        let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        assert!(matches!(
            server.process(b"EDHT-KDM-\x00\x00", from).await,
            Err(ServerError::Decode(DecodeError::OldVersion))
        ));
        assert!(matches!(
            server.process(b"garbage", from).await,
            Err(ServerError::Decode(DecodeError::BadMagic))
        ));
        assert!(server.routing().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_store_expires_and_refreshes() {
        let mut store = EndpointStore::new();
        let id = NodeId::generate();
        let addr: SocketAddr = "127.0.0.1:7777".parse().unwrap();

        store.add(id, addr);
        assert_eq!(store.get(&id), vec![addr]);

        // Re-announcing two thirds through the lifetime restarts the clock.
        tokio::time::advance(ENDPOINT_LIFETIME * 2 / 3).await;
        store.add(id, addr);

        tokio::time::advance(ENDPOINT_LIFETIME * 2 / 3).await;
        assert_eq!(store.get(&id), vec![addr]);

        tokio::time::advance(ENDPOINT_LIFETIME).await;
        assert!(store.get(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_value_falls_back_to_nodes_after_expiry() {
        let server = Server::bind(0).await.unwrap();
        let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let target = NodeId::generate();

        let token = server.issue_token(&from);
        let stored = server.answer(
            1,
            Query::Store {
                token,
                id: target,
                port: 7777,
            },
            from,
        );
        assert_eq!(stored.payload, Payload::Response(Response::Store));

        match server.answer(2, Query::FindValue { target }, from).payload {
            Payload::Response(Response::FindValue { endpoints, .. }) => {
                assert_eq!(
                    endpoints,
                    vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7777)]
                );
            }
            other => panic!("expected a values reply, got {:?}", other),
        }

        tokio::time::advance(ENDPOINT_LIFETIME + Duration::from_secs(1)).await;

        // The association is gone; the same query now gets a referral.
        match server.answer(3, Query::FindValue { target }, from).payload {
            Payload::Response(Response::FindNode { peers, .. }) => {
                assert!(peers.is_empty());
            }
            other => panic!("expected a nodes reply, got {:?}", other),
        }
    }
}
