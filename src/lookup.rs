//! Iterative parallel Kademlia lookup.
//!
//! A lookup proceeds in rounds. Each round queries up to [`ALPHA`] peers
//! concurrently, folds the replies into the `done`/`alive` state, and selects
//! the next work queue from the freshly referred peers closest to the target.
//! The retry budget drains while no referred peer is strictly closer than the
//! best responder so far, and refills to 3 whenever one is; the lookup
//! finishes when the budget hits zero.
//!
//! The engine never talks to the network itself: it drives a [`Transport`],
//! which turns timeouts and remote errors into plain [`Reply`] values. A
//! lookup therefore cannot fail; it converges or exhausts its budget and
//! returns whatever it found.

use std::collections::HashSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tracing::debug;

use crate::metric::{self, Distance};
use crate::node::{NodeId, Peer, Token};
use crate::routing::RoutingTable;

/// Search width: peak concurrent RPCs per round.
pub const ALPHA: usize = 32;

/// Rounds a lookup tolerates without getting strictly closer to the target.
const RETRY_BUDGET: u32 = 3;

/// Issues find RPCs on behalf of a lookup.
///
/// Implementations express every failure as a [`Reply`] value; a lookup
/// worker returning an error is a programming bug, not a network condition.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn find_node(&self, peer: &Peer, target: NodeId) -> Reply;
    async fn find_value(&self, peer: &Peer, target: NodeId) -> Reply;
}

/// Outcome of a single find RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The peer referred us onward. A find-value query lands here when the
    /// responder holds no endpoints for the target.
    Nodes { token: Token, peers: Vec<Peer> },
    /// The peer returned stored endpoints for the target.
    Values { token: Token, endpoints: Vec<SocketAddr> },
    /// No response within the transport's deadline.
    Timeout,
    /// The peer answered with a protocol error.
    Failed { code: u16, message: Bytes },
}

/// Result of a find-value lookup.
#[derive(Debug, Default)]
pub struct Found {
    /// Every respondent that contributed a row, with the token it issued;
    /// candidates for a follow-up `Store`.
    pub store: Vec<(Peer, Token)>,
    /// Deduplicated union of all returned endpoints, first-seen order.
    pub endpoints: Vec<SocketAddr>,
    /// Peers that responded successfully during the lookup.
    pub alive: HashSet<Peer>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Node,
    Value,
}

struct State {
    done: HashSet<Peer>,
    alive: HashSet<Peer>,
    acc: Vec<(Peer, Token, Vec<SocketAddr>)>,
    retries: u32,
}

/// A lookup driver borrowing the local routing table and a transport.
pub struct Lookup<'a, T> {
    routing: &'a RoutingTable,
    transport: &'a T,
}

impl<'a, T: Transport> Lookup<'a, T> {
    pub fn new(routing: &'a RoutingTable, transport: &'a T) -> Self {
        Self { routing, transport }
    }

    /// Runs a find-node lookup and returns the peers that answered, closest
    /// to `target` first.
    pub async fn find_node(&self, target: NodeId) -> Vec<Peer> {
        let state = self.run(Kind::Node, target).await;

        let mut peers: Vec<Peer> = state.alive.into_iter().collect();
        peers.sort_by_key(|peer| metric::distance(&peer.id, &target));
        peers
    }

    /// Runs a find-value lookup and returns the collected endpoints together
    /// with the store candidates and the alive set.
    pub async fn find_value(&self, target: NodeId) -> Found {
        let state = self.run(Kind::Value, target).await;

        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        for (_, _, found) in &state.acc {
            for addr in found {
                if seen.insert(*addr) {
                    endpoints.push(*addr);
                }
            }
        }

        Found {
            store: state.acc.iter().map(|(peer, token, _)| (*peer, *token)).collect(),
            endpoints,
            alive: state.alive,
        }
    }

    async fn run(&self, kind: Kind, target: NodeId) -> State {
        let local = self.routing.node_id();
        let mut state = State {
            done: HashSet::new(),
            alive: HashSet::new(),
            acc: Vec::new(),
            retries: RETRY_BUDGET,
        };
        let mut todo = self.routing.closest_to(&target, ALPHA);
        let mut round = 0u32;

        loop {
            round += 1;

            // Fan out to the whole work queue; completion order is
            // irrelevant, the round barrier is the join.
            let replies = join_all(todo.iter().map(|peer| async move {
                let reply = match kind {
                    Kind::Node => self.transport.find_node(peer, target).await,
                    Kind::Value => self.transport.find_value(peer, target).await,
                };
                (*peer, reply)
            }))
            .await;

            state.done.extend(todo.iter().copied());

            let mut referred: Vec<Peer> = Vec::new();
            for (peer, reply) in replies {
                match reply {
                    Reply::Nodes { token, peers } => {
                        state.alive.insert(peer);
                        if kind == Kind::Value {
                            state.acc.push((peer, token, Vec::new()));
                        }
                        referred.extend(peers);
                    }
                    Reply::Values { token, endpoints } => {
                        state.alive.insert(peer);
                        if kind == Kind::Value {
                            state.acc.push((peer, token, endpoints));
                        }
                    }
                    Reply::Timeout | Reply::Failed { .. } => {}
                }
            }

            referred.retain(|peer| peer.id != local && !state.done.contains(peer));
            let next = metric::neighborhood(&target, &referred, ALPHA);

            // Convergence predicate: is the work queue strictly closer to
            // the target than anything that has answered? Empty sets sit at
            // infinity, so an empty queue can never be closer.
            let min_next = self.min_distance(&next, &target);
            let min_alive = self.min_distance(&state.alive, &target);
            let converging = match (min_next, min_alive) {
                (Some(work), Some(best)) => work < best,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if converging {
                state.retries = RETRY_BUDGET;
            } else {
                state.retries -= 1;
            }

            debug!(
                "lookup round {}: queried={} alive={} next={} retries={}",
                round,
                state.done.len(),
                state.alive.len(),
                next.len(),
                state.retries
            );

            if state.retries == 0 {
                return state;
            }
            todo = next;
        }
    }

    fn min_distance<'p>(
        &self,
        peers: impl IntoIterator<Item = &'p Peer>,
        target: &NodeId,
    ) -> Option<Distance> {
        peers
            .into_iter()
            .map(|peer| metric::distance(&peer.id, target))
            .min()
    }
}
