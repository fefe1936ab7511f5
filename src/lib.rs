//! edht - a content-neutral Kademlia DHT peer
//!
//! This library associates opaque 256-bit identifiers with `{IP, port}`
//! endpoints. It is content-neutral: callers choose the identifiers
//! (typically content hashes) and layer their own protocol on the endpoint
//! sets a lookup returns.
//!
//! # Modules
//!
//! - [`wire`] - Binary wire codec: framing, queries, responses, errors
//! - [`lookup`] - Iterative parallel lookup engine over the XOR metric
//! - [`metric`] - XOR distance and closest-peer selection
//! - [`routing`] - K-bucket routing table
//! - [`server`] - UDP peer: socket loop, query handling, store tokens
//! - [`node`] - Shared identifier, peer, and token types
//!
//! # Getting Started
//!
//! ```no_run
//! use edht::{NodeId, Server};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = std::sync::Arc::new(Server::bind(6881).await?);
//!
//! let runner = server.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! server.bootstrap(&["198.51.100.7:6881".parse()?]).await;
//!
//! // Announce ourselves under an id, then look it up from the network.
//! let id = NodeId::generate();
//! server.announce(id, 6881).await;
//! for endpoint in server.get(id).await {
//!     println!("{}", endpoint);
//! }
//! # Ok(())
//! # }
//! ```

pub mod lookup;
pub mod metric;
pub mod node;
pub mod routing;
pub mod server;
pub mod wire;

pub use lookup::{Found, Lookup, Reply, Transport, ALPHA};
pub use metric::{distance, neighborhood, Distance};
pub use node::{NodeId, Peer, Token};
pub use routing::RoutingTable;
pub use server::{Server, ServerError};
pub use wire::{DecodeError, Envelope, Payload, Query, RemoteError, Response, Tag};
