//! Binary wire protocol.
//!
//! Every datagram starts with an 8-byte magic prefix, followed by a 2-byte
//! correlation tag, the sender's 32-byte identifier, a kind byte
//! (`'q'`/`'r'`/`'e'`), and the body. All integers are big-endian; peer and
//! endpoint records carry a 1-byte address family tag (`0x04`/`0x06`).
//!
//! Encoding is total and byte-for-byte deterministic; decoding never panics
//! and reports truncation, unknown discriminators, and the legacy
//! `"EDHT-KDM-\x00"` prefix as typed [`DecodeError`] values.
//!
//! ```
//! use edht::wire::{Envelope, Payload, Query};
//! use edht::NodeId;
//!
//! let msg = Envelope {
//!     tag: 0x0001,
//!     sender: NodeId([0u8; 32]),
//!     payload: Payload::Query(Query::Ping),
//! };
//! let bytes = msg.encode();
//! assert_eq!(Envelope::decode(&bytes).unwrap(), msg);
//! ```

mod error;
mod message;

pub use error::DecodeError;
pub use message::{Envelope, Payload, Query, RemoteError, Response, Tag, LEGACY_MAGIC, MAGIC};
