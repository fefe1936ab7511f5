use thiserror::Error;

/// Reasons a datagram fails to decode.
///
/// Malformed input is an expected condition on a public UDP port; none of
/// these are ever raised as panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated packet")]
    Truncated,

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("unknown body discriminator {0:#04x}")]
    UnknownBody(u8),

    #[error("unknown address family {0:#04x}")]
    UnknownFamily(u8),

    #[error("legacy protocol magic")]
    OldVersion,

    #[error("bad magic prefix")]
    BadMagic,
}
