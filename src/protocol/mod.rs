//! Wire protocol.
//!
//! - [`messages`] - Client and server message types
//! - [`codec`] - Length-prefixed frame codec

pub mod codec;
pub mod messages;

pub use codec::{ClientCodec, DecodeResult, FrameCodec, ProtocolCodec, ServerCodec};
pub use messages::{
    BatchRequest, BatchResponse, ClientMessage, CompletedTransactionLowWaterMark,
    HandshakeRequest, HandshakeResponse, InvalidationPush, LockMode, LockRequest, LockResponse,
    RejectReason, ServerMessage, TransactionBatch,
};

/// Major component of a `MAJOR.MINOR[.PATCH]` version string.
pub fn major_version(version: &str) -> Option<u32> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?;
    minor.parse::<u32>().ok()?;
    if let Some(patch) = parts.next() {
        patch.parse::<u32>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(major)
}

/// Versions are compatible when their major components match.
pub fn versions_compatible(server: &str, client: &str) -> bool {
    match (major_version(server), major_version(client)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("1.0"), Some(1));
        assert_eq!(major_version("2.3.4"), Some(2));
        assert_eq!(major_version("2"), None);
        assert_eq!(major_version("a.b"), None);
        assert_eq!(major_version("1.2.3.4"), None);
    }

    #[test]
    fn test_compatibility() {
        assert!(versions_compatible("1.0", "1.7"));
        assert!(!versions_compatible("1.0", "2.0"));
        assert!(!versions_compatible("1.0", "garbage"));
    }
}
