//! Protocol participant identities.
//!
//! A [`NodeId`] names any participant: a client process, a server, or a
//! server group (stripe). Each variant wraps a numeric identity and has a
//! `NULL` sentinel. Ordering is total: variant first (client < server <
//! group), then the numeric identity.

use crate::core::error::{CoherenceError, CoherenceResult};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Identity of a connected client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Sentinel for "no client".
    pub const NULL: ClientId = ClientId(u64::MAX);

    /// Create a client id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == u64::MAX
    }
}

/// Identity of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl ServerId {
    /// Sentinel for "no server".
    pub const NULL: ServerId = ServerId(u64::MAX);

    /// Create a server id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == u64::MAX
    }
}

/// Identity of a server group (one stripe of the object space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Sentinel for "no group".
    pub const NULL: GroupId = GroupId(u32::MAX);

    /// Create a group id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == u32::MAX
    }
}

const TAG_CLIENT: u8 = 1;
const TAG_SERVER: u8 = 2;
const TAG_GROUP: u8 = 3;

/// Any protocol participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// A client process.
    Client(ClientId),
    /// A server process.
    Server(ServerId),
    /// A server group.
    Group(GroupId),
}

impl NodeId {
    /// Null client node, the default "no node" value.
    pub const NULL: NodeId = NodeId::Client(ClientId::NULL);

    /// Shorthand for a client node.
    pub const fn client(id: u64) -> Self {
        Self::Client(ClientId(id))
    }

    /// Shorthand for a server node.
    pub const fn server(id: u64) -> Self {
        Self::Server(ServerId(id))
    }

    /// Shorthand for a group node.
    pub const fn group(id: u32) -> Self {
        Self::Group(GroupId(id))
    }

    /// Whether the wrapped identity is its variant's null sentinel.
    pub const fn is_null(&self) -> bool {
        match self {
            Self::Client(id) => id.is_null(),
            Self::Server(id) => id.is_null(),
            Self::Group(id) => id.is_null(),
        }
    }

    /// Whether this node is a client.
    pub const fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    /// Node-type discriminant used by the byte encoding.
    pub const fn type_tag(&self) -> u8 {
        match self {
            Self::Client(_) => TAG_CLIENT,
            Self::Server(_) => TAG_SERVER,
            Self::Group(_) => TAG_GROUP,
        }
    }

    /// Number of bytes produced by [`NodeId::encode`].
    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::Client(_) | Self::Server(_) => 9,
            Self::Group(_) => 5,
        }
    }

    /// Write the stable byte encoding: one tag byte, then the big-endian id.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.type_tag());
        match self {
            Self::Client(id) => buf.put_u64(id.0),
            Self::Server(id) => buf.put_u64(id.0),
            Self::Group(id) => buf.put_u32(id.0),
        }
    }

    /// Read a node id written by [`NodeId::encode`].
    pub fn decode<B: Buf>(buf: &mut B) -> CoherenceResult<Self> {
        if buf.remaining() < 1 {
            return Err(CoherenceError::codec("truncated node id tag"));
        }
        let tag = buf.get_u8();
        let needed = if tag == TAG_GROUP { 4 } else { 8 };
        if buf.remaining() < needed {
            return Err(CoherenceError::codec("truncated node id"));
        }
        match tag {
            TAG_CLIENT => Ok(Self::Client(ClientId(buf.get_u64()))),
            TAG_SERVER => Ok(Self::Server(ServerId(buf.get_u64()))),
            TAG_GROUP => Ok(Self::Group(GroupId(buf.get_u32()))),
            other => Err(CoherenceError::codec(format!("unknown node tag {}", other))),
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "null-node");
        }
        match self {
            Self::Client(id) => write!(f, "client-{}", id.0),
            Self::Server(id) => write!(f, "server-{}", id.0),
            Self::Group(id) => write!(f, "group-{}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_node_ordering_variant_first() {
        let mut nodes = vec![
            NodeId::group(0),
            NodeId::server(1),
            NodeId::client(9),
            NodeId::client(2),
        ];
        nodes.sort();
        assert_eq!(
            nodes,
            vec![
                NodeId::client(2),
                NodeId::client(9),
                NodeId::server(1),
                NodeId::group(0)
            ]
        );
    }

    #[test]
    fn test_node_encoding_is_fixed_layout() {
        let mut buf = BytesMut::new();
        NodeId::client(0x0102).encode(&mut buf);
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0, 0, 0, 1, 2]);

        let mut read = buf.freeze();
        assert_eq!(NodeId::decode(&mut read).unwrap(), NodeId::client(0x0102));
    }

    #[test]
    fn test_node_decode_rejects_unknown_tag() {
        let mut data: &[u8] = &[9, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(NodeId::decode(&mut data).is_err());
    }

    #[test]
    fn test_null_sentinels() {
        assert!(NodeId::NULL.is_null());
        assert!(NodeId::Group(GroupId::NULL).is_null());
        assert!(!NodeId::client(0).is_null());
        assert_eq!(NodeId::NULL.to_string(), "null-node");
    }
}
