//! Protocol data model.
//!
//! Value types shared by every coherence component:
//! - [`node`] - Participant identities (`NodeId` over client/server/group)
//! - [`lock`] - Lock ids, levels, requesters and contexts
//! - [`txn`] - Client and server transaction identities
//! - [`object`] - Object ids and change sets
//! - [`invalidations`] - Client cache invalidation sets

pub mod invalidations;
pub mod lock;
pub mod node;
pub mod object;
pub mod txn;

pub use invalidations::Invalidations;
pub use lock::{LockContext, LockId, LockLevel, LockType, Requester, ThreadId};
pub use node::{ClientId, GroupId, NodeId, ServerId};
pub use object::{ChangeKind, ChangeSet, ObjectChange, ObjectId};
pub use txn::{ClientTransaction, GlobalTransactionId, ServerTransactionId, TransactionId};
