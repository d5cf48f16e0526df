//! Client-side coherence core.
//!
//! - [`locks`] - Local view of held, pending and waiting lock contexts
//! - [`transactions`] - Transaction id allocation and resend buffer
//! - [`cache`] - Ids of locally cached objects
//! - [`session`] - One connection's wiring of all of the above
//! - [`connection`] - TCP driver for a session

pub mod cache;
pub mod connection;
pub mod locks;
pub mod session;
pub mod transactions;

pub use cache::ClientReferenceCache;
pub use locks::{ClientLockTable, LocalLockStatus, LockOutcome};
pub use session::{ChannelOutbound, ClientSession, Outbound, SessionConfig, SessionEvent};
pub use transactions::ClientTransactionBuffer;
