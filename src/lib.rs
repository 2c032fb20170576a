//! Node Discovery Protocol v5 engine.
//!
//! A UDP-based, Kademlia-style peer discovery engine. Every message is
//! encrypted and authenticated under per-peer session keys negotiated
//! through the WHOAREYOU handshake; peers live in a 256-bucket
//! logarithmic-distance routing table that background loops revalidate and
//! refill through iterative lookups.
//!
//! The entry point is [`Discovery::spawn`], which binds the UDP socket,
//! seeds the table from the bootstrap set, and runs the engine as a single
//! task owning all protocol state. The returned [`Discovery`] handle is
//! cheap to clone and exposes the request surface (`ping`, `find_node`,
//! `lookup`, `resolve`, …); session secrets persist only through the
//! injected [`SessionStore`].

pub mod discv5;
pub mod kademlia;
pub mod types;
pub mod utils;

pub use discv5::server::{
    Discovery, DiscoveryConfig, DiscoveryServerError, DiscoveryStats, LOOKUP_INTERVAL, Pong,
};
pub use discv5::session::{MemorySessionStore, Session, SessionStore};
pub use kademlia::{BUCKET_SIZE, Contact, KademliaTable};
pub use types::{Node, NodeRecord, NodeRecordError};
