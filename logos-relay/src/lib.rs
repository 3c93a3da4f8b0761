//! # logos-relay: Real-time document relay for Logos
//!
//! Relays CRDT updates and presence between the clients of a named document.
//! The relay merges every update into its own copy of the document, so a
//! late joiner catches up from the relay alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ RelayClient │ ◄────────────────► │   RelayServer    │
//! │ (per user)  │  ws://host/<name>  │ SessionRegistry  │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │ name → session
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ Yrs Doc     │                    │ DocumentSession  │
//! │ (local)     │                    │ Yrs Doc          │
//! └─────────────┘                    │ AwarenessRegistry│
//!                                    └────────┬─────────┘
//!                                     ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire codec (varint envelope, sync and awareness)
//! - [`awareness`]: Clock-ordered presence with tombstones
//! - [`session`]: One document's CRDT state, presence and connections
//! - [`broadcast`]: Per-session fan-out with origin filtering
//! - [`registry`]: Name → session map with idle eviction
//! - [`connection`]: Per-connection handshake and receive loop
//! - [`server`]: Accept loop, presence sweeper, statistics
//! - [`client`]: WebSocket peer holding its own document

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use awareness::{AwarenessEntry, AwarenessRegistry};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, RELAY_ORIGIN};
pub use client::{ClientEvent, RelayClient};
pub use config::RelayConfig;
pub use connection::{document_name, ConnectionState};
pub use error::RelayError;
pub use protocol::{AwarenessChange, Message, MessageKind, ProtocolError, SyncMessage};
pub use registry::{RegistryStats, SessionRegistry};
pub use server::{AtomicRelayStats, RelayServer, RelayStats};
pub use session::{Baseline, ClientConnection, ConnectionId, DocumentSession, SessionState};
