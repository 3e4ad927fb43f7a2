//! Per-peer connection object.
//!
//! A [`NetworkConnection`] represents one live peer link. It owns the framed
//! stream and a single background task that first runs the role-appropriate
//! handshake, then services reads and writes until shutdown or failure.
//!
//! # Connection lifecycle
//!
//! ```text
//! ┌─────────┐  start   ┌─────────────┐  hello exchange  ┌──────────────┐
//! │ Created ├─────────►│ Handshaking ├─────────────────►│ Synchronized │
//! └─────────┘          └──────┬──────┘                  └──────┬───────┘
//!                             │ failure                        │ snapshot
//!                             ▼                                ▼ applied
//!                        ┌────────┐      stream error     ┌────────┐
//!                        │  Dead  │◄──────────────────────┤ Active │
//!                        └────────┘                       └────────┘
//! ```
//!
//! The dispatcher never drives these transitions; it only reads the state to
//! decide which connections participate in flushes and broadcasts, and (in
//! client role) to notice death and request reconnection.
//!
//! Collaborators interact with the cheap, clonable [`ConnectionHandle`]
//! rather than the owning object: the dispatch loop posts outgoing batches
//! through it, storage attributes incoming traffic to it, and the handshake
//! records the negotiated revision and remote identity on it.

mod core;
mod handle;
mod io;

pub use self::core::{HandshakeError, Handshaker, NetworkConnection};
pub use handle::{ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionState};
pub use io::MessageIo;
