//! # tablebus
//!
//! Connection management and handshake engine for a publish/subscribe
//! key-value synchronization protocol: one central node (server role) keeps
//! any number of peers (client role) consistent over TCP.
//!
//! This crate provides:
//! - **Dispatcher**: role lifecycle, the table of live peer connections,
//!   periodic flush/persistence scheduling, and reconnection
//! - **Handshake protocol**: two-generation version negotiation (0x0200
//!   legacy, 0x0300 current) with identity exchange and initial snapshot
//!   reconciliation
//! - **Connection object**: framed message transport with a single
//!   background task per peer link
//! - **Notifier**: callback and polled listeners for connection events
//!
//! The value store itself is a collaborator behind the [`Storage`] trait;
//! this crate moves values, it does not interpret them.
//!
//! ## Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use tablebus::{ConnectionNotifier, Dispatcher, TokioProviders};
//!
//! let dispatcher = Dispatcher::new(
//!     TokioProviders::new(),
//!     storage, // your Rc<dyn Storage>
//!     Rc::new(ConnectionNotifier::new()),
//! );
//! dispatcher.set_identity("dashboard");
//! dispatcher.start_client();
//! dispatcher.set_server_team(4917, 1735);
//! // ... later
//! dispatcher.stop().await;
//! ```
//!
//! Everything runs on the current thread; run inside a
//! `tokio::task::LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Per-peer connection object and shared handles.
pub mod connection;

/// The dispatcher: roles, loops, and lifecycle.
pub mod dispatcher;

/// Connection event notifications.
pub mod notifier;

/// Collaborator surface consumed from the key-value store.
pub mod storage;

/// Wire message model and frame format.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Re-export environment seam types for convenience
pub use tablebus_core::{
    Elapsed, NetworkProvider, Providers, TaskProvider, TcpListenerTrait, TimeProvider,
    TokioNetworkProvider, TokioProviders, TokioTaskProvider, TokioTimeProvider,
};

// Dispatcher exports
pub use dispatcher::{Dispatcher, ModeStatus, NetworkMode, Role, ServerAddress, team_addresses};

// Connection exports
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionState, HandshakeError,
    NetworkConnection,
};

// Notifier exports
pub use notifier::{ConnectionNotification, ConnectionNotifier};

// Storage collaborator exports
pub use storage::{MessageRouter, Storage};

// Wire exports
pub use wire::{
    EntryType, Message, PROTO_REV_CURRENT, PROTO_REV_LEGACY, Value, WireError, encode_frame,
    try_decode_frame,
};
