//! The dispatcher: role selection, connection tracking, and control loops.
//!
//! A [`Dispatcher`] owns the set of live peer connections for one node and
//! the small set of long-lived loops that service them:
//!
//! - a **dispatch loop** (all networked roles) that periodically posts each
//!   active connection's queued traffic, schedules persistence in server
//!   role, and notices dead client connections
//! - an **accept loop** (server role) that turns accepted sockets into
//!   handshaking connections, reusing dead table slots before growing
//! - a **connect loop** (client role) that maintains the single outbound
//!   connection, retrying on a fixed backoff and blocking on a reconnect
//!   signal between attempts
//!
//! Role selection is a start-time parameterization (an acceptor value or a
//! connector value obtained from the environment's [`NetworkProvider`]),
//! not a type distinction; one lifecycle engine serves both.
//!
//! [`NetworkProvider`]: tablebus_core::NetworkProvider

mod connector;
mod core;
mod handshake;
mod mode;
mod table;

pub use connector::{ServerAddress, team_addresses};
pub use core::Dispatcher;
pub use mode::{ModeStatus, NetworkMode, Role};
