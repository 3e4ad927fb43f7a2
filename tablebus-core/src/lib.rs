//! # tablebus-core
//!
//! Runtime environment seam for the tablebus synchronization engine.
//!
//! The dispatcher in the `tablebus` crate never touches sockets, clocks, or
//! the task scheduler directly. Everything environment-dependent goes through
//! a small set of provider traits, bundled into a single [`Providers`] type
//! parameter:
//!
//! - [`NetworkProvider`]: create TCP listeners (server role acceptor) and
//!   outbound TCP connections (client role connector)
//! - [`TimeProvider`]: sleep, timeout, and monotonic time queries
//! - [`TaskProvider`]: spawning of single-threaded background tasks
//!
//! Production code uses [`TokioProviders`]; tests can substitute any other
//! bundle (loopback sockets, paused clocks) without the engine noticing.
//!
//! ## Single-core design
//!
//! All traits are `?Send`: the engine runs its loops on one thread inside a
//! `tokio::task::LocalSet`, sharing state through `Rc<RefCell<_>>` rather
//! than locks. Providers are `Clone` so they can be handed to each background
//! task cheaply.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod network;
mod providers;
mod task;
mod time;

pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{Elapsed, TimeProvider, TokioTimeProvider};
