//! Owning connection object and its background task.

use std::rc::Rc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use tablebus_core::{Providers, TaskProvider, TimeProvider};

use super::handle::{ConnectionHandle, ConnectionId, ConnectionState};
use super::io::MessageIo;
use crate::notifier::ConnectionNotifier;
use crate::storage::Storage;
use crate::wire::Message;

/// Reasons a handshake attempt is abandoned.
///
/// All variants discard the connection; the owning loop decides what happens
/// next (the accept loop keeps accepting, the connect loop waits for the
/// next reconnect signal).
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    /// The peer disconnected mid-handshake.
    #[error("peer disconnected during handshake")]
    Disconnected,

    /// A message of an unexpected kind arrived.
    #[error("unexpected {kind} during handshake")]
    Unexpected {
        /// Kind of the offending message.
        kind: &'static str,
    },

    /// The server replied that the requested protocol revision is
    /// unsupported.
    #[error("server rejected protocol, supports {proto_rev:#06x}")]
    Rejected {
        /// The revision the server named as its ceiling.
        proto_rev: u16,
    },

    /// A client requested a revision newer than this server speaks.
    #[error("client requested unsupported protocol {proto_rev:#06x}")]
    UnsupportedRevision {
        /// The revision the client requested.
        proto_rev: u16,
    },
}

impl HandshakeError {
    pub(crate) fn unexpected(msg: &Message) -> Self {
        HandshakeError::Unexpected { kind: msg.kind() }
    }
}

/// The handshake a connection runs before admitting normal traffic.
///
/// Implemented by the dispatcher, once per role; injected at
/// [`NetworkConnection::start`] so the connection object stays
/// role-agnostic.
#[async_trait(?Send)]
pub trait Handshaker {
    /// Run the handshake to completion on a fresh connection.
    async fn handshake(
        &self,
        conn: &ConnectionHandle,
        io: &mut MessageIo,
    ) -> Result<(), HandshakeError>;
}

/// One peer link: shared handle plus the owning background task.
pub struct NetworkConnection<P: Providers> {
    handle: ConnectionHandle,
    io: Option<MessageIo>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: Option<mpsc::UnboundedReceiver<()>>,
    providers: P,
}

impl<P: Providers> NetworkConnection<P> {
    /// Create a connection over a freshly established stream.
    ///
    /// `remote` is the peer's `"address:port"` string as reported by the
    /// acceptor or connector. No task runs until [`start`](Self::start).
    pub fn new<S>(
        id: ConnectionId,
        stream: S,
        remote: &str,
        providers: P,
        notifier: Rc<ConnectionNotifier>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let (remote_ip, remote_port) = match remote.rsplit_once(':') {
            Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(0)),
            None => (remote.to_string(), 0),
        };
        let now = providers.time().now();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        Self {
            handle: ConnectionHandle::new(id, remote_ip, remote_port, notifier, now),
            io: Some(MessageIo::new(stream)),
            task: None,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            providers,
        }
    }

    /// The shared handle collaborators use to talk to this connection.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Start the connection's background activity: handshake first, then the
    /// normal read/write loop. Does nothing when already started.
    pub fn start(&mut self, handshaker: Rc<dyn Handshaker>, storage: Rc<dyn Storage>) {
        let (Some(io), Some(shutdown_rx)) = (self.io.take(), self.shutdown_rx.take()) else {
            return;
        };
        let task = self.providers.task().spawn_task(
            "connection_task",
            connection_task(
                self.handle.clone(),
                io,
                handshaker,
                storage,
                self.handle.data_to_send(),
                shutdown_rx,
            ),
        );
        self.task = Some(task);
    }

    /// Shut the connection down and wait for its task to exit.
    ///
    /// Idempotent; safe to call on a connection that never started.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.handle.set_state(ConnectionState::Dead);
    }
}

/// Background task owning all of a connection's stream I/O.
///
/// Runs the injected handshake, then services the posted-batch queue and the
/// read side until shutdown, peer disconnect, or a stream error. The task
/// exits on connection loss; reconnection is the dispatcher's decision, not
/// this task's.
async fn connection_task(
    handle: ConnectionHandle,
    mut io: MessageIo,
    handshaker: Rc<dyn Handshaker>,
    storage: Rc<dyn Storage>,
    data_to_send: Rc<Notify>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    handle.set_state(ConnectionState::Handshaking);
    // No soft-cancel: shutdown mid-handshake discards the whole attempt.
    let outcome = tokio::select! {
        _ = shutdown_rx.recv() => None,
        outcome = handshaker.handshake(&handle, &mut io) => Some(outcome),
    };
    match outcome {
        Some(Ok(())) => handle.set_state(ConnectionState::Active),
        Some(Err(e)) => {
            tracing::debug!(id = %handle.id(), error = %e, "handshake failed");
            handle.set_state(ConnectionState::Dead);
            return;
        }
        None => {
            handle.set_state(ConnectionState::Dead);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            _ = data_to_send.notified() => {
                let mut write_failed = false;
                while let Some(batch) = handle.pop_outgoing() {
                    if let Err(e) = io.send_batch(&batch).await {
                        tracing::debug!(id = %handle.id(), error = %e, "write failed");
                        write_failed = true;
                        break;
                    }
                }
                if write_failed {
                    break;
                }
            }

            msg = io.recv() => {
                match msg {
                    Some(Message::KeepAlive) => {}
                    Some(msg) => process_incoming(&handle, &storage, msg),
                    None => break,
                }
            }
        }
    }

    handle.set_state(ConnectionState::Dead);
}

/// Runtime incoming path: hand a received message to storage, dropping
/// updates whose target entry is unknown or carries a mismatched type.
fn process_incoming(handle: &ConnectionHandle, storage: &Rc<dyn Storage>, msg: Message) {
    if let Message::EntryUpdate { id, ref value, .. } = msg {
        match storage.entry_type(id) {
            Some(expected) if expected == value.entry_type() => {}
            _ => {
                tracing::debug!(id = %handle.id(), entry = id, "dropping update for unknown or mismatched entry");
                return;
            }
        }
    }
    storage.process_incoming(msg, handle);
}
