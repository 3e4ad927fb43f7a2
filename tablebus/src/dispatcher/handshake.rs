//! Client-side and server-side handshake state machines.
//!
//! A handshake runs once per new connection, on that connection's own task,
//! between the `Handshaking` and `Active` states. Both sides negotiate the
//! protocol revision, exchange identity strings (revision 0x0300 and later),
//! and reconcile the initial value snapshot through the storage collaborator
//! before any normal traffic flows.
//!
//! Revisions below 0x0300 have no hello exchange and no client-side
//! terminator: the server marks the connection usable right after sending
//! its snapshot, and whatever initial assignments the legacy peer sends
//! afterwards arrive through the ordinary read path. That asymmetry is a
//! protocol fact, kept as-is.

use std::rc::Rc;

use async_trait::async_trait;

use tablebus_core::Providers;

use super::core::DispatcherCore;
use crate::connection::{ConnectionHandle, ConnectionState, HandshakeError, Handshaker, MessageIo};
use crate::wire::{FLAG_RESUMED_SESSION, Message, PROTO_REV_CURRENT, PROTO_REV_LEGACY};

/// Run the handshake from the client's perspective.
pub(crate) async fn client_handshake<P: Providers>(
    core: &DispatcherCore<P>,
    conn: &ConnectionHandle,
    io: &mut MessageIo,
) -> Result<(), HandshakeError> {
    let self_id = core.identity();

    tracing::debug!("client: sending hello");
    io.send_batch(&[Message::ClientHello {
        proto_rev: conn.protocol_revision(),
        self_id,
    }])
    .await
    .map_err(|_| HandshakeError::Disconnected)?;

    let Some(mut msg) = io.recv().await else {
        tracing::debug!("client: server disconnected before first response");
        return Err(HandshakeError::Disconnected);
    };

    if let Message::ProtoUnsup { proto_rev } = msg {
        // An old server naming 0x0200 gets exactly one retry at that
        // revision; the remembered revision resets after the next attempt.
        if proto_rev == PROTO_REV_LEGACY {
            core.client_reconnect(PROTO_REV_LEGACY);
        }
        return Err(HandshakeError::Rejected { proto_rev });
    }

    let mut new_server = true;
    if conn.protocol_revision() >= PROTO_REV_CURRENT {
        match msg {
            Message::ServerHello { flags, ref self_id } => {
                conn.set_remote_identity(self_id);
                if flags & FLAG_RESUMED_SESSION != 0 {
                    new_server = false;
                }
            }
            ref other => return Err(HandshakeError::unexpected(other)),
        }
        msg = io.recv().await.ok_or(HandshakeError::Disconnected)?;
    }

    // Receive initial assignments until the server's done sentinel.
    let mut incoming = Vec::new();
    loop {
        match msg {
            Message::ServerHelloDone => break,
            // Shouldn't see a keep-alive here, but tolerate it.
            Message::KeepAlive => {}
            Message::EntryAssign { .. } => incoming.push(msg),
            ref other => {
                tracing::debug!(
                    kind = other.kind(),
                    "client: unexpected message during initial entries"
                );
                return Err(HandshakeError::unexpected(other));
            }
        }
        msg = match io.recv().await {
            Some(m) => m,
            None => {
                tracing::debug!("client: server disconnected during initial entries");
                return Err(HandshakeError::Disconnected);
            }
        };
    }

    conn.set_state(ConnectionState::Synchronized);
    let mut outgoing = core
        .storage()
        .apply_initial_assignments(conn, incoming, new_server);

    if conn.protocol_revision() >= PROTO_REV_CURRENT {
        outgoing.push(Message::ClientHelloDone);
    }
    if !outgoing.is_empty() {
        io.send_batch(&outgoing)
            .await
            .map_err(|_| HandshakeError::Disconnected)?;
    }

    let info = conn.info();
    tracing::info!(remote = %info.remote_ip, port = info.remote_port, "client: connected to server");
    Ok(())
}

/// Run the handshake from the server's perspective.
pub(crate) async fn server_handshake<P: Providers>(
    core: &DispatcherCore<P>,
    conn: &ConnectionHandle,
    io: &mut MessageIo,
) -> Result<(), HandshakeError> {
    let Some(msg) = io.recv().await else {
        tracing::debug!("server: client disconnected before sending hello");
        return Err(HandshakeError::Disconnected);
    };
    let (proto_rev, remote_id) = match msg {
        Message::ClientHello {
            proto_rev,
            self_id,
        } => (proto_rev, self_id),
        ref other => {
            tracing::debug!("server: client initial message was not client hello");
            return Err(HandshakeError::unexpected(other));
        }
    };

    if proto_rev > PROTO_REV_CURRENT {
        tracing::debug!(
            requested = format_args!("{proto_rev:#06x}"),
            "server: client requested unsupported protocol"
        );
        let _ = io
            .send_batch(&[Message::ProtoUnsup {
                proto_rev: PROTO_REV_CURRENT,
            }])
            .await;
        return Err(HandshakeError::UnsupportedRevision { proto_rev });
    }

    if proto_rev >= PROTO_REV_CURRENT {
        conn.set_remote_identity(&remote_id);
    }
    tracing::debug!(proto_rev = format_args!("{proto_rev:#06x}"), "server: client protocol");
    conn.set_protocol_revision(proto_rev);
    conn.set_state(ConnectionState::Synchronized);

    let mut outgoing = Vec::new();
    if proto_rev >= PROTO_REV_CURRENT {
        // New/resumed flag reserved; sessions are always fresh for now.
        outgoing.push(Message::ServerHello {
            flags: 0,
            self_id: core.identity(),
        });
    }
    outgoing.extend(core.storage().get_initial_assignments(conn));
    outgoing.push(Message::ServerHelloDone);

    tracing::debug!("server: sending initial assignments");
    io.send_batch(&outgoing)
        .await
        .map_err(|_| HandshakeError::Disconnected)?;

    // Revision 0x0300 and later concludes with a client hello done, so the
    // client's initial assignments batch up before the connection goes
    // active. Pre-0x0300 has no terminator: the connection goes active now
    // and trailing assignments arrive through the normal read path.
    if proto_rev >= PROTO_REV_CURRENT {
        let mut incoming = Vec::new();
        let mut msg = io.recv().await.ok_or(HandshakeError::Disconnected)?;
        loop {
            match msg {
                Message::ClientHelloDone => break,
                Message::KeepAlive => {}
                Message::EntryAssign { .. } => incoming.push(msg),
                ref other => {
                    tracing::debug!(
                        kind = other.kind(),
                        "server: unexpected message during initial entries"
                    );
                    return Err(HandshakeError::unexpected(other));
                }
            }
            msg = match io.recv().await {
                Some(m) => m,
                None => {
                    tracing::debug!("server: disconnected waiting for initial entries");
                    return Err(HandshakeError::Disconnected);
                }
            };
        }
        for msg in incoming {
            core.storage().process_incoming(msg, conn);
        }
    }

    let info = conn.info();
    tracing::info!(remote = %info.remote_ip, port = info.remote_port, "server: client connected");
    Ok(())
}

/// [`Handshaker`] running the client side against the dispatcher's state.
pub(crate) struct ClientHandshaker<P: Providers>(pub(crate) Rc<DispatcherCore<P>>);

#[async_trait(?Send)]
impl<P: Providers> Handshaker for ClientHandshaker<P> {
    async fn handshake(
        &self,
        conn: &ConnectionHandle,
        io: &mut MessageIo,
    ) -> Result<(), HandshakeError> {
        client_handshake(self.0.as_ref(), conn, io).await
    }
}

/// [`Handshaker`] running the server side against the dispatcher's state.
pub(crate) struct ServerHandshaker<P: Providers>(pub(crate) Rc<DispatcherCore<P>>);

#[async_trait(?Send)]
impl<P: Providers> Handshaker for ServerHandshaker<P> {
    async fn handshake(
        &self,
        conn: &ConnectionHandle,
        io: &mut MessageIo,
    ) -> Result<(), HandshakeError> {
        server_handshake(self.0.as_ref(), conn, io).await
    }
}
