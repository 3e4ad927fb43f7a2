//! Shared connection state and the collaborator-facing handle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use crate::notifier::ConnectionNotifier;
use crate::wire::{Message, PROTO_REV_CURRENT};

/// Minimum idle time before a posted batch degrades to a keep-alive.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of a connection.
///
/// Assigned in strictly increasing order for the lifetime of a dispatcher
/// instance; never reused, even when a table slot is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, background task not yet started.
    Created,
    /// Handshake in progress.
    Handshaking,
    /// Initial snapshot exchanged, not yet carrying normal traffic.
    Synchronized,
    /// Carrying normal traffic.
    Active,
    /// Transport broken or handshake failed; awaiting teardown.
    Dead,
}

/// Snapshot of a connection's identity as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// The peer's identity string from the handshake.
    pub remote_id: String,
    /// The peer's address.
    pub remote_ip: String,
    /// The peer's port.
    pub remote_port: u16,
    /// Negotiated protocol revision.
    pub protocol_version: u16,
}

struct HandleState {
    state: ConnectionState,
    remote_id: String,
    remote_ip: String,
    remote_port: u16,
    proto_rev: u16,
    /// Messages queued since the last post, in queue order.
    pending: Vec<Message>,
    /// Posted batches awaiting the writer.
    outgoing: VecDeque<Vec<Message>>,
    last_post: Duration,
}

/// Cheap, clonable view of one connection, shared between the owning
/// background task, the dispatcher loops, and storage.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    inner: Rc<RefCell<HandleState>>,
    data_to_send: Rc<Notify>,
    notifier: Rc<ConnectionNotifier>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        remote_ip: String,
        remote_port: u16,
        notifier: Rc<ConnectionNotifier>,
        now: Duration,
    ) -> Self {
        Self {
            id,
            inner: Rc::new(RefCell::new(HandleState {
                state: ConnectionState::Created,
                remote_id: String::new(),
                remote_ip,
                remote_port,
                proto_rev: PROTO_REV_CURRENT,
                pending: Vec::new(),
                outgoing: VecDeque::new(),
                last_post: now,
            })),
            data_to_send: Rc::new(Notify::new()),
            notifier,
        }
    }

    /// This connection's identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    /// Snapshot of remote identity, address, and negotiated revision.
    pub fn info(&self) -> ConnectionInfo {
        let state = self.inner.borrow();
        ConnectionInfo {
            remote_id: state.remote_id.clone(),
            remote_ip: state.remote_ip.clone(),
            remote_port: state.remote_port,
            protocol_version: state.proto_rev,
        }
    }

    /// Negotiated (or, before negotiation completes, requested) protocol
    /// revision.
    pub fn protocol_revision(&self) -> u16 {
        self.inner.borrow().proto_rev
    }

    /// Set the working protocol revision.
    pub fn set_protocol_revision(&self, proto_rev: u16) {
        self.inner.borrow_mut().proto_rev = proto_rev;
    }

    /// Record the peer's identity string from the handshake.
    pub fn set_remote_identity(&self, name: &str) {
        self.inner.borrow_mut().remote_id = name.to_string();
    }

    /// Transition to a new state, notifying connection listeners when the
    /// connection enters or leaves `Active`.
    pub fn set_state(&self, new: ConnectionState) {
        let (old, info) = {
            let mut state = self.inner.borrow_mut();
            let old = state.state;
            if old == new {
                return;
            }
            state.state = new;
            (
                old,
                ConnectionInfo {
                    remote_id: state.remote_id.clone(),
                    remote_ip: state.remote_ip.clone(),
                    remote_port: state.remote_port,
                    protocol_version: state.proto_rev,
                },
            )
        };
        tracing::debug!(id = %self.id, ?old, ?new, "connection state changed");
        if new == ConnectionState::Active {
            self.notifier.notify_connection(true, info, None);
        } else if old == ConnectionState::Active {
            self.notifier.notify_connection(false, info, None);
        }
    }

    /// Queue a message for the next posted batch.
    ///
    /// An update targeting an entry that already has a pending update
    /// replaces it in place; everything else appends.
    pub fn queue_outgoing(&self, msg: Message) {
        let mut state = self.inner.borrow_mut();
        if let Message::EntryUpdate { id, .. } = msg {
            let coalesced = state.pending.iter_mut().find(
                |m| matches!(m, Message::EntryUpdate { id: pending_id, .. } if *pending_id == id),
            );
            if let Some(slot) = coalesced {
                *slot = msg;
                return;
            }
        }
        state.pending.push(msg);
    }

    /// Post queued messages to the writer as one batch.
    ///
    /// With nothing pending, a client (`send_keep_alive`) posts a lone
    /// keep-alive instead, at most once per second of idle time.
    pub fn post_outgoing(&self, send_keep_alive: bool, now: Duration) {
        let mut state = self.inner.borrow_mut();
        if state.pending.is_empty() {
            if !send_keep_alive || now.saturating_sub(state.last_post) < KEEP_ALIVE_INTERVAL {
                return;
            }
            state.outgoing.push_back(vec![Message::KeepAlive]);
        } else {
            let batch = std::mem::take(&mut state.pending);
            state.outgoing.push_back(batch);
        }
        state.last_post = now;
        drop(state);
        self.data_to_send.notify_one();
    }

    /// Take the next posted batch, if any. Used by the writer.
    pub(crate) fn pop_outgoing(&self) -> Option<Vec<Message>> {
        self.inner.borrow_mut().outgoing.pop_front()
    }

    pub(crate) fn data_to_send(&self) -> Rc<Notify> {
        self.data_to_send.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionId(1),
            "127.0.0.1".to_string(),
            1735,
            Rc::new(ConnectionNotifier::new()),
            Duration::ZERO,
        )
    }

    fn update(id: u32, seq_num: u32, v: f64) -> Message {
        Message::EntryUpdate {
            id,
            seq_num,
            value: Value::Double(v),
        }
    }

    #[test]
    fn test_post_outgoing_moves_pending_as_one_batch() {
        let h = handle();
        h.queue_outgoing(Message::KeepAlive);
        h.queue_outgoing(update(1, 1, 0.5));

        h.post_outgoing(false, Duration::from_millis(10));

        let batch = h.pop_outgoing().expect("batch should be posted");
        assert_eq!(batch.len(), 2);
        assert!(h.pop_outgoing().is_none());
    }

    #[test]
    fn test_pending_updates_coalesce_by_entry_id() {
        let h = handle();
        h.queue_outgoing(update(1, 1, 0.5));
        h.queue_outgoing(update(2, 1, 1.0));
        h.queue_outgoing(update(1, 2, 2.5));

        h.post_outgoing(false, Duration::from_millis(10));

        let batch = h.pop_outgoing().expect("batch should be posted");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], update(1, 2, 2.5));
        assert_eq!(batch[1], update(2, 1, 1.0));
    }

    #[test]
    fn test_idle_client_posts_keep_alive_after_interval() {
        let h = handle();

        h.post_outgoing(true, Duration::from_millis(500));
        assert!(h.pop_outgoing().is_none(), "too soon for a keep-alive");

        h.post_outgoing(true, Duration::from_millis(1500));
        assert_eq!(
            h.pop_outgoing().expect("keep-alive should be posted"),
            vec![Message::KeepAlive]
        );
    }

    #[test]
    fn test_idle_server_never_posts_keep_alive() {
        let h = handle();
        h.post_outgoing(false, Duration::from_secs(60));
        assert!(h.pop_outgoing().is_none());
    }

    #[test]
    fn test_state_transitions_notify_on_active_boundary() {
        let notifier = Rc::new(ConnectionNotifier::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        notifier.add(move |n| seen2.borrow_mut().push(n.connected));

        let h = ConnectionHandle::new(
            ConnectionId(3),
            "10.0.0.2".to_string(),
            1735,
            notifier,
            Duration::ZERO,
        );
        h.set_state(ConnectionState::Handshaking);
        h.set_state(ConnectionState::Synchronized);
        h.set_state(ConnectionState::Active);
        h.set_state(ConnectionState::Dead);
        h.set_state(ConnectionState::Dead);

        assert_eq!(*seen.borrow(), vec![true, false]);
    }
}
