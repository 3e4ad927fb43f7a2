//! Connection event notifications.
//!
//! Listeners are either callbacks invoked inline when a connection becomes
//! (or stops being) active, or polled queues drained by the caller at its
//! own pace. The dispatcher uses the `only` filter to deliver the synthetic
//! notifications a freshly registered listener receives for connections that
//! are already active.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::connection::ConnectionInfo;

/// A connection state-change event delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionNotification {
    /// True when the connection became active, false when it was lost.
    pub connected: bool,
    /// Snapshot of the connection's info at notification time.
    pub conn: ConnectionInfo,
}

type Callback = Rc<dyn Fn(&ConnectionNotification)>;

enum Listener {
    Callback(Callback),
    Polled(u32),
}

#[derive(Default)]
struct NotifierState {
    listeners: Vec<Option<Listener>>,
    pollers: Vec<Option<VecDeque<ConnectionNotification>>>,
}

/// Registry of connection-event listeners.
///
/// Shared between the dispatcher (registration, synthetic notifications) and
/// every connection (state-change notifications), so it is handed around as
/// `Rc<ConnectionNotifier>`.
#[derive(Default)]
pub struct ConnectionNotifier {
    state: RefCell<NotifierState>,
}

impl ConnectionNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback listener. Returns its listener id.
    pub fn add<F>(&self, callback: F) -> u32
    where
        F: Fn(&ConnectionNotification) + 'static,
    {
        self.insert(Listener::Callback(Rc::new(callback)))
    }

    /// Create a poller: a queue that buffers notifications for listeners
    /// registered against it. Returns the poller id.
    pub fn create_poller(&self) -> u32 {
        let mut state = self.state.borrow_mut();
        for (i, slot) in state.pollers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(VecDeque::new());
                return i as u32 + 1;
            }
        }
        state.pollers.push(Some(VecDeque::new()));
        state.pollers.len() as u32
    }

    /// Register a polled listener against an existing poller. Returns its
    /// listener id.
    pub fn add_polled(&self, poller: u32) -> u32 {
        self.insert(Listener::Polled(poller))
    }

    /// Remove a listener by id. Unknown ids are ignored.
    pub fn remove(&self, listener: u32) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = listener
            .checked_sub(1)
            .and_then(|i| state.listeners.get_mut(i as usize))
        {
            *slot = None;
        }
    }

    /// Drain buffered notifications for a poller.
    pub fn poll(&self, poller: u32) -> Vec<ConnectionNotification> {
        let mut state = self.state.borrow_mut();
        match poller
            .checked_sub(1)
            .and_then(|i| state.pollers.get_mut(i as usize))
        {
            Some(Some(queue)) => queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }

    /// Remove a poller and all listeners registered against it.
    pub fn remove_poller(&self, poller: u32) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = poller
            .checked_sub(1)
            .and_then(|i| state.pollers.get_mut(i as usize))
        {
            *slot = None;
        }
        for listener in state.listeners.iter_mut() {
            if matches!(listener, Some(Listener::Polled(p)) if *p == poller) {
                *listener = None;
            }
        }
    }

    /// Deliver a notification to every listener, or to `only` alone.
    ///
    /// Callback listeners run after the registry borrow is released, so a
    /// callback may re-enter the notifier (e.g. to remove itself).
    pub fn notify_connection(&self, connected: bool, conn: ConnectionInfo, only: Option<u32>) {
        let notification = ConnectionNotification { connected, conn };
        let mut callbacks: Vec<Callback> = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let mut queued: Vec<(u32, ConnectionNotification)> = Vec::new();
            for (i, listener) in state.listeners.iter().enumerate() {
                let id = i as u32 + 1;
                if only.is_some() && only != Some(id) {
                    continue;
                }
                match listener {
                    Some(Listener::Callback(cb)) => callbacks.push(cb.clone()),
                    Some(Listener::Polled(poller)) => {
                        queued.push((*poller, notification.clone()));
                    }
                    None => {}
                }
            }
            for (poller, n) in queued {
                if let Some(Some(queue)) = poller
                    .checked_sub(1)
                    .and_then(|i| state.pollers.get_mut(i as usize))
                {
                    queue.push_back(n);
                }
            }
        }
        for cb in callbacks {
            cb(&notification);
        }
    }

    fn insert(&self, listener: Listener) -> u32 {
        let mut state = self.state.borrow_mut();
        for (i, slot) in state.listeners.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(listener);
                return i as u32 + 1;
            }
        }
        state.listeners.push(Some(listener));
        state.listeners.len() as u32
    }
}
