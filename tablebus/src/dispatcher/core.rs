//! The dispatcher: role lifecycle, control loops, and user surface.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use tablebus_core::{NetworkProvider, Providers, TaskProvider, TcpListenerTrait, TimeProvider};

use super::connector::{self, ServerAddress};
use super::handshake::{ClientHandshaker, ServerHandshaker};
use super::mode::{ModeStatus, NetworkMode, Role};
use super::table::ConnectionTable;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionState, NetworkConnection};
use crate::notifier::{ConnectionNotification, ConnectionNotifier};
use crate::storage::{MessageRouter, Storage};
use crate::wire::{Message, PROTO_REV_CURRENT};

/// Fixed sleep between client connection attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Minimum spacing between honored flush requests.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

/// Spacing of periodic persistent saves in server role.
const SAVE_PERIOD: Duration = Duration::from_secs(1);

/// Fastest allowed dispatch period.
const MIN_UPDATE_RATE: Duration = Duration::from_millis(5);

/// Slowest allowed dispatch period.
const MAX_UPDATE_RATE: Duration = Duration::from_secs(1);

/// Default dispatch period.
const DEFAULT_UPDATE_RATE: Duration = Duration::from_millis(100);

/// User-facing state behind the coarse guard.
///
/// Borrows are short and never held across an await.
struct UserState<P: Providers> {
    identity: String,
    update_rate: Duration,
    connections: ConnectionTable<P>,
    connector: Option<Vec<ServerAddress>>,
    connector_override: Option<Vec<ServerAddress>>,
    reconnect_proto_rev: u16,
    do_reconnect: bool,
    persist_path: Option<PathBuf>,
    listen_spec: Option<String>,
    bound_addr: Option<String>,
    dispatch_task: Option<JoinHandle<()>>,
    io_task: Option<JoinHandle<()>>,
    dispatch_shutdown: Option<mpsc::UnboundedSender<()>>,
    io_shutdown: Option<mpsc::UnboundedSender<()>>,
    loggers: Vec<Option<ConnectionLogger>>,
}

/// Flush/persistence schedule, guarded separately from [`UserState`] so
/// flush signaling never contends with table mutation.
struct FlushState {
    last_flush: Option<Duration>,
    do_flush: bool,
}

struct ConnectionLogger {
    listener: u32,
}

/// JSON shape of one connection-log record.
#[derive(Serialize)]
struct LogRecord<'a> {
    connected: bool,
    #[serde(flatten)]
    info: &'a ConnectionInfo,
}

pub(crate) struct DispatcherCore<P: Providers> {
    providers: P,
    storage: Rc<dyn Storage>,
    notifier: Rc<ConnectionNotifier>,
    active: Cell<bool>,
    mode: Cell<NetworkMode>,
    next_conn_id: Cell<u32>,
    user: RefCell<UserState<P>>,
    flush: RefCell<FlushState>,
    flush_signal: Notify,
    reconnect_signal: Notify,
}

impl<P: Providers> DispatcherCore<P> {
    pub(crate) fn identity(&self) -> String {
        self.user.borrow().identity.clone()
    }

    pub(crate) fn storage(&self) -> &Rc<dyn Storage> {
        &self.storage
    }

    /// Remember a protocol revision for the next connection attempt and wake
    /// the connect loop. No-op in server role.
    pub(crate) fn client_reconnect(&self, proto_rev: u16) {
        if self.mode.get().is_server() {
            return;
        }
        {
            let mut user = self.user.borrow_mut();
            user.reconnect_proto_rev = proto_rev;
            user.do_reconnect = true;
        }
        self.reconnect_signal.notify_one();
    }

    /// Rate-limited flush request; at most one per 5 ms is honored, the rest
    /// are dropped.
    fn request_flush(&self) {
        let now = self.providers.time().now();
        {
            let mut flush = self.flush.borrow_mut();
            if let Some(last) = flush.last_flush {
                if now.saturating_sub(last) < MIN_FLUSH_INTERVAL {
                    return;
                }
            }
            flush.last_flush = Some(now);
            flush.do_flush = true;
        }
        self.flush_signal.notify_one();
    }

    fn next_connection_id(&self) -> ConnectionId {
        let next = self.next_conn_id.get() + 1;
        self.next_conn_id.set(next);
        ConnectionId(next)
    }
}

impl<P: Providers> MessageRouter for DispatcherCore<P> {
    fn queue_outgoing(
        &self,
        msg: Message,
        only: Option<ConnectionId>,
        except: Option<ConnectionId>,
    ) {
        let user = self.user.borrow();
        for conn in user.connections.iter() {
            let handle = conn.handle();
            if Some(handle.id()) == except {
                continue;
            }
            if only.is_some() && only != Some(handle.id()) {
                continue;
            }
            match handle.state() {
                ConnectionState::Synchronized | ConnectionState::Active => {
                    handle.queue_outgoing(msg.clone());
                }
                _ => {}
            }
        }
    }

    fn flush(&self) {
        self.request_flush();
    }
}

/// The connection-management and handshake engine.
///
/// One instance per node. Pick a role with [`start_local`](Self::start_local),
/// [`start_server`](Self::start_server), or [`start_client`](Self::start_client);
/// starting is idempotent while a role is active, and [`stop`](Self::stop)
/// tears everything down. All failures stay inside the role's loops; they
/// surface through [`network_mode`](Self::network_mode) and the connection
/// notification stream, never as return values.
///
/// Runs entirely on the current thread; callers must be inside a
/// `tokio::task::LocalSet` (or equivalent) so background tasks can spawn.
pub struct Dispatcher<P: Providers> {
    core: Rc<DispatcherCore<P>>,
}

impl<P: Providers> Dispatcher<P> {
    /// Create a dispatcher over the given environment, storage collaborator,
    /// and notifier.
    pub fn new(providers: P, storage: Rc<dyn Storage>, notifier: Rc<ConnectionNotifier>) -> Self {
        Self {
            core: Rc::new(DispatcherCore {
                providers,
                storage,
                notifier,
                active: Cell::new(false),
                mode: Cell::new(NetworkMode::default()),
                next_conn_id: Cell::new(0),
                user: RefCell::new(UserState {
                    identity: String::new(),
                    update_rate: DEFAULT_UPDATE_RATE,
                    connections: ConnectionTable::new(),
                    connector: None,
                    connector_override: None,
                    reconnect_proto_rev: PROTO_REV_CURRENT,
                    do_reconnect: false,
                    persist_path: None,
                    listen_spec: None,
                    bound_addr: None,
                    dispatch_task: None,
                    io_task: None,
                    dispatch_shutdown: None,
                    io_shutdown: None,
                    loggers: Vec::new(),
                }),
                flush: RefCell::new(FlushState {
                    last_flush: None,
                    do_flush: false,
                }),
                flush_signal: Notify::new(),
                reconnect_signal: Notify::new(),
            }),
        }
    }

    /// Current network mode. A hint; see [`NetworkMode`].
    pub fn network_mode(&self) -> NetworkMode {
        self.core.mode.get()
    }

    /// Start with local-only values: no networking, no loops.
    ///
    /// No-op when a role is already active.
    pub fn start_local(&self) {
        if self.core.active.replace(true) {
            return;
        }
        self.core
            .mode
            .set(NetworkMode::new(Role::Local, ModeStatus::Running));
        self.core.storage.set_dispatcher(self.core.clone(), false);
    }

    /// Start as a server accepting peers on `listen_address:port` (an empty
    /// listen address binds all interfaces).
    ///
    /// With a persist path, previously saved values load now (parse problems
    /// are logged, not fatal) and the dispatch loop saves periodically. A
    /// bind failure is fatal to the role and shows up as a `Failed` mode.
    ///
    /// No-op when a role is already active.
    pub fn start_server(&self, persist_path: Option<&Path>, listen_address: &str, port: u16) {
        if self.core.active.replace(true) {
            return;
        }
        self.core
            .mode
            .set(NetworkMode::new(Role::Server, ModeStatus::Starting));

        let listen = listen_address.trim();
        let listen = if listen.is_empty() { "0.0.0.0" } else { listen };
        {
            let mut user = self.core.user.borrow_mut();
            user.persist_path = persist_path.map(Path::to_path_buf);
            user.listen_spec = Some(format!("{listen}:{port}"));
        }

        if let Some(path) = persist_path {
            let mut first = true;
            self.core.storage.load_persistent(path, &mut |line, msg| {
                if first {
                    first = false;
                    tracing::warn!(
                        file = %path.display(),
                        "errors reading initial persistent values"
                    );
                }
                tracing::warn!("{}:{}: {}", path.display(), line, msg);
            });
        }

        self.core.storage.set_dispatcher(self.core.clone(), true);
        self.spawn_loops(true);
    }

    /// Start as a client. The connect loop runs immediately; until a
    /// connector is configured it idles in `Failed` status.
    ///
    /// No-op when a role is already active.
    pub fn start_client(&self) {
        if self.core.active.replace(true) {
            return;
        }
        self.core
            .mode
            .set(NetworkMode::new(Role::Client, ModeStatus::Starting));
        self.core.storage.set_dispatcher(self.core.clone(), false);
        self.spawn_loops(false);
    }

    /// Stop the active role.
    ///
    /// Wakes and joins both loops, then tears down every tracked connection
    /// once no loop can still be iterating the table. Idempotent; safe to
    /// call before any start. Blocks until teardown completes.
    pub async fn stop(&self) {
        self.core.active.set(false);

        // wake the dispatch loop with a flush
        self.core.flush_signal.notify_one();

        // wake the connect loop with a reconnect
        {
            self.core.user.borrow_mut().connector = None;
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);

        let (dispatch_task, io_task) = {
            let mut user = self.core.user.borrow_mut();
            if let Some(tx) = user.dispatch_shutdown.take() {
                let _ = tx.send(());
            }
            if let Some(tx) = user.io_shutdown.take() {
                let _ = tx.send(());
            }
            (user.dispatch_task.take(), user.io_task.take())
        };
        if let Some(task) = dispatch_task {
            let _ = task.await;
        }
        if let Some(task) = io_task {
            let _ = task.await;
        }

        let conns = { self.core.user.borrow_mut().connections.take_all() };
        for mut conn in conns {
            conn.close().await;
        }
    }

    /// Set the dispatch period, clamped to 5 ms - 1 s.
    pub fn set_update_rate(&self, interval: Duration) {
        self.core.user.borrow_mut().update_rate = interval.clamp(MIN_UPDATE_RATE, MAX_UPDATE_RATE);
    }

    /// Set this node's identity string, exchanged during handshakes.
    ///
    /// In client role this requests a reconnection so the peer sees the new
    /// identity.
    pub fn set_identity(&self, name: &str) {
        {
            self.core.user.borrow_mut().identity = name.to_string();
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Configure the connector to a single server.
    pub fn set_server(&self, host: &str, port: u16) {
        {
            self.core.user.borrow_mut().connector = Some(vec![ServerAddress::new(host, port)]);
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Configure the connector to race a set of candidate servers; the first
    /// to connect wins.
    pub fn set_server_multi(&self, servers: &[ServerAddress]) {
        {
            self.core.user.borrow_mut().connector = Some(servers.to_vec());
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Configure the connector from a team number; expands to the five
    /// conventional candidate addresses.
    pub fn set_server_team(&self, team: u16, port: u16) {
        {
            self.core.user.borrow_mut().connector = Some(connector::team_addresses(team, port));
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Install a one-shot override connector that takes precedence over the
    /// configured one until cleared.
    pub fn set_server_override(&self, host: &str, port: u16) {
        {
            self.core.user.borrow_mut().connector_override =
                Some(vec![ServerAddress::new(host, port)]);
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Clear the override connector.
    pub fn clear_server_override(&self) {
        {
            self.core.user.borrow_mut().connector_override = None;
        }
        self.core.client_reconnect(PROTO_REV_CURRENT);
    }

    /// Request an early flush of queued outgoing traffic.
    ///
    /// Requests arriving less than 5 ms after the previous honored one are
    /// dropped: flush is a rate-limited hint, not guaranteed delivery.
    pub fn flush(&self) {
        self.core.request_flush();
    }

    /// Info for every active connection.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        if !self.core.active.get() {
            return Vec::new();
        }
        let user = self.core.user.borrow();
        user.connections
            .iter()
            .filter(|c| c.handle().state() == ConnectionState::Active)
            .map(|c| c.handle().info())
            .collect()
    }

    /// True when at least one connection is active (always true in local
    /// role).
    pub fn is_connected(&self) -> bool {
        if !self.core.active.get() {
            return false;
        }
        if self.core.mode.get().role == Role::Local {
            return true;
        }
        let user = self.core.user.borrow();
        let any_active = user
            .connections
            .iter()
            .any(|c| c.handle().state() == ConnectionState::Active);
        any_active
    }

    /// The server role's actual bound address, once the acceptor is up.
    ///
    /// Mostly useful when binding port 0.
    pub fn listen_address(&self) -> Option<String> {
        self.core.user.borrow().bound_addr.clone()
    }

    /// Register a connection listener; with `immediate_notify`, it first
    /// receives one synthetic notification per already-active connection.
    pub fn add_listener<F>(&self, callback: F, immediate_notify: bool) -> u32
    where
        F: Fn(&ConnectionNotification) + 'static,
    {
        let id = self.core.notifier.add(callback);
        if immediate_notify {
            self.notify_existing(id);
        }
        id
    }

    /// Register a polled connection listener against a poller created on the
    /// notifier, with the same synthetic-notification behavior.
    pub fn add_polled_listener(&self, poller: u32, immediate_notify: bool) -> u32 {
        let id = self.core.notifier.add_polled(poller);
        if immediate_notify {
            self.notify_existing(id);
        }
        id
    }

    /// Remove a connection listener.
    pub fn remove_listener(&self, listener: u32) {
        self.core.notifier.remove(listener);
    }

    /// Start appending JSON connection-event records to `sink`, one line per
    /// state change, plus one synthetic record per already-active
    /// connection. Returns an id for [`stop_connection_log`](Self::stop_connection_log).
    pub fn start_connection_log(&self, sink: mpsc::UnboundedSender<String>) -> u32 {
        let listener = {
            let sink = sink.clone();
            self.core.notifier.add(move |n| {
                if let Ok(record) = serde_json::to_string(&LogRecord {
                    connected: n.connected,
                    info: &n.conn,
                }) {
                    let _ = sink.send(record);
                }
            })
        };

        let mut user = self.core.user.borrow_mut();
        for conn in user.connections.iter() {
            if conn.handle().state() != ConnectionState::Active {
                continue;
            }
            let info = conn.handle().info();
            if let Ok(record) = serde_json::to_string(&LogRecord {
                connected: true,
                info: &info,
            }) {
                let _ = sink.send(record);
            }
        }

        for (i, slot) in user.loggers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ConnectionLogger { listener });
                return i as u32 + 1;
            }
        }
        user.loggers.push(Some(ConnectionLogger { listener }));
        user.loggers.len() as u32
    }

    /// Stop a connection-event log started with
    /// [`start_connection_log`](Self::start_connection_log).
    pub fn stop_connection_log(&self, logger: u32) {
        let removed = {
            let mut user = self.core.user.borrow_mut();
            logger
                .checked_sub(1)
                .and_then(|i| user.loggers.get_mut(i as usize))
                .and_then(Option::take)
        };
        if let Some(logger) = removed {
            self.core.notifier.remove(logger.listener);
        }
    }

    fn notify_existing(&self, listener: u32) {
        let infos: Vec<ConnectionInfo> = {
            let user = self.core.user.borrow();
            user.connections
                .iter()
                .filter(|c| c.handle().state() == ConnectionState::Active)
                .map(|c| c.handle().info())
                .collect()
        };
        for info in infos {
            self.core.notifier.notify_connection(true, info, Some(listener));
        }
    }

    fn spawn_loops(&self, server: bool) {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let tasks = self.core.providers.task().clone();

        let dispatch_task =
            tasks.spawn_task("dispatch_loop", dispatch_loop(self.core.clone(), dispatch_rx));
        let io_task = if server {
            tasks.spawn_task("accept_loop", accept_loop(self.core.clone(), io_rx))
        } else {
            tasks.spawn_task("connect_loop", connect_loop(self.core.clone(), io_rx))
        };

        let mut user = self.core.user.borrow_mut();
        user.dispatch_shutdown = Some(dispatch_tx);
        user.io_shutdown = Some(io_tx);
        user.dispatch_task = Some(dispatch_task);
        user.io_task = Some(io_task);
    }
}

impl<P: Providers> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        let loggers = {
            let mut user = self.core.user.borrow_mut();
            std::mem::take(&mut user.loggers)
        };
        for logger in loggers.into_iter().flatten() {
            self.core.notifier.remove(logger.listener);
        }
    }
}

/// Periodic loop: posts outgoing traffic, schedules persistence, and detects
/// dead client connections. Runs for every role with loops; woken early by
/// flush requests.
async fn dispatch_loop<P: Providers>(
    core: Rc<DispatcherCore<P>>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let time = core.providers.time().clone();
    let mut deadline = time.now();
    let mut next_save = deadline + SAVE_PERIOD;
    let mut count = 0u32;

    while core.active.get() {
        // handle an iteration taking longer than the period
        let start = time.now();
        if start > deadline {
            deadline = start;
        }
        deadline += core.user.borrow().update_rate;

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = time.sleep(deadline.saturating_sub(start)) => {}
            _ = core.flush_signal.notified() => {}
        }
        if !core.active.get() {
            break;
        }
        core.flush.borrow_mut().do_flush = false;

        // periodic persistent save, server role only
        if core.mode.get().is_server() {
            let persist = core.user.borrow().persist_path.clone();
            if let Some(path) = persist {
                let now = time.now();
                if now > next_save {
                    next_save += SAVE_PERIOD;
                    // catch up if the loop fell behind schedule
                    if now > next_save {
                        next_save = now + SAVE_PERIOD;
                    }
                    if let Err(e) = core.storage.save_persistent(&path, true) {
                        tracing::warn!(error = %e, "periodic persistent save failed");
                    }
                }
            }
        }

        let is_client = core.mode.get().is_client();
        let mut reconnect = false;
        {
            let user = core.user.borrow();
            count += 1;
            if count > 10 {
                tracing::debug!(connections = user.connections.len(), "dispatch running");
                count = 0;
            }
            let now = time.now();
            for conn in user.connections.iter() {
                let handle = conn.handle();
                // post outgoing messages if active; only clients keep-alive
                if handle.state() == ConnectionState::Active {
                    handle.post_outgoing(is_client, now);
                }
                if is_client && handle.state() == ConnectionState::Dead {
                    reconnect = true;
                }
            }
        }
        // coalesced: at most one pending reconnect signal
        if reconnect {
            let signal = {
                let mut user = core.user.borrow_mut();
                if user.do_reconnect {
                    false
                } else {
                    user.do_reconnect = true;
                    true
                }
            };
            if signal {
                core.reconnect_signal.notify_one();
            }
        }
    }
}

/// Server role: bind the acceptor and accept peers until shutdown.
///
/// Failing to bind is fatal to the whole role. Individual handshake failures
/// are not: accepting continues regardless.
async fn accept_loop<P: Providers>(
    core: Rc<DispatcherCore<P>>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let network = core.providers.network().clone();
    let spec = core.user.borrow().listen_spec.clone().unwrap_or_default();

    let listener = match network.bind(&spec).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(addr = %spec, error = %e, "server: failed to start acceptor");
            core.active.set(false);
            core.mode
                .set(NetworkMode::new(Role::Server, ModeStatus::Failed));
            return;
        }
    };
    {
        core.user.borrow_mut().bound_addr = listener.local_addr().ok();
    }
    core.mode
        .set(NetworkMode::new(Role::Server, ModeStatus::Running));

    while core.active.get() {
        let accepted = tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => accepted,
        };
        if !core.active.get() {
            break;
        }
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "server: accept failed");
                continue;
            }
        };
        tracing::debug!(remote = %remote, "server: client connection");

        let mut conn = NetworkConnection::new(
            core.next_connection_id(),
            stream,
            &remote,
            core.providers.clone(),
            core.notifier.clone(),
        );
        conn.start(
            Rc::new(ServerHandshaker(core.clone())),
            core.storage.clone(),
        );
        let replaced = core.user.borrow_mut().connections.install_server(conn);
        drop(replaced); // task already exited; slot reused
    }
    core.mode.set(NetworkMode::default());
}

/// Client role: connect, install the single connection, and wait for a
/// reconnect signal, forever.
async fn connect_loop<P: Providers>(
    core: Rc<DispatcherCore<P>>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let time = core.providers.time().clone();

    while core.active.get() {
        // sleep between retries
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = time.sleep(RETRY_BACKOFF) => {}
        }
        if !core.active.get() {
            break;
        }

        // override takes precedence over the configured connector
        let targets = {
            let user = core.user.borrow();
            user.connector_override
                .clone()
                .or_else(|| user.connector.clone())
        };
        let Some(targets) = targets else {
            core.mode
                .set(NetworkMode::new(Role::Client, ModeStatus::Failed));
            continue;
        };

        tracing::debug!("client: trying to connect");
        let Some((stream, addr)) = connector::connect_any(&core.providers, &targets).await else {
            core.mode
                .set(NetworkMode::new(Role::Client, ModeStatus::Failed));
            continue;
        };
        tracing::debug!(remote = %addr, "client: connected");
        core.mode
            .set(NetworkMode::new(Role::Client, ModeStatus::Running));

        let mut conn = NetworkConnection::new(
            core.next_connection_id(),
            stream,
            &addr.to_string(),
            core.providers.clone(),
            core.notifier.clone(),
        );
        // seed the revision remembered from any downgrade request, then
        // reset it: the downgrade is one-shot
        let proto_rev = {
            let mut user = core.user.borrow_mut();
            let rev = user.reconnect_proto_rev;
            user.reconnect_proto_rev = PROTO_REV_CURRENT;
            rev
        };
        conn.handle().set_protocol_revision(proto_rev);
        conn.start(
            Rc::new(ClientHandshaker(core.clone())),
            core.storage.clone(),
        );

        let displaced = {
            let mut user = core.user.borrow_mut();
            user.do_reconnect = false;
            user.connections.install_client(conn)
        };
        for mut old in displaced {
            old.close().await;
        }

        // block until told to reconnect
        loop {
            if !core.active.get() || core.user.borrow().do_reconnect {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = core.reconnect_signal.notified() => {}
            }
        }
    }
    core.mode.set(NetworkMode::default());
}

#[cfg(test)]
mod tests {
    use tablebus_core::TokioProviders;

    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::wire::EntryType;

    #[derive(Default)]
    struct NullStorage;

    impl Storage for NullStorage {
        fn set_dispatcher(&self, _router: Rc<dyn MessageRouter>, _server: bool) {}
        fn load_persistent(&self, _path: &Path, _warn: &mut dyn FnMut(usize, &str)) {}
        fn save_persistent(&self, _path: &Path, _periodic: bool) -> std::io::Result<()> {
            Ok(())
        }
        fn apply_initial_assignments(
            &self,
            _conn: &ConnectionHandle,
            _incoming: Vec<Message>,
            _new_server: bool,
        ) -> Vec<Message> {
            Vec::new()
        }
        fn get_initial_assignments(&self, _conn: &ConnectionHandle) -> Vec<Message> {
            Vec::new()
        }
        fn process_incoming(&self, _msg: Message, _conn: &ConnectionHandle) {}
        fn entry_type(&self, _id: u32) -> Option<EntryType> {
            None
        }
    }

    fn dispatcher() -> Dispatcher<TokioProviders> {
        Dispatcher::new(
            TokioProviders::new(),
            Rc::new(NullStorage),
            Rc::new(ConnectionNotifier::new()),
        )
    }

    #[test]
    fn test_connection_ids_strictly_increase() {
        let d = dispatcher();
        let ids: Vec<ConnectionId> = (0..5).map(|_| d.core.next_connection_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(ids[0], ConnectionId(1));
    }

    #[test]
    fn test_update_rate_is_clamped() {
        let d = dispatcher();

        d.set_update_rate(Duration::from_millis(1));
        assert_eq!(d.core.user.borrow().update_rate, MIN_UPDATE_RATE);

        d.set_update_rate(Duration::from_secs(10));
        assert_eq!(d.core.user.borrow().update_rate, MAX_UPDATE_RATE);

        d.set_update_rate(Duration::from_millis(40));
        assert_eq!(d.core.user.borrow().update_rate, Duration::from_millis(40));
    }

    #[test]
    fn test_flush_requests_within_window_are_dropped() {
        let d = dispatcher();

        d.flush();
        assert!(d.core.flush.borrow().do_flush, "first flush is honored");
        let honored_at = d.core.flush.borrow().last_flush;

        // simulate the dispatch loop consuming the request
        d.core.flush.borrow_mut().do_flush = false;

        // immediate second request lands inside the 5 ms window
        d.flush();
        assert!(!d.core.flush.borrow().do_flush, "second flush is dropped");
        assert_eq!(d.core.flush.borrow().last_flush, honored_at);
    }

    #[test]
    fn test_downgrade_memory_is_recorded_by_client_reconnect() {
        let d = dispatcher();
        d.core.client_reconnect(0x0200);

        let mut user = d.core.user.borrow_mut();
        assert_eq!(user.reconnect_proto_rev, 0x0200);
        assert!(user.do_reconnect);

        // what the connect loop does when seeding the next attempt
        let seeded = user.reconnect_proto_rev;
        user.reconnect_proto_rev = PROTO_REV_CURRENT;
        assert_eq!(seeded, 0x0200);
        assert_eq!(user.reconnect_proto_rev, PROTO_REV_CURRENT);
    }

    #[test]
    fn test_queue_outgoing_skips_unsynchronized_connections() {
        let d = dispatcher();
        let notifier = Rc::new(ConnectionNotifier::new());
        {
            let mut user = d.core.user.borrow_mut();
            for _ in 0..3 {
                let (stream, _peer) = tokio::io::duplex(64);
                user.connections.install_server(NetworkConnection::new(
                    d.core.next_connection_id(),
                    stream,
                    "127.0.0.1:1735",
                    TokioProviders::new(),
                    notifier.clone(),
                ));
            }
        }
        let handles: Vec<ConnectionHandle> = {
            let user = d.core.user.borrow();
            user.connections.iter().map(|c| c.handle().clone()).collect()
        };
        handles[0].set_state(ConnectionState::Active);
        handles[1].set_state(ConnectionState::Handshaking);
        handles[2].set_state(ConnectionState::Synchronized);

        d.core.queue_outgoing(Message::KeepAlive, None, None);

        let now = Duration::from_secs(2);
        for h in &handles {
            h.post_outgoing(false, now);
        }
        assert!(handles[0].pop_outgoing().is_some());
        assert!(handles[1].pop_outgoing().is_none());
        assert!(handles[2].pop_outgoing().is_some());
    }

    #[test]
    fn test_queue_outgoing_honors_only_and_except() {
        let d = dispatcher();
        let notifier = Rc::new(ConnectionNotifier::new());
        {
            let mut user = d.core.user.borrow_mut();
            for _ in 0..2 {
                let (stream, _peer) = tokio::io::duplex(64);
                let conn = NetworkConnection::new(
                    d.core.next_connection_id(),
                    stream,
                    "127.0.0.1:1735",
                    TokioProviders::new(),
                    notifier.clone(),
                );
                conn.handle().set_state(ConnectionState::Active);
                user.connections.install_server(conn);
            }
        }
        let handles: Vec<ConnectionHandle> = {
            let user = d.core.user.borrow();
            user.connections.iter().map(|c| c.handle().clone()).collect()
        };

        d.core
            .queue_outgoing(Message::KeepAlive, None, Some(handles[0].id()));
        let now = Duration::from_secs(2);
        handles[0].post_outgoing(false, now);
        handles[1].post_outgoing(false, now);
        assert!(handles[0].pop_outgoing().is_none());
        assert!(handles[1].pop_outgoing().is_some());

        d.core
            .queue_outgoing(Message::KeepAlive, Some(handles[0].id()), None);
        let now = Duration::from_secs(4);
        handles[0].post_outgoing(false, now);
        handles[1].post_outgoing(false, now);
        assert!(handles[0].pop_outgoing().is_some());
        assert!(handles[1].pop_outgoing().is_none());
    }

    #[test]
    fn test_set_dispatcher_handed_to_storage_on_local_start() {
        struct RecordingStorage {
            seen: RefCell<Vec<bool>>,
        }
        impl Storage for RecordingStorage {
            fn set_dispatcher(&self, _router: Rc<dyn MessageRouter>, server: bool) {
                self.seen.borrow_mut().push(server);
            }
            fn load_persistent(&self, _path: &Path, _warn: &mut dyn FnMut(usize, &str)) {}
            fn save_persistent(&self, _path: &Path, _periodic: bool) -> std::io::Result<()> {
                Ok(())
            }
            fn apply_initial_assignments(
                &self,
                _conn: &ConnectionHandle,
                _incoming: Vec<Message>,
                _new_server: bool,
            ) -> Vec<Message> {
                Vec::new()
            }
            fn get_initial_assignments(&self, _conn: &ConnectionHandle) -> Vec<Message> {
                Vec::new()
            }
            fn process_incoming(&self, _msg: Message, _conn: &ConnectionHandle) {}
            fn entry_type(&self, _id: u32) -> Option<EntryType> {
                None
            }
        }

        let storage = Rc::new(RecordingStorage {
            seen: RefCell::new(Vec::new()),
        });
        let d = Dispatcher::new(
            TokioProviders::new(),
            storage.clone(),
            Rc::new(ConnectionNotifier::new()),
        );

        d.start_local();
        assert_eq!(*storage.seen.borrow(), vec![false]);
        assert_eq!(d.network_mode().role, Role::Local);
        assert!(d.is_connected());

        // starting again while active is a no-op
        d.start_local();
        assert_eq!(*storage.seen.borrow(), vec![false]);
    }
}
