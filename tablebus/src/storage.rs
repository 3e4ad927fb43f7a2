//! Collaborator surface consumed from the key-value store.
//!
//! The dispatcher does not know what the synchronized values mean; it only
//! moves them. [`Storage`] is everything it needs from the value store: the
//! initial-snapshot exchange during handshakes, the runtime incoming path,
//! persistence, and entry type lookups. In return the store receives a
//! [`MessageRouter`] at role start so it can broadcast its own changes.

use std::io;
use std::path::Path;
use std::rc::Rc;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::wire::{EntryType, Message};

/// The dispatcher surface handed to [`Storage::set_dispatcher`].
///
/// Lets the store push outgoing traffic without holding a reference to the
/// full dispatcher.
pub trait MessageRouter {
    /// Queue a message on matching connections.
    ///
    /// Skips connections that are not yet synchronized. `only` restricts
    /// delivery to a single connection; `except` excludes one (typically the
    /// message's origin).
    fn queue_outgoing(&self, msg: Message, only: Option<ConnectionId>, except: Option<ConnectionId>);

    /// Request an early flush of queued outgoing traffic.
    ///
    /// Rate-limited; requests arriving too quickly are dropped.
    fn flush(&self);
}

/// Collaborator surface consumed from the key-value store.
pub trait Storage {
    /// Called at role start, handing the store its outgoing path and telling
    /// it which role this node plays.
    fn set_dispatcher(&self, router: Rc<dyn MessageRouter>, server: bool);

    /// Load persisted values from `path` at server start.
    ///
    /// Parse problems are reported through `warn` as `(line, message)` pairs
    /// and are never fatal.
    fn load_persistent(&self, path: &Path, warn: &mut dyn FnMut(usize, &str));

    /// Save persistent values to `path`.
    ///
    /// `periodic` is true for the dispatch loop's scheduled saves.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the dispatch loop logs it and moves
    /// on.
    fn save_persistent(&self, path: &Path, periodic: bool) -> io::Result<()>;

    /// Client handshake: reconcile the server's initial assignments against
    /// local state and return the batch to send back.
    ///
    /// `new_server` is false when the server marked the session as resumed.
    fn apply_initial_assignments(
        &self,
        conn: &ConnectionHandle,
        incoming: Vec<Message>,
        new_server: bool,
    ) -> Vec<Message>;

    /// Server handshake: the full current snapshot to send to a new client.
    fn get_initial_assignments(&self, conn: &ConnectionHandle) -> Vec<Message>;

    /// Runtime incoming path: one message received from a connection.
    fn process_incoming(&self, msg: Message, conn: &ConnectionHandle);

    /// Look up the type of an assigned entry, if known.
    ///
    /// Used by the connection read path to drop updates targeting unknown
    /// entries or carrying a mismatched value type.
    fn entry_type(&self, id: u32) -> Option<EntryType>;
}
