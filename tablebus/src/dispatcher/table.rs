//! The guarded collection of tracked connections.

use tablebus_core::Providers;

use crate::connection::{ConnectionState, NetworkConnection};

/// Ordered collection of owned connections.
///
/// Lives inside the dispatcher's user-state cell; every access happens under
/// that single guard. Removal is by replacement: server role reuses the slot
/// of a dead connection before growing, client role evicts everything when a
/// new connection is installed.
pub(crate) struct ConnectionTable<P: Providers> {
    conns: Vec<NetworkConnection<P>>,
}

impl<P: Providers> ConnectionTable<P> {
    pub(crate) fn new() -> Self {
        Self { conns: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &NetworkConnection<P>> {
        self.conns.iter()
    }

    /// Install a server-side connection, reusing the first dead slot if one
    /// exists. Returns the evicted connection, if any.
    pub(crate) fn install_server(
        &mut self,
        conn: NetworkConnection<P>,
    ) -> Option<NetworkConnection<P>> {
        for slot in self.conns.iter_mut() {
            if slot.handle().state() == ConnectionState::Dead {
                return Some(std::mem::replace(slot, conn));
            }
        }
        self.conns.push(conn);
        None
    }

    /// Install the client-side connection, evicting any current occupants.
    ///
    /// Client role holds at most one connection; the returned list is
    /// whatever was displaced and must be torn down by the caller.
    pub(crate) fn install_client(&mut self, conn: NetworkConnection<P>) -> Vec<NetworkConnection<P>> {
        let old = std::mem::take(&mut self.conns);
        self.conns.push(conn);
        old
    }

    /// Empty the table, transferring ownership of every connection to the
    /// caller.
    pub(crate) fn take_all(&mut self) -> Vec<NetworkConnection<P>> {
        std::mem::take(&mut self.conns)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use tablebus_core::TokioProviders;

    use super::*;
    use crate::connection::ConnectionId;
    use crate::notifier::ConnectionNotifier;

    fn conn(id: u32) -> NetworkConnection<TokioProviders> {
        let (stream, _peer) = tokio::io::duplex(64);
        NetworkConnection::new(
            ConnectionId(id),
            stream,
            "127.0.0.1:1735",
            TokioProviders::new(),
            Rc::new(ConnectionNotifier::new()),
        )
    }

    #[test]
    fn test_server_install_reuses_dead_slot() {
        let mut table = ConnectionTable::new();

        assert!(table.install_server(conn(1)).is_none());
        assert!(table.install_server(conn(2)).is_none());
        assert_eq!(table.len(), 2);

        table
            .iter()
            .next()
            .expect("slot 0 exists")
            .handle()
            .set_state(ConnectionState::Dead);

        let evicted = table.install_server(conn(3)).expect("dead slot reused");
        assert_eq!(evicted.handle().id(), ConnectionId(1));
        assert_eq!(table.len(), 2);

        let ids: Vec<ConnectionId> = table.iter().map(|c| c.handle().id()).collect();
        assert_eq!(ids, vec![ConnectionId(3), ConnectionId(2)]);
    }

    #[test]
    fn test_table_length_bounded_by_live_high_water_mark() {
        let mut table = ConnectionTable::new();
        let mut next_id = 0u32;

        // Two connections live at once, across many connect/disconnect
        // cycles: the table never grows past two slots.
        for _ in 0..10 {
            for _ in 0..2 {
                next_id += 1;
                table.install_server(conn(next_id));
            }
            for c in table.iter() {
                c.handle().set_state(ConnectionState::Dead);
            }
        }

        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_client_install_keeps_at_most_one() {
        let mut table = ConnectionTable::new();

        assert!(table.install_client(conn(1)).is_empty());
        let old = table.install_client(conn(2));

        assert_eq!(old.len(), 1);
        assert_eq!(old[0].handle().id(), ConnectionId(1));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.iter().next().expect("occupant").handle().id(),
            ConnectionId(2)
        );
    }

    #[test]
    fn test_take_all_empties_the_table() {
        let mut table = ConnectionTable::new();
        table.install_server(conn(1));
        table.install_server(conn(2));

        let taken = table.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(table.len(), 0);
    }
}
