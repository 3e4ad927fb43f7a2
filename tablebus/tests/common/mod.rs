//! Shared helpers for integration tests: a local runtime, a recording
//! storage stub, and raw framed-stream helpers for scripting peers.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tablebus::{
    ConnectionHandle, EntryType, Message, MessageRouter, Storage, encode_frame, try_decode_frame,
};

/// Run a future on a current-thread runtime inside a `LocalSet`, so the
/// dispatcher can spawn its local background tasks.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(future))
}

/// Poll `condition` every few milliseconds until it holds or the budget runs
/// out. Returns whether it held.
pub async fn wait_until(budget: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Storage stub that serves canned snapshots and records every interaction.
#[derive(Default)]
pub struct TestStorage {
    /// Served by `get_initial_assignments` (server handshake snapshot).
    pub snapshot: RefCell<Vec<Message>>,
    /// Returned by `apply_initial_assignments` (client handshake reply).
    pub reply: RefCell<Vec<Message>>,
    /// `(incoming, new_server)` recorded per client handshake.
    pub applied: RefCell<Vec<(Vec<Message>, bool)>>,
    /// Messages fed through `process_incoming`.
    pub incoming: RefCell<Vec<Message>>,
    /// Known entry types for `entry_type` lookups.
    pub entry_types: RefCell<HashMap<u32, EntryType>>,
    /// The router and role received via `set_dispatcher`.
    pub router: RefCell<Option<(Rc<dyn MessageRouter>, bool)>>,
}

impl Storage for TestStorage {
    fn set_dispatcher(&self, router: Rc<dyn MessageRouter>, server: bool) {
        *self.router.borrow_mut() = Some((router, server));
    }

    fn load_persistent(&self, _path: &Path, _warn: &mut dyn FnMut(usize, &str)) {}

    fn save_persistent(&self, _path: &Path, _periodic: bool) -> io::Result<()> {
        Ok(())
    }

    fn apply_initial_assignments(
        &self,
        _conn: &ConnectionHandle,
        incoming: Vec<Message>,
        new_server: bool,
    ) -> Vec<Message> {
        self.applied.borrow_mut().push((incoming, new_server));
        self.reply.borrow().clone()
    }

    fn get_initial_assignments(&self, _conn: &ConnectionHandle) -> Vec<Message> {
        self.snapshot.borrow().clone()
    }

    fn process_incoming(&self, msg: Message, _conn: &ConnectionHandle) {
        self.incoming.borrow_mut().push(msg);
    }

    fn entry_type(&self, id: u32) -> Option<EntryType> {
        self.entry_types.borrow().get(&id).copied()
    }
}

/// Send messages over a raw stream, one frame each.
pub async fn send_frames(stream: &mut tokio::net::TcpStream, msgs: &[Message]) {
    for msg in msgs {
        let frame = encode_frame(msg).expect("encode should succeed");
        stream.write_all(&frame).await.expect("write should succeed");
    }
}

/// Read the next message from a raw stream, buffering partial frames in
/// `buf`. Returns `None` on EOF.
pub async fn read_frame(stream: &mut tokio::net::TcpStream, buf: &mut Vec<u8>) -> Option<Message> {
    loop {
        if let Some((msg, consumed)) = try_decode_frame(buf).expect("peer sent a valid frame") {
            buf.drain(..consumed);
            return Some(msg);
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

/// Extract the port from a dispatcher-reported `"address:port"` string.
pub fn port_of(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .expect("address should have a port")
}
