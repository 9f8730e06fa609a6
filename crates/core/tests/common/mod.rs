//! Helpers shared by the socket-level integration tests.
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use companion_link::{Message, MessageHandler, Network, NetworkClient, NetworkServer, Remote};
use parking_lot::Mutex;

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Call `step` until it returns true or [`DEADLINE`] passes.
pub fn run_until(mut step: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if step() {
            return true;
        }
        if start.elapsed() > DEADLINE {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Keep calling `step` for `duration`.
pub fn run_for(duration: Duration, mut step: impl FnMut()) {
    let start = Instant::now();
    while start.elapsed() < duration {
        step();
        thread::sleep(Duration::from_millis(2));
    }
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

/// Connect `client` to `server` and return each side's view of the other.
pub fn connect(server: &mut NetworkServer, client: &mut NetworkClient) -> (Remote, Remote) {
    let port = server.port().unwrap();
    client.connect_to_server("127.0.0.1", port, 0).unwrap();
    let client_id = client.id();
    assert!(run_until(|| {
        server.update();
        client.update();
        client.server().is_some() && server.remotes().iter().any(|r| r.id == client_id)
    }));
    let on_server = server
        .remotes()
        .into_iter()
        .find(|r| r.id == client_id)
        .unwrap();
    (on_server, client.server().unwrap())
}

/// Handler collecting every message it receives.
pub fn collector() -> (MessageHandler, Arc<Mutex<Vec<Message>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: MessageHandler = Arc::new(move |message: Message| sink.lock().push(message));
    (handler, received)
}
