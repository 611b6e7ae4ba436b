//! A "mock" (totally local) overlay for passing around wire chunks.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use multiverse_node::overlay::{Overlay, OverlayInput, TransportError};
use multiverse_node::types::data_types::ConnectionId;

/// An overlay stub that records everything written to it and replays injected inputs.
///
/// Cloning shares the underlying state, so a clone held by a test observes traffic
/// produced by the clone the engine polls.
#[derive(Clone)]
pub struct MockOverlay {
    inputs: Arc<Mutex<VecDeque<OverlayInput>>>,
    sent: Arc<Mutex<Vec<(ConnectionId, Vec<u8>)>>>,
    broadcasts: Arc<Mutex<Vec<Vec<u8>>>>,
    discovering: Arc<Mutex<bool>>,
    disconnected: Arc<Mutex<Vec<ConnectionId>>>,
}

impl MockOverlay {
    pub fn new() -> MockOverlay {
        MockOverlay {
            inputs: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            discovering: Arc::new(Mutex::new(true)),
            disconnected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue an input for the engine's next poll.
    pub fn inject(&self, input: OverlayInput) {
        self.inputs.lock().unwrap().push_back(input);
    }

    pub fn sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn discovering(&self) -> bool {
        *self.discovering.lock().unwrap()
    }

    pub fn disconnected(&self) -> Vec<ConnectionId> {
        self.disconnected.lock().unwrap().clone()
    }

    /// Block until `pred` observes a directed send, or panic after `timeout`.
    pub fn wait_for_send(
        &self,
        timeout: Duration,
        pred: impl Fn(&(ConnectionId, Vec<u8>)) -> bool,
    ) -> (ConnectionId, Vec<u8>) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.sent.lock().unwrap().iter().find(|entry| pred(entry)) {
                return found.clone();
            }
            if Instant::now() >= deadline {
                panic!("no matching send before the deadline");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Block until `pred` observes a broadcast, or panic after `timeout`.
    pub fn wait_for_broadcast(
        &self,
        timeout: Duration,
        pred: impl Fn(&Vec<u8>) -> bool,
    ) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self
                .broadcasts
                .lock()
                .unwrap()
                .iter()
                .find(|bytes| pred(bytes))
            {
                return found.clone();
            }
            if Instant::now() >= deadline {
                panic!("no matching broadcast before the deadline");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Overlay for MockOverlay {
    fn send(&mut self, conn: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((conn, bytes));
        Ok(())
    }

    fn broadcast(&mut self, bytes: Vec<u8>) {
        self.broadcasts.lock().unwrap().push(bytes);
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        self.disconnected.lock().unwrap().push(conn);
    }

    fn start_discovery(&mut self) {
        *self.discovering.lock().unwrap() = true;
    }

    fn stop_discovery(&mut self) {
        *self.discovering.lock().unwrap() = false;
    }

    fn recv(&mut self) -> Option<OverlayInput> {
        self.inputs.lock().unwrap().pop_front()
    }
}
