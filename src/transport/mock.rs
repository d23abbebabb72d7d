//! In-memory scripted transport.
//!
//! Drives the pool and markets in tests without a network:
//! - per-method response queues (`script_result`) or a fallback responder
//!   closure (`set_responder`) for bulk scenarios,
//! - a recorded call log (method + args, in call-start order) for asserting
//!   subscribe serialization,
//! - injectable lifecycle events and pushed deltas (`emit`),
//! - optional manual connect mode so a test can hold a connection in the
//!   "created but never connected" state.
//!
//! `call()` suspends until a response is available, which lets tests control
//! interleaving at the exact suspension points the pool has in production.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use super::{Transport, TransportError, TransportEvent};

type Responder = Box<dyn Fn(&str, &[Value]) -> Result<Value, TransportError> + Send + Sync>;

pub struct ScriptedTransport {
    scripted: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
    responder: Mutex<Option<Responder>>,
    response_ready: Notify,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    manual_connect: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            scripted: Mutex::new(HashMap::new()),
            responder: Mutex::new(None),
            response_ready: Notify::new(),
            calls: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            manual_connect: AtomicBool::new(false),
        }
    }

    /// Hold `connect()` open: no lifecycle event fires until
    /// [`release_connect`](Self::release_connect) is called.
    pub fn with_manual_connect(self) -> Self {
        self.manual_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Queue one response for `method` (FIFO per method).
    pub fn script_result(&self, method: &str, result: Result<Value, TransportError>) {
        self.scripted
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
        self.response_ready.notify_waiters();
    }

    /// Fallback for methods without a scripted queue entry.
    pub fn set_responder(
        &self,
        responder: impl Fn(&str, &[Value]) -> Result<Value, TransportError> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Box::new(responder));
        self.response_ready.notify_waiters();
    }

    /// Inject a lifecycle event or pushed delta, as the wire would.
    pub fn emit(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected | TransportEvent::Reconnected => {
                self.connected.store(true, Ordering::SeqCst);
                self.ever_connected.store(true, Ordering::SeqCst);
            }
            TransportEvent::Disconnected => self.connected.store(false, Ordering::SeqCst),
            TransportEvent::Push(_) => {}
        }
        let _ = self.events_tx.send(event);
    }

    /// Complete a pending manual connect, emitting the lifecycle event.
    pub fn release_connect(&self) {
        if self.ever_connected.load(Ordering::SeqCst) {
            self.emit(TransportEvent::Reconnected);
        } else {
            self.emit(TransportEvent::Connected);
        }
    }

    /// Calls recorded so far, in call-start order.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            if self.calls.lock().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn try_respond(&self, method: &str, args: &[Value]) -> Option<Result<Value, TransportError>> {
        if let Some(queue) = self.scripted.lock().get_mut(method) {
            if let Some(result) = queue.pop_front() {
                return Some(result);
            }
        }
        self.responder
            .lock()
            .as_ref()
            .map(|responder| responder(method, args))
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.manual_connect.load(Ordering::SeqCst) {
            self.release_connect();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, TransportError> {
        self.calls.lock().push((method.to_string(), args.to_vec()));
        loop {
            // Register for wakeup before checking, so a response scripted
            // between the check and the await is not missed.
            let notified = self.response_ready.notified();
            if let Some(result) = self.try_respond(method, args) {
                return result;
            }
            notified.await;
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
