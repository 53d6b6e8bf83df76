//! Consumer notifications and the channel bridge that carries them
//!
//! The core emits [`SerialEvent`]s from the opening thread, the permission
//! callback thread and every I/O worker thread. An [`EventSender`] accepts
//! events from any of them without blocking; the matching [`EventReceiver`]
//! can be drained from a Tokio task or a plain thread.

use async_channel::{Receiver, Sender, TryRecvError, unbounded};

/// Notifications delivered to the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// A logical port connected or disconnected
    ConnectedStateChanged { port: String, connected: bool },

    /// Bytes received on a logical port
    DataReceived { port: String, data: Vec<u8> },

    /// Human readable failure; `port` is `None` for device-level errors
    Error {
        port: Option<String>,
        message: String,
    },

    /// A device was attached (`true`) or detached (`false`)
    DeviceAttached(bool),
}

impl SerialEvent {
    pub fn port(&self) -> Option<&str> {
        match self {
            SerialEvent::ConnectedStateChanged { port, .. }
            | SerialEvent::DataReceived { port, .. } => Some(port),
            SerialEvent::Error { port, .. } => port.as_deref(),
            SerialEvent::DeviceAttached(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SerialEvent::Error { .. })
    }
}

/// Receiver of consumer notifications
///
/// Implementations must be safe to call concurrently from several threads
/// and must not block for long: workers call `emit` inline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SerialEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SerialEvent) {}
}

/// Sending half of the event bridge
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SerialEvent>,
}

impl EventSink for EventSender {
    fn emit(&self, event: SerialEvent) {
        // Unbounded: only fails once every receiver is gone
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("Dropping event, no receiver: {:?}", e.into_inner());
        }
    }
}

/// Receiving half of the event bridge
#[derive(Clone)]
pub struct EventReceiver {
    rx: Receiver<SerialEvent>,
}

impl EventReceiver {
    /// Receive the next event (async)
    pub async fn recv(&self) -> crate::Result<SerialEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event, blocking the current thread
    pub fn recv_blocking(&self) -> crate::Result<SerialEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<SerialEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event bridge between the core and the application layer
///
/// Returns (EventSender for the core, EventReceiver for the consumer)
pub fn create_event_bridge() -> (EventSender, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}
