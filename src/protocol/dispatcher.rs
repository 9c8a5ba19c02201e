//! Delivers decoded messages by correlation id.
//!
//! Responses go to the caller waiting on that id; requests go to the handler
//! registered for their packet type. Both tables are shared by every
//! connection of a messaging service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::time::{current_millis, is_expired};

/// A decoded message as it comes off a connection.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub packet: Packet,
    pub id: i32,
    /// Sender timestamp in milliseconds, or the local receive time when
    /// cross-node timeouts are off.
    pub timestamp: i64,
    pub from: SocketAddr,
    pub version: i32,
}

type HandlerFn = dyn Fn(InboundMessage) + Send + Sync + 'static;

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the caller waiting on its id.
    Delivered,
    /// Handed to a request handler.
    Handled,
    /// A response nobody waits for any more.
    Expired,
    /// A request older than the request timeout.
    Stale,
    /// A request type with no handler.
    Unhandled,
}

struct PendingCallback {
    tx: oneshot::Sender<Result<Packet>>,
    expires_at: Instant,
    to: SocketAddr,
}

/// Correlation-id dispatcher.
pub struct Dispatcher {
    next_id: AtomicI32,
    callbacks: Mutex<HashMap<i32, PendingCallback>>,
    handlers: RwLock<HashMap<PacketType, Arc<HandlerFn>>>,
    request_timeout: Option<Duration>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            callbacks: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            request_timeout: None,
        }
    }

    /// Drop requests whose timestamp is older than `timeout` instead of
    /// handing them to their handler.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn register_handler<F>(&self, packet_type: PacketType, handler: F) -> Result<()>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;
        handlers.insert(packet_type, Arc::new(handler));
        Ok(())
    }

    fn next_id(&self) -> i32 {
        // ids wrap; zero is never handed out
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Allocate an id for a request to `to` and start waiting for its ack.
    pub fn register_callback(self: &Arc<Self>, to: SocketAddr, timeout: Duration) -> ResponseHandle {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id();
        let callback = PendingCallback {
            tx,
            expires_at: Instant::now() + timeout,
            to,
        };
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.insert(id, callback),
            Err(poisoned) => poisoned.into_inner().insert(id, callback),
        };
        trace!(id, %to, "Registered callback");
        ResponseHandle {
            id,
            to,
            timeout,
            rx,
            dispatcher: Arc::clone(self),
        }
    }

    /// Whether a caller still waits for `id`.
    pub fn is_expecting(&self, id: i32) -> bool {
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks.contains_key(&id),
            Err(poisoned) => poisoned.into_inner().contains_key(&id),
        }
    }

    pub fn pending(&self) -> usize {
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn take_callback(&self, id: i32) -> Option<PendingCallback> {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        }
    }

    /// Deliver one message.
    pub fn dispatch(&self, message: InboundMessage) -> Result<DispatchOutcome> {
        let packet_type = message.packet.packet_type();

        if packet_type.is_response() {
            let Some(callback) = self.take_callback(message.id) else {
                trace!(id = message.id, %packet_type, "Dropping response for expired callback");
                return Ok(DispatchOutcome::Expired);
            };
            if callback.to != message.from {
                trace!(id = message.id, expected = %callback.to, from = %message.from, "Response from a different endpoint");
            }
            let result = match message.packet {
                Packet::Error(err) => Err(ProtocolError::Remote {
                    code: err.code,
                    message: err.message,
                }),
                packet => Ok(packet),
            };
            // the waiter may have given up between lookup and send
            let _ = callback.tx.send(result);
            return Ok(DispatchOutcome::Delivered);
        }

        if let Some(timeout) = self.request_timeout {
            if is_expired(message.timestamp, current_millis(), timeout.as_millis() as i64) {
                debug!(id = message.id, %packet_type, from = %message.from, "Dropping stale request");
                return Ok(DispatchOutcome::Stale);
            }
        }

        let handler = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.into()))?;
            handlers.get(&packet_type).cloned()
        };
        match handler {
            Some(handler) => {
                handler(message);
                Ok(DispatchOutcome::Handled)
            }
            None => {
                debug!(id = message.id, %packet_type, "No handler registered, dropping request");
                Ok(DispatchOutcome::Unhandled)
            }
        }
    }

    /// Fail every callback whose deadline has passed. Returns how many.
    pub fn expire_callbacks(&self, now: Instant) -> usize {
        let expired: Vec<(i32, PendingCallback)> = {
            let mut callbacks = match self.callbacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let ids: Vec<i32> = callbacks
                .iter()
                .filter(|(_, cb)| cb.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| callbacks.remove(&id).map(|cb| (id, cb)))
                .collect()
        };
        let count = expired.len();
        for (id, callback) in expired {
            trace!(id, to = %callback.to, "Callback expired");
            let _ = callback.tx.send(Err(ProtocolError::Timeout));
        }
        count
    }

    /// Drop every pending callback; their waiters see `ConnectionClosed`.
    pub fn clear_callbacks(&self) {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

/// A caller's side of a registered callback.
///
/// Dropping the handle, or letting [`wait`](Self::wait) time out, removes the
/// callback so a late response is treated as expired.
pub struct ResponseHandle {
    id: i32,
    to: SocketAddr,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Packet>>,
    dispatcher: Arc<Dispatcher>,
}

impl ResponseHandle {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn to(&self) -> SocketAddr {
        self.to
    }

    /// Wait for the ack. An `Error` packet resolves to `ProtocolError::Remote`.
    pub async fn wait(mut self) -> Result<Packet> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.dispatcher.take_callback(self.id);
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("to", &self.to)
            .finish()
    }
}
