//! Client-side receive loop and transfer-id routing.
//!
//! One task owns `recv_from` on the client socket. Each datagram is decoded
//! and forwarded to the channel registered for its transfer id. Sessions hold
//! a [`Registration`]; dropping it removes the route.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reach_protocol::{Message, MAX_MESSAGE_SIZE};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::socket::{is_connection_reset, send_datagram};

#[derive(Default)]
struct Routes {
    by_transfer: HashMap<u64, mpsc::UnboundedSender<Message>>,
    alive_waiters: Vec<oneshot::Sender<u64>>,
    closed: bool,
}

struct Shared {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    routes: Mutex<Routes>,
    malformed: AtomicU64,
    unrouted: AtomicU64,
}

/// Handle to the receive loop of one client socket talking to one server.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket,
                peer,
                routes: Mutex::new(Routes::default()),
                malformed: AtomicU64::new(0),
                unrouted: AtomicU64::new(0),
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Datagrams dropped because they failed to decode.
    pub fn malformed_count(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Datagrams dropped because no registration matched.
    pub fn unrouted_count(&self) -> u64 {
        self.shared.unrouted.load(Ordering::Relaxed)
    }

    /// Route messages for `transfer_id` to the returned registration.
    pub fn register(&self, transfer_id: u64) -> Result<Registration> {
        let mut routes = self.routes();
        if routes.closed {
            return Err(TransferError::DispatcherClosed);
        }
        if routes.by_transfer.contains_key(&transfer_id) {
            return Err(TransferError::TransferIdInUse(transfer_id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.by_transfer.insert(transfer_id, tx);

        Ok(Registration {
            transfer_id,
            rx,
            dispatcher: self.clone(),
        })
    }

    /// Resolve with the server's protocol version on the next Alive.
    pub(crate) fn wait_alive(&self) -> Result<oneshot::Receiver<u64>> {
        let mut routes = self.routes();
        if routes.closed {
            return Err(TransferError::DispatcherClosed);
        }
        let (tx, rx) = oneshot::channel();
        routes.alive_waiters.push(tx);
        Ok(rx)
    }

    /// Encode and send a message to the server.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        send_datagram(&self.shared.socket, &bytes, self.shared.peer)
            .await
            .map_err(TransferError::Socket)
    }

    /// Receive until the socket fails. Every registration is closed on exit,
    /// so waiting sessions observe [`TransferError::DispatcherClosed`].
    pub async fn run(self) -> Result<()> {
        // Oversized so that a datagram above the limit is detectable.
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 64];

        let result = loop {
            match self.shared.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if len > MAX_MESSAGE_SIZE {
                        self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!("Dropping oversized datagram ({} bytes) from {}", len, from);
                        continue;
                    }
                    match Message::decode(&buf[..len]) {
                        Ok(message) => self.route(message, from),
                        Err(e) => {
                            self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                            warn!("Dropping malformed datagram from {}: {}", from, e);
                        }
                    }
                }
                Err(ref e) if is_connection_reset(e) => continue,
                Err(e) => break Err(TransferError::Socket(e)),
            }
        };

        self.close();
        result
    }

    fn route(&self, message: Message, from: SocketAddr) {
        match message {
            Message::Alive { version } => {
                let waiters = std::mem::take(&mut self.routes().alive_waiters);
                for waiter in waiters {
                    let _ = waiter.send(version);
                }
            }
            Message::Ping => debug!("Ignoring ping from {}", from),
            message => {
                let Some(transfer_id) = message.transfer_id() else {
                    return;
                };
                let routes = self.routes();
                match routes.by_transfer.get(&transfer_id) {
                    Some(tx) => {
                        // A send error means the registration is being dropped.
                        let _ = tx.send(message);
                    }
                    None => {
                        self.shared.unrouted.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "No registration for {} on transfer {} from {}",
                            message.kind(),
                            transfer_id,
                            from
                        );
                    }
                }
            }
        }
    }

    fn unregister(&self, transfer_id: u64) {
        self.routes().by_transfer.remove(&transfer_id);
    }

    fn close(&self) {
        let mut routes = self.routes();
        routes.closed = true;
        routes.by_transfer.clear();
        routes.alive_waiters.clear();
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.shared.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of one transfer id's route.
pub struct Registration {
    transfer_id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    dispatcher: Dispatcher,
}

impl Registration {
    pub fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    /// Next message for this transfer, or `None` once the receive loop stopped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.transfer_id);
    }
}
