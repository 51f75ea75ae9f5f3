//! Listening-socket owner: accepts connections on the acceptor loop.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::address::Address;
use crate::dispatcher::{Dispatcher, EventKind};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::{SocketHandle, DEFAULT_BACKLOG};

/// Invoked once per accepted descriptor with its peer address.
pub type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr) + Send>;

/// Owns the listening descriptor and its dispatcher on the acceptor loop.
///
/// On readable readiness the acceptor drains the kernel queue: with a
/// level-triggered facility a single `accept` per fire would fall behind
/// under bursty connect load.
pub struct Acceptor {
    owner: Arc<EventLoop>,
    socket: Arc<SocketHandle>,
    dispatcher: Arc<Dispatcher>,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Build the listener (SO_REUSEADDR, SO_REUSEPORT and TCP_NODELAY set
    /// before bind/listen) and wrap it in a dispatcher on `owner`.
    ///
    /// The dispatcher stays detached until [`Acceptor::start`].
    pub fn new(owner: Arc<EventLoop>, addr: &Address) -> Result<Arc<Self>> {
        let socket = SocketHandle::new_stream()?;
        socket.set_reuse_address()?;
        socket.set_reuse_port()?;
        socket.set_nodelay()?;
        socket.set_nonblocking()?;
        socket.bind(addr)?;
        socket.listen(DEFAULT_BACKLOG)?;
        let socket = Arc::new(socket);
        debug!(addr = %addr, "listener bound");

        let acceptor = Arc::new_cyclic(|weak: &std::sync::Weak<Acceptor>| {
            let dispatcher = Arc::new(Dispatcher::new(socket.clone(), &owner));
            let weak = weak.clone();
            dispatcher.set_handler(EventKind::Readable, move |now| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_accept(now)
                } else {
                    Ok(())
                }
            });
            Self {
                owner,
                socket,
                dispatcher,
                on_connection: Mutex::new(None),
            }
        });
        Ok(acceptor)
    }

    /// Register the callback that receives accepted descriptors. Must be
    /// set before `start`; descriptors accepted without one are closed.
    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock() = Some(callback);
    }

    /// Arm the listening descriptor for readable readiness.
    pub fn start(self: &Arc<Self>) {
        let acceptor = self.clone();
        self.owner.run_in_loop(move || {
            if let Err(e) = acceptor.dispatcher.enable_reading() {
                error!(error = %e, "failed to arm acceptor");
            }
        });
    }

    /// Detach the listening descriptor from the poller.
    pub fn stop(self: &Arc<Self>) {
        let acceptor = self.clone();
        self.owner.run_in_loop(move || {
            if let Err(e) = acceptor.dispatcher.remove() {
                debug!(error = %e, "acceptor already detached");
            }
        });
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accept until the kernel reports an empty queue.
    fn handle_accept(&self, _now: Instant) -> Result<()> {
        loop {
            match self.socket.accept() {
                Ok((fd, peer)) => {
                    CONNECTIONS_ACCEPTED.increment();
                    let callback = self.on_connection.lock();
                    match callback.as_ref() {
                        Some(callback) => callback(fd, peer),
                        None => {
                            warn!(peer = %peer, "no new-connection callback, dropping");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient exhaustion (EMFILE and friends) must not
                    // take the loop down; the fire will repeat.
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.dispatcher.fd())
            .field("armed", &self.dispatcher.is_registered())
            .finish()
    }
}
