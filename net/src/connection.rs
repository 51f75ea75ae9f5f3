//! A live client connection: buffered read/write paths and user callbacks.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::dispatcher::{Dispatcher, EventKind};
use crate::error::NetError;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::socket::SocketHandle;

pub type ConnectionRef = Arc<Connection>;

pub type ConnectionCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ConnectionRef, &NetError) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnectionRef, usize) + Send + Sync>;

/// Output-buffer size at which the high-water callback fires, unless the
/// embedder overrides it.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet armed on its worker loop.
    Connecting,
    /// Armed for readiness; traffic flows.
    Connected,
    /// Closed; awaiting final release.
    Disconnected,
}

#[derive(Default)]
struct Callbacks {
    on_connection: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
    on_high_water_mark: Option<HighWaterMarkCallback>,
}

/// One accepted client, owned by exactly one worker loop.
///
/// Created on the acceptor thread and handed to its worker via
/// `queue_in_loop`; every handler afterwards runs on that worker's thread
/// until close. The server holds the strong reference; the dispatcher only
/// ties back weakly, promoted per event, so a removed connection dies
/// deterministically on its worker thread once in-flight handlers return.
pub struct Connection {
    owner: Arc<EventLoop>,
    socket: Arc<SocketHandle>,
    dispatcher: Arc<Dispatcher>,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl Connection {
    /// Wrap an accepted descriptor, pre-installing the four event handlers
    /// on a detached dispatcher. Nothing is registered with the poller
    /// until [`Connection::connect_established`] runs on the owner loop.
    pub fn new(owner: Arc<EventLoop>, fd: OwnedFd) -> ConnectionRef {
        let socket = Arc::new(SocketHandle::from_fd(fd));
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let dispatcher = Arc::new(Dispatcher::new(socket.clone(), &owner));

            let w = weak.clone();
            dispatcher.set_handler(EventKind::Readable, move |now| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(now);
                }
                Ok(())
            });
            let w = weak.clone();
            dispatcher.set_handler(EventKind::Writable, move |now| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write(now);
                }
                Ok(())
            });
            let w = weak.clone();
            dispatcher.set_handler(EventKind::Hangup, move |_now| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
                Ok(())
            });
            let w = weak.clone();
            dispatcher.set_handler(EventKind::Error, move |_now| {
                if let Some(conn) = w.upgrade() {
                    let err = conn
                        .socket
                        .take_error()
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| io::Error::other("socket error event"));
                    conn.handle_error(err.into());
                }
                Ok(())
            });

            Self {
                owner,
                socket,
                dispatcher,
                state: AtomicU8::new(STATE_CONNECTING),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Bytes queued in the output buffer, waiting for writable readiness.
    pub fn pending_send_bytes(&self) -> usize {
        self.output.lock().readable_bytes()
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().on_connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().on_message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().on_write_complete = Some(callback);
    }

    pub fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().on_close = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.lock().on_error = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback) {
        self.callbacks.lock().on_high_water_mark = Some(callback);
    }

    /// Arm the connection on its owner loop.
    ///
    /// Runs as a deferred task queued by the server, after the user
    /// callbacks have been copied on — arming earlier would let readiness
    /// fire before anyone is listening. Ties the dispatcher to `self`,
    /// enables readable interest (the ADD transition), and announces the
    /// connection.
    pub fn connect_established(self: &ConnectionRef) {
        assert!(
            self.owner.is_in_loop_thread(),
            "connect_established must run on the owner loop"
        );
        if self
            .state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(fd = self.fd(), "connect_established on a non-fresh connection");
            return;
        }

        let tie: Weak<Connection> = Arc::downgrade(self);
        let tie: Weak<dyn Any + Send + Sync> = tie;
        self.dispatcher.tie(tie);
        if let Err(e) = self.dispatcher.enable_reading() {
            self.handle_error(e);
            return;
        }
        CONNECTIONS_ACTIVE.increment();
        trace!(fd = self.fd(), "connection established");

        let callback = self.callbacks.lock().on_connection.clone();
        if let Some(on_connection) = callback {
            on_connection(self);
        }
    }

    /// Send `data`, marshalling to the owner loop when called from a
    /// foreign thread. An empty payload is a no-op.
    pub fn send(self: &ConnectionRef, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if !self.is_connected() {
            warn!(fd = self.fd(), "send on a closed connection dropped");
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.owner.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &ConnectionRef, data: &[u8]) {
        if !self.is_connected() {
            warn!(fd = self.fd(), "connection closed before queued send ran");
            return;
        }

        let mut output = self.output.lock();
        let mut written = 0;

        // Fast path only when nothing is queued; queued bytes must leave
        // first or the stream would reorder.
        if !self.dispatcher.is_writing() && output.is_empty() {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    BYTES_SENT.add(n as u64);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    drop(output);
                    self.handle_error(e.into());
                    return;
                }
            }
        }

        if written == data.len() {
            drop(output);
            // Never invoked inline: a write-complete callback that sends
            // again could recurse on this path unboundedly.
            self.queue_write_complete();
            return;
        }

        let old_len = output.readable_bytes();
        output.append(&data[written..]);
        let new_len = output.readable_bytes();

        let high_water = self.high_water_mark.load(Ordering::Relaxed);
        if old_len < high_water && new_len >= high_water {
            let callback = self.callbacks.lock().on_high_water_mark.clone();
            if let Some(on_high_water_mark) = callback {
                let conn = self.clone();
                self.owner
                    .queue_in_loop(move || on_high_water_mark(&conn, new_len));
            }
        }
        drop(output);

        if !self.dispatcher.is_writing() {
            if let Err(e) = self.dispatcher.enable_writing() {
                self.handle_error(e);
            }
        }
    }

    /// Spool `length` bytes of `file_fd` starting at `offset` to the peer
    /// with `sendfile(2)`, re-queueing the remainder on the owner loop
    /// until complete; write-complete fires at the end.
    ///
    /// The caller keeps `file_fd` open until then. Interleaving with
    /// buffered `send` traffic is not coordinated; callers sequence the
    /// two themselves.
    pub fn send_file(self: &ConnectionRef, file_fd: RawFd, offset: i64, length: usize) {
        if length == 0 {
            return;
        }
        let conn = self.clone();
        self.owner
            .run_in_loop(move || conn.send_file_in_loop(file_fd, offset as libc::off_t, length));
    }

    fn send_file_in_loop(self: &ConnectionRef, file_fd: RawFd, mut offset: libc::off_t, remaining: usize) {
        if !self.is_connected() {
            warn!(fd = self.fd(), "file transfer abandoned, connection closed");
            return;
        }

        let n = unsafe {
            libc::sendfile(self.socket.as_raw_fd(), file_fd, &mut offset, remaining)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                let conn = self.clone();
                self.owner
                    .queue_in_loop(move || conn.send_file_in_loop(file_fd, offset, remaining));
            } else {
                self.handle_error(err.into());
            }
            return;
        }

        let sent = n as usize;
        BYTES_SENT.add(sent as u64);
        if sent == remaining {
            self.queue_write_complete();
            return;
        }
        // Partial transfer; the kernel advanced `offset` for us.
        let conn = self.clone();
        self.owner
            .queue_in_loop(move || conn.send_file_in_loop(file_fd, offset, remaining - sent));
    }

    /// Readable readiness: scatter-read, then hand the input buffer to the
    /// message callback synchronously. A consumer cannot recurse the way a
    /// writer can, so no deferral is needed here.
    fn handle_read(self: &ConnectionRef, now: Instant) {
        let mut input = self.input.lock();
        match input.read_from_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(input);
                debug!(fd = self.fd(), "peer closed");
                self.handle_close();
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let callback = self.callbacks.lock().on_message.clone();
                if let Some(on_message) = callback {
                    on_message(self, &mut input, now);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(input);
                self.handle_error(e.into());
            }
        }
    }

    /// Writable readiness: drain the output buffer; on empty, drop the
    /// writable interest bit and queue the write-complete callback.
    fn handle_write(self: &ConnectionRef, _now: Instant) {
        if !self.dispatcher.is_writing() {
            trace!(fd = self.fd(), "spurious writable fire");
            return;
        }
        let mut output = self.output.lock();
        if output.is_empty() {
            return;
        }
        match output.write_to_fd(self.socket.as_raw_fd()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                if output.is_empty() {
                    drop(output);
                    if let Err(e) = self.dispatcher.disable_writing() {
                        debug!(fd = self.fd(), error = %e, "disable writable failed");
                    }
                    self.queue_write_complete();
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(output);
                self.handle_error(e.into());
            }
        }
    }

    fn queue_write_complete(self: &ConnectionRef) {
        let callback = self.callbacks.lock().on_write_complete.clone();
        if let Some(on_write_complete) = callback {
            let conn = self.clone();
            self.owner.queue_in_loop(move || on_write_complete(&conn));
        }
    }

    /// Close path. Idempotent; the first caller wins.
    ///
    /// Releases the tie (in-flight promoted references finish harmlessly),
    /// clears interest, and hands `self` to the close callback — normally
    /// the server's `remove_connection`, which defers the final release
    /// back to this loop so destruction runs after the current turn.
    pub(crate) fn handle_close(self: &ConnectionRef) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) != STATE_CONNECTED {
            return;
        }
        CONNECTIONS_ACTIVE.decrement();
        debug!(fd = self.fd(), "connection closing");

        if self.dispatcher.is_registered() {
            if let Err(e) = self.dispatcher.disable_all() {
                debug!(fd = self.fd(), error = %e, "interest clear failed");
            }
        }
        self.dispatcher.untie();

        let callback = self.callbacks.lock().on_close.clone();
        match callback {
            Some(on_close) => on_close(self),
            None => warn!(fd = self.fd(), "no close callback registered"),
        }
    }

    /// Error path: surface the error, detach from the poller, then close.
    fn handle_error(self: &ConnectionRef, err: NetError) {
        error!(fd = self.fd(), error = %err, "connection error");
        let callback = self.callbacks.lock().on_error.clone();
        if let Some(on_error) = callback {
            on_error(self, &err);
        }
        if self.dispatcher.is_registered() {
            let _ = self.dispatcher.disable_all();
            let _ = self.dispatcher.remove();
        }
        self.handle_close();
    }

    /// Tear down without the close callback; used when the server forgets
    /// its connections wholesale during shutdown.
    pub(crate) fn connect_destroyed(self: &ConnectionRef) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) == STATE_CONNECTED {
            CONNECTIONS_ACTIVE.decrement();
        }
        self.dispatcher.untie();
        if self.dispatcher.is_registered() {
            let _ = self.dispatcher.disable_all();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The deferred-release protocol lands the final drop on the owner
        // loop's thread, where the DEL transition is legal. During whole
        // process teardown the loop thread may already be gone; the epoll
        // instance is being dropped too, so skipping DEL is harmless.
        if self.dispatcher.is_registered() && self.owner.is_in_loop_thread() {
            let _ = self.dispatcher.remove();
        }
        if self.state.load(Ordering::Acquire) == STATE_CONNECTED {
            CONNECTIONS_ACTIVE.decrement();
        }
        trace!(fd = self.fd(), "connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("state", &self.state())
            .finish()
    }
}
