//! Server façade: wires the acceptor's new connections into the pool.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::address::Address;
use crate::connection::{
    Connection, ConnectionCallback, ConnectionRef, ErrorCallback, HighWaterMarkCallback,
    MessageCallback, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::pool::WorkerPool;

#[derive(Default)]
struct UserCallbacks {
    on_connection: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_error: Option<ErrorCallback>,
    on_high_water_mark: Option<HighWaterMarkCallback>,
}

/// Composes the acceptor and the worker pool.
///
/// Accepted descriptors are wrapped into [`Connection`]s on the acceptor
/// loop, round-robined onto worker loops, and armed there via a deferred
/// `connect_established` so user callbacks are in place before I/O starts.
/// The connection map is mutated on the acceptor loop only.
pub struct Server {
    main_loop: Arc<EventLoop>,
    acceptor: Arc<Acceptor>,
    pool: Arc<WorkerPool>,
    connections: Mutex<AHashMap<RawFd, ConnectionRef>>,
    started: AtomicBool,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<UserCallbacks>,
}

impl Server {
    /// Bind the listener on `addr`; `main_loop` becomes the acceptor loop.
    ///
    /// The embedder owns `main_loop` and is expected to call its `run()`
    /// after [`Server::start`].
    pub fn new(main_loop: Arc<EventLoop>, addr: &Address) -> Result<Arc<Self>> {
        let acceptor = Acceptor::new(main_loop.clone(), addr)?;
        let pool = Arc::new(WorkerPool::new(main_loop.clone()));

        let server = Arc::new(Self {
            main_loop,
            acceptor,
            pool,
            connections: Mutex::new(AHashMap::new()),
            started: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(UserCallbacks::default()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer);
                }
            }));
        Ok(server)
    }

    /// Number of worker loops hosting connections. Zero keeps everything
    /// on the acceptor loop. Must precede [`Server::start`].
    pub fn set_thread_count(&self, count: usize) -> Result<()> {
        self.pool.set_thread_count(count)
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

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.lock().on_error = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback) {
        self.callbacks.lock().on_high_water_mark = Some(callback);
    }

    /// Output-buffer threshold copied onto every new connection.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    /// The bound listen address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn main_loop(&self) -> &Arc<EventLoop> {
        &self.main_loop
    }

    /// Start the worker pool, then arm the acceptor.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("server already started");
            return Ok(());
        }
        self.pool.start()?;
        self.acceptor.start();
        info!(
            workers = self.pool.thread_count(),
            "server started"
        );
        Ok(())
    }

    /// Runs on the acceptor loop for every accepted descriptor.
    fn new_connection(self: &Arc<Self>, fd: OwnedFd, peer: SocketAddr) {
        let worker = self.pool.next_loop();
        let raw = fd.as_raw_fd();
        let conn = Connection::new(worker.clone(), fd);

        {
            let callbacks = self.callbacks.lock();
            if let Some(cb) = &callbacks.on_connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.on_message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.on_write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.on_error {
                conn.set_error_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.on_high_water_mark {
                conn.set_high_water_mark_callback(cb.clone());
            }
        }
        conn.set_high_water_mark(self.high_water_mark.load(Ordering::Relaxed));

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(raw, conn.clone());
        debug!(fd = raw, peer = %peer, "connection dispatched to worker");

        // Arming is deferred to the worker so callbacks are registered
        // before the first readiness fire.
        worker.queue_in_loop(move || conn.connect_established());
    }

    /// Drop the server's reference to a closing connection.
    ///
    /// Map mutations happen on the acceptor loop; calls from worker
    /// threads re-dispatch themselves there. The final strong reference is
    /// then queued back to the owning worker loop, so the connection is
    /// destroyed on its own thread after the current turn finishes.
    pub fn remove_connection(self: &Arc<Self>, conn: &ConnectionRef) {
        let server = self.clone();
        let conn = conn.clone();
        self.main_loop
            .run_in_loop(move || server.remove_connection_in_loop(conn));
    }

    fn remove_connection_in_loop(&self, conn: ConnectionRef) {
        let removed = self.connections.lock().remove(&conn.fd());
        if removed.is_none() {
            debug!(fd = conn.fd(), "connection was already removed");
        }
        let worker = conn.owner_loop().clone();
        let retained = (removed, conn);
        worker.queue_in_loop(move || drop(retained));
    }

    /// Detach the acceptor, tear down every connection on its worker loop,
    /// then stop and join the pool. The main loop itself stays with the
    /// embedder.
    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.acceptor.stop();

        let drained: Vec<ConnectionRef> = {
            let mut connections = self.connections.lock();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            let worker = conn.owner_loop().clone();
            worker.queue_in_loop(move || conn.connect_destroyed());
        }

        self.pool.stop();
        info!("server stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("workers", &self.pool.thread_count())
            .finish()
    }
}
