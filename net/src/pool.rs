//! Worker threads, one event loop each, handed out round-robin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::event_loop::EventLoop;

/// A fixed pool of worker threads, each running its own [`EventLoop`].
///
/// `next_loop` balances new connections across the workers round-robin.
/// With zero workers the base loop hosts everything (single-reactor mode).
pub struct WorkerPool {
    base_loop: Arc<EventLoop>,
    thread_count: AtomicUsize,
    started: AtomicBool,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new(base_loop: Arc<EventLoop>) -> Self {
        Self {
            base_loop,
            thread_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Set the number of worker threads. Must precede `start`.
    pub fn set_thread_count(&self, count: usize) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(NetError::AlreadyStarted("worker pool"));
        }
        self.thread_count.store(count, Ordering::Release);
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Acquire)
    }

    /// Spawn the workers and block until every one has published its loop.
    ///
    /// Each worker constructs its loop on its own thread (the loop is
    /// thread-affine from birth), hands the handle back through a
    /// mutex/condvar rendezvous, then parks in `run()`.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted("worker pool"));
        }
        let count = self.thread_count();
        if count == 0 {
            debug!("no workers configured, base loop hosts all connections");
            return Ok(());
        }

        // Slots are indexed by worker id so the published order matches
        // start order regardless of which thread finishes construction
        // first.
        let rendezvous: Arc<(Mutex<Vec<Option<Arc<EventLoop>>>>, Condvar)> =
            Arc::new((Mutex::new(vec![None; count]), Condvar::new()));

        let mut threads = self.threads.lock();
        for worker_id in 0..count {
            let rendezvous = rendezvous.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || {
                    let event_loop =
                        EventLoop::new().expect("worker event loop construction failed");
                    {
                        let (slots, ready) = &*rendezvous;
                        slots.lock()[worker_id] = Some(event_loop.clone());
                        ready.notify_one();
                    }
                    event_loop.run();
                    debug!(worker_id, "worker exited");
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        let (slots, ready) = &*rendezvous;
        let mut published = slots.lock();
        while published.iter().any(|slot| slot.is_none()) {
            ready.wait(&mut published);
        }
        *self.loops.lock() = published.iter().map(|slot| slot.clone().unwrap()).collect();

        info!(workers = count, "worker pool started");
        Ok(())
    }

    /// The loop that should host the next connection.
    ///
    /// Round-robin over the workers; the base loop when there are none.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[index].clone()
    }

    /// All worker loops, in start order.
    pub fn loops(&self) -> Vec<Arc<EventLoop>> {
        self.loops.lock().clone()
    }

    /// Stop every worker loop and join the threads.
    pub fn stop(&self) {
        for event_loop in self.loops.lock().iter() {
            event_loop.stop();
        }
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) {
            self.stop();
        }
    }
}
