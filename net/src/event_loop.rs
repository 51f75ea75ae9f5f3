//! One-loop-per-thread reactor: poll, dispatch, then run deferred tasks.

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::dispatcher::{Dispatcher, EventKind};
use crate::error::Result;
use crate::metrics::{LOOP_WAKEUPS, TASKS_EXECUTED};
use crate::poller::{Poller, Transition};
use crate::socket::{new_eventfd, SocketHandle};

/// How long one poll may block before the loop turns over anyway.
pub const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    static LOOP_ON_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Lifecycle of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Init,
    Running,
    Stopped,
    Error,
}

const STATUS_INIT: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPED: u8 = 2;
const STATUS_ERROR: u8 = 3;

pub type Task = Box<dyn FnOnce() + Send>;

/// A thread-affine event loop.
///
/// Owns one [`Poller`] and an eventfd used to interrupt a blocking poll
/// from other threads. All poller transitions for this loop's dispatchers
/// happen on the owning thread; foreign threads hand work over through
/// [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`], the only
/// cross-thread entry points.
pub struct EventLoop {
    thread_id: ThreadId,
    status: AtomicU8,
    poller: Mutex<Poller>,
    wake_handle: Arc<SocketHandle>,
    wake_dispatcher: OnceLock<Arc<Dispatcher>>,
    tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Construct the loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already constructed an event loop; one loop
    /// per thread is a hard invariant.
    pub fn new() -> Result<Arc<Self>> {
        LOOP_ON_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("an event loop already exists on this thread");
            }
        });

        let poller = Poller::new()?;
        let wake_handle = Arc::new(new_eventfd()?);

        let event_loop = Arc::new(Self {
            thread_id: thread::current().id(),
            status: AtomicU8::new(STATUS_INIT),
            poller: Mutex::new(poller),
            wake_handle,
            wake_dispatcher: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // Arm the wake-up descriptor. Its handler drains the eventfd
        // counter so the level-triggered facility does not re-fire.
        let dispatcher = Arc::new(Dispatcher::new(
            event_loop.wake_handle.clone(),
            &event_loop,
        ));
        let wake = event_loop.wake_handle.clone();
        dispatcher.set_handler(EventKind::Readable, move |_now| {
            let mut buf = [0u8; 8];
            match wake.read(&mut buf) {
                Ok(8) => Ok(()),
                Ok(n) => {
                    warn!(bytes = n, "short wake-up read");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            }
        });
        dispatcher.enable_reading()?;
        let _ = event_loop.wake_dispatcher.set(dispatcher);

        LOOP_ON_THIS_THREAD.with(|flag| flag.set(true));
        Ok(event_loop)
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn status(&self) -> LoopStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_INIT => LoopStatus::Init,
            STATUS_RUNNING => LoopStatus::Running,
            STATUS_STOPPED => LoopStatus::Stopped,
            _ => LoopStatus::Error,
        }
    }

    /// Run the loop on the owning thread until stopped.
    ///
    /// Each turn polls for readiness, dispatches the active descriptors,
    /// then swaps the deferred-task queue out under its lock and runs the
    /// batch. The swap means a task enqueueing another task cannot
    /// deadlock; the new task lands in the next turn.
    ///
    /// Calling `run` while already running is a logged no-op.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "run() must be called on the loop's owning thread"
        );
        if self
            .status
            .compare_exchange(
                STATUS_INIT,
                STATUS_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(status = ?self.status(), "run() called twice, ignoring");
            return;
        }
        debug!("event loop started");

        let mut active: Vec<Arc<Dispatcher>> = Vec::new();
        while self.status() == LoopStatus::Running {
            active.clear();
            if let Err(e) = self.poller.lock().wait(POLL_TIMEOUT_MS, &mut active) {
                error!(error = %e, "poll failed, stopping loop");
                self.status.store(STATUS_ERROR, Ordering::Release);
                break;
            }

            let now = Instant::now();
            for dispatcher in active.drain(..) {
                dispatcher.handle_event(now);
            }

            let batch = mem::take(&mut *self.tasks.lock());
            TASKS_EXECUTED.add(batch.len() as u64);
            for task in batch {
                task();
            }
        }

        // Tasks that slipped in while stopping still run once; dropping
        // them unexecuted could strand resources captured in the closures.
        let batch = mem::take(&mut *self.tasks.lock());
        for task in batch {
            task();
        }
        debug!(status = ?self.status(), "event loop exited");
    }

    /// Stop after the current turn completes. Callable from any thread.
    pub fn stop(&self) {
        {
            let _queue = self.tasks.lock();
            self.status.store(STATUS_STOPPED, Ordering::Release);
        }
        self.wakeup();
    }

    /// Run `task` now when called on the owning thread, otherwise defer it
    /// to the loop via [`EventLoop::queue_in_loop`].
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the loop's task phase and wake the loop.
    ///
    /// The wake-up write is unconditional; a redundant wake costs one
    /// syscall while a missed one could stall the task a full poll
    /// timeout. Tasks run in enqueue order within one swapped batch.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().push(Box::new(task));
        self.wakeup();
    }

    /// Interrupt a blocking poll by bumping the eventfd counter.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        match self.wake_handle.write(&one.to_ne_bytes()) {
            Ok(8) => {
                LOOP_WAKEUPS.increment();
            }
            Ok(n) => error!(bytes = n, "short wake-up write"),
            // A saturated counter still reads as readable; nothing lost.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => error!(error = %e, "wake-up write failed"),
        }
    }

    /// Forward a dispatcher transition to this loop's poller.
    ///
    /// # Panics
    ///
    /// Panics when called from a foreign thread; transitions are
    /// owner-thread-only and must be marshalled via `run_in_loop`.
    pub fn update_dispatcher(
        &self,
        dispatcher: &Arc<Dispatcher>,
        transition: Transition,
    ) -> Result<()> {
        assert!(
            self.is_in_loop_thread(),
            "poller transitions must run on the owning loop thread"
        );
        self.poller.lock().update(dispatcher, transition)
    }

    /// Number of descriptors currently registered, the wake-up descriptor
    /// included.
    pub fn descriptor_count(&self) -> usize {
        self.poller.lock().len()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Free the thread's loop slot, but only when dropped on the owning
        // thread; a foreign-thread drop must not clobber that thread's slot.
        if self.is_in_loop_thread() {
            LOOP_ON_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        (rx.recv().unwrap(), handle)
    }

    #[test]
    fn second_loop_on_same_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| EventLoop::new()));
        assert!(result.is_err());
    }

    #[test]
    fn starts_in_init_status() {
        let event_loop = EventLoop::new().unwrap();
        assert_eq!(event_loop.status(), LoopStatus::Init);
        assert!(event_loop.is_in_loop_thread());
        // The wake-up descriptor is registered from construction.
        assert_eq!(event_loop.descriptor_count(), 1);
    }

    #[test]
    fn queue_from_foreign_thread_runs_once_on_loop_thread() {
        let (event_loop, handle) = spawn_loop();

        static HITS: AtomicUsize = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        let expected = event_loop.thread_id();
        event_loop.queue_in_loop(move || {
            HITS.fetch_add(1, Ordering::SeqCst);
            tx.send(thread::current().id()).unwrap();
        });

        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, expected);

        // Give a spurious duplicate a chance to surface before checking.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        event_loop.stop();
        handle.join().unwrap();
        assert_eq!(event_loop.status(), LoopStatus::Stopped);
    }

    #[test]
    fn tasks_run_in_enqueue_order() {
        let (event_loop, handle) = spawn_loop();

        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            event_loop.queue_in_loop(move || {
                tx.send(i).unwrap();
            });
        }
        let order: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..16).collect::<Vec<_>>());

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn run_in_loop_is_synchronous_on_owner_thread() {
        let (event_loop, handle) = spawn_loop();

        let (tx, rx) = mpsc::channel();
        let inner = event_loop.clone();
        event_loop.queue_in_loop(move || {
            let mut seen = Vec::new();
            seen.push("before");
            // On the owning thread this must execute inline, not defer.
            let marker: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
            let marker2 = marker.clone();
            inner.run_in_loop(move || marker2.lock().push("inline"));
            seen.extend(marker.lock().iter().copied());
            seen.push("after");
            tx.send(seen).unwrap();
        });

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, vec!["before", "inline", "after"]);

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn stop_interrupts_blocking_poll_promptly() {
        let (event_loop, handle) = spawn_loop();
        // Let the loop reach its blocking poll.
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        event_loop.stop();
        handle.join().unwrap();
        // Far below the 10 s poll timeout: the wake-up did its job.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_from_a_foreign_thread_panics() {
        let (event_loop, handle) = spawn_loop();
        thread::sleep(Duration::from_millis(20));

        let result = catch_unwind(AssertUnwindSafe(|| event_loop.run()));
        assert!(result.is_err(), "foreign-thread run must be rejected");

        event_loop.stop();
        handle.join().unwrap();
    }
}
