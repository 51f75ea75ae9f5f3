//! Per-descriptor event dispatch: interest bits, pending bits, handlers.

use std::any::Any;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{NetError, Result};
use crate::event_loop::EventLoop;
use crate::poller::Transition;
use crate::socket::SocketHandle;

/// A set of readiness event kinds, stored as epoll bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u32);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);
    pub const READABLE: EventSet = EventSet((libc::EPOLLIN | libc::EPOLLPRI) as u32);
    pub const WRITABLE: EventSet = EventSet(libc::EPOLLOUT as u32);
    pub const HANGUP: EventSet = EventSet(libc::EPOLLHUP as u32);
    pub const ERROR: EventSet = EventSet(libc::EPOLLERR as u32);

    pub const fn from_bits(bits: u32) -> Self {
        EventSet(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn with(self, other: EventSet) -> Self {
        EventSet(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: EventSet) -> Self {
        EventSet(self.0 & !other.0)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(EventSet::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(EventSet::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.contains(EventSet::HANGUP) {
            parts.push("HANGUP");
        }
        if self.contains(EventSet::ERROR) {
            parts.push("ERROR");
        }
        write!(f, "EventSet({})", parts.join("|"))
    }
}

/// The event kinds a handler can be installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Readable,
    Writable,
    Hangup,
    Error,
}

impl EventKind {
    fn mask(self) -> EventSet {
        match self {
            EventKind::Readable => EventSet::READABLE,
            EventKind::Writable => EventSet::WRITABLE,
            EventKind::Hangup => EventSet::HANGUP,
            EventKind::Error => EventSet::ERROR,
        }
    }
}

/// Dispatch order within one readiness fire.
const DISPATCH_ORDER: [EventKind; 4] = [
    EventKind::Readable,
    EventKind::Writable,
    EventKind::Hangup,
    EventKind::Error,
];

pub type Handler = Box<dyn FnMut(Instant) -> Result<()> + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<Handler>,
    write: Option<Handler>,
    hangup: Option<Handler>,
    error: Option<Handler>,
}

impl Handlers {
    fn slot(&mut self, kind: EventKind) -> &mut Option<Handler> {
        match kind {
            EventKind::Readable => &mut self.read,
            EventKind::Writable => &mut self.write,
            EventKind::Hangup => &mut self.hangup,
            EventKind::Error => &mut self.error,
        }
    }
}

/// Weak back-reference to the object whose lifetime gates dispatch.
enum Tie {
    Untied,
    Tied(Weak<dyn Any + Send + Sync>),
}

/// Glue between one descriptor and its owning event loop.
///
/// Holds the interest set registered with the poller, the pending set
/// reported by the last poll, and one handler per event kind. Created
/// detached; attached by the first interest change, which issues an ADD
/// transition on the owning loop's poller.
pub struct Dispatcher {
    socket: Arc<SocketHandle>,
    owner: Weak<EventLoop>,
    interest: AtomicU32,
    pending: AtomicU32,
    registered: AtomicBool,
    handlers: Mutex<Handlers>,
    tie: Mutex<Tie>,
}

impl Dispatcher {
    pub fn new(socket: Arc<SocketHandle>, owner: &Arc<EventLoop>) -> Self {
        Self {
            socket,
            owner: Arc::downgrade(owner),
            interest: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            registered: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(Tie::Untied),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[inline]
    pub fn socket(&self) -> &Arc<SocketHandle> {
        &self.socket
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub fn set_handler<F>(&self, kind: EventKind, handler: F)
    where
        F: FnMut(Instant) -> Result<()> + Send + 'static,
    {
        *self.handlers.lock().slot(kind) = Some(Box::new(handler));
    }

    /// Gate dispatch on `owner` staying alive: events fire only while the
    /// weak reference can be promoted, and the promotion pins the owner for
    /// the span of one `handle_event`.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock() = Tie::Tied(owner);
    }

    /// Release the tie; in-flight events for this descriptor are dropped
    /// from now on.
    pub fn untie(&self) {
        *self.tie.lock() = Tie::Untied;
    }

    #[inline]
    pub fn interest(&self) -> EventSet {
        EventSet::from_bits(self.interest.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest().contains(EventSet::WRITABLE)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    pub(crate) fn set_registered(&self, on: bool) {
        self.registered.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, events: EventSet) {
        self.pending.store(events.bits(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_interest_for_test(&self, interest: EventSet) {
        self.interest.store(interest.bits(), Ordering::Relaxed);
    }

    pub fn pending(&self) -> EventSet {
        EventSet::from_bits(self.pending.load(Ordering::Relaxed))
    }

    pub fn enable_reading(self: &Arc<Self>) -> Result<()> {
        self.set_interest(self.interest().with(EventSet::READABLE))
    }

    pub fn enable_writing(self: &Arc<Self>) -> Result<()> {
        self.set_interest(self.interest().with(EventSet::WRITABLE))
    }

    pub fn disable_writing(self: &Arc<Self>) -> Result<()> {
        self.set_interest(self.interest().without(EventSet::WRITABLE))
    }

    pub fn disable_all(self: &Arc<Self>) -> Result<()> {
        self.set_interest(EventSet::EMPTY)
    }

    /// Write a new interest set through to the poller. The first change
    /// attaches the descriptor (ADD); later ones modify it (MOD).
    /// Clearing interest on a detached dispatcher stays a pure bit store.
    fn set_interest(self: &Arc<Self>, interest: EventSet) -> Result<()> {
        self.interest.store(interest.bits(), Ordering::Relaxed);
        if self.is_registered() {
            self.update_in_loop(Transition::Mod)
        } else if interest.is_empty() {
            Ok(())
        } else {
            self.update_in_loop(Transition::Add)
        }
    }

    /// Detach from the poller. A no-op when never attached.
    pub fn remove(self: &Arc<Self>) -> Result<()> {
        if !self.is_registered() {
            return Ok(());
        }
        self.interest.store(0, Ordering::Relaxed);
        self.update_in_loop(Transition::Del)
    }

    fn update_in_loop(self: &Arc<Self>, transition: Transition) -> Result<()> {
        let owner = self.owner.upgrade().ok_or(NetError::LoopGone)?;
        owner.update_dispatcher(self, transition)
    }

    /// Run the handlers matching the pending set, in fixed order
    /// Readable, Writable, Hangup, Error.
    ///
    /// When tied, the owner is promoted first; failure to promote means it
    /// is already gone, and the fire is dropped. A handler failure
    /// short-circuits the remaining kinds for this turn.
    pub fn handle_event(self: &Arc<Self>, now: Instant) {
        let _pin: Option<Arc<dyn Any + Send + Sync>> = match &*self.tie.lock() {
            Tie::Untied => None,
            Tie::Tied(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => {
                    trace!(fd = self.fd(), "owner gone, dropping event");
                    return;
                }
            },
        };

        let pending = EventSet::from_bits(self.pending.swap(0, Ordering::Relaxed));
        let mut handlers = self.handlers.lock();
        for kind in DISPATCH_ORDER {
            if !pending.contains(kind.mask()) {
                continue;
            }
            if let Some(handler) = handlers.slot(kind) {
                if let Err(e) = handler(now) {
                    warn!(fd = self.fd(), kind = ?kind, error = %e, "handler failed");
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("fd", &self.fd())
            .field("interest", &self.interest())
            .field("registered", &self.is_registered())
            .finish()
    }
}
