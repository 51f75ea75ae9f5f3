//! Level-triggered readiness facility: one epoll instance per event loop.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, error, trace, warn};

use crate::dispatcher::{Dispatcher, EventSet};
use crate::error::{NetError, Result};

/// Initial capacity of the readiness result list.
const INITIAL_EVENT_CAPACITY: usize = 16;

/// Interest-set transitions a dispatcher can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Add,
    Mod,
    Del,
}

impl Transition {
    fn op(self) -> libc::c_int {
        match self {
            Transition::Add => libc::EPOLL_CTL_ADD,
            Transition::Mod => libc::EPOLL_CTL_MOD,
            Transition::Del => libc::EPOLL_CTL_DEL,
        }
    }
}

/// Owns one epoll instance and the descriptor-to-dispatcher map.
///
/// A descriptor is registered with the kernel iff it appears in the map,
/// and the kernel's interest bits always match the dispatcher's at the
/// moment of the most recent transition. Only the owning loop's thread may
/// issue transitions or wait; the loop enforces that before calling in.
pub struct Poller {
    epoll: OwnedFd,
    dispatchers: AHashMap<RawFd, Arc<Dispatcher>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            dispatchers: AHashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_CAPACITY],
        })
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.dispatchers.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Apply a transition for a dispatcher's descriptor.
    ///
    /// A stray ADD of a known descriptor is coerced to MOD; MOD or DEL of
    /// an unknown descriptor fails without touching the kernel.
    pub fn update(&mut self, dispatcher: &Arc<Dispatcher>, transition: Transition) -> Result<()> {
        let fd = dispatcher.fd();
        let known = self.dispatchers.contains_key(&fd);

        let transition = match transition {
            Transition::Add if known => {
                debug!(fd, "descriptor already registered, coercing ADD to MOD");
                Transition::Mod
            }
            Transition::Mod | Transition::Del if !known => {
                warn!(fd, ?transition, "transition for unknown descriptor");
                return Err(NetError::UnknownDescriptor(fd));
            }
            other => other,
        };

        // The kernel ignores the event argument for DEL but pre-2.6.9
        // kernels required it non-null, so one is passed regardless.
        let mut event = libc::epoll_event {
            events: dispatcher.interest().bits(),
            u64: fd as u64,
        };

        let rc =
            unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), transition.op(), fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            error!(fd, ?transition, error = %err, "epoll_ctl failed");
            return Err(err.into());
        }

        match transition {
            Transition::Add => {
                self.dispatchers.insert(fd, dispatcher.clone());
                dispatcher.set_registered(true);
                trace!(fd, interest = ?dispatcher.interest(), "descriptor added");
            }
            Transition::Mod => {
                trace!(fd, interest = ?dispatcher.interest(), "descriptor modified");
            }
            Transition::Del => {
                self.dispatchers.remove(&fd);
                dispatcher.set_registered(false);
                trace!(fd, "descriptor removed");
            }
        }
        Ok(())
    }

    /// Block for up to `timeout_ms` and collect the dispatchers with
    /// pending events, their `pending` sets populated.
    ///
    /// A signal interruption yields an empty list rather than an error.
    /// When the ready count fills the result list, its capacity doubles
    /// for the next call.
    pub fn wait(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Dispatcher>>) -> Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            error!(error = %err, "epoll_wait failed");
            return Err(err.into());
        }
        let n = n as usize;

        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            let Some(dispatcher) = self.dispatchers.get(&fd) else {
                // Raced with a DEL issued earlier this turn.
                trace!(fd, "event for unmapped descriptor dropped");
                continue;
            };
            dispatcher.set_pending(EventSet::from_bits(event.events));
            active.push(dispatcher.clone());
        }

        if n == self.events.len() {
            let grown = self.events.len() * 2;
            self.events.resize(grown, unsafe { std::mem::zeroed() });
            trace!(capacity = grown, "event list grown");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn event_capacity(&self) -> usize {
        self.events.len()
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("descriptors", &self.dispatchers.len())
            .field("event_capacity", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::socket::new_eventfd;
    use std::sync::Arc;

    fn dispatcher_on_eventfd(event_loop: &Arc<EventLoop>, interest: EventSet) -> Arc<Dispatcher> {
        let efd = Arc::new(new_eventfd().unwrap());
        let dispatcher = Arc::new(Dispatcher::new(efd, event_loop));
        dispatcher.set_interest_for_test(interest);
        dispatcher
    }

    fn bump(dispatcher: &Arc<Dispatcher>) {
        let one: u64 = 1;
        dispatcher.socket().write(&one.to_ne_bytes()).unwrap();
    }

    #[test]
    fn map_tracks_registration() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();
        let dispatcher = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);

        assert!(!poller.contains(dispatcher.fd()));
        poller.update(&dispatcher, Transition::Add).unwrap();
        assert!(poller.contains(dispatcher.fd()));
        assert!(dispatcher.is_registered());
        assert_eq!(poller.len(), 1);

        poller.update(&dispatcher, Transition::Del).unwrap();
        assert!(!poller.contains(dispatcher.fd()));
        assert!(!dispatcher.is_registered());
        assert!(poller.is_empty());
    }

    #[test]
    fn duplicate_add_is_coerced_to_mod() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();

        // Register with no interest: a bumped counter stays silent.
        let dispatcher = dispatcher_on_eventfd(&event_loop, EventSet::EMPTY);
        poller.update(&dispatcher, Transition::Add).unwrap();
        bump(&dispatcher);

        let mut active = Vec::new();
        poller.wait(50, &mut active).unwrap();
        assert!(active.is_empty());

        // The stray second ADD carries new interest bits and must land as
        // a MOD: one map entry, and the new bits take effect.
        dispatcher.set_interest_for_test(EventSet::READABLE);
        poller.update(&dispatcher, Transition::Add).unwrap();
        assert_eq!(poller.len(), 1);

        poller.wait(50, &mut active).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].pending().contains(EventSet::READABLE));
    }

    #[test]
    fn mod_and_del_of_unknown_descriptor_fail() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();
        let dispatcher = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);

        let err = poller.update(&dispatcher, Transition::Mod).unwrap_err();
        assert!(matches!(err, NetError::UnknownDescriptor(fd) if fd == dispatcher.fd()));
        let err = poller.update(&dispatcher, Transition::Del).unwrap_err();
        assert!(matches!(err, NetError::UnknownDescriptor(_)));
    }

    #[test]
    fn wait_populates_pending_on_active_dispatchers() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();

        let quiet = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);
        let noisy = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);
        poller.update(&quiet, Transition::Add).unwrap();
        poller.update(&noisy, Transition::Add).unwrap();
        bump(&noisy);

        let mut active = Vec::new();
        poller.wait(1000, &mut active).unwrap();
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &noisy));
        assert!(active[0].pending().contains(EventSet::READABLE));
    }

    #[test]
    fn wait_with_nothing_ready_times_out_empty() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();
        let dispatcher = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);
        poller.update(&dispatcher, Transition::Add).unwrap();

        let mut active = Vec::new();
        poller.wait(10, &mut active).unwrap();
        assert!(active.is_empty());
    }

    #[test]
    fn event_list_doubles_when_saturated() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = Poller::new().unwrap();
        assert_eq!(poller.event_capacity(), 16);

        let dispatchers: Vec<_> = (0..16)
            .map(|_| {
                let d = dispatcher_on_eventfd(&event_loop, EventSet::READABLE);
                poller.update(&d, Transition::Add).unwrap();
                bump(&d);
                d
            })
            .collect();

        let mut active = Vec::new();
        poller.wait(1000, &mut active).unwrap();
        assert_eq!(active.len(), dispatchers.len());
        assert_eq!(poller.event_capacity(), 32);
    }
}
