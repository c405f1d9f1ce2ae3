//! Readiness reactor.
//!
//! A thin epoll wrapper that owns every event source of a display. Callbacks
//! receive the reactor itself plus a caller supplied `&mut D`, so they can add,
//! update or remove sources (their own included) while a batch is being
//! processed.
//!
//! Sources are keyed by ids that are never reused. A readiness batch only
//! records ids, so an event captured for a source that a previous callback in
//! the same batch removed is simply skipped. The storage of removed sources is
//! kept until the start of the next [`Reactor::dispatch`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::core::errors::{CoreError, Result};
use crate::core::signal::{ListenerId, Signal};

/// Events fetched per `epoll_wait`
const EVENT_BATCH: usize = 32;

bitflags! {
    /// Portable readiness set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u32 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
        const HANGUP = 0x04;
        const ERROR = 0x08;
    }
}

impl Interest {
    fn to_epoll(self) -> EpollFlags {
        let mut events = EpollFlags::empty();
        if self.contains(Interest::READABLE) {
            events |= EpollFlags::EPOLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            events |= EpollFlags::EPOLLOUT;
        }
        events
    }

    fn from_epoll(events: EpollFlags) -> Self {
        let mut mask = Interest::empty();
        if events.contains(EpollFlags::EPOLLIN) {
            mask |= Interest::READABLE;
        }
        if events.contains(EpollFlags::EPOLLOUT) {
            mask |= Interest::WRITABLE;
        }
        if events.contains(EpollFlags::EPOLLHUP) {
            mask |= Interest::HANGUP;
        }
        if events.contains(EpollFlags::EPOLLERR) {
            mask |= Interest::ERROR;
        }
        mask
    }
}

/// Handle to a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u64);

impl SourceId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

pub type FdCallback<D> = Box<dyn FnMut(&mut Reactor<D>, &mut D, SourceId, Interest)>;
pub type IdleCallback<D> = Box<dyn FnOnce(&mut Reactor<D>, &mut D)>;

enum Callback<D> {
    /// `None` while the callback is running
    Fd(Option<FdCallback<D>>),
    Idle(Option<IdleCallback<D>>),
}

struct Source<D> {
    id: u64,
    /// Our own duplicate of the registered fd
    fd: Option<OwnedFd>,
    interest: Interest,
    callback: Callback<D>,
}

/// Milliseconds for `epoll_wait`, rounded up so short waits never spin.
fn epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(t) => {
            let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
            EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::MAX)
        }
    }
}

pub struct Reactor<D> {
    epoll: Epoll,
    next_id: u64,
    sources: HashMap<u64, Source<D>>,
    idle_queue: VecDeque<u64>,
    /// Removed sources, released at the next safe point
    retired: Vec<Source<D>>,
    events: Vec<EpollEvent>,
    destroy_signal: Signal<()>,
}

impl<D> fmt::Debug for Reactor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epoll", &self.epoll)
            .field("sources", &self.sources.len())
            .field("idle", &self.idle_queue.len())
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl<D> Reactor<D> {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        tracing::debug!("Created reactor on epoll fd {}", epoll.0.as_raw_fd());
        Ok(Self {
            epoll,
            next_id: 1,
            sources: HashMap::new(),
            idle_queue: VecDeque::new(),
            retired: Vec::new(),
            events: vec![EpollEvent::empty(); EVENT_BATCH],
            destroy_signal: Signal::new(),
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Watch `fd` for `interest`.
    ///
    /// The reactor keeps its own duplicate of `fd`, so the caller may close
    /// theirs at any time. Hangups and errors are always reported.
    pub fn add_fd<F>(&mut self, fd: BorrowedFd<'_>, interest: Interest, callback: F) -> Result<SourceId>
    where
        F: FnMut(&mut Reactor<D>, &mut D, SourceId, Interest) + 'static,
    {
        let dup = fd.try_clone_to_owned()?;
        let id = self.allocate_id();
        self.epoll.add(&dup, EpollEvent::new(interest.to_epoll(), id))?;

        tracing::trace!("Registered fd {} as source#{} ({:?})", dup.as_raw_fd(), id, interest);
        self.sources.insert(
            id,
            Source {
                id,
                fd: Some(dup),
                interest,
                callback: Callback::Fd(Some(Box::new(callback))),
            },
        );
        Ok(SourceId(id))
    }

    /// Queue a callback to run once at the next idle flush.
    pub fn add_idle<F>(&mut self, callback: F) -> SourceId
    where
        F: FnOnce(&mut Reactor<D>, &mut D) + 'static,
    {
        let id = self.allocate_id();
        self.sources.insert(
            id,
            Source {
                id,
                fd: None,
                interest: Interest::empty(),
                callback: Callback::Idle(Some(Box::new(callback))),
            },
        );
        self.idle_queue.push_back(id);
        SourceId(id)
    }

    /// Change which conditions wake an fd source.
    pub fn update_interest(&mut self, source: SourceId, interest: Interest) -> Result<()> {
        let entry = self
            .sources
            .get_mut(&source.0)
            .ok_or(CoreError::InvalidSource(source.0))?;
        let Some(fd) = entry.fd.as_ref() else {
            return Err(CoreError::InvalidSource(source.0));
        };
        if entry.interest == interest {
            return Ok(());
        }
        let mut event = EpollEvent::new(interest.to_epoll(), source.0);
        self.epoll.modify(fd, &mut event)?;
        entry.interest = interest;
        Ok(())
    }

    /// Unregister a source and close its descriptor.
    ///
    /// Events for it already captured in the running batch are dropped.
    pub fn remove(&mut self, source: SourceId) -> Result<()> {
        let mut entry = self
            .sources
            .remove(&source.0)
            .ok_or(CoreError::InvalidSource(source.0))?;

        if let Some(fd) = entry.fd.take() {
            if let Err(e) = self.epoll.delete(&fd) {
                tracing::warn!("Failed to unregister {}: {}", source, e);
            }
        }
        tracing::trace!("Removed {}", source);
        self.retired.push(entry);
        Ok(())
    }

    pub fn contains(&self, source: SourceId) -> bool {
        self.sources.contains_key(&source.0)
    }

    pub fn interest(&self, source: SourceId) -> Option<Interest> {
        self.sources
            .get(&source.0)
            .filter(|s| s.fd.is_some())
            .map(|s| s.interest)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sources removed but not yet released
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run queued idle callbacks in FIFO order until none are left.
    pub fn dispatch_idle(&mut self, data: &mut D) {
        while let Some(id) = self.idle_queue.pop_front() {
            let Some(source) = self.sources.remove(&id) else {
                continue;
            };
            if let Callback::Idle(Some(callback)) = source.callback {
                callback(self, data);
            }
        }
    }

    /// Wait up to `timeout` for readiness and run the callbacks of one batch.
    ///
    /// `None` blocks indefinitely, `Some(Duration::ZERO)` polls. Idle
    /// callbacks run first. Returns the number of events in the batch.
    pub fn dispatch(&mut self, data: &mut D, timeout: Option<Duration>) -> Result<usize> {
        self.retired.clear();
        self.dispatch_idle(data);

        let count = match self.epoll.wait(&mut self.events, epoll_timeout(timeout)) {
            Ok(count) => count,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        // Capture the whole batch before running anything
        let batch: Vec<(u64, Interest)> = self.events[..count]
            .iter()
            .map(|ev| (ev.data(), Interest::from_epoll(ev.events())))
            .collect();

        for (id, mask) in batch {
            let callback = match self.sources.get_mut(&id) {
                Some(Source { callback: Callback::Fd(slot), .. }) => slot.take(),
                _ => None,
            };
            let Some(mut callback) = callback else {
                tracing::trace!("Skipping stale event for source#{}", id);
                continue;
            };

            callback(self, data, SourceId(id), mask);

            if let Some(Source { callback: Callback::Fd(slot), .. }) = self.sources.get_mut(&id) {
                *slot = Some(callback);
            } else if let Some(entry) = self.retired.iter_mut().find(|s| s.id == id) {
                // Removed by its own callback; released with the entry
                entry.callback = Callback::Fd(Some(callback));
            }
        }

        Ok(count)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn add_destroy_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&()) + 'static,
    {
        self.destroy_signal.add(listener)
    }

    pub fn remove_destroy_listener(&self, listener: ListenerId) -> bool {
        self.destroy_signal.remove(listener)
    }
}

impl<D> AsFd for Reactor<D> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epoll.0.as_fd()
    }
}

impl<D> Drop for Reactor<D> {
    fn drop(&mut self) {
        self.destroy_signal.emit_final(&());
        tracing::debug!("Destroying reactor with {} source(s)", self.sources.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        seen: Vec<(SourceId, Interest)>,
        idle: Vec<u32>,
        targets: Vec<SourceId>,
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(100));

    #[test]
    fn test_readable_source_fires() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a, mut b) = UnixStream::pair().unwrap();

        let id = reactor
            .add_fd(a.as_fd(), Interest::READABLE, |_, calls: &mut Calls, id, mask| {
                calls.seen.push((id, mask));
            })
            .unwrap();
        b.write_all(b"ping").unwrap();

        assert_eq!(reactor.dispatch(&mut calls, SHORT).unwrap(), 1);
        assert_eq!(calls.seen, vec![(id, Interest::READABLE)]);
    }

    #[test]
    fn test_registration_outlives_callers_fd() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a, mut b) = UnixStream::pair().unwrap();
        let id = reactor
            .add_fd(a.as_fd(), Interest::READABLE, |_, calls: &mut Calls, id, mask| {
                calls.seen.push((id, mask));
            })
            .unwrap();

        // The reactor's duplicate keeps the socket alive
        drop(a);
        b.write_all(b"x").unwrap();
        reactor.dispatch(&mut calls, SHORT).unwrap();
        assert_eq!(calls.seen.len(), 1);
        assert_eq!(calls.seen[0].0, id);
    }

    #[test]
    fn test_update_interest_toggles_writable() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a, _b) = UnixStream::pair().unwrap();
        let id = reactor
            .add_fd(a.as_fd(), Interest::READABLE, |_, calls: &mut Calls, id, mask| {
                calls.seen.push((id, mask));
            })
            .unwrap();

        assert_eq!(reactor.dispatch(&mut calls, Some(Duration::ZERO)).unwrap(), 0);

        reactor.update_interest(id, Interest::READABLE | Interest::WRITABLE).unwrap();
        assert_eq!(reactor.interest(id), Some(Interest::READABLE | Interest::WRITABLE));
        reactor.dispatch(&mut calls, SHORT).unwrap();
        assert_eq!(calls.seen, vec![(id, Interest::WRITABLE)]);

        reactor.update_interest(id, Interest::READABLE).unwrap();
        calls.seen.clear();
        assert_eq!(reactor.dispatch(&mut calls, Some(Duration::ZERO)).unwrap(), 0);
        assert!(calls.seen.is_empty());
    }

    #[test]
    fn test_hangup_is_reported() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a, b) = UnixStream::pair().unwrap();
        reactor
            .add_fd(a.as_fd(), Interest::READABLE, |_, calls: &mut Calls, id, mask| {
                calls.seen.push((id, mask));
            })
            .unwrap();
        drop(b);
        reactor.dispatch(&mut calls, SHORT).unwrap();
        assert!(calls.seen[0].1.contains(Interest::HANGUP));
    }

    fn remove_others(reactor: &mut Reactor<Calls>, calls: &mut Calls, id: SourceId, mask: Interest) {
        calls.seen.push((id, mask));
        for other in calls.targets.clone() {
            if other != id && reactor.contains(other) {
                reactor.remove(other).unwrap();
            }
        }
    }

    #[test]
    fn test_removal_inside_batch_skips_captured_event() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, mut b2) = UnixStream::pair().unwrap();

        let first = reactor.add_fd(a1.as_fd(), Interest::READABLE, remove_others).unwrap();
        let second = reactor.add_fd(a2.as_fd(), Interest::READABLE, remove_others).unwrap();
        calls.targets = vec![first, second];
        b1.write_all(b"1").unwrap();
        b2.write_all(b"2").unwrap();

        // Both events are captured, only the first one to run is delivered.
        assert_eq!(reactor.dispatch(&mut calls, SHORT).unwrap(), 2);
        assert_eq!(calls.seen.len(), 1);

        let ran = calls.seen[0].0;
        let other = if ran == first { second } else { first };
        assert!(reactor.contains(ran));
        assert!(!reactor.contains(other));
        assert_eq!(reactor.retired_len(), 1);
    }

    #[test]
    fn test_destroy_listener_runs_on_drop() {
        let reactor = Reactor::<Calls>::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        reactor.add_destroy_listener(move |_| counter.set(counter.get() + 1));
        drop(reactor);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_self_removal_defers_release() {
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        let (a, mut b) = UnixStream::pair().unwrap();
        let released = Rc::new(Cell::new(false));
        let guard = Guard(released.clone());
        let seen = released.clone();

        reactor
            .add_fd(a.as_fd(), Interest::READABLE, move |reactor, _: &mut Calls, id, _| {
                let _keep = &guard;
                reactor.remove(id).unwrap();
                assert!(!seen.get());
            })
            .unwrap();
        b.write_all(b"x").unwrap();

        reactor.dispatch(&mut calls, SHORT).unwrap();
        assert!(!released.get());
        assert_eq!(reactor.retired_len(), 1);

        reactor.dispatch(&mut calls, Some(Duration::ZERO)).unwrap();
        assert!(released.get());
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_idle_callbacks_run_fifo_and_once() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let mut calls = Calls::default();
        reactor.add_idle(|_, calls: &mut Calls| calls.idle.push(1));
        let dropped = reactor.add_idle(|_, calls: &mut Calls| calls.idle.push(2));
        reactor.add_idle(|reactor, calls: &mut Calls| {
            calls.idle.push(3);
            reactor.add_idle(|_, calls: &mut Calls| calls.idle.push(4));
        });
        reactor.remove(dropped).unwrap();

        reactor.dispatch_idle(&mut calls);
        assert_eq!(calls.idle, vec![1, 3, 4]);

        reactor.dispatch_idle(&mut calls);
        assert_eq!(calls.idle, vec![1, 3, 4]);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_epoll_timeout_rounds_up() {
        assert_eq!(epoll_timeout(None), EpollTimeout::NONE);
        assert_eq!(epoll_timeout(Some(Duration::ZERO)), EpollTimeout::ZERO);
        assert_eq!(
            epoll_timeout(Some(Duration::from_micros(1))),
            EpollTimeout::try_from(1u128).unwrap()
        );
        assert_eq!(epoll_timeout(Some(Duration::from_secs(u64::MAX))), EpollTimeout::MAX);
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let mut reactor = Reactor::<Calls>::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let id = reactor
            .add_fd(a.as_fd(), Interest::READABLE, |_, _: &mut Calls, _, _| {})
            .unwrap();
        reactor.remove(id).unwrap();
        assert!(matches!(reactor.remove(id), Err(CoreError::InvalidSource(_))));
        assert!(matches!(
            reactor.update_interest(id, Interest::WRITABLE),
            Err(CoreError::InvalidSource(_))
        ));
    }
}
