//! Signals and listeners used for lifecycle notifications.
//!
//! A [`Signal`] is a cheap, cloneable handle to a shared listener list.
//! Listeners are registered with [`Signal::add`], which hands back a
//! [`ListenerId`] token. The token is the only way to unregister, and since it
//! is consumed by [`Signal::remove`] a listener can never be unlinked twice.
//!
//! Two emission modes exist:
//! - [`Signal::emit`] for repeatable events. The stable list is moved into an
//!   in-flight list first, so listeners added during the emission only run on
//!   the next one, and removals never disturb the traversal.
//! - [`Signal::emit_final`] for destruction. Each listener is detached before
//!   it runs, so a callback may drop everything it owns (or try to remove
//!   itself) without affecting the listeners that follow.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

type Callback<T> = Rc<dyn Fn(&T)>;

/// Token returned by [`Signal::add`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct SignalInner<T> {
    next_id: u64,
    callbacks: HashMap<u64, Callback<T>>,
    /// Listeners in registration order
    stable: VecDeque<u64>,
    /// One in-flight list per nested `emit` call
    emitting: Vec<VecDeque<u64>>,
}

/// Observer list shared between its owner and anyone holding a clone.
pub struct Signal<T> {
    inner: Rc<RefCell<SignalInner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Signal")
            .field("listeners", &inner.stable.len())
            .field("emitting", &inner.emitting.len())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SignalInner {
                next_id: 1,
                callbacks: HashMap::new(),
                stable: VecDeque::new(),
                emitting: Vec::new(),
            })),
        }
    }

    /// Register a listener at the tail of the list.
    pub fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(id, Rc::new(callback));
        inner.stable.push_back(id);
        ListenerId(id)
    }

    /// Unregister a listener.
    ///
    /// Returns false if the listener was already detached, which happens to
    /// every listener once [`Signal::emit_final`] has reached it.
    pub fn remove(&self, listener: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let id = listener.0;
        if inner.callbacks.remove(&id).is_none() {
            return false;
        }
        inner.stable.retain(|l| *l != id);
        for round in &mut inner.emitting {
            round.retain(|l| *l != id);
        }
        true
    }

    pub fn contains(&self, listener: &ListenerId) -> bool {
        self.inner.borrow().callbacks.contains_key(&listener.0)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener registered when the emission starts.
    pub fn emit(&self, data: &T) {
        let depth = {
            let mut inner = self.inner.borrow_mut();
            let round = std::mem::take(&mut inner.stable);
            inner.emitting.push(round);
            inner.emitting.len() - 1
        };

        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.emitting[depth].pop_front() {
                    Some(id) => {
                        inner.stable.push_back(id);
                        inner.callbacks.get(&id).cloned()
                    }
                    None => break,
                }
            };
            // The borrow is released before calling out; the callback may
            // add, remove or emit on this signal.
            if let Some(callback) = next {
                callback(data);
            }
        }

        let mut inner = self.inner.borrow_mut();
        let round = inner.emitting.pop();
        debug_assert!(matches!(round, Some(ref r) if r.is_empty()));
    }

    /// Detach and invoke every listener, leaving the signal empty.
    ///
    /// Listeners added while this runs are detached and invoked as well.
    pub fn emit_final(&self, data: &T) {
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.stable.pop_front() {
                    Some(id) => inner.callbacks.remove(&id),
                    None => break,
                }
            };
            if let Some(callback) = next {
                callback(data);
            }
        }
    }
}
