//! C1 — Event Bus.
//!
//! A named signal that fans a value out to zero or more subscribers.
//! Subscribing returns a [`Subscription`] handle; dropping it disconnects.
//! Emission snapshots the subscriber list before visiting it, so a handler
//! that subscribes or unsubscribes during emission never perturbs the
//! in-progress traversal (spec.md §4.1, and see DESIGN.md's "cyclic
//! observer graphs" note).

use std::cell::RefCell;
use std::rc::Rc;

type SlotId = u64;

struct Slot<T> {
    id: SlotId,
    alive: bool,
    callback: Box<dyn FnMut(&T)>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    next_id: SlotId,
}

/// A signal of values of type `T`.
pub struct Signal<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal {
            inner: Rc::new(RefCell::new(Inner { slots: Vec::new(), next_id: 0 })),
        }
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal { inner: self.inner.clone() }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `callback`, returning a handle that disconnects it on drop.
    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> Subscription<T> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push(Slot { id, alive: true, callback: Box::new(callback) });
        Subscription { inner: self.inner.clone(), id }
    }

    /// Emits `value` to a snapshot of the currently-subscribed callbacks, in
    /// subscription order. Subscribers added during this call do not see
    /// `value`; subscribers dropped during this call are skipped once their
    /// `alive` flag goes false, even though the id snapshot still names them.
    pub fn emit(&self, value: &T) {
        let ids: Vec<SlotId> = self.inner.borrow().slots.iter().map(|s| s.id).collect();
        for id in ids {
            // Pull the callback out of the slot so invoking it doesn't hold
            // `inner` borrowed — a handler may legally subscribe, drop a
            // subscription, or re-enter `emit` on this same signal.
            let taken = {
                let mut inner = self.inner.borrow_mut();
                inner.slots.iter().position(|s| s.id == id).and_then(|idx| {
                    if inner.slots[idx].alive {
                        Some(std::mem::replace(&mut inner.slots[idx].callback, Box::new(|_: &T| {})))
                    } else {
                        None
                    }
                })
            };
            let Some(mut cb) = taken else { continue };
            cb(value);
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == id) {
                slot.callback = cb;
            }
        }
        self.inner.borrow_mut().slots.retain(|s| s.alive);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().slots.iter().filter(|s| s.alive).count()
    }
}

/// Handle owning a subscription to a [`Signal`]; dropping it disconnects.
pub struct Subscription<T> {
    inner: Rc<RefCell<Inner<T>>>,
    id: SlotId,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == self.id) {
                slot.alive = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emits_in_subscription_order() {
        let sig: Signal<i32> = Signal::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let _s1 = sig.subscribe(move |v| o1.borrow_mut().push(("a", *v)));
        let _s2 = sig.subscribe(move |v| o2.borrow_mut().push(("b", *v)));
        sig.emit(&42);
        assert_eq!(*order.borrow(), vec![("a", 42), ("b", 42)]);
    }

    #[test]
    fn dropping_subscription_disconnects() {
        let sig: Signal<i32> = Signal::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let sub = sig.subscribe(move |_| c.set(c.get() + 1));
        sig.emit(&1);
        assert_eq!(count.get(), 1);
        drop(sub);
        sig.emit(&1);
        assert_eq!(count.get(), 1);
        assert_eq!(sig.subscriber_count(), 0);
    }

    #[test]
    fn subscribing_during_emit_does_not_see_current_event() {
        let sig: Signal<i32> = Signal::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sig2 = sig.clone();
        let late: Rc<RefCell<Option<Subscription<i32>>>> = Rc::new(RefCell::new(None));
        let late2 = late.clone();
        let seen_outer = seen.clone();
        let _s1 = sig.subscribe(move |v| {
            seen_outer.borrow_mut().push(*v);
            if late2.borrow().is_none() {
                let seen3 = seen_outer.clone();
                let handle = sig2.subscribe(move |v| seen3.borrow_mut().push(*v));
                *late2.borrow_mut() = Some(handle);
            }
        });
        sig.emit(&1);
        assert_eq!(*seen.borrow(), vec![1]);
        sig.emit(&2);
        assert_eq!(*seen.borrow(), vec![1, 2, 2]);
    }

    #[test]
    fn dropping_a_subscription_from_within_another_callback_is_not_revisited() {
        let sig: Signal<i32> = Signal::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_b = log.clone();
        let sub_b = sig.subscribe(move |_| log_b.borrow_mut().push("b"));
        let holder = Rc::new(RefCell::new(Some(sub_b)));
        let holder2 = holder.clone();
        let log_a = log.clone();
        let _killer = sig.subscribe(move |_| {
            log_a.borrow_mut().push("killer");
            holder2.borrow_mut().take();
        });
        sig.emit(&1);
        // "b" was subscribed before "killer" in insertion order, so it still
        // fires on the same emit pass that drops it from within "killer"'s
        // own callback is impossible (killer runs after b); dropping it
        // takes effect starting the *next* emit.
        assert_eq!(*log.borrow(), vec!["b", "killer"]);
        log.borrow_mut().clear();
        sig.emit(&1);
        assert_eq!(*log.borrow(), vec!["killer"]);
    }
}
