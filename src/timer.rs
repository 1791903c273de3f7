//! C2 — Timed Events.
//!
//! A deadline-ordered set of one-shot callbacks, driven by a cooperative
//! `poll` call from the host loop (spec.md §4.2). There is no background
//! thread: nothing fires except from inside `poll`.

use std::time::Instant;

type TimerId = u64;

struct Entry {
    id: TimerId,
    deadline: Instant,
    cancelled: bool,
    callback: Option<Box<dyn FnOnce()>>,
}

/// Deadline scheduler for one-shot callbacks.
#[derive(Default)]
pub struct Timers {
    entries: Vec<Entry>,
    next_id: TimerId,
}

/// A handle to a scheduled timer; cancellation is idempotent and may be
/// called any number of times, including after the timer has already fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle(TimerId);

impl Timers {
    pub fn new() -> Self {
        Timers::default()
    }

    /// Schedules `callback` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { id, deadline, cancelled: false, callback: Some(Box::new(callback)) });
        TimerHandle(id)
    }

    /// Cancels a scheduled timer. No-op if it already fired or was already
    /// cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == handle.0) {
            entry.cancelled = true;
        }
    }

    /// Fires every non-cancelled entry whose deadline has passed, in
    /// deadline order, removing each before invoking it. No two callbacks
    /// run concurrently; a callback that schedules a new timer does not
    /// affect this pass, since the new entry's deadline is evaluated against
    /// `now` only on the *next* `poll`.
    pub fn poll(&mut self, now: Instant) {
        let mut due: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.cancelled && e.deadline <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| self.entries[i].deadline);

        // Remove due (and any cancelled) entries from the live set first,
        // in one pass, then run callbacks — keeps `self.entries` indices
        // stable across callback execution, which may itself call
        // `schedule`/`cancel`.
        let mut fired = Vec::with_capacity(due.len());
        let due_ids: std::collections::HashSet<TimerId> =
            due.iter().map(|&i| self.entries[i].id).collect();
        self.entries.retain_mut(|e| {
            if due_ids.contains(&e.id) {
                if let Some(cb) = e.callback.take() {
                    fired.push(cb);
                }
                false
            } else {
                !e.cancelled
            }
        });
        for cb in fired {
            cb();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        timers.schedule(base + Duration::from_millis(20), move || l1.borrow_mut().push(2));
        timers.schedule(base + Duration::from_millis(10), move || l2.borrow_mut().push(1));
        timers.poll(base + Duration::from_millis(30));
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn cancellation_is_idempotent_and_prevents_firing() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let handle = timers.schedule(base, move || *f.borrow_mut() = true);
        timers.cancel(handle);
        timers.cancel(handle);
        timers.poll(base + Duration::from_secs(1));
        assert!(!*fired.borrow());
    }

    #[test]
    fn only_due_entries_fire() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let fired = Rc::new(RefCell::new(0));
        let f = fired.clone();
        timers.schedule(base + Duration::from_secs(10), move || *f.borrow_mut() += 1);
        timers.poll(base);
        assert_eq!(*fired.borrow(), 0);
        assert!(!timers.is_empty());
    }
}
