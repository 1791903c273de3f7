//! C9 — Redispatch Queue.
//!
//! Holds ops the router could not route because they referenced an
//! unbound type (or an entity not yet seen), keyed by the fact they're
//! waiting on. When that fact becomes true, every op parked under its key
//! is re-fed through the router. Each op carries a remaining-attempts
//! counter so a wrong or never-resolved trigger cannot queue it forever
//! (spec.md §4.9).

use std::collections::HashMap;

use crate::op::Op;

/// The fact a parked op is waiting on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    TypeBound(String),
    EntitySeen(String),
}

impl Trigger {
    pub fn type_bound(name: impl Into<String>) -> Trigger {
        Trigger::TypeBound(name.into())
    }

    pub fn entity_seen(id: impl Into<String>) -> Trigger {
        Trigger::EntitySeen(id.into())
    }
}

struct Parked {
    op: Op,
    attempts_left: u32,
}

/// The redispatch queue. Owns no ops until the router reports one blocked;
/// `drain` hands back everything waiting on `trigger` for the caller to
/// re-route.
#[derive(Default)]
pub struct RedispatchQueue {
    by_trigger: HashMap<Trigger, Vec<Parked>>,
}

impl RedispatchQueue {
    pub fn new() -> Self {
        RedispatchQueue::default()
    }

    /// Parks `op` under every given trigger, each with its own countdown.
    /// An op that fails to find a home because `max_attempts` is `0` is
    /// dropped immediately and reported back via the return value.
    pub fn park(&mut self, op: Op, triggers: Vec<Trigger>, max_attempts: u32) -> Result<(), Op> {
        if max_attempts == 0 || triggers.is_empty() {
            return Err(op);
        }
        for trigger in triggers {
            self.by_trigger
                .entry(trigger)
                .or_default()
                .push(Parked { op: op.clone(), attempts_left: max_attempts });
        }
        Ok(())
    }

    /// Re-queues an op that was just drained and failed routing again,
    /// decrementing its attempts. Returns `false` (and drops the op) once
    /// attempts are exhausted.
    fn requeue(&mut self, trigger: &Trigger, op: Op, attempts_left: u32) -> bool {
        if attempts_left == 0 {
            tracing::warn!(class = op.class(), "redispatch attempts exhausted, dropping op");
            return false;
        }
        self.by_trigger.entry(trigger.clone()).or_default().push(Parked { op, attempts_left });
        true
    }

    /// Removes and returns every op parked under `trigger`. The caller is
    /// expected to re-route each one and call [`RedispatchQueue::retry`] for
    /// any that are blocked again (possibly on a different trigger).
    pub fn drain(&mut self, trigger: &Trigger) -> Vec<Op> {
        self.by_trigger
            .remove(trigger)
            .map(|parked| parked.into_iter().map(|p| p.op).collect())
            .unwrap_or_default()
    }

    /// Like `drain`, but keeps each op's attempts budget, calling `retry`
    /// with `(op, attempts_left - 1)` for the caller to re-park under
    /// whatever new trigger the re-route reports, or to drop once attempts
    /// reach zero.
    pub fn drain_with_attempts(&mut self, trigger: &Trigger) -> Vec<(Op, u32)> {
        self.by_trigger
            .remove(trigger)
            .map(|parked| parked.into_iter().map(|p| (p.op, p.attempts_left - 1)).collect())
            .unwrap_or_default()
    }

    pub fn requeue_or_drop(&mut self, trigger: &Trigger, op: Op, attempts_left: u32) {
        self.requeue(trigger, op, attempts_left);
    }

    pub fn is_empty(&self) -> bool {
        self.by_trigger.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.by_trigger.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(class: &str) -> Op {
        Op::new(class, Vec::new())
    }

    #[test]
    fn park_and_drain_round_trip() {
        let mut q = RedispatchQueue::new();
        q.park(op("sight"), vec![Trigger::type_bound("settler")], 4).unwrap();
        assert_eq!(q.len(), 1);
        let drained = q.drain(&Trigger::type_bound("settler"));
        assert_eq!(drained.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn zero_attempts_is_dropped_immediately() {
        let mut q = RedispatchQueue::new();
        let result = q.park(op("sight"), vec![Trigger::type_bound("settler")], 0);
        assert!(result.is_err());
        assert!(q.is_empty());
    }

    #[test]
    fn attempts_exhaust_after_repeated_failures() {
        let mut q = RedispatchQueue::new();
        q.park(op("sight"), vec![Trigger::type_bound("settler")], 1).unwrap();
        let drained = q.drain_with_attempts(&Trigger::type_bound("settler"));
        assert_eq!(drained.len(), 1);
        let (dropped_op, attempts_left) = drained.into_iter().next().unwrap();
        assert_eq!(attempts_left, 0);
        q.requeue_or_drop(&Trigger::type_bound("settler"), dropped_op, attempts_left);
        assert!(q.is_empty());
    }

    #[test]
    fn multiple_triggers_each_get_a_copy() {
        let mut q = RedispatchQueue::new();
        q.park(
            op("sight"),
            vec![Trigger::type_bound("settler"), Trigger::entity_seen("42")],
            2,
        )
        .unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.drain(&Trigger::type_bound("settler")).len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain(&Trigger::entity_seen("42")).len(), 1);
        assert!(q.is_empty());
    }
}
