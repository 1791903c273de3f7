//! The pending-request table (spec.md §3 "Pending Request").
//!
//! A single table, shared by the type service, the account layer, and the
//! avatar layer, correlates outstanding request serials to what should
//! happen when (or if) a reply with a matching refno arrives.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::op::Serial;

/// What kind of request a pending serial corresponds to, and any payload
/// needed to act on its reply.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingKind {
    TypeLookup(String),
    Login,
    Logout,
    Look { entity_id: String },
    Create,
    Possess { entity_id: String },
}

/// Monotonically-increasing serial number source, shared across every
/// subsystem that issues requests so refnos never collide.
#[derive(Clone, Default)]
pub struct SerialAllocator(Rc<Cell<Serial>>);

impl SerialAllocator {
    pub fn new() -> Self {
        SerialAllocator::default()
    }

    pub fn next(&self) -> Serial {
        let s = self.0.get();
        self.0.set(s + 1);
        s
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<Serial, PendingKind>,
}

/// Shared handle to the pending-request table.
#[derive(Clone, Default)]
pub struct PendingRequests(Rc<RefCell<Table>>);

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests::default()
    }

    pub fn insert(&self, serial: Serial, kind: PendingKind) {
        self.0.borrow_mut().entries.insert(serial, kind);
    }

    /// Removes and returns the entry for `refno`, if any is outstanding.
    /// This is the single place a reply (or a timeout) retires a request.
    pub fn take(&self, refno: Serial) -> Option<PendingKind> {
        self.0.borrow_mut().entries.remove(&refno)
    }

    pub fn contains(&self, refno: Serial) -> bool {
        self.0.borrow().entries.contains_key(&refno)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_are_unique_and_increasing() {
        let alloc = SerialAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }

    #[test]
    fn take_removes_the_entry() {
        let table = PendingRequests::new();
        table.insert(7, PendingKind::Login);
        assert!(table.contains(7));
        assert_eq!(table.take(7), Some(PendingKind::Login));
        assert!(!table.contains(7));
        assert_eq!(table.take(7), None);
    }
}
