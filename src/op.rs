//! C3 — Codec Boundary.
//!
//! `Op` is an opaque handle to an already-decoded Atlas operation. The byte
//! level codec lives outside this crate; this module only exposes the
//! accessors the rest of the core pattern-matches on.

use crate::value::Value;

/// Serial numbers correlate requests to replies; refnos correlate replies
/// back to the request they answer.
pub type Serial = u64;

/// A decoded Atlas operation (or an argument that is itself an operation,
/// e.g. the inner op of a sight-of-op or sound-of-op).
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    class: String,
    parents: Vec<String>,
    serial: Option<Serial>,
    refno: Option<Serial>,
    from: Option<String>,
    to: Option<String>,
    args: Vec<Arg>,
}

/// An operation argument: either a nested operation, or a plain value.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Op(Op),
    Value(Value),
}

impl Arg {
    pub fn as_op(&self) -> Option<&Op> {
        match self {
            Arg::Op(op) => Some(op),
            Arg::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Op(_) => None,
        }
    }
}

impl Op {
    pub fn new(class: impl Into<String>, parents: Vec<String>) -> Op {
        Op {
            class: class.into(),
            parents,
            serial: None,
            refno: None,
            from: None,
            to: None,
            args: Vec::new(),
        }
    }

    pub fn with_serial(mut self, serial: Serial) -> Op {
        self.serial = Some(serial);
        self
    }

    pub fn with_refno(mut self, refno: Serial) -> Op {
        self.refno = Some(refno);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Op {
        self.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Op {
        self.to = Some(to.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Arg>) -> Op {
        self.args = args;
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// The declared parent-list of this op's own class, used by the type
    /// service to resolve `getForOp`. By convention the first entry is the
    /// operative parent.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn serial(&self) -> Option<Serial> {
        self.serial
    }

    pub fn refno(&self) -> Option<Serial> {
        self.refno
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Is this op (or is it a descendant of) the named class, per its own
    /// declared parents? The core never walks a full class lattice for this
    /// — it only ever needs "is the first parent `x`", matching how the
    /// teacher op lattice is actually consulted by the router.
    pub fn is_a(&self, class: &str) -> bool {
        self.class == class || self.parents.iter().any(|p| p == class)
    }

    /// The inner operation of a wrapped op, e.g. the `Sight` of a `Create`,
    /// or the `Sound` of a `Talk`. By convention this is the op's first
    /// argument, if that argument is itself an op.
    pub fn inner_op(&self) -> Option<&Op> {
        self.args.first().and_then(Arg::as_op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_a_matches_class_and_declared_parent() {
        let op = Op::new("sight", vec!["perception".into()]);
        assert!(op.is_a("sight"));
        assert!(op.is_a("perception"));
        assert!(!op.is_a("sound"));
    }

    #[test]
    fn inner_op_unwraps_first_op_argument() {
        let inner = Op::new("create", vec!["action".into()]);
        let wrapper =
            Op::new("sight", vec!["perception".into()]).with_args(vec![Arg::Op(inner.clone())]);
        assert_eq!(wrapper.inner_op(), Some(&inner));
    }
}
