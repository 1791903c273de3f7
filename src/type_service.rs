//! C4 — Type Service.
//!
//! Maintains the type lattice (spec.md §4.4): every type referenced so far,
//! whether its descriptor has arrived, whether all its ancestors are known
//! ("bound"), and its merged default property map. Types are shared,
//! mutable, single-threaded nodes — entities and the router hold clones of
//! the same `TypeRef` the service itself holds, so a type flipping from
//! unbound to bound is visible everywhere without a re-lookup.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::event_bus::Signal;
use crate::op::{Arg, Op};
use crate::pending::{PendingKind, PendingRequests, SerialAllocator};
use crate::value::Value;

/// The three builtin roots every connection seeds at startup, plus the
/// catch-all fallback described below.
pub const ROOT: &str = "root";
pub const ROOT_ENTITY: &str = "root-entity";
pub const ROOT_OPERATION: &str = "root-operation";

/// Synthetic type substituted for a GET that comes back as an error, so
/// callers always get *some* bound `TypeRef` rather than a dangling name.
/// Grounded on `original_source/Eris/TypeService.h`'s `m_anonymousType`.
pub const ANONYMOUS: &str = "anonymous";

/// A node in the type lattice.
pub struct TypeInfo {
    name: String,
    parents: Vec<String>,
    children: HashSet<String>,
    ancestors: HashSet<String>,
    own_defaults: BTreeMap<String, Value>,
    defaults: BTreeMap<String, Value>,
    has_descriptor: bool,
    bound: bool,
    bad: bool,
}

impl TypeInfo {
    fn placeholder(name: &str) -> TypeInfo {
        TypeInfo {
            name: name.to_string(),
            parents: Vec::new(),
            children: HashSet::new(),
            ancestors: HashSet::new(),
            own_defaults: BTreeMap::new(),
            defaults: BTreeMap::new(),
            has_descriptor: false,
            bound: false,
            bad: false,
        }
    }

    fn builtin(name: &str) -> TypeInfo {
        TypeInfo {
            has_descriptor: true,
            bound: true,
            ..TypeInfo::placeholder(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn ancestors(&self) -> &HashSet<String> {
        &self.ancestors
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.ancestors.contains(name)
    }

    /// The type's merged default property map: parent maps (nearer, i.e.
    /// first-declared, parents win ties) overlaid with this type's own
    /// declared defaults, which always win.
    pub fn default_property(&self, key: &str) -> Option<&Value> {
        self.defaults.get(key)
    }

    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }
}

pub type TypeRef = Rc<RefCell<TypeInfo>>;

/// The type lattice plus the lookups needed to grow it from inbound INFO ops.
pub struct TypeService {
    types: HashMap<String, TypeRef>,
    pending: PendingRequests,
    serials: SerialAllocator,
    outgoing: Vec<Op>,
    local_entity: String,
    bound: Signal<TypeRef>,
    bad: Signal<TypeRef>,
}

impl TypeService {
    /// `local_entity` is the id sent as `from` on outgoing GET ops (spec.md
    /// §6, "the local account/avatar entity id").
    pub fn new(pending: PendingRequests, serials: SerialAllocator, local_entity: impl Into<String>, seed_types: &[String]) -> TypeService {
        let mut service = TypeService {
            types: HashMap::new(),
            pending,
            serials,
            outgoing: Vec::new(),
            local_entity: local_entity.into(),
            bound: Signal::new(),
            bad: Signal::new(),
        };
        service.define_builtin(ROOT);
        service.define_builtin(ROOT_ENTITY);
        service.define_builtin(ROOT_OPERATION);
        service.define_builtin(ANONYMOUS);
        for name in seed_types {
            service.define_builtin(name);
        }
        service
    }

    fn define_builtin(&mut self, name: &str) {
        self.types
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(TypeInfo::builtin(name))));
    }

    pub fn bound_signal(&self) -> &Signal<TypeRef> {
        &self.bound
    }

    pub fn bad_signal(&self) -> &Signal<TypeRef> {
        &self.bad
    }

    /// Ops queued for the host to send since the last drain — one GET per
    /// newly-referenced, not-yet-known type name.
    pub fn drain_outgoing(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.outgoing)
    }

    fn ensure_placeholder(&mut self, name: &str) -> TypeRef {
        self.types
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(TypeInfo::placeholder(name))))
            .clone()
    }

    /// Returns the (possibly still-unbound) type for `name`, issuing a GET
    /// request the first time `name` is ever referenced.
    pub fn get_by_name(&mut self, name: &str) -> TypeRef {
        if let Some(existing) = self.types.get(name) {
            return existing.clone();
        }
        let type_ref = self.ensure_placeholder(name);
        let serial = self.serials.next();
        self.pending.insert(serial, PendingKind::TypeLookup(name.to_string()));
        let get = Op::new("get", vec!["get".into()])
            .with_serial(serial)
            .with_from(self.local_entity.clone())
            .with_args(vec![Arg::Value(Value::Map(
                [("id".to_string(), Value::String(name.to_string()))].into_iter().collect(),
            ))]);
        self.outgoing.push(get);
        type_ref
    }

    pub fn find_by_name(&self, name: &str) -> Option<TypeRef> {
        self.types.get(name).cloned()
    }

    /// Resolves the type of an operation: the first entry of its declared
    /// parent list, falling back to the op's own class if it declares none.
    pub fn get_for_op(&mut self, op: &Op) -> TypeRef {
        let name = op.parents().first().map(String::as_str).unwrap_or_else(|| op.class());
        self.get_by_name(name)
    }

    /// A successful INFO reply for `name`: records its declared parents and
    /// own default properties, then attempts to bind it (and cascades to
    /// anything waiting on it).
    pub fn apply_descriptor(&mut self, name: &str, parents: Vec<String>, own_defaults: BTreeMap<String, Value>) {
        let type_ref = self.ensure_placeholder(name);
        {
            let mut info = type_ref.borrow_mut();
            info.parents = parents.clone();
            info.own_defaults = own_defaults;
            info.has_descriptor = true;
        }
        for parent_name in &parents {
            let parent_ref = self.get_by_name(parent_name);
            parent_ref.borrow_mut().children.insert(name.to_string());
        }
        self.try_bind_and_cascade(name);
    }

    /// Applies an inbound reply op to a type lookup: an `error` class marks
    /// the type bad, anything else is parsed as an INFO descriptor whose
    /// first argument is a map with a `parents` list and the type's own
    /// declared default properties alongside it.
    pub fn handle_reply(&mut self, name: &str, op: &Op) {
        if op.is_a("error") {
            self.mark_bad(name);
            return;
        }
        let mut parents = Vec::new();
        let mut own_defaults = BTreeMap::new();
        if let Some(Arg::Value(Value::Map(map))) = op.args().first() {
            if let Some(Value::List(list)) = map.get("parents") {
                parents = list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
            }
            for (key, value) in map {
                if key != "parents" && key != "id" && key != "objtype" {
                    own_defaults.insert(key.clone(), value.clone());
                }
            }
        }
        self.apply_descriptor(name, parents, own_defaults);
    }

    /// An ERROR reply for a type lookup: the type is permanently unusable.
    /// Its (still-unbound) children stay unbound; nothing can re-bind a bad
    /// type once marked.
    pub fn mark_bad(&mut self, name: &str) {
        let type_ref = self.ensure_placeholder(name);
        let already_bad = type_ref.borrow().bad;
        if already_bad {
            return;
        }
        type_ref.borrow_mut().bad = true;
        self.bad.emit(&type_ref);
    }

    fn try_bind_and_cascade(&mut self, name: &str) {
        if !self.try_bind(name) {
            return;
        }
        let type_ref = self.types.get(name).expect("just bound").clone();
        self.bound.emit(&type_ref);
        let children: Vec<String> = type_ref.borrow().children.iter().cloned().collect();
        for child in children {
            self.try_bind_and_cascade(&child);
        }
    }

    /// Checks (without issuing any new requests) whether `name` can now be
    /// marked bound: its descriptor must have arrived and every declared
    /// parent must already be bound. On success, computes `ancestors` and
    /// the merged `defaults` map and flips `bound`.
    fn try_bind(&mut self, name: &str) -> bool {
        let Some(type_ref) = self.types.get(name).cloned() else { return false };
        {
            let info = type_ref.borrow();
            if info.bound {
                return true;
            }
            if info.bad || !info.has_descriptor {
                return false;
            }
        }
        let parents = type_ref.borrow().parents.clone();
        for parent_name in &parents {
            if !self.try_bind(parent_name) {
                return false;
            }
        }

        let mut ancestors = HashSet::new();
        let mut defaults = BTreeMap::new();
        // First-listed parent wins ties: walk parents in order, only
        // inserting keys/ancestors not already present.
        for parent_name in &parents {
            ancestors.insert(parent_name.clone());
            if let Some(parent_ref) = self.types.get(parent_name) {
                let parent = parent_ref.borrow();
                for anc in &parent.ancestors {
                    ancestors.insert(anc.clone());
                }
                for (k, v) in &parent.defaults {
                    defaults.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        let mut info = type_ref.borrow_mut();
        for (k, v) in &info.own_defaults {
            defaults.insert(k.clone(), v.clone());
        }
        info.ancestors = ancestors;
        info.defaults = defaults;
        info.bound = true;
        true
    }

    /// Returns the names of every type this op references (its own class's
    /// declared parent, and for each argument that is itself an op, that
    /// argument's declared parent) that is not currently bound. Each such
    /// name has already had `get_by_name` called on it, so a GET is in
    /// flight (or a cached result already exists) by the time this returns.
    /// An empty result means the op has nothing left to wait on.
    pub fn verify_object_types(&mut self, op: &Op) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(p) = op.parents().first() {
            names.push(p.clone());
        }
        for arg in op.args() {
            if let Arg::Op(inner) = arg {
                if let Some(p) = inner.parents().first() {
                    names.push(p.clone());
                }
            }
        }

        let mut unbound = Vec::new();
        for name in names {
            let type_ref = self.get_by_name(&name);
            let bound = type_ref.borrow().bound;
            if !bound {
                unbound.push(name);
            }
        }
        unbound
    }
}
