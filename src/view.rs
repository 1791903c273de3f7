//! C6 — Entity View.
//!
//! The client's model of the entities it has seen: a containment tree keyed
//! by entity id, property storage with per-type default fallback, batched
//! change notification, and the visibility cascades that keep children
//! consistent with their parent's appear/disappear state and with the
//! parent-wait rule (an entity sighted under a not-yet-seen parent stays
//! invisible until that parent itself is seen and visible).

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::event_bus::Signal;
use crate::motion::{predict, MovingState, Pose};
use crate::op::Op;
use crate::router::OpHandler;
use crate::task::{Task, TaskTracker};
use crate::type_service::{TypeRef, TypeService};
use crate::value::{Quaternion, Value, Vector3};

/// Property names the view itself understands and routes to dedicated
/// state rather than the generic property map (spec.md §4.6's native-handler
/// list: `name`, `stamp`, `pos`, `velocity`, `angular`, `accel`, `orientation`,
/// `bbox`, `scale`, `loc`, `tasks`).
const NAME: &str = "name";
const STAMP: &str = "stamp";
const LOC: &str = "loc";
const POS: &str = "pos";
const VELOCITY: &str = "velocity";
const ACCEL: &str = "accel";
const ORIENTATION: &str = "orientation";
const ANGULAR: &str = "angular";
const BBOX: &str = "bbox";
const SCALE: &str = "scale";
const TASKS: &str = "tasks";

/// Reserved names that may never be written through `setProperty` — they're
/// either structural (`id`) or derived from the containment tree (`contains`)
/// rather than settable instance data.
const RESERVED: [&str; 2] = ["id", "contains"];

/// A single known entity.
pub struct Entity {
    id: String,
    type_ref: Option<TypeRef>,
    loc: Option<String>,
    children: HashSet<String>,
    properties: BTreeMap<String, Value>,
    name: Option<String>,
    stamp: Option<Value>,
    bbox: Option<(Vector3, Vector3)>,
    scale: Vector3,
    pose: Pose,
    pose_stamp: Option<Instant>,
    moving: MovingState,
    tasks: TaskTracker,
    /// Effective visibility, maintained by the appear/disappear cascades
    /// rather than recomputed on every access.
    visible: bool,
    /// Set once a sight/create op has supplied real data; entities created
    /// only as a placeholder parent for a `loc` reference start `false`.
    seen: bool,
    /// True while this entity's `loc` names a parent that has not itself
    /// been seen-and-visible yet. Implies `!visible` (spec.md §4.6, P2).
    waiting_for_parent_bind: bool,
    update_depth: u32,
    dirty: HashSet<String>,
}

impl Entity {
    fn placeholder(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            type_ref: None,
            loc: None,
            children: HashSet::new(),
            properties: BTreeMap::new(),
            name: None,
            stamp: None,
            bbox: None,
            scale: Vector3::new(1.0, 1.0, 1.0),
            pose: Pose::default(),
            pose_stamp: None,
            moving: MovingState::new(),
            tasks: TaskTracker::new(),
            visible: false,
            seen: false,
            waiting_for_parent_bind: false,
            update_depth: 0,
            dirty: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_ref(&self) -> Option<&TypeRef> {
        self.type_ref.as_ref()
    }

    pub fn loc(&self) -> Option<&str> {
        self.loc.as_deref()
    }

    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_seen(&self) -> bool {
        self.seen
    }

    pub fn is_waiting_for_parent_bind(&self) -> bool {
        self.waiting_for_parent_bind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn stamp(&self) -> Option<&Value> {
        self.stamp.as_ref()
    }

    /// The unscaled bounding box, as `(min, max)` corners.
    pub fn bbox(&self) -> Option<(Vector3, Vector3)> {
        self.bbox
    }

    pub fn scale(&self) -> Vector3 {
        self.scale
    }

    /// The bounding box after applying `scale` componentwise to each corner.
    pub fn bbox_scaled(&self) -> Option<(Vector3, Vector3)> {
        let (min, max) = self.bbox?;
        let s = self.scale;
        Some((Vector3::new(min.x * s.x, min.y * s.y, min.z * s.z), Vector3::new(max.x * s.x, max.y * s.y, max.z * s.z)))
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// The pose predicted `elapsed` after the last pose update, scaled by
    /// `simulation_speed` (spec.md §4.7).
    pub fn predicted_pose(&self, now: Instant, simulation_speed: f64) -> Pose {
        let elapsed = self.pose_stamp.map(|stamp| now.saturating_duration_since(stamp)).unwrap_or(Duration::ZERO);
        predict(&self.pose, elapsed, simulation_speed)
    }

    /// Returns the effective value of `name`: this entity's own property if
    /// set, otherwise the type's default, otherwise `None`.
    pub fn effective_property(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.properties.get(name) {
            return Some(v.clone());
        }
        self.type_ref.as_ref().and_then(|t| t.borrow().default_property(name).cloned())
    }
}

/// What changed in one batch of updates to an entity.
#[derive(Debug, Clone)]
pub struct Changed {
    pub entity_id: String,
    pub properties: Vec<String>,
}

pub struct View {
    entities: std::collections::HashMap<String, Rc<RefCell<Entity>>>,
    root_id: Option<String>,
    pub changed: Signal<Changed>,
    /// Fires when a pose property (`pos`/`velocity`/`orientation`/`angular`)
    /// changed in the most recent batch.
    pub moved: Signal<String>,
    /// Fires when an entity's `loc` (its parent reference) changed, distinct
    /// from `moved`.
    pub location_changed: Signal<String>,
    pub moving: Signal<(String, bool)>,
    pub appeared: Signal<String>,
    pub disappeared: Signal<String>,
    /// `(parent_id, child_id)` — a child was added to a parent's children set.
    pub child_added: Signal<(String, String)>,
    /// `(parent_id, child_id)` — a child left a parent's children set.
    pub child_removed: Signal<(String, String)>,
    pub task_added: Signal<(String, Task)>,
    pub task_removed: Signal<(String, Task)>,
}

impl Default for View {
    fn default() -> Self {
        View {
            entities: std::collections::HashMap::new(),
            root_id: None,
            changed: Signal::new(),
            moved: Signal::new(),
            location_changed: Signal::new(),
            moving: Signal::new(),
            appeared: Signal::new(),
            disappeared: Signal::new(),
            child_added: Signal::new(),
            child_removed: Signal::new(),
            task_added: Signal::new(),
            task_removed: Signal::new(),
        }
    }
}

impl View {
    pub fn new() -> Self {
        View::default()
    }

    pub fn entity(&self, id: &str) -> Option<Rc<RefCell<Entity>>> {
        self.entities.get(id).cloned()
    }

    pub fn root(&self) -> Option<Rc<RefCell<Entity>>> {
        self.root_id.as_ref().and_then(|id| self.entity(id))
    }

    pub fn set_root(&mut self, id: &str) {
        self.ensure_entity(id);
        self.root_id = Some(id.to_string());
    }

    fn ensure_entity(&mut self, id: &str) -> Rc<RefCell<Entity>> {
        self.entities.entry(id.to_string()).or_insert_with(|| Rc::new(RefCell::new(Entity::placeholder(id)))).clone()
    }

    /// Whether `parent_id` is both seen and currently effectively visible —
    /// the condition an entity's own visibility waits on when it names that
    /// parent via `loc` (spec.md §4.6, P2).
    fn parent_ready(&self, parent_id: Option<&str>) -> bool {
        match parent_id {
            None => true,
            Some(pid) => self.entities.get(pid).map(|p| {
                let p = p.borrow();
                p.seen && p.visible
            }).unwrap_or(false),
        }
    }

    /// Applies a full entity snapshot (a SIGHT of an entity, or the reply
    /// to a CREATE): sets the type, writes every supplied property through
    /// the single write path, reparents on `loc`, and marks the entity seen
    /// and (if it wasn't already, and its parent is ready) visible. Batches
    /// everything into one `Changed` notification.
    pub fn apply_sight(&mut self, id: &str, type_ref: TypeRef, properties: &BTreeMap<String, Value>, now: Instant) {
        let entity = self.ensure_entity(id);
        self.begin_update(&entity);
        entity.borrow_mut().type_ref = Some(type_ref);
        entity.borrow_mut().seen = true;
        for (name, value) in properties {
            self.set_property(&entity, name, value, now);
        }
        self.end_update(id, &entity);

        // A `loc` in this batch already drove its own appear/disappear
        // cascade through `reparent`. An entity with no `loc` at all (a
        // root-level entity, or one whose parent link predates this sight)
        // still needs its own visibility resolved against whatever parent
        // it already has.
        if !properties.contains_key(LOC) {
            let parent_id = entity.borrow().loc.clone();
            let parent_ready = self.parent_ready(parent_id.as_deref());
            entity.borrow_mut().waiting_for_parent_bind = !parent_ready;
            if parent_ready {
                self.mark_appeared(id);
            }
        }
    }

    fn begin_update(&self, entity: &Rc<RefCell<Entity>>) {
        entity.borrow_mut().update_depth += 1;
    }

    fn end_update(&mut self, id: &str, entity: &Rc<RefCell<Entity>>) {
        let should_flush = {
            let mut e = entity.borrow_mut();
            e.update_depth = e.update_depth.saturating_sub(1);
            e.update_depth == 0 && !e.dirty.is_empty()
        };
        if !should_flush {
            return;
        }
        let (properties, loc_changed, pose_changed) = {
            let mut e = entity.borrow_mut();
            let properties: Vec<String> = e.dirty.drain().collect();
            let loc_changed = properties.iter().any(|p| p == LOC);
            let pose_changed = properties.iter().any(|p| matches!(p.as_str(), POS | VELOCITY | ORIENTATION | ANGULAR));
            (properties, loc_changed, pose_changed)
        };
        self.changed.emit(&Changed { entity_id: id.to_string(), properties });
        if loc_changed {
            self.location_changed.emit(&id.to_string());
        }
        if pose_changed {
            self.moved.emit(&id.to_string());
            let pose = entity.borrow().pose;
            if let Some(transition) = entity.borrow_mut().moving.update(&pose) {
                self.moving.emit(&(id.to_string(), transition));
            }
        }
    }

    /// The single property write path (spec.md §4.6): reserved names are
    /// rejected outright, known names route to native state, everything
    /// else lands in the generic property map. Always called inside a
    /// `begin_update`/`end_update` pair.
    fn set_property(&mut self, entity: &Rc<RefCell<Entity>>, name: &str, value: &Value, now: Instant) {
        if RESERVED.contains(&name) {
            tracing::warn!(entity_id = %entity.borrow().id, property = name, "rejected write to a reserved property");
            return;
        }
        match name {
            LOC => {
                let new_parent = value.as_str().map(str::to_string);
                let id = entity.borrow().id.clone();
                self.reparent(&id, new_parent.clone());
                entity.borrow_mut().loc = new_parent;
                entity.borrow_mut().dirty.insert(LOC.to_string());
            }
            NAME => {
                if let Some(s) = value.as_str() {
                    let mut e = entity.borrow_mut();
                    e.name = Some(s.to_string());
                    e.dirty.insert(NAME.to_string());
                }
            }
            STAMP => {
                let mut e = entity.borrow_mut();
                e.stamp = Some(value.clone());
                e.dirty.insert(STAMP.to_string());
            }
            POS => {
                if let Some(v) = Vector3::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.pose.position = v;
                    e.pose_stamp = Some(now);
                    e.dirty.insert(POS.to_string());
                }
            }
            VELOCITY => {
                if let Some(v) = Vector3::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.pose.velocity = v;
                    e.pose_stamp = Some(now);
                    e.dirty.insert(VELOCITY.to_string());
                }
            }
            ACCEL => {
                if let Some(v) = Vector3::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.pose.acceleration = v;
                    e.pose_stamp = Some(now);
                    e.dirty.insert(ACCEL.to_string());
                }
            }
            ORIENTATION => {
                if let Some(q) = Quaternion::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.pose.orientation = q;
                    e.pose_stamp = Some(now);
                    e.dirty.insert(ORIENTATION.to_string());
                }
            }
            ANGULAR => {
                if let Some(v) = Vector3::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.pose.angular_velocity = v;
                    e.pose_stamp = Some(now);
                    e.dirty.insert(ANGULAR.to_string());
                }
            }
            BBOX => {
                if let Some(bbox) = parse_bbox(value) {
                    let mut e = entity.borrow_mut();
                    e.bbox = Some(bbox);
                    e.dirty.insert(BBOX.to_string());
                }
            }
            SCALE => {
                if let Some(v) = Vector3::from_value(value) {
                    let mut e = entity.borrow_mut();
                    e.scale = v;
                    e.dirty.insert(SCALE.to_string());
                }
            }
            TASKS => {
                let id = entity.borrow().id.clone();
                let delta = entity.borrow_mut().tasks.reconcile(value);
                for task in delta.added {
                    self.task_added.emit(&(id.clone(), task));
                }
                for task in delta.removed {
                    self.task_removed.emit(&(id.clone(), task));
                }
                entity.borrow_mut().dirty.insert(TASKS.to_string());
            }
            other => {
                let mut e = entity.borrow_mut();
                e.properties.insert(other.to_string(), value.clone());
                e.dirty.insert(other.to_string());
            }
        }
    }

    /// Moves `id` out of its previous parent's children set and into
    /// `new_parent`'s, emitting `ChildRemoved`/`ChildAdded`/`LocationChanged`,
    /// then resolves `id`'s own visibility against the new parent: appears
    /// it if the new parent is seen-and-visible, otherwise marks it waiting
    /// (and disappears it if it had been visible under the old parent). An
    /// unseen `new_parent` gets a placeholder entry so the containment edge
    /// exists before the parent's own data arrives.
    fn reparent(&mut self, id: &str, new_parent: Option<String>) {
        let old_parent = self.entities.get(id).and_then(|e| e.borrow().loc.clone());
        if old_parent == new_parent {
            return;
        }
        if let Some(old) = &old_parent {
            if let Some(parent) = self.entities.get(old) {
                parent.borrow_mut().children.remove(id);
            }
            self.child_removed.emit(&(old.clone(), id.to_string()));
        }
        if let Some(new) = &new_parent {
            let parent = self.ensure_entity(new);
            parent.borrow_mut().children.insert(id.to_string());
            self.child_added.emit(&(new.clone(), id.to_string()));
        }

        let parent_ready = self.parent_ready(new_parent.as_deref());
        if let Some(entity) = self.entities.get(id) {
            entity.borrow_mut().waiting_for_parent_bind = !parent_ready;
        }
        if parent_ready {
            self.mark_appeared(id);
        } else {
            self.mark_disappeared(id);
        }
    }

    /// Top-down appearance cascade: `id` becomes visible (unless it is
    /// itself waiting on its own parent), then every child already known is
    /// un-waited and walked the same way, since the fact they were waiting
    /// on — this entity becoming seen-and-visible — has just happened.
    fn mark_appeared(&mut self, id: &str) {
        let Some(entity) = self.entities.get(id).cloned() else { return };
        let (already_visible, waiting) = {
            let e = entity.borrow();
            (e.visible, e.waiting_for_parent_bind)
        };
        if waiting {
            return;
        }
        if !already_visible {
            entity.borrow_mut().visible = true;
            self.appeared.emit(&id.to_string());
        }
        let children: Vec<String> = entity.borrow().children.iter().cloned().collect();
        for child in children {
            if let Some(child_entity) = self.entities.get(&child) {
                child_entity.borrow_mut().waiting_for_parent_bind = false;
            }
            self.mark_appeared(&child);
        }
    }

    /// Bottom-up disappearance cascade: every child disappears before its
    /// parent does.
    fn mark_disappeared(&mut self, id: &str) {
        let children: Vec<String> =
            self.entities.get(id).map(|e| e.borrow().children.iter().cloned().collect()).unwrap_or_default();
        for child in children {
            self.mark_disappeared(&child);
        }
        if let Some(entity) = self.entities.get(id) {
            if entity.borrow().visible {
                entity.borrow_mut().visible = false;
                self.disappeared.emit(&id.to_string());
            }
        }
    }

    /// A DELETE op for `id`: cascades disappearance bottom-up, then removes
    /// the whole subtree from the view, detaching it from its parent.
    pub fn handle_delete(&mut self, id: &str) {
        self.mark_disappeared(id);
        self.remove_subtree(id);
    }

    fn remove_subtree(&mut self, id: &str) {
        let children: Vec<String> =
            self.entities.get(id).map(|e| e.borrow().children.iter().cloned().collect()).unwrap_or_default();
        for child in children {
            self.remove_subtree(&child);
        }
        if let Some(entity) = self.entities.remove(id) {
            if let Some(parent_id) = entity.borrow().loc.clone() {
                if let Some(parent) = self.entities.get(&parent_id) {
                    parent.borrow_mut().children.remove(id);
                }
            }
        }
        if self.root_id.as_deref() == Some(id) {
            self.root_id = None;
        }
    }

    /// Applies a partial update (a SIGHT of a SET) to an already-known
    /// entity: writes every supplied property through the single write
    /// path without touching the entity's type, batched into one
    /// `Changed` notification. A SET for an entity never seen before is
    /// logged and dropped — there's nothing to attach the properties to.
    pub fn apply_update(&mut self, id: &str, properties: &BTreeMap<String, Value>, now: Instant) {
        let Some(entity) = self.entities.get(id).cloned() else {
            tracing::debug!(entity_id = id, "set op for an entity never seen, dropping");
            return;
        };
        self.begin_update(&entity);
        for (name, value) in properties {
            self.set_property(&entity, name, value, now);
        }
        self.end_update(id, &entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Parses a 6-element `[minx, miny, minz, maxx, maxy, maxz]` atlas list into
/// unscaled `(min, max)` corners.
fn parse_bbox(value: &Value) -> Option<(Vector3, Vector3)> {
    let list = value.as_list()?;
    if list.len() != 6 {
        return None;
    }
    let min = Vector3::new(list[0].as_f64()?, list[1].as_f64()?, list[2].as_f64()?);
    let max = Vector3::new(list[3].as_f64()?, list[4].as_f64()?, list[5].as_f64()?);
    Some((min, max))
}

/// Pulls `(id, parents, properties)` out of an op whose first argument is a
/// map shaped like `{"id": ..., "parents": [...], ...props}` — the shape
/// both CREATE and SET ops carry their entity data in (spec.md §4.6).
fn entity_payload(op: &Op) -> Option<(String, Vec<String>, BTreeMap<String, Value>)> {
    let map = op.args().first()?.as_value()?.as_map()?;
    let id = map.get("id")?.as_str()?.to_string();
    let parents = map
        .get("parents")
        .and_then(Value::as_list)
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let properties = map
        .iter()
        .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "parents" && k.as_str() != "objtype")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some((id, parents, properties))
}

/// The id a DELETE op targets: conventionally its `to` field, falling back
/// to a bare string first argument.
fn delete_target(op: &Op) -> Option<String> {
    op.to()
        .map(str::to_string)
        .or_else(|| op.args().first().and_then(|a| a.as_value()).and_then(Value::as_str).map(str::to_string))
}

impl OpHandler for View {
    fn try_handle(&mut self, op: &Op, type_service: &mut TypeService) -> bool {
        let now = Instant::now();
        match op.class() {
            "sight" => {
                let Some(inner) = op.inner_op() else { return false };
                match inner.class() {
                    "create" => {
                        let Some((id, parents, properties)) = entity_payload(inner) else { return false };
                        let type_name = parents.first().map(String::as_str).unwrap_or(crate::type_service::ANONYMOUS);
                        let type_ref = type_service.get_by_name(type_name);
                        self.apply_sight(&id, type_ref, &properties, now);
                        true
                    }
                    "set" => {
                        let Some((id, _, properties)) = entity_payload(inner) else { return false };
                        self.apply_update(&id, &properties, now);
                        true
                    }
                    "delete" => {
                        let Some(id) = delete_target(inner) else { return false };
                        self.handle_delete(&id);
                        true
                    }
                    _ => false,
                }
            }
            "delete" => {
                let Some(id) = delete_target(op) else { return false };
                self.handle_delete(&id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{PendingRequests, SerialAllocator};
    use crate::type_service::TypeService;
    use std::cell::RefCell as StdRefCell;

    fn bound_type(service: &mut TypeService, name: &str) -> TypeRef {
        service.apply_descriptor(name, vec![crate::type_service::ROOT_ENTITY.to_string()], BTreeMap::new());
        service.find_by_name(name).unwrap()
    }

    #[test]
    fn apply_sight_creates_and_marks_visible() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        let appeared = Rc::new(StdRefCell::new(Vec::new()));
        let a = appeared.clone();
        let _sub = view.appeared.subscribe(move |id| a.borrow_mut().push(id.clone()));
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());
        assert!(view.entity("e1").unwrap().borrow().is_visible());
        assert_eq!(*appeared.borrow(), vec!["e1".to_string()]);
    }

    #[test]
    fn loc_change_reparents_and_cascades_visibility() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("room", t.clone(), &BTreeMap::new(), Instant::now());
        let appeared = Rc::new(StdRefCell::new(Vec::new()));
        let a = appeared.clone();
        let _sub = view.appeared.subscribe(move |id| a.borrow_mut().push(id.clone()));
        let added = Rc::new(StdRefCell::new(Vec::new()));
        let ad = added.clone();
        let _child_sub = view.child_added.subscribe(move |pair| ad.borrow_mut().push(pair.clone()));

        let mut props = BTreeMap::new();
        props.insert(LOC.to_string(), Value::String("room".to_string()));
        view.apply_sight("item", t, &props, Instant::now());

        assert_eq!(view.entity("item").unwrap().borrow().loc(), Some("room"));
        assert!(view.entity("room").unwrap().borrow().children().any(|c| c == "item"));
        assert_eq!(*appeared.borrow(), vec!["item".to_string()]);
        assert_eq!(*added.borrow(), vec![("room".to_string(), "item".to_string())]);
    }

    /// Scenario 2: an entity sighted with `loc` pointing at an as-yet-unseen
    /// parent stays invisible and waiting, with no `appeared` fired, until
    /// the parent itself is sighted and appears.
    #[test]
    fn sight_under_unseen_parent_waits_then_appears_when_parent_does() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");

        let appeared = Rc::new(StdRefCell::new(Vec::new()));
        let a = appeared.clone();
        let _sub = view.appeared.subscribe(move |id| a.borrow_mut().push(id.clone()));

        let mut props = BTreeMap::new();
        props.insert(LOC.to_string(), Value::String("e1".to_string()));
        view.apply_sight("e2", t.clone(), &props, Instant::now());

        let e2 = view.entity("e2").unwrap();
        assert!(!e2.borrow().is_visible());
        assert!(e2.borrow().is_waiting_for_parent_bind());
        assert!(appeared.borrow().is_empty());
        assert!(view.entity("e1").unwrap().borrow().children().any(|c| c == "e2"));

        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());

        assert!(view.entity("e1").unwrap().borrow().is_visible());
        assert!(e2.borrow().is_visible());
        assert!(!e2.borrow().is_waiting_for_parent_bind());
        assert_eq!(*appeared.borrow(), vec!["e1".to_string(), "e2".to_string()]);
    }

    /// A child sighted under a parent that exists but is not itself
    /// effectively visible (e.g. the parent is itself waiting) must not
    /// appear either.
    #[test]
    fn child_of_an_invisible_parent_does_not_appear() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");

        // "room" is only a placeholder so far: referenced by "item"'s loc,
        // never itself sighted.
        let mut item_props = BTreeMap::new();
        item_props.insert(LOC.to_string(), Value::String("room".to_string()));
        view.apply_sight("item", t, &item_props, Instant::now());

        assert!(!view.entity("room").unwrap().borrow().is_visible());
        assert!(!view.entity("item").unwrap().borrow().is_visible());
    }

    #[test]
    fn delete_cascades_bottom_up_and_removes_subtree() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("room", t.clone(), &BTreeMap::new(), Instant::now());
        let mut props = BTreeMap::new();
        props.insert(LOC.to_string(), Value::String("room".to_string()));
        view.apply_sight("item", t, &props, Instant::now());

        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o = order.clone();
        let _sub = view.disappeared.subscribe(move |id| o.borrow_mut().push(id.clone()));
        view.handle_delete("room");

        assert_eq!(*order.borrow(), vec!["item".to_string(), "room".to_string()]);
        assert!(view.entity("room").is_none());
        assert!(view.entity("item").is_none());
    }

    #[test]
    fn moving_edge_fires_once() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());

        let edges = Rc::new(StdRefCell::new(Vec::new()));
        let e = edges.clone();
        let _sub = view.moving.subscribe(move |(_, m)| e.borrow_mut().push(*m));

        let entity = view.entity("e1").unwrap();
        view.begin_update(&entity);
        view.set_property(&entity, VELOCITY, &Value::List(vec![Value::Float(1.0), Value::Float(0.0), Value::Float(0.0)]), Instant::now());
        view.end_update("e1", &entity);
        view.begin_update(&entity);
        view.set_property(&entity, VELOCITY, &Value::List(vec![Value::Float(1.0), Value::Float(0.0), Value::Float(0.0)]), Instant::now());
        view.end_update("e1", &entity);

        assert_eq!(*edges.borrow(), vec![true]);
    }

    /// Scenario 3: a single batched pos/velocity update fires exactly one
    /// `Changed`, then `Moved` (not gated on `loc`), then the `Moving(true)`
    /// edge.
    #[test]
    fn pose_batch_fires_changed_then_moved_then_moving() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());

        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = order.clone();
        let _c = view.changed.subscribe(move |_| o1.borrow_mut().push("changed"));
        let o2 = order.clone();
        let _m = view.moved.subscribe(move |_| o2.borrow_mut().push("moved"));
        let o3 = order.clone();
        let _mv = view.moving.subscribe(move |_| o3.borrow_mut().push("moving"));
        let o4 = order.clone();
        let _lc = view.location_changed.subscribe(move |_| o4.borrow_mut().push("location_changed"));

        let entity = view.entity("e1").unwrap();
        view.begin_update(&entity);
        view.set_property(&entity, POS, &Value::List(vec![Value::Float(1.0), Value::Float(0.0), Value::Float(0.0)]), Instant::now());
        view.set_property(&entity, VELOCITY, &Value::List(vec![Value::Float(1.0), Value::Float(0.0), Value::Float(0.0)]), Instant::now());
        view.end_update("e1", &entity);

        assert_eq!(*order.borrow(), vec!["changed", "moved", "moving"]);
    }

    #[test]
    fn loc_change_fires_location_changed_not_moved() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("room", t.clone(), &BTreeMap::new(), Instant::now());
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());

        let moved = Rc::new(StdRefCell::new(0));
        let m = moved.clone();
        let _mv = view.moved.subscribe(move |_| *m.borrow_mut() += 1);
        let located = Rc::new(StdRefCell::new(0));
        let l = located.clone();
        let _lc = view.location_changed.subscribe(move |_| *l.borrow_mut() += 1);

        let entity = view.entity("e1").unwrap();
        view.begin_update(&entity);
        view.set_property(&entity, LOC, &Value::String("room".to_string()), Instant::now());
        view.end_update("e1", &entity);

        assert_eq!(*moved.borrow(), 0);
        assert_eq!(*located.borrow(), 1);
    }

    #[test]
    fn accel_and_angular_use_atlas_property_names() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());
        let entity = view.entity("e1").unwrap();

        view.begin_update(&entity);
        view.set_property(&entity, ACCEL, &Value::List(vec![Value::Float(2.0), Value::Float(0.0), Value::Float(0.0)]), Instant::now());
        view.set_property(&entity, ANGULAR, &Value::List(vec![Value::Float(0.0), Value::Float(0.0), Value::Float(1.0)]), Instant::now());
        view.end_update("e1", &entity);

        assert_eq!(entity.borrow().pose.acceleration, Vector3::new(2.0, 0.0, 0.0));
        assert_eq!(entity.borrow().pose.angular_velocity, Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn bbox_and_scale_are_tracked_and_combine() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());
        let entity = view.entity("e1").unwrap();

        view.begin_update(&entity);
        view.set_property(
            &entity,
            BBOX,
            &Value::List(vec![
                Value::Float(-1.0), Value::Float(-1.0), Value::Float(-1.0),
                Value::Float(1.0), Value::Float(1.0), Value::Float(1.0),
            ]),
            Instant::now(),
        );
        view.set_property(&entity, SCALE, &Value::List(vec![Value::Float(2.0), Value::Float(2.0), Value::Float(2.0)]), Instant::now());
        view.end_update("e1", &entity);

        let (min, max) = entity.borrow().bbox_scaled().unwrap();
        assert_eq!(min, Vector3::new(-2.0, -2.0, -2.0));
        assert_eq!(max, Vector3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut view = View::new();
        let mut ts = TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[]);
        let t = bound_type(&mut ts, "settler");
        view.apply_sight("e1", t, &BTreeMap::new(), Instant::now());
        let entity = view.entity("e1").unwrap();

        view.begin_update(&entity);
        view.set_property(&entity, "id", &Value::String("hacked".to_string()), Instant::now());
        view.set_property(&entity, "contains", &Value::List(vec![]), Instant::now());
        view.end_update("e1", &entity);

        assert_eq!(entity.borrow().id(), "e1");
        assert!(entity.borrow().effective_property("contains").is_none());
    }
}
