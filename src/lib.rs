//! Client-side core for the Atlas Objects wire protocol: session, type, and
//! entity state for a virtual-world client, driven by a host transport.
//!
//! This crate owns none of the bytes on the wire. A host hands decoded
//! [`Op`]s to a [`Connection`] through its [`Connection::inbound`] channel
//! and calls [`Connection::poll`] on whatever cadence it likes; the
//! connection drives the type lattice, the entity view, dead-reckoning
//! motion, and the redispatch queue from inside that one call, with no
//! locks and no background thread.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

pub mod config;
pub mod error;
pub mod event_bus;
pub mod motion;
pub mod op;
pub mod pending;
pub mod redispatch;
pub mod router;
pub mod task;
pub mod timer;
pub mod type_service;
pub mod value;
pub mod view;

pub use config::ClientConfig;
pub use error::Error;
pub use op::{Arg, Op, Serial};
pub use value::{Quaternion, Value, Vector3};

use event_bus::Signal;
use pending::{PendingRequests, SerialAllocator};
use redispatch::{RedispatchQueue, Trigger};
use router::{OpHandler, RequestOutcome, RouteOutcome, Router};
use timer::Timers;
use type_service::TypeService;
use view::View;

/// The client-side core of a single connection: everything in spec.md's
/// component list (C1-C9) wired together behind one cooperative [`poll`]
/// call. There is no background thread and no async runtime here — a host
/// transport feeds decoded ops in through [`Connection::inbound`] and calls
/// `poll` on whatever cadence it likes.
pub struct Connection {
    config: ClientConfig,
    inbound_tx: crossbeam_channel::Sender<Op>,
    inbound_rx: crossbeam_channel::Receiver<Op>,
    outgoing: Vec<Op>,
    pending: PendingRequests,
    serials: SerialAllocator,
    type_service: TypeService,
    view: View,
    redispatch: RedispatchQueue,
    timers: Timers,
    router: Router,
    newly_bound: Rc<RefCell<Vec<String>>>,
    _bound_sub: event_bus::Subscription<type_service::TypeRef>,
    pub login_success: Signal<Op>,
    pub login_failure: Signal<String>,
    pub logout_success: Signal<()>,
    pub look_result: Signal<(String, Op)>,
    pub look_failure: Signal<(String, String)>,
    pub create_success: Signal<Op>,
    pub create_failure: Signal<String>,
    pub possess_success: Signal<(String, Op)>,
    pub possess_failure: Signal<(String, String)>,
}

impl Connection {
    pub fn new(local_entity: impl Into<String>, config: ClientConfig) -> Connection {
        let local_entity = local_entity.into();
        let pending = PendingRequests::new();
        let serials = SerialAllocator::new();
        let mut type_service = TypeService::new(pending.clone(), serials.clone(), local_entity.clone(), &config.seed_types);

        let newly_bound = Rc::new(RefCell::new(Vec::new()));
        let buf = newly_bound.clone();
        let bound_sub = type_service.bound_signal().subscribe(move |t| buf.borrow_mut().push(t.borrow().name().to_string()));

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();

        Connection {
            config,
            inbound_tx,
            inbound_rx,
            outgoing: Vec::new(),
            router: Router::new(pending.clone()),
            pending,
            serials,
            type_service,
            view: View::new(),
            redispatch: RedispatchQueue::new(),
            timers: Timers::new(),
            newly_bound,
            _bound_sub: bound_sub,
            login_success: Signal::new(),
            login_failure: Signal::new(),
            logout_success: Signal::new(),
            look_result: Signal::new(),
            look_failure: Signal::new(),
            create_success: Signal::new(),
            create_failure: Signal::new(),
            possess_success: Signal::new(),
            possess_failure: Signal::new(),
        }
    }

    fn report_request_outcome(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::LoginSuccess(op) => self.login_success.emit(&op),
            RequestOutcome::LoginFailure(msg) => self.login_failure.emit(&msg),
            RequestOutcome::LogoutSuccess => self.logout_success.emit(&()),
            RequestOutcome::LookResult { entity_id, op } => self.look_result.emit(&(entity_id, op)),
            RequestOutcome::LookFailure { entity_id, message } => self.look_failure.emit(&(entity_id, message)),
            RequestOutcome::CreateSuccess(op) => self.create_success.emit(&op),
            RequestOutcome::CreateFailure(msg) => self.create_failure.emit(&msg),
            RequestOutcome::PossessSuccess { entity_id, op } => self.possess_success.emit(&(entity_id, op)),
            RequestOutcome::PossessFailure { entity_id, message } => self.possess_failure.emit(&(entity_id, message)),
        }
    }

    /// The sending half a host transport pushes decoded ops into. Cheap to
    /// clone; safe to hand to whatever thread or callback owns the socket,
    /// since `crossbeam_channel` itself is `Send`/`Sync` even though
    /// everything downstream of [`Connection::poll`] is not.
    pub fn inbound(&self) -> crossbeam_channel::Sender<Op> {
        self.inbound_tx.clone()
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn type_service(&self) -> &TypeService {
        &self.type_service
    }

    pub fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Ops ready to hand to the host transport since the last call.
    pub fn drain_outgoing(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.outgoing)
    }

    /// Drives every cooperative subsystem one step: fires due timers,
    /// drains and routes every op the host has pushed in since the last
    /// call, then re-feeds anything the redispatch queue was waiting on
    /// for a type that only just became bound.
    pub fn poll(&mut self, now: Instant) {
        self.timers.poll(now);

        let inbound: Vec<Op> = self.inbound_rx.try_iter().collect();
        for op in inbound {
            self.dispatch(op, self.config.redispatch_attempts);
        }

        let bound_names: Vec<String> = self.newly_bound.borrow_mut().drain(..).collect();
        for name in bound_names {
            let trigger = Trigger::type_bound(name);
            for (op, attempts_left) in self.redispatch.drain_with_attempts(&trigger) {
                self.dispatch(op, attempts_left);
            }
        }

        self.outgoing.append(&mut self.type_service.drain_outgoing());
    }

    fn dispatch(&mut self, op: Op, attempts: u32) {
        let mut handlers: [&mut dyn OpHandler; 1] = [&mut self.view];
        match self.router.route(&op, &mut self.type_service, &mut handlers) {
            RouteOutcome::Handled(Some(outcome)) => self.report_request_outcome(outcome),
            RouteOutcome::Handled(None) | RouteOutcome::HandledByChain | RouteOutcome::Ignored => {}
            RouteOutcome::WillRedispatch(names) => {
                if attempts == 0 {
                    tracing::warn!(class = op.class(), "redispatch attempts exhausted, dropping op");
                    return;
                }
                let triggers = names.into_iter().map(Trigger::type_bound).collect();
                if let Err(dropped) = self.redispatch.park(op, triggers, attempts) {
                    tracing::warn!(class = dropped.class(), "dropped op: no unbound types to wait on");
                }
            }
        }
    }

    /// Issues a LOGIN request, tracking its serial in the pending-request
    /// table so the reply (success or `error`) reaches
    /// [`Connection::login_success`] / [`Connection::login_failure`].
    pub fn login(&mut self, username: &str, password: &str) -> Op {
        let serial = self.next_serial();
        self.pending.insert(serial, pending::PendingKind::Login);

        let pending = self.pending.clone();
        let login_failure = self.login_failure.clone();
        self.timers.schedule(Instant::now() + self.config.login_timeout, move || {
            if pending.take(serial).is_some() {
                login_failure.emit(&"login request timed out".to_string());
            }
        });

        let op = Op::new("login", vec!["login".into()])
            .with_serial(serial)
            .with_args(vec![Arg::Value(Value::Map(
                [
                    ("username".to_string(), Value::String(username.to_string())),
                    ("password".to_string(), Value::String(password.to_string())),
                ]
                .into_iter()
                .collect(),
            ))]);
        self.outgoing.push(op.clone());
        op
    }

    pub fn logout(&mut self) -> Op {
        let serial = self.next_serial();
        self.pending.insert(serial, pending::PendingKind::Logout);
        let op = Op::new("logout", vec!["logout".into()]).with_serial(serial);
        self.outgoing.push(op.clone());
        op
    }

    /// Requests a full snapshot of `entity_id`, tracking the reply via
    /// [`Connection::look_result`] / [`Connection::look_failure`].
    pub fn look(&mut self, entity_id: &str) -> Op {
        let serial = self.next_serial();
        self.pending.insert(serial, pending::PendingKind::Look { entity_id: entity_id.to_string() });
        let op = Op::new("look", vec!["look".into()]).with_serial(serial).with_to(entity_id);
        self.outgoing.push(op.clone());
        op
    }

    /// Requests control of `entity_id`, tracking the reply via
    /// [`Connection::possess_success`] / [`Connection::possess_failure`].
    pub fn possess(&mut self, entity_id: &str, key: &str) -> Op {
        let serial = self.next_serial();
        self.pending.insert(serial, pending::PendingKind::Possess { entity_id: entity_id.to_string() });
        let op = Op::new("possess", vec!["possess".into()]).with_serial(serial).with_args(vec![Arg::Value(
            Value::Map(
                [
                    ("id".to_string(), Value::String(entity_id.to_string())),
                    ("key".to_string(), Value::String(key.to_string())),
                ]
                .into_iter()
                .collect(),
            ),
        )]);
        self.outgoing.push(op.clone());
        op
    }

    fn next_serial(&self) -> Serial {
        self.serials.next()
    }
}
