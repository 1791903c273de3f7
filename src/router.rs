//! C5 — Operation Router.
//!
//! A first-hit chain of handlers (spec.md §4.5): refno correlation against
//! the pending-request table runs first, then each registered handler gets
//! a turn, in order, until one reports it handled the op. If none do, and
//! the op references a type that is not yet bound, the op is reported back
//! to the caller as `WillRedispatch` so it can be queued in the redispatch
//! table (C9) rather than dropped.

use crate::op::Op;
use crate::pending::{PendingKind, PendingRequests};
use crate::type_service::TypeService;

/// What the router decided to do with an inbound op.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Handled by refno correlation; carries the resolved request, if any
    /// (a type lookup reply resolves silently, with nothing to report).
    Handled(Option<RequestOutcome>),
    /// Handled by one of the `OpHandler`s in the chain.
    HandledByChain,
    Ignored,
    /// Blocked on the named types becoming bound; the caller should enqueue
    /// the op under each name's `type-bound:<name>` trigger.
    WillRedispatch(Vec<String>),
}

/// A stage in the router's handler chain. Each concrete handler (the view,
/// the task tracker, ...) implements this against the parts of the op it
/// understands, and leaves everything else for the next handler.
pub trait OpHandler {
    fn try_handle(&mut self, op: &Op, type_service: &mut TypeService) -> bool;
}

/// Fired when a request tracked in the pending-request table comes back.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    LoginSuccess(Op),
    LoginFailure(String),
    LogoutSuccess,
    LookResult { entity_id: String, op: Op },
    LookFailure { entity_id: String, message: String },
    CreateSuccess(Op),
    CreateFailure(String),
    PossessSuccess { entity_id: String, op: Op },
    PossessFailure { entity_id: String, message: String },
}

pub struct Router {
    pending: PendingRequests,
}

impl Router {
    pub fn new(pending: PendingRequests) -> Router {
        Router { pending }
    }

    /// Routes a single inbound op through the chain. `handlers` runs in
    /// order; the first one to return `true` from `try_handle` wins.
    pub fn route(
        &mut self,
        op: &Op,
        type_service: &mut TypeService,
        handlers: &mut [&mut dyn OpHandler],
    ) -> RouteOutcome {
        if let Some(refno) = op.refno() {
            if let Some(kind) = self.pending.take(refno) {
                if let PendingKind::TypeLookup(name) = &kind {
                    type_service.handle_reply(name, op);
                    return RouteOutcome::Handled(None);
                }
                return RouteOutcome::Handled(request_outcome(kind, op));
            }
        }

        for handler in handlers.iter_mut() {
            if handler.try_handle(op, type_service) {
                return RouteOutcome::HandledByChain;
            }
        }

        let unbound = type_service.verify_object_types(op);
        if !unbound.is_empty() {
            tracing::debug!(class = op.class(), ?unbound, "op blocked on unbound types");
            return RouteOutcome::WillRedispatch(unbound);
        }

        tracing::debug!(class = op.class(), "op ignored by every handler");
        RouteOutcome::Ignored
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }
}

fn request_outcome(kind: PendingKind, op: &Op) -> Option<RequestOutcome> {
    let is_error = op.is_a("error");
    Some(match kind {
        PendingKind::TypeLookup(_) => return None,
        PendingKind::Login if is_error => RequestOutcome::LoginFailure(error_message(op)),
        PendingKind::Login => RequestOutcome::LoginSuccess(op.clone()),
        PendingKind::Logout => RequestOutcome::LogoutSuccess,
        PendingKind::Look { entity_id } if is_error => {
            RequestOutcome::LookFailure { entity_id, message: error_message(op) }
        }
        PendingKind::Look { entity_id } => RequestOutcome::LookResult { entity_id, op: op.clone() },
        PendingKind::Create if is_error => RequestOutcome::CreateFailure(error_message(op)),
        PendingKind::Create => RequestOutcome::CreateSuccess(op.clone()),
        PendingKind::Possess { entity_id } if is_error => {
            RequestOutcome::PossessFailure { entity_id, message: error_message(op) }
        }
        PendingKind::Possess { entity_id } => RequestOutcome::PossessSuccess { entity_id, op: op.clone() },
    })
}

fn error_message(op: &Op) -> String {
    op.args()
        .iter()
        .find_map(|arg| arg.as_value().and_then(|v| v.as_str()))
        .unwrap_or("unknown error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::SerialAllocator;

    struct AlwaysIgnore;
    impl OpHandler for AlwaysIgnore {
        fn try_handle(&mut self, _op: &Op, _type_service: &mut TypeService) -> bool {
            false
        }
    }

    struct AlwaysHandle;
    impl OpHandler for AlwaysHandle {
        fn try_handle(&mut self, _op: &Op, _type_service: &mut TypeService) -> bool {
            true
        }
    }

    fn new_type_service() -> TypeService {
        TypeService::new(PendingRequests::new(), SerialAllocator::new(), "avatar-1", &[])
    }

    #[test]
    fn refno_match_retires_the_pending_entry_and_reports_handled() {
        let pending = PendingRequests::new();
        pending.insert(9, PendingKind::Login);
        let mut router = Router::new(pending);
        let mut ts = new_type_service();
        let op = Op::new("info", Vec::new()).with_refno(9);
        let outcome = router.route(&op, &mut ts, &mut []);
        assert!(matches!(outcome, RouteOutcome::Handled(Some(RequestOutcome::LoginSuccess(_)))));
        assert!(!router.pending().contains(9));
    }

    #[test]
    fn falls_through_to_next_handler() {
        let mut router = Router::new(PendingRequests::new());
        let mut ts = new_type_service();
        let op = Op::new("sight", vec![crate::type_service::ROOT_OPERATION.to_string()]);
        let mut ignore = AlwaysIgnore;
        let mut handle = AlwaysHandle;
        let outcome = router.route(&op, &mut ts, &mut [&mut ignore, &mut handle]);
        assert!(matches!(outcome, RouteOutcome::HandledByChain));
    }

    #[test]
    fn unhandled_op_with_unbound_type_is_will_redispatch() {
        let mut router = Router::new(PendingRequests::new());
        let mut ts = new_type_service();
        let op = Op::new("sight", vec!["perception".into()]);
        let mut ignore = AlwaysIgnore;
        let outcome = router.route(&op, &mut ts, &mut [&mut ignore]);
        assert!(matches!(outcome, RouteOutcome::WillRedispatch(names) if names == vec!["perception".to_string()]));
    }

    #[test]
    fn unhandled_op_with_bound_types_is_ignored() {
        let mut router = Router::new(PendingRequests::new());
        let mut ts = new_type_service();
        let op = Op::new("sight", vec![crate::type_service::ROOT_OPERATION.to_string()]);
        let mut ignore = AlwaysIgnore;
        let outcome = router.route(&op, &mut ts, &mut [&mut ignore]);
        assert!(matches!(outcome, RouteOutcome::Ignored));
    }
}
