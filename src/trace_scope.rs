//! [`TraceScope`]: the explicit, per-call tracing context threaded through `invoke`/`register`.
use uuid::Uuid;

/// How a call entered the engine, carried on [`TraceScope`] for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// A broker-mediated RPC call issued via `invoke`.
    Rpc,
    /// A handler invoked directly (e.g. from an HTTP endpoint) sharing the same trace lineage.
    Endpoint,
}

/// Explicit per-call trace context, passed by value instead of read from a continuation-local
/// namespace: every `invoke`/`register` caller threads it through as a parameter rather than
/// relying on an ambient/thread-local lookup.
#[derive(Debug, Clone)]
pub struct TraceScope {
    /// Correlates every log line and nested call belonging to one logical request.
    pub tattoo: Uuid,
    /// Caller-supplied free-form context string, propagated to callees.
    pub context: Option<String>,
    /// How the current call entered the engine, if known.
    pub call_type: Option<CallType>,
}

impl TraceScope {
    /// A fresh root scope with a new `tattoo`, used when no caller scope exists yet.
    #[must_use]
    pub fn root() -> Self {
        Self {
            tattoo: Uuid::new_v4(),
            context: None,
            call_type: None,
        }
    }

    /// Derive a child scope for a nested call, keeping the same `tattoo` and `context` but
    /// stamping the child's `call_type`.
    #[must_use]
    pub fn child(&self, call_type: CallType) -> Self {
        Self {
            tattoo: self.tattoo,
            context: self.context.clone(),
            call_type: Some(call_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_scopes_get_distinct_tattoos() {
        let a = TraceScope::root();
        let b = TraceScope::root();
        assert_ne!(a.tattoo, b.tattoo);
    }

    #[test]
    fn child_preserves_tattoo_and_context() {
        let mut root = TraceScope::root();
        root.context = Some("order-42".to_string());
        let child = root.child(CallType::Rpc);
        assert_eq!(child.tattoo, root.tattoo);
        assert_eq!(child.context.as_deref(), Some("order-42"));
        assert_eq!(child.call_type, Some(CallType::Rpc));
    }
}
