//! [`HookRegistry`]: the closed-sum-type hook pipeline.
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::RpcError;
use crate::trace_scope::TraceScope;

/// The eight hook points a registered handler runs through, split by whether the call entered
/// as a plain endpoint or as an RPC call, and by whether it runs before/after the handler body
/// or the error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcHookType {
    /// Before an endpoint-invoked handler's body runs.
    PreEndpoint,
    /// After an endpoint-invoked handler's body returns successfully.
    PostEndpoint,
    /// Before an RPC-invoked handler's body runs.
    PreRpc,
    /// After an RPC-invoked handler's body returns successfully.
    PostRpc,
    /// When an endpoint-invoked handler's pipeline raises an error.
    PreEndpointError,
    /// After `PreEndpointError` hooks run, just before the error reply is sent.
    PostEndpointError,
    /// When an RPC-invoked handler's pipeline raises an error.
    PreRpcError,
    /// After `PreRpcError` hooks run, just before the error reply is sent.
    PostRpcError,
}

/// Returned by [`HookRegistry::register_hook`]/[`HookRegistry::register_error_hook`] when the
/// caller names an [`RpcHookType`] variant of the wrong kind (a body kind passed to
/// `register_error_hook`, or vice versa).
#[derive(Debug, thiserror::Error)]
#[error("{hook_type:?} is {expected}; use the matching register_* method")]
pub struct HookKindMismatch {
    /// The variant the caller actually passed.
    hook_type: RpcHookType,
    /// A human-readable description of the kind `hook_type` actually belongs to.
    expected: &'static str,
}

/// The non-error (body) hook kinds, selected by `call_type` in `register`'s pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyHookKind {
    /// Runs before the handler body.
    Pre,
    /// Runs after the handler body.
    Post,
}

/// The error hook kinds, selected by `call_type` in `register`'s error branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHookKind {
    /// Runs as soon as an error is observed, before it is replied.
    Pre,
    /// Runs just before the (possibly hook-transformed) error is replied.
    Post,
}

/// A body-transforming hook: receives the current JSON body and the active [`TraceScope`],
/// returns the (possibly modified) body.
pub type BodyHook =
    Box<dyn Fn(Value, &TraceScope) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// An error-observing/transforming hook: receives the current [`RpcError`] and [`TraceScope`],
/// returns the (possibly modified) error.
pub type ErrorHook = Box<dyn Fn(RpcError, &TraceScope) -> BoxFuture<'static, RpcError> + Send + Sync>;

/// Per-process registry of hooks, one list per [`RpcHookType`] variant so folding a pipeline is
/// a compile-time-checked match rather than a dynamic map lookup keyed by string.
#[derive(Default)]
pub struct HookRegistry {
    pre_endpoint: tokio::sync::RwLock<Vec<BodyHook>>,
    post_endpoint: tokio::sync::RwLock<Vec<BodyHook>>,
    pre_rpc: tokio::sync::RwLock<Vec<BodyHook>>,
    post_rpc: tokio::sync::RwLock<Vec<BodyHook>>,
    pre_endpoint_error: tokio::sync::RwLock<Vec<ErrorHook>>,
    post_endpoint_error: tokio::sync::RwLock<Vec<ErrorHook>>,
    pre_rpc_error: tokio::sync::RwLock<Vec<ErrorHook>>,
    post_rpc_error: tokio::sync::RwLock<Vec<ErrorHook>>,
}

impl HookRegistry {
    /// Register a body hook under `hook_type`.
    ///
    /// # Errors
    ///
    /// If `hook_type` names one of the four error variants; use
    /// [`Self::register_error_hook`] for those.
    pub async fn register_hook(
        &self,
        hook_type: RpcHookType,
        hook: BodyHook,
    ) -> Result<(), HookKindMismatch> {
        let slot = match hook_type {
            RpcHookType::PreEndpoint => &self.pre_endpoint,
            RpcHookType::PostEndpoint => &self.post_endpoint,
            RpcHookType::PreRpc => &self.pre_rpc,
            RpcHookType::PostRpc => &self.post_rpc,
            other => return Err(HookKindMismatch { hook_type: other, expected: "a body hook" }),
        };
        slot.write().await.push(hook);
        Ok(())
    }

    /// Register an error hook under `hook_type`.
    ///
    /// # Errors
    ///
    /// If `hook_type` names a body hook variant.
    pub async fn register_error_hook(
        &self,
        hook_type: RpcHookType,
        hook: ErrorHook,
    ) -> Result<(), HookKindMismatch> {
        let slot = match hook_type {
            RpcHookType::PreEndpointError => &self.pre_endpoint_error,
            RpcHookType::PostEndpointError => &self.post_endpoint_error,
            RpcHookType::PreRpcError => &self.pre_rpc_error,
            RpcHookType::PostRpcError => &self.post_rpc_error,
            other => return Err(HookKindMismatch { hook_type: other, expected: "an error hook" }),
        };
        slot.write().await.push(hook);
        Ok(())
    }

    /// Fold `body` through every hook registered under `hook_type`, in registration order.
    /// Short-circuits on the first hook that errors.
    pub async fn dohook_body(
        &self,
        hook_type: RpcHookType,
        mut body: Value,
        scope: &TraceScope,
    ) -> Result<Value, RpcError> {
        let slot = match hook_type {
            RpcHookType::PreEndpoint => &self.pre_endpoint,
            RpcHookType::PostEndpoint => &self.post_endpoint,
            RpcHookType::PreRpc => &self.pre_rpc,
            RpcHookType::PostRpc => &self.post_rpc,
            RpcHookType::PreEndpointError
            | RpcHookType::PostEndpointError
            | RpcHookType::PreRpcError
            | RpcHookType::PostRpcError => return Ok(body),
        };
        for hook in slot.read().await.iter() {
            body = hook(body, scope).await?;
        }
        Ok(body)
    }

    /// Fold `error` through every hook registered under `hook_type`, in registration order.
    pub async fn dohook_error(
        &self,
        hook_type: RpcHookType,
        mut error: RpcError,
        scope: &TraceScope,
    ) -> RpcError {
        let slot = match hook_type {
            RpcHookType::PreEndpointError => &self.pre_endpoint_error,
            RpcHookType::PostEndpointError => &self.post_endpoint_error,
            RpcHookType::PreRpcError => &self.pre_rpc_error,
            RpcHookType::PostRpcError => &self.post_rpc_error,
            RpcHookType::PreEndpoint
            | RpcHookType::PostEndpoint
            | RpcHookType::PreRpc
            | RpcHookType::PostRpc => return error,
        };
        for hook in slot.read().await.iter() {
            error = hook(error, scope).await;
        }
        error
    }

    /// The `Pre`/`Post` body hook variant for `call_type`.
    #[must_use]
    pub fn body_kind(call_type: crate::trace_scope::CallType, kind: BodyHookKind) -> RpcHookType {
        use crate::trace_scope::CallType;
        match (call_type, kind) {
            (CallType::Endpoint, BodyHookKind::Pre) => RpcHookType::PreEndpoint,
            (CallType::Endpoint, BodyHookKind::Post) => RpcHookType::PostEndpoint,
            (CallType::Rpc, BodyHookKind::Pre) => RpcHookType::PreRpc,
            (CallType::Rpc, BodyHookKind::Post) => RpcHookType::PostRpc,
        }
    }

    /// The `Pre`/`Post` error hook variant for `call_type`.
    #[must_use]
    pub fn error_kind(call_type: crate::trace_scope::CallType, kind: ErrorHookKind) -> RpcHookType {
        use crate::trace_scope::CallType;
        match (call_type, kind) {
            (CallType::Endpoint, ErrorHookKind::Pre) => RpcHookType::PreEndpointError,
            (CallType::Endpoint, ErrorHookKind::Post) => RpcHookType::PostEndpointError,
            (CallType::Rpc, ErrorHookKind::Pre) => RpcHookType::PreRpcError,
            (CallType::Rpc, ErrorHookKind::Post) => RpcHookType::PostRpcError,
        }
    }

    /// Drop every registered hook. Does not touch consumers or pending requests.
    pub async fn purge(&self) {
        self.pre_endpoint.write().await.clear();
        self.post_endpoint.write().await.clear();
        self.pre_rpc.write().await.clear();
        self.post_rpc.write().await.clear();
        self.pre_endpoint_error.write().await.clear();
        self.post_endpoint_error.write().await.clear();
        self.pre_rpc_error.write().await.clear();
        self.post_rpc_error.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_scope::CallType;
    use serde_json::json;

    #[tokio::test]
    async fn body_hooks_fold_in_registration_order() {
        let registry = HookRegistry::default();
        registry
            .register_hook(
                RpcHookType::PreRpc,
                Box::new(|body, _scope| {
                    Box::pin(async move {
                        let mut body = body;
                        body["steps"].as_array_mut().unwrap().push(json!("first"));
                        Ok(body)
                    })
                }),
            )
            .await
            .unwrap();
        registry
            .register_hook(
                RpcHookType::PreRpc,
                Box::new(|body, _scope| {
                    Box::pin(async move {
                        let mut body = body;
                        body["steps"].as_array_mut().unwrap().push(json!("second"));
                        Ok(body)
                    })
                }),
            )
            .await
            .unwrap();

        let scope = TraceScope::root();
        let result = registry
            .dohook_body(RpcHookType::PreRpc, json!({"steps": []}), &scope)
            .await
            .unwrap();
        assert_eq!(result["steps"], json!(["first", "second"]));
    }

    #[tokio::test]
    async fn body_hook_short_circuits_on_error() {
        let registry = HookRegistry::default();
        registry
            .register_hook(
                RpcHookType::PreRpc,
                Box::new(|_body, _scope| {
                    Box::pin(async move { Err(RpcError::logic("L0002_WRONG_PARAMETER_SCHEMA", "bad")) })
                }),
            )
            .await
            .unwrap();
        let scope = TraceScope::root();
        let result = registry.dohook_body(RpcHookType::PreRpc, json!({}), &scope).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn error_hooks_can_annotate_extra() {
        let registry = HookRegistry::default();
        registry
            .register_error_hook(
                RpcHookType::PreRpcError,
                Box::new(|mut err, _scope| {
                    Box::pin(async move {
                        err.merge_extra(json!({"annotated": true}));
                        err
                    })
                }),
            )
            .await
            .unwrap();
        let scope = TraceScope::root();
        let err = registry
            .dohook_error(RpcHookType::PreRpcError, RpcError::fatal("F0000", "boom"), &scope)
            .await;
        assert_eq!(err.extra["annotated"], json!(true));
    }

    #[test]
    fn body_kind_maps_call_type_and_phase() {
        assert_eq!(
            HookRegistry::body_kind(CallType::Rpc, BodyHookKind::Pre),
            RpcHookType::PreRpc
        );
        assert_eq!(
            HookRegistry::body_kind(CallType::Endpoint, BodyHookKind::Post),
            RpcHookType::PostEndpoint
        );
    }

    #[tokio::test]
    async fn purge_clears_all_registered_hooks() {
        let registry = HookRegistry::default();
        registry
            .register_hook(
                RpcHookType::PreRpc,
                Box::new(|body, _scope| Box::pin(async move { Ok(body) })),
            )
            .await
            .unwrap();
        registry.purge().await;
        let scope = TraceScope::root();
        let result = registry
            .dohook_body(RpcHookType::PreRpc, json!({"untouched": true}), &scope)
            .await
            .unwrap();
        assert_eq!(result, json!({"untouched": true}));
    }

    #[tokio::test]
    async fn registering_a_body_hook_under_an_error_kind_errs_without_panicking() {
        let registry = HookRegistry::default();
        let err = registry
            .register_hook(
                RpcHookType::PreRpcError,
                Box::new(|body, _scope| Box::pin(async move { Ok(body) })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.hook_type, RpcHookType::PreRpcError);
    }

    #[tokio::test]
    async fn registering_an_error_hook_under_a_body_kind_errs_without_panicking() {
        let registry = HookRegistry::default();
        let err = registry
            .register_error_hook(
                RpcHookType::PreRpc,
                Box::new(|err, _scope| Box::pin(async move { err })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.hook_type, RpcHookType::PreRpc);
    }
}
