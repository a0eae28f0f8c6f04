//! [`RpcService`]: ties the response multiplexer, request issuer, handler registrar, and
//! lifecycle operations together behind one per-process handle.
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use lapin::ConnectionProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::codec::{self, Reviver};
use crate::config::{RpcConfig, RpcServiceOptions};
use crate::error::RpcError;
use crate::hooks::{BodyHook, ErrorHook, HookKindMismatch, HookRegistry, RpcHookType};
use crate::issuer::{self, InvokeOptions, InvokeOutcome};
use crate::lifecycle::{self, ConsumerRecord};
use crate::multiplexer::{self, PendingTable};
use crate::registrar::{self, Handler, RegisterError, RpcOptions};
use crate::trace_scope::{CallType, TraceScope};
use crate::client::NewError as BrokerConnectError;
use crate::RabbitBroker;

/// Default consumer prefix for the response multiplexer's own consumer tag.
const RESPONSE_CONSUMER_PREFIX: &str = "rpc.response";

/// One running instance of the RPC engine for a named service: a
/// [`RabbitBroker`] connection, a hook registry, the private response queue's pending-request
/// table, and the set of currently-registered procedure consumers.
#[derive(Clone)]
pub struct RpcService {
    /// Broker connection and channel pool.
    broker: RabbitBroker,
    /// Environment-resolved timeouts/prefetch, snapshotted at connect time.
    config: RpcConfig,
    /// This service's name, stamped as `occurred_in` on outbound errors and used in queue
    /// naming.
    service_name: Arc<String>,
    /// Stamped into `headers.from.node` on every outbound request.
    hostname: Arc<String>,
    /// The hook pipeline shared by every registered procedure.
    hooks: Arc<HookRegistry>,
    /// Pending `invoke` calls awaiting a reply, keyed by correlation id.
    pending: PendingTable,
    /// This process's private, exclusive reply queue.
    response_queue_name: Arc<String>,
    /// Decode-side reviver, disabled when `RPC_NO_REVIVER` or `RpcServiceOptions::no_reviver`
    /// is set.
    reviver: Option<Reviver>,
    /// Live consumer records for every registered procedure, keyed by name.
    consumers: Arc<DashMap<String, ConsumerRecord>>,
}

impl RpcService {
    /// Connects to the broker, declares this process's private response queue, and starts the
    /// response multiplexer.
    ///
    /// # Errors
    ///
    /// When the broker connection fails, the response queue can not be declared, or the
    /// multiplexer's consumer can not be started.
    pub async fn connect(
        uri: impl AsRef<str>,
        props: ConnectionProperties,
        service_name: impl Into<String>,
        options: RpcServiceOptions,
    ) -> Result<Self, ConnectError> {
        let service_name = Arc::new(service_name.into());
        let broker = RabbitBroker::connect(uri, props, &service_name)
            .await
            .map_err(ConnectError::Broker)?;
        let config = *RpcConfig::global();
        let hostname = Arc::new(std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()));

        let response_queue_name = Arc::new(format!(
            "rpc.res.{service_name}.{hostname}.{}",
            Uuid::new_v4()
        ));
        broker
            .queue_declare_builder(&response_queue_name)
            .exclusive(true)
            .durable(false)
            .auto_delete(true)
            .declare()
            .await
            .map_err(|err| ConnectError::DeclareResponseQueue(err.into()))?;

        let pending: PendingTable = Arc::new(DashMap::new());
        let consumer_tag = format!("{RESPONSE_CONSUMER_PREFIX}.{service_name}.{}", Uuid::new_v4());
        multiplexer::start(
            &broker,
            &response_queue_name,
            &consumer_tag,
            config.prefetch,
            Arc::clone(&pending),
        )
        .await
        .map_err(|err| ConnectError::StartMultiplexer(err.into()))?;

        let reviver = if options.no_reviver || config.no_reviver_env {
            None
        } else {
            Some(codec::default_reviver())
        };

        info!(service = %service_name, response_queue = %response_queue_name, "rpc service connected");

        Ok(Self {
            broker,
            config,
            service_name,
            hostname,
            hooks: Arc::new(HookRegistry::default()),
            pending,
            response_queue_name,
            reviver,
            consumers: Arc::new(DashMap::new()),
        })
    }

    /// This service's name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// A fresh root [`TraceScope`], used by an external entrypoint (e.g. an HTTP handler) that
    /// has no parent scope of its own to thread through.
    #[must_use]
    pub fn root_scope(&self) -> TraceScope {
        TraceScope::root()
    }

    /// Issues a broker-mediated RPC call to `procedure`. `scope` is the caller's current
    /// [`TraceScope`] — pass [`Self::root_scope`] at an external entrypoint, or the scope a
    /// handler is already running under so nested calls share one `tattoo`.
    ///
    /// # Errors
    ///
    /// The callee's failure reply rehydrated into an [`RpcError`], a wait-timeout
    /// (`F0023_RPC_TIMEOUT`), or a publish/decode failure.
    pub async fn invoke<A, R>(
        &self,
        scope: &TraceScope,
        procedure: &str,
        args: &A,
        opts: InvokeOptions,
    ) -> Result<InvokeOutcome<R>, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        issuer::invoke(
            &self.broker,
            &self.pending,
            &self.config,
            self.reviver.as_ref(),
            &self.service_name,
            &self.hostname,
            &self.response_queue_name,
            scope,
            procedure,
            args,
            opts,
        )
        .await
    }

    /// Registers a handler for `procedure`. `handler` receives the decoded request body
    /// and the scope the call is running under, and returns the JSON result or an [`RpcError`].
    ///
    /// # Errors
    ///
    /// When the procedure queue can not be declared or its consumer can not be started.
    pub async fn register<F, Fut>(
        &self,
        name: &str,
        call_type: CallType,
        handler: F,
        rpc_options: RpcOptions,
    ) -> Result<(), RegisterError>
    where
        F: Fn(serde_json::Value, TraceScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |body, scope| Box::pin(handler(body, scope)));
        let record = registrar::register(
            &self.broker,
            Arc::clone(&self.hooks),
            &self.config,
            Arc::clone(&self.service_name),
            name,
            call_type,
            handler,
            rpc_options,
        )
        .await?;
        self.consumers.insert(name.to_string(), record);
        Ok(())
    }

    /// Registers a body hook.
    ///
    /// # Errors
    ///
    /// If `hook_type` names one of the four error variants.
    pub async fn register_hook(
        &self,
        hook_type: RpcHookType,
        hook: BodyHook,
    ) -> Result<(), HookKindMismatch> {
        self.hooks.register_hook(hook_type, hook).await
    }

    /// Registers an error hook.
    ///
    /// # Errors
    ///
    /// If `hook_type` names one of the four body variants.
    pub async fn register_error_hook(
        &self,
        hook_type: RpcHookType,
        hook: ErrorHook,
    ) -> Result<(), HookKindMismatch> {
        self.hooks.register_error_hook(hook_type, hook).await
    }

    /// Cancels `procedure`'s consumer tag, keeping its channel so [`Self::resume`] can
    /// re-subscribe later.
    ///
    /// # Errors
    ///
    /// When `procedure` is not registered, or cancelling its consumer fails.
    pub async fn pause(&self, procedure: &str) -> Result<(), LifecycleError> {
        let record = self
            .consumers
            .get(procedure)
            .ok_or_else(|| LifecycleError::NotRegistered(procedure.to_string()))?;
        lifecycle::pause(&record).await.map_err(LifecycleError::Lifecycle)
    }

    /// Re-subscribes `procedure`'s paused consumer.
    ///
    /// # Errors
    ///
    /// When `procedure` is not registered, or re-subscribing fails.
    pub async fn resume(&self, procedure: &str) -> Result<(), LifecycleError> {
        let record = self
            .consumers
            .get(procedure)
            .ok_or_else(|| LifecycleError::NotRegistered(procedure.to_string()))?;
        lifecycle::resume(&self.broker, &record)
            .await
            .map_err(LifecycleError::Lifecycle)
    }

    /// Cancels `procedure`'s consumer, releases its channel, and drops its record.
    ///
    /// # Errors
    ///
    /// When `procedure` is not registered, or tearing it down fails.
    pub async fn unregister(&self, procedure: &str) -> Result<(), LifecycleError> {
        let (_, record) = self
            .consumers
            .remove(procedure)
            .ok_or_else(|| LifecycleError::NotRegistered(procedure.to_string()))?;
        lifecycle::unregister(&record).await.map_err(LifecycleError::Lifecycle)
    }

    /// Resets every registered hook. Live consumers are left running.
    pub async fn purge(&self) {
        lifecycle::purge(&self.hooks).await;
    }

    /// Waits for every consumer (the response multiplexer and every registered procedure) to
    /// finish, or for the broker connection to error.
    ///
    /// # Errors
    ///
    /// When a consumer task panics/errors or the broker connection drops.
    pub async fn completion(&self) -> Result<(), crate::client::JoinConsumersError> {
        self.broker.completion().await
    }
}

/// Errors from [`RpcService::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Connecting to the broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerConnectError),
    /// Declaring the private response queue failed.
    #[error("declaring the response queue failed: {0}")]
    DeclareResponseQueue(anyhow::Error),
    /// Starting the response multiplexer's consumer failed.
    #[error("starting the response multiplexer failed: {0}")]
    StartMultiplexer(anyhow::Error),
}

/// Errors from a lifecycle call ([`RpcService::pause`]/[`RpcService::resume`]/
/// [`RpcService::unregister`]).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No procedure with this name is currently registered.
    #[error("no procedure named {0:?} is registered")]
    NotRegistered(String),
    /// The underlying broker operation failed.
    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_queue_name_is_unique_per_call() {
        let service = "orders".to_string();
        let hostname = "host-a".to_string();
        let a = format!("rpc.res.{service}.{hostname}.{}", Uuid::new_v4());
        let b = format!("rpc.res.{service}.{hostname}.{}", Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("rpc.res.orders.host-a."));
    }
}
