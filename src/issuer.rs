//! Request issuer: `invoke`, the caller side of a broker-mediated RPC call.
use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::codec::{self, Reviver};
use crate::config::RpcConfig;
use crate::error::{rpc_timeout_error, RpcError};
use crate::multiplexer::{self, PendingTable};
use crate::trace_scope::{CallType, TraceScope};
use crate::RabbitBroker;

/// Default (nameless) exchange: `basic_publish("", queue_name, ...)` routes directly to the
/// queue of the same name, the standard AMQP idiom for point-to-point RPC requests.
const DEFAULT_EXCHANGE: &str = "";

/// Per-call overrides for [`invoke`]. Any field left `None` falls back to [`RpcConfig`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Overrides [`RpcConfig::wait_timeout`] for this call only.
    pub wait_timeout: Option<Duration>,
    /// Caller-supplied free-form context, propagated onto the child [`TraceScope`] and the
    /// request's `headers.from.context`.
    pub context: Option<String>,
    /// When set, [`InvokeOutcome::raw`] carries the undecoded reply bytes alongside the decoded
    /// value, for callers that need to re-parse or forward the wire payload verbatim.
    pub with_raw: bool,
}

/// What [`invoke`] returns on success: the decoded result and the scope used, so callers that
/// chain further calls can continue the same trace lineage.
pub struct InvokeOutcome<R> {
    /// The decoded reply value.
    pub result: R,
    /// The scope this call ran under, with `call_type` stamped.
    pub scope: TraceScope,
    /// The undecoded reply bytes, present only when [`InvokeOptions::with_raw`] was set.
    pub raw: Option<Vec<u8>>,
}

/// Issues a broker-mediated RPC call to the procedure queue named `procedure`, replying to
/// `response_queue_name`, and awaits the matching reply via `pending`.
///
/// Steps:
/// 1. Mint a fresh correlation id.
/// 2. Install the pending-request entry *before* publishing (install-before-publish).
/// 3. Publish the request to the procedure queue with `reply_to`/`correlation_id`/`expiration`
///    and the `{tattoo, from}` headers.
/// 4. Await the reply, racing against the wait timeout.
/// 5. On timeout, cancel the pending entry and return a timeout error.
/// 6. Decode the reply, rehydrating a failure envelope into an [`RpcError`].
///
/// Unlike `register`'s pipeline, `invoke` has no hook points of its own: the hook pipeline
/// only runs on the side that owns a handler body, i.e. inside `register`.
///
/// # Errors
///
/// An [`RpcError`] either because the callee replied with one, the wait timeout elapsed, or the
/// reply payload could not be decoded.
#[allow(clippy::too_many_arguments)]
pub async fn invoke<A, R>(
    broker: &RabbitBroker,
    pending: &PendingTable,
    config: &RpcConfig,
    reviver: Option<&Reviver>,
    service_name: &str,
    hostname: &str,
    response_queue_name: &str,
    caller_scope: &TraceScope,
    procedure: &str,
    args: &A,
    opts: InvokeOptions,
) -> Result<InvokeOutcome<R>, RpcError>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let mut scope = caller_scope.child(CallType::Rpc);
    if let Some(context) = opts.context.clone() {
        scope.context = Some(context);
    }
    let wait_timeout = opts.wait_timeout.unwrap_or(config.wait_timeout);

    let correlation_id = Uuid::new_v4();
    let rx = multiplexer::install(pending, correlation_id);

    let result = run_invoke(
        broker,
        reviver,
        &scope,
        service_name,
        hostname,
        response_queue_name,
        procedure,
        args,
        wait_timeout,
        correlation_id,
        rx,
        opts.with_raw,
    )
    .await;

    match result {
        Ok((result, raw)) => Ok(InvokeOutcome { result, scope, raw }),
        Err(mut err) => {
            multiplexer::cancel(pending, correlation_id);
            err.merge_extra(serde_json::json!({ "tattoo": scope.tattoo.to_string() }));
            Err(err)
        }
    }
}

/// The body of [`invoke`] after the pending entry has been installed, split out so the error
/// path above always has a chance to cancel the entry.
#[allow(clippy::too_many_arguments)]
async fn run_invoke<A, R>(
    broker: &RabbitBroker,
    reviver: Option<&Reviver>,
    scope: &TraceScope,
    service_name: &str,
    hostname: &str,
    response_queue_name: &str,
    procedure: &str,
    args: &A,
    wait_timeout: Duration,
    correlation_id: Uuid,
    rx: tokio::sync::oneshot::Receiver<multiplexer::RawReply>,
    with_raw: bool,
) -> Result<(R, Option<Vec<u8>>), RpcError>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let bytes = serde_json::to_vec(args)
        .map_err(|err| RpcError::from_foreign("L0002_WRONG_PARAMETER_SCHEMA", &err))?;

    broker
        .basic_publish_builder(DEFAULT_EXCHANGE, procedure)
        .correlation_id(correlation_id)
        .reply_to(response_queue_name)
        .expiration(wait_timeout.as_millis().to_string())
        .headers(request_headers(scope, service_name, hostname))
        .publish_raw(bytes)
        .await
        .map_err(|err| RpcError::from_foreign("ETC_PUBLISH_FAILED", &err))?;

    let raw = tokio::time::timeout(wait_timeout, rx)
        .await
        .map_err(|_| rpc_timeout_error(procedure, wait_timeout))?
        .map_err(|err| RpcError::from_foreign("ETC_REPLY_SENDER_DROPPED", &err))?;

    let result = codec::decode_or_undecodable_error::<R>(&raw, reviver, procedure)?;
    Ok((result, with_raw.then_some(raw)))
}

/// Builds the `{tattoo, from: {node, context, island, call_type}}` header block carried on
/// every request.
fn request_headers(scope: &TraceScope, service_name: &str, hostname: &str) -> FieldTable {
    let mut from = FieldTable::default();
    from.insert("node".into(), AMQPValue::LongString(hostname.into()));
    from.insert(
        "context".into(),
        AMQPValue::LongString(scope.context.clone().unwrap_or_default().into()),
    );
    from.insert("island".into(), AMQPValue::LongString(service_name.into()));
    from.insert(
        "call_type".into(),
        AMQPValue::LongString(
            scope
                .call_type
                .map(|ct| format!("{ct:?}"))
                .unwrap_or_default()
                .into(),
        ),
    );

    let mut headers = FieldTable::default();
    headers.insert("tattoo".into(), AMQPValue::LongString(scope.tattoo.to_string().into()));
    headers.insert("from".into(), AMQPValue::FieldTable(from));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_options_default_to_none() {
        let opts = InvokeOptions::default();
        assert!(opts.wait_timeout.is_none());
        assert!(opts.context.is_none());
    }

    #[test]
    fn request_headers_carry_tattoo_and_from_block() {
        let scope = TraceScope::root();
        let headers = request_headers(&scope, "orders", "host-a");
        let AMQPValue::LongString(tattoo) = headers.inner().get("tattoo").unwrap() else {
            panic!("expected tattoo header");
        };
        assert_eq!(tattoo.as_str(), scope.tattoo.to_string());
        let AMQPValue::FieldTable(from) = headers.inner().get("from").unwrap() else {
            panic!("expected from header table");
        };
        let AMQPValue::LongString(island) = from.inner().get("island").unwrap() else {
            panic!("expected island in from block");
        };
        assert_eq!(island.as_str(), "orders");
    }
}
