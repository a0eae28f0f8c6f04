//! Handler registrar: `register(name, handler, call_type, rpc_options)` declares a
//! procedure queue and binds a consumer that runs the user handler inside a trace scope with
//! the hook pipeline and schema guards.
use std::sync::Arc;

use futures::future::BoxFuture;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::RpcConfig;
use crate::consume_envelope::{self, DeliveryHandler, HandlerOutcome};
use crate::error::{
    missing_reply_to_error, rpc_exec_timeout_error, wrong_parameter_schema_error, RpcError,
};
use crate::hooks::{BodyHookKind, ErrorHookKind, HookRegistry};
use crate::lifecycle::ConsumerRecord;
use crate::trace_scope::{CallType, TraceScope};
use crate::RabbitBroker;

/// Default (nameless) exchange, used for both procedure queues and replies.
const DEFAULT_EXCHANGE: &str = "";

/// A registered procedure's body: takes the decoded request body and the [`TraceScope`] it is
/// running under, returns the (JSON) result or an [`RpcError`].
pub type Handler =
    Arc<dyn Fn(Value, TraceScope) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// A pure JSON transform, used for request/result sanitization.
pub type Sanitizer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A JSON predicate, used for request/result validation. `Err` carries a
/// human-readable reason folded into `L0002_WRONG_PARAMETER_SCHEMA`'s message.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Sanitize/validate pair applied to one side (request or result) of a call.
#[derive(Clone, Default)]
pub struct SchemaSide {
    /// Applied first; transforms the value before validation.
    pub sanitization: Option<Sanitizer>,
    /// Applied after sanitization; rejects the call on `Err`.
    pub validation: Option<Validator>,
}

/// `rpcOptions.schema`: independent guards for the inbound request
/// ("query") and the outbound result.
#[derive(Clone, Default)]
pub struct SchemaOptions {
    /// Guards applied to the decoded request body.
    pub query: SchemaSide,
    /// Guards applied to the handler's result before it is encoded and replied.
    pub result: SchemaSide,
}

/// Per-registration options controlling request/result schema guards.
#[derive(Clone, Default)]
pub struct RpcOptions {
    /// Input/output schema guards, if any.
    pub schema: Option<SchemaOptions>,
}

/// Declares the procedure queue named `name` and starts a
/// consumer that wraps `handler` with the full envelope. Returns the [`ConsumerRecord`]
/// needed to pause/resume/unregister it later.
///
/// # Errors
///
/// When the queue can not be declared or the consumer can not be started.
pub async fn register(
    broker: &RabbitBroker,
    hooks: Arc<HookRegistry>,
    config: &RpcConfig,
    service_name: Arc<String>,
    name: &str,
    call_type: CallType,
    handler: Handler,
    rpc_options: RpcOptions,
) -> Result<ConsumerRecord, RegisterError> {
    let queue = broker
        .queue_declare_builder(name)
        .durable(false)
        .expires(config.queue_expires())
        .map_err(|err| RegisterError::Declare(err.into()))?
        .declare()
        .await
        .map_err(|err| RegisterError::Declare(err.into()))?;

    let consumer_tag = format!("rpc.consumer.{name}.{}", Uuid::new_v4());
    let chan = consume_envelope::open_consumer_channel(broker, config.prefetch)
        .await
        .map_err(|err| RegisterError::Declare(err.into()))?;

    let name_owned = name.to_string();
    let rpc_options = Arc::new(rpc_options);
    let broker_owned = broker.clone();
    let exec_timeout = config.exec_timeout;
    let delivery_handler: DeliveryHandler = Arc::new(move |delivery| {
        let broker = broker_owned.clone();
        let hooks = Arc::clone(&hooks);
        let service_name = Arc::clone(&service_name);
        let handler = Arc::clone(&handler);
        let rpc_options = Arc::clone(&rpc_options);
        let name = name_owned.clone();
        Box::pin(async move {
            handle_delivery(
                &broker, &delivery, &hooks, &service_name, &name, call_type, &handler, &rpc_options,
                exec_timeout,
            )
            .await
        })
    });

    consume_envelope::start_consumer_on_channel(
        broker,
        chan.clone(),
        queue.name().as_str(),
        &consumer_tag,
        Arc::clone(&delivery_handler),
    )
    .await
    .map_err(|err| RegisterError::Declare(err.into()))?;

    Ok(ConsumerRecord::new(
        chan,
        queue.name().to_string(),
        consumer_tag,
        delivery_handler,
    ))
}

/// The full per-delivery envelope described by steps 1-10.
#[allow(clippy::too_many_arguments)]
async fn handle_delivery(
    broker: &RabbitBroker,
    delivery: &Delivery,
    hooks: &HookRegistry,
    service_name: &str,
    name: &str,
    call_type: CallType,
    handler: &Handler,
    rpc_options: &RpcOptions,
    exec_timeout: std::time::Duration,
) -> HandlerOutcome {
    // Step 1: header validation. A request with no `reply_to` can never be answered; discard
    // it outright rather than entering a trace scope for a call nobody is waiting on.
    let Some(reply_to) = delivery.properties.reply_to().clone() else {
        warn!(procedure = name, "request is missing reply_to; discarding");
        return HandlerOutcome::Fatal(missing_reply_to_error(name));
    };
    let correlation_id = delivery
        .properties
        .correlation_id()
        .clone()
        .map(|id| id.to_string());
    let request_headers = delivery.properties.headers().clone().unwrap_or_default();
    let reply_to = reply_to.to_string();

    // Step 2-3: trace-log start and scope entry.
    let tattoo = parse_tattoo(&request_headers);
    let scope = TraceScope {
        tattoo,
        context: Some(name.to_string()),
        call_type: Some(call_type),
    };
    info!(
        procedure = name,
        tattoo = %scope.tattoo,
        payload_bytes = delivery.data.len(),
        "rpc request received"
    );

    let outcome = run_pipeline(delivery, hooks, name, call_type, handler, rpc_options, &scope, exec_timeout).await;

    match outcome {
        Ok(bytes) => {
            if let Err(err) = send_reply(broker, &reply_to, correlation_id.as_deref(), &request_headers, bytes).await {
                error!(procedure = name, %err, "failed to send rpc reply");
            }
            HandlerOutcome::Replied
        }
        Err(mut err) => {
            let pre_kind = HookRegistry::error_kind(call_type, ErrorHookKind::Pre);
            err = hooks.dohook_error(pre_kind, err, &scope).await;

            if err.is_requeue() {
                info!(procedure = name, "handler requested a requeue (503); suppressing reply");
                return HandlerOutcome::Requeue(err);
            }

            err.merge_extra(serde_json::json!({
                "island": service_name,
                "name": name,
            }));
            error!(procedure = name, error = %err.message, error_key = ?err.error_key, "rpc handler failed");

            let bytes = codec::encode_err(&err, service_name);
            let send_result = send_reply(broker, &reply_to, correlation_id.as_deref(), &request_headers, bytes).await;

            let post_kind = HookRegistry::error_kind(call_type, ErrorHookKind::Post);
            err = hooks.dohook_error(post_kind, err, &scope).await;

            if let Err(send_err) = send_result {
                error!(procedure = name, %send_err, "failed to send rpc error reply");
            }
            HandlerOutcome::ErrorReplied(err)
        }
    }
}

/// Steps 4-8 of: decode, input guards, pre-hook, handler (under the exec timeout),
/// post-hook, output guards. Returns the encoded success envelope bytes, or the [`RpcError`]
/// that should run the error branch.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    delivery: &Delivery,
    hooks: &HookRegistry,
    name: &str,
    call_type: CallType,
    handler: &Handler,
    rpc_options: &RpcOptions,
    scope: &TraceScope,
    exec_timeout: std::time::Duration,
) -> Result<Vec<u8>, RpcError> {
    let body: Value = serde_json::from_slice(&delivery.data)
        .map_err(|err| wrong_parameter_schema_error(format!("request body is not valid JSON: {err}")))?;
    run_pipeline_on_body(body, hooks, name, call_type, handler, rpc_options, scope, exec_timeout).await
}

/// The decoded-body half of [`run_pipeline`], split out so it can be exercised
/// in tests without a real `lapin::Delivery`.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline_on_body(
    mut body: Value,
    hooks: &HookRegistry,
    name: &str,
    call_type: CallType,
    handler: &Handler,
    rpc_options: &RpcOptions,
    scope: &TraceScope,
    exec_timeout: std::time::Duration,
) -> Result<Vec<u8>, RpcError> {
    if let Some(schema) = &rpc_options.schema {
        if let Some(sanitize) = &schema.query.sanitization {
            body = sanitize(body);
        }
        if let Some(validate) = &schema.query.validation {
            validate(&body).map_err(wrong_parameter_schema_error)?;
        }
    }

    let pre_kind = HookRegistry::body_kind(call_type, BodyHookKind::Pre);
    body = hooks.dohook_body(pre_kind, body, scope).await?;

    let result = tokio::time::timeout(exec_timeout, handler(body, scope.clone()))
        .await
        .map_err(|_| rpc_exec_timeout_error(name, exec_timeout))??;

    let post_kind = HookRegistry::body_kind(call_type, BodyHookKind::Post);
    let mut result = hooks.dohook_body(post_kind, result, scope).await?;

    if let Some(schema) = &rpc_options.schema {
        if let Some(sanitize) = &schema.result.sanitization {
            result = sanitize(result);
        }
        if let Some(validate) = &schema.result.validation {
            validate(&result).map_err(wrong_parameter_schema_error)?;
        }
    }

    codec::encode_ok(&result).map_err(|err| RpcError::from_foreign("F0000_ENCODE_FAILED", &err))
}

/// Encodes and publishes `bytes` to `reply_to`, copying the original `correlation_id` and
/// headers through.
async fn send_reply(
    broker: &RabbitBroker,
    reply_to: &str,
    correlation_id: Option<&str>,
    headers: &FieldTable,
    bytes: Vec<u8>,
) -> Result<(), RpcError> {
    let mut builder = broker
        .basic_publish_builder(DEFAULT_EXCHANGE, reply_to)
        .headers(headers.clone());
    if let Some(correlation_id) = correlation_id {
        if let Ok(uuid) = Uuid::parse_str(correlation_id) {
            builder = builder.correlation_id(uuid);
        }
    }
    builder
        .publish_raw(bytes)
        .await
        .map(|_| ())
        .map_err(|err| RpcError::from_foreign("F0000_REPLY_PUBLISH_FAILED", &err))
}

/// Extracts `headers.tattoo`, minting a fresh one if the header is absent or
/// not a valid UUID — a caller-side programming error we tolerate rather than reject.
fn parse_tattoo(headers: &FieldTable) -> Uuid {
    match headers.inner().get("tattoo") {
        Some(AMQPValue::LongString(s)) => Uuid::parse_str(s.as_str()).unwrap_or_else(|_| Uuid::new_v4()),
        _ => Uuid::new_v4(),
    }
}

/// Errors that can occur while registering a procedure.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// Declaring the procedure queue, or starting its consumer, failed.
    #[error(transparent)]
    Declare(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn root_scope() -> TraceScope {
        TraceScope {
            tattoo: Uuid::new_v4(),
            context: Some("echo".to_string()),
            call_type: Some(CallType::Rpc),
        }
    }

    fn echo_handler() -> Handler {
        Arc::new(|body, _scope| Box::pin(async move { Ok(body) }))
    }

    #[test]
    fn parse_tattoo_mints_fresh_uuid_when_missing() {
        let headers = FieldTable::default();
        // Two calls with no tattoo header must not collide.
        assert_ne!(parse_tattoo(&headers), parse_tattoo(&headers));
    }

    #[test]
    fn parse_tattoo_reads_valid_header() {
        let tattoo = Uuid::new_v4();
        let mut headers = FieldTable::default();
        headers.insert("tattoo".into(), AMQPValue::LongString(tattoo.to_string().into()));
        assert_eq!(parse_tattoo(&headers), tattoo);
    }

    #[tokio::test]
    async fn echo_handler_round_trips_through_the_pipeline() {
        let hooks = HookRegistry::default();
        let scope = root_scope();
        let bytes = run_pipeline_on_body(
            json!({"a": 1}),
            &hooks,
            "echo",
            CallType::Rpc,
            &echo_handler(),
            &RpcOptions::default(),
            &scope,
            Duration::from_secs(1),
        )
        .await
        .expect("handler should succeed");

        match codec::decode::<Value>(&bytes, None) {
            codec::DecodeOutcome::Ok(value) => assert_eq!(value, json!({"a": 1})),
            _ => panic!("expected a decodable success envelope"),
        }
    }

    #[tokio::test]
    async fn failing_query_validation_rejects_before_the_handler_runs() {
        let hooks = HookRegistry::default();
        let scope = root_scope();
        let rpc_options = RpcOptions {
            schema: Some(SchemaOptions {
                query: SchemaSide {
                    sanitization: None,
                    validation: Some(Arc::new(|body| {
                        if body.get("n").and_then(Value::as_i64).is_some() {
                            Ok(())
                        } else {
                            Err("n must be an integer".to_string())
                        }
                    })),
                },
                result: SchemaSide::default(),
            }),
        };

        let err = run_pipeline_on_body(
            json!({"n": "not a number"}),
            &hooks,
            "validate",
            CallType::Rpc,
            &echo_handler(),
            &rpc_options,
            &scope,
            Duration::from_secs(1),
        )
        .await
        .expect_err("validation should reject the call");

        assert_eq!(err.error_key.as_deref(), Some("L0002_WRONG_PARAMETER_SCHEMA"));
    }

    #[tokio::test]
    async fn pre_hook_transforms_body_before_the_handler_sees_it() {
        let hooks = HookRegistry::default();
        hooks
            .register_hook(
                crate::hooks::RpcHookType::PreRpc,
                Box::new(|mut body, _scope| {
                    Box::pin(async move {
                        body["hooked"] = json!(true);
                        Ok(body)
                    })
                }),
            )
            .await
            .unwrap();
        let scope = root_scope();

        let bytes = run_pipeline_on_body(
            json!({}),
            &hooks,
            "echo",
            CallType::Rpc,
            &echo_handler(),
            &RpcOptions::default(),
            &scope,
            Duration::from_secs(1),
        )
        .await
        .expect("handler should succeed");

        match codec::decode::<Value>(&bytes, None) {
            codec::DecodeOutcome::Ok(value) => assert_eq!(value["hooked"], json!(true)),
            _ => panic!("expected a decodable success envelope"),
        }
    }

    #[tokio::test]
    async fn handler_exceeding_exec_timeout_yields_fatal_timeout_error() {
        let hooks = HookRegistry::default();
        let scope = root_scope();
        let slow: Handler = Arc::new(|_body, _scope| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({}))
            })
        });

        let err = run_pipeline_on_body(
            json!({}),
            &hooks,
            "slow",
            CallType::Rpc,
            &slow,
            &RpcOptions::default(),
            &scope,
            Duration::from_millis(5),
        )
        .await
        .expect_err("handler should time out");

        assert_eq!(err.error_key.as_deref(), Some("F0024_RPC_EXEC_TIMEOUT"));
        assert_eq!(err.status_code, 500);
    }
}
