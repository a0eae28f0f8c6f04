//! Versioned response envelope: [`encode_ok`]/[`encode_err`]/[`decode`].
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{undecodable_reply_error, ErrorShape, RpcError};

/// Current envelope schema version. `0` is reserved for "undecodable".
const CURRENT_VERSION: u8 = 1;

/// `{version, result, body}` as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponseEnvelope {
    /// `1` for a well-formed envelope, `0` for "undecodable".
    version: u8,
    /// `true` when `body` is the success payload, `false` when it is an [`ErrorShape`].
    result: bool,
    /// The success payload or the [`ErrorShape`], depending on `result`.
    #[serde(default)]
    body: Value,
}

/// Encode a successful result as a `{version: 1, result: true, body}` envelope.
///
/// # Errors
///
/// Only if `value` itself cannot be represented as JSON (practically unreachable for
/// `Serialize` types built from owned data).
pub fn encode_ok<T>(value: &T) -> Result<Vec<u8>, EncodeError>
where
    T: Serialize,
{
    let envelope = ResponseEnvelope {
        version: CURRENT_VERSION,
        result: true,
        body: serde_json::to_value(value).map_err(|err| EncodeError(err.into()))?,
    };
    serde_json::to_vec(&envelope).map_err(|err| EncodeError(err.into()))
}

/// Encode a failure as a `{version: 1, result: false, body: ErrorShape}` envelope.
///
/// Never fails: encoding always produces bytes, falling back to a hand-built minimal
/// JSON object in the practically-unreachable case that `serde_json` itself errors.
#[must_use]
pub fn encode_err(err: &RpcError, occurred_in: &str) -> Vec<u8> {
    let shape = err.to_wire_shape(occurred_in);
    let envelope = ResponseEnvelope {
        version: CURRENT_VERSION,
        result: false,
        body: serde_json::to_value(&shape).unwrap_or_else(|_| Value::Null),
    };
    serde_json::to_vec(&envelope).unwrap_or_else(|_| {
        format!(
            r#"{{"version":1,"result":false,"body":{{"name":"EncodeFailure","message":"failed to encode error body","errorType":"ETC","statusCode":500}}}}"#
        )
        .into_bytes()
    })
}

/// Errors that can occur while encoding a success payload.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct EncodeError(#[from] anyhow::Error);

/// A transformer applied bottom-up over the decoded JSON tree before it is projected into `T`,
/// mirroring `JSON.parse(text, reviver)` semantics. The first argument is the key the
/// value was found under (`""` for the document root).
pub type Reviver = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Outcome of [`decode`].
pub enum DecodeOutcome<T> {
    /// The envelope was `{result: true, ..}` and `body` deserialized into `T`.
    Ok(T),
    /// The envelope was `{result: false, ..}`; `body` was rehydrated into an [`RpcError`].
    Err(RpcError),
    /// The payload was not valid JSON, was not a `{version, result, body}` envelope, or
    /// `body` did not deserialize into `T` despite `result: true`.
    Undecodable,
}

/// Decode a reply payload into `T`, rehydrating a failure envelope into an [`RpcError`] and
/// applying `reviver` (if given) to the parsed JSON tree before projection.
pub fn decode<T>(bytes: &[u8], reviver: Option<&Reviver>) -> DecodeOutcome<T>
where
    T: DeserializeOwned,
{
    let Ok(mut raw) = serde_json::from_slice::<Value>(bytes) else {
        debug!("reply payload is not valid JSON; treating as undecodable");
        return DecodeOutcome::Undecodable;
    };

    if let Some(reviver) = reviver {
        raw = revive(raw, "", reviver);
    }

    let Ok(envelope) = serde_json::from_value::<ResponseEnvelope>(raw) else {
        debug!("reply payload is not a recognised {{version, result, body}} envelope");
        return DecodeOutcome::Undecodable;
    };

    if envelope.version != CURRENT_VERSION {
        debug!(
            version = envelope.version,
            "peer reported an envelope version this crate does not recognise; treating as undecodable"
        );
        return DecodeOutcome::Undecodable;
    }

    if !envelope.result {
        return match serde_json::from_value::<ErrorShape>(envelope.body) {
            Ok(shape) => DecodeOutcome::Err(shape.into()),
            Err(_) => DecodeOutcome::Undecodable,
        };
    }

    match serde_json::from_value::<T>(envelope.body) {
        Ok(value) => DecodeOutcome::Ok(value),
        Err(_) => DecodeOutcome::Undecodable,
    }
}

/// Decode into `T`, turning [`DecodeOutcome::Undecodable`] into the typed
/// `ETC_UNDECODABLE_REPLY` error instead of leaving the caller to reject with nothing.
pub fn decode_or_undecodable_error<T>(
    bytes: &[u8],
    reviver: Option<&Reviver>,
    procedure: &str,
) -> Result<T, RpcError>
where
    T: DeserializeOwned,
{
    match decode(bytes, reviver) {
        DecodeOutcome::Ok(value) => Ok(value),
        DecodeOutcome::Err(err) => Err(err),
        DecodeOutcome::Undecodable => Err(undecodable_reply_error(procedure)),
    }
}

/// Apply `reviver` bottom-up: children are revived before the parent, mirroring
/// `JSON.parse`'s reviver walk order.
fn revive(value: Value, key: &str, reviver: &Reviver) -> Value {
    let walked = match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let revived = revive(v, &k, reviver);
                    (k, revived)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| revive(v, &i.to_string(), reviver))
                .collect(),
        ),
        other => other,
    };
    reviver(key, walked)
}

/// The default reviver: rehydrates strings that look like RFC 3339 timestamps into a
/// normalised UTC representation, the canonical "rehydrate `Date` strings" use case named in
/// the Glossary. Not a general type-rehydration framework.
#[must_use]
pub fn default_reviver() -> Reviver {
    Arc::new(|_key, value| match &value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::String(dt.with_timezone(&chrono::Utc).to_rfc3339()))
            .unwrap_or(value),
        _ => value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_success_value() {
        let bytes = encode_ok(&json!({"a": 1})).unwrap();
        let outcome = decode::<Value>(&bytes, None);
        match outcome {
            DecodeOutcome::Ok(value) => assert_eq!(value, json!({"a": 1})),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn round_trips_error_value() {
        let err = RpcError::logic("L0002_WRONG_PARAMETER_SCHEMA", "nope");
        let bytes = encode_err(&err, "callee-svc");
        match decode::<Value>(&bytes, None) {
            DecodeOutcome::Err(rehydrated) => {
                assert_eq!(rehydrated.error_key.as_deref(), Some("L0002_WRONG_PARAMETER_SCHEMA"));
                assert_eq!(rehydrated.occurred_in.as_deref(), Some("callee-svc"));
            }
            _ => panic!("expected Err"),
        }
    }

    #[test]
    fn garbage_bytes_are_undecodable() {
        match decode::<Value>(b"not json at all {{{", None) {
            DecodeOutcome::Undecodable => {}
            _ => panic!("expected Undecodable"),
        }
    }

    #[test]
    fn version_zero_is_undecodable() {
        let bytes = serde_json::to_vec(&json!({"version": 0, "result": false})).unwrap();
        match decode::<Value>(&bytes, None) {
            DecodeOutcome::Undecodable => {}
            _ => panic!("expected Undecodable"),
        }
    }

    #[test]
    fn undecodable_maps_to_typed_error() {
        let result = decode_or_undecodable_error::<Value>(b"{{{", None, "echo");
        let err = result.expect_err("garbage payload should error");
        assert_eq!(err.error_key.as_deref(), Some("ETC_UNDECODABLE_REPLY"));
        assert_eq!(err.status_code, 502);
    }

    #[test]
    fn reviver_runs_bottom_up_over_nested_values() {
        let order = std::sync::Mutex::new(Vec::<String>::new());
        let order = Arc::new(order);
        let recorder = Arc::clone(&order);
        let reviver: Reviver = Arc::new(move |key, value| {
            recorder.lock().unwrap().push(key.to_string());
            value
        });
        let bytes = encode_ok(&json!({"outer": {"inner": 1}})).unwrap();
        let _ = decode::<Value>(&bytes, Some(&reviver));
        let seen = order.lock().unwrap().clone();
        let inner_pos = seen.iter().position(|k| k == "inner").unwrap();
        let outer_pos = seen.iter().position(|k| k == "outer").unwrap();
        assert!(inner_pos < outer_pos, "children must be revived before their parent");
    }

    #[test]
    fn default_reviver_normalises_rfc3339_strings() {
        let reviver = default_reviver();
        let bytes = encode_ok(&json!({"at": "2024-01-02T03:04:05Z"})).unwrap();
        match decode::<Value>(&bytes, Some(&reviver)) {
            DecodeOutcome::Ok(value) => {
                assert_eq!(value["at"], json!("2024-01-02T03:04:05+00:00"));
            }
            _ => panic!("expected Ok"),
        }
    }
}
