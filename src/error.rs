//! [`RpcError`] domain type and its [`ErrorShape`] wire projection.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Taxonomy of a failure, mirrored on the wire as `ErrorShape::error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RpcErrorKind {
    /// Caller-attributable, e.g. a bad schema.
    Logic,
    /// Engine-attributable, e.g. a timeout or a missing `reply_to`.
    Fatal,
    /// Rehydrated on the receive side from an `errorType` this crate does not recognise.
    Etc,
}

impl<'de> Deserialize<'de> for RpcErrorKind {
    /// Any `errorType` this crate does not recognise rehydrates as [`Self::Etc`] instead
    /// of failing the whole envelope decode.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "LOGIC" => Self::Logic,
            "FATAL" => Self::Fatal,
            _ => Self::Etc,
        })
    }
}

/// A failure raised by a handler, or reconstructed from a failure reply.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    /// Error name, e.g. the Rust type name or a symbolic identifier.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, when one is available (always `None` for errors raised in Rust handlers).
    pub stack: Option<String>,
    /// Error taxonomy.
    pub kind: RpcErrorKind,
    /// Machine-readable error number.
    pub error_number: Option<String>,
    /// Machine-readable error key, e.g. `"L0002_WRONG_PARAMETER_SCHEMA"`.
    pub error_key: Option<String>,
    /// Application-specific error code.
    pub error_code: Option<String>,
    /// Extra debugging detail not meant for the caller's application logic.
    pub debug_msg: Option<String>,
    /// HTTP-aligned status code.
    pub status_code: u16,
    /// The service name this error occurred in.
    pub occurred_in: Option<String>,
    /// Free-form structured extra data, merged (not overwritten) by `register`'s error path.
    pub extra: Value,
}

impl RpcError {
    /// Build a `LOGIC` error.
    #[must_use]
    pub fn logic(error_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Logic, error_key, message, 400)
    }

    /// Build a `FATAL` error.
    #[must_use]
    pub fn fatal(error_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Fatal, error_key, message, 500)
    }

    /// Build a `FATAL` error carrying a caller-chosen status code, e.g. `503` for a requeue
    /// signal.
    #[must_use]
    pub fn fatal_with_status(
        error_key: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self::new(RpcErrorKind::Fatal, error_key, message, status_code)
    }

    /// Build an `ETC` error, the catch-all used when rehydrating an unrecognised `errorType`
    /// or wrapping a foreign/opaque error.
    #[must_use]
    pub fn etc(error_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Etc, error_key, message, 500)
    }

    /// Wrap any [`std::error::Error`] as an `ETC` error, e.g. a broker or builder failure.
    pub fn from_foreign<E>(error_key: impl Into<String>, err: &E) -> Self
    where
        E: std::error::Error,
    {
        Self::etc(error_key, err.to_string())
    }

    /// Shared constructor.
    fn new(
        kind: RpcErrorKind,
        error_key: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        let error_key = error_key.into();
        Self {
            name: error_key.clone(),
            message: message.into(),
            stack: None,
            kind,
            error_number: None,
            error_key: Some(error_key),
            error_code: None,
            debug_msg: None,
            status_code,
            occurred_in: None,
            extra: json!({}),
        }
    }

    /// `true` when this error should suppress the reply and request a delayed nack/requeue.
    #[must_use]
    pub fn is_requeue(&self) -> bool {
        self.status_code == 503
    }

    /// Merge keys into [`Self::extra`] without overwriting any the caller already set.
    pub fn merge_extra(&mut self, additions: Value) {
        let Value::Object(additions) = additions else {
            return;
        };
        let Value::Object(extra) = &mut self.extra else {
            self.extra = Value::Object(additions);
            return;
        };
        for (key, value) in additions {
            extra.entry(key).or_insert(value);
        }
    }

    /// Project into the wire [`ErrorShape`], stamping `occurred_in`.
    #[must_use]
    pub fn to_wire_shape(&self, occurred_in: &str) -> ErrorShape {
        ErrorShape {
            name: self.name.clone(),
            message: self.message.clone(),
            stack: self.stack.clone(),
            error_type: self.kind,
            error_number: self.error_number.clone(),
            error_key: self.error_key.clone(),
            error_code: self.error_code.clone(),
            debug_msg: self.debug_msg.clone(),
            status_code: self.status_code,
            occurred_in: Some(occurred_in.to_string()),
            extra: self.extra.clone(),
        }
    }
}

impl From<ErrorShape> for RpcError {
    fn from(shape: ErrorShape) -> Self {
        Self {
            name: shape.name,
            message: shape.message,
            stack: shape.stack,
            kind: shape.error_type,
            error_number: shape.error_number,
            error_key: shape.error_key,
            error_code: shape.error_code,
            debug_msg: shape.debug_msg,
            status_code: shape.status_code,
            occurred_in: shape.occurred_in,
            extra: shape.extra,
        }
    }
}

/// Wire form of [`RpcError`], sent as the `body` of a `{version, result: false, body}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Error name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, if any.
    pub stack: Option<String>,
    /// Error taxonomy.
    #[serde(rename = "errorType", default = "default_error_type")]
    pub error_type: RpcErrorKind,
    /// Machine-readable error number.
    pub error_number: Option<String>,
    /// Machine-readable error key.
    pub error_key: Option<String>,
    /// Application-specific error code.
    pub error_code: Option<String>,
    /// Extra debugging detail.
    pub debug_msg: Option<String>,
    /// HTTP-aligned status code.
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    /// The service name this error occurred in.
    pub occurred_in: Option<String>,
    /// Free-form structured extra data.
    #[serde(default)]
    pub extra: Value,
}

/// Default `error_type` for a wire payload that omits it (rehydrated as [`RpcErrorKind::Etc`]).
fn default_error_type() -> RpcErrorKind {
    RpcErrorKind::Etc
}

/// Default `status_code` for a wire payload that omits it.
fn default_status_code() -> u16 {
    500
}

/// `F0023_RPC_TIMEOUT`: the caller's wait timeout elapsed before a reply arrived.
#[must_use]
pub fn rpc_timeout_error(procedure: &str, timeout: std::time::Duration) -> RpcError {
    RpcError::fatal_with_status(
        "F0023_RPC_TIMEOUT",
        format!("rpc call to '{procedure}' timed out after {timeout:?}"),
        504,
    )
}

/// `F0024_RPC_EXEC_TIMEOUT`: a callee's hooks+handler exceeded the execution timeout.
#[must_use]
pub fn rpc_exec_timeout_error(procedure: &str, timeout: std::time::Duration) -> RpcError {
    RpcError::fatal_with_status(
        "F0024_RPC_EXEC_TIMEOUT",
        format!("handler for '{procedure}' exceeded execution timeout of {timeout:?}"),
        500,
    )
}

/// `F0026_MISSING_REPLY_TO`: a request arrived without a `reply_to`, so it can never be
/// answered; the message is discarded.
#[must_use]
pub fn missing_reply_to_error(procedure: &str) -> RpcError {
    RpcError::fatal(
        "F0026_MISSING_REPLY_TO",
        format!("request to '{procedure}' is missing the reply_to property"),
    )
}

/// `L0002_WRONG_PARAMETER_SCHEMA`: request or result failed sanitize/validate.
#[must_use]
pub fn wrong_parameter_schema_error(detail: impl Into<String>) -> RpcError {
    RpcError::logic("L0002_WRONG_PARAMETER_SCHEMA", detail)
}

/// `ETC_UNDECODABLE_REPLY`: the reply payload could not be parsed/decoded at all.
#[must_use]
pub fn undecodable_reply_error(procedure: &str) -> RpcError {
    RpcError::fatal_with_status(
        "ETC_UNDECODABLE_REPLY",
        format!("reply from '{procedure}' could not be decoded"),
        502,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_fields() {
        let mut err = RpcError::logic("L0002_WRONG_PARAMETER_SCHEMA", "nope");
        err.stack = Some("at foo".to_string());
        err.extra = json!({"n": 1});
        let shape = err.to_wire_shape("callee-service");
        assert_eq!(shape.occurred_in.as_deref(), Some("callee-service"));

        let restored: RpcError = shape.into();
        assert_eq!(restored.kind, err.kind);
        assert_eq!(restored.error_key, err.error_key);
        assert_eq!(restored.status_code, err.status_code);
        assert_eq!(restored.stack, err.stack);
        assert_eq!(restored.extra, err.extra);
        assert_eq!(restored.occurred_in.as_deref(), Some("callee-service"));
    }

    #[test]
    fn unknown_error_type_rehydrates_as_etc() {
        let raw = json!({
            "name": "Weird",
            "message": "from a newer peer",
            "stack": null,
            "errorType": "SOMETHING_NEW",
        });
        let shape: ErrorShape = serde_json::from_value(raw).expect("should still decode");
        assert_eq!(shape.error_type, RpcErrorKind::Etc);
    }

    #[test]
    fn merge_extra_does_not_overwrite_existing_keys() {
        let mut err = RpcError::logic("L0002_WRONG_PARAMETER_SCHEMA", "nope");
        err.extra = json!({"req": "original"});
        err.merge_extra(json!({"req": "overwritten", "island": "svc"}));
        assert_eq!(err.extra["req"], "original");
        assert_eq!(err.extra["island"], "svc");
    }

    #[test]
    fn is_requeue_only_for_503() {
        assert!(RpcError::fatal_with_status("X", "x", 503).is_requeue());
        assert!(!RpcError::fatal_with_status("X", "x", 500).is_requeue());
    }
}
