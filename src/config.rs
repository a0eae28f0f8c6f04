//! Environment-driven [`RpcConfig`] shared by every [`crate::RpcService`].
use std::env;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::warn;

/// Default handler+hooks execution timeout (`ISLAND_RPC_EXEC_TIMEOUT_MS`).
const DEFAULT_EXEC_TIMEOUT_MS: u64 = 25_000;
/// Default caller wait timeout (`ISLAND_RPC_WAIT_TIMEOUT_MS`).
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;
/// Default margin added to the wait timeout for queue `x-expires` (`ISLAND_SERVICE_LOAD_TIME_MS`).
const DEFAULT_SERVICE_LOAD_TIME_MS: u64 = 60_000;
/// Default per-channel prefetch (`RPC_PREFETCH`).
const DEFAULT_PREFETCH: u16 = 1000;

/// Resolved configuration for an [`crate::RpcService`], read once from the environment.
#[derive(Debug, Clone, Copy)]
pub struct RpcConfig {
    /// Handler+hooks execution timeout.
    pub exec_timeout: Duration,
    /// Caller wait timeout; also used as the publish `expiration`.
    pub wait_timeout: Duration,
    /// Added to `wait_timeout` to compute a procedure queue's `x-expires`.
    pub service_load_time: Duration,
    /// Per-channel prefetch used when starting a consumer.
    pub prefetch: u16,
    /// Whether the decode reviver is globally disabled via `RPC_NO_REVIVER`.
    pub no_reviver_env: bool,
}

impl RpcConfig {
    /// Loads configuration from the environment, falling back to the documented
    /// defaults for any variable that is absent or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            exec_timeout: Duration::from_millis(env_u64(
                "ISLAND_RPC_EXEC_TIMEOUT_MS",
                DEFAULT_EXEC_TIMEOUT_MS,
            )),
            wait_timeout: Duration::from_millis(env_u64(
                "ISLAND_RPC_WAIT_TIMEOUT_MS",
                DEFAULT_WAIT_TIMEOUT_MS,
            )),
            service_load_time: Duration::from_millis(env_u64(
                "ISLAND_SERVICE_LOAD_TIME_MS",
                DEFAULT_SERVICE_LOAD_TIME_MS,
            )),
            prefetch: u16::try_from(env_u64("RPC_PREFETCH", u64::from(DEFAULT_PREFETCH)))
                .unwrap_or(DEFAULT_PREFETCH),
            no_reviver_env: env_bool("RPC_NO_REVIVER"),
        }
    }

    /// The queue expiry (`x-expires`) for procedure queues: `wait_timeout + service_load_time`.
    #[must_use]
    pub fn queue_expires(&self) -> Duration {
        self.wait_timeout.saturating_add(self.service_load_time)
    }

    /// Process-wide singleton, loaded lazily on first access.
    pub fn global() -> &'static Self {
        /// Backing storage for the process-wide [`RpcConfig`].
        static GLOBAL: OnceCell<RpcConfig> = OnceCell::new();
        GLOBAL.get_or_init(Self::from_env)
    }
}

/// Parse a `u64` environment variable, warning and falling back to `default` on failure.
fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|err| {
            warn!("{name} is set to {raw:?} which is not a valid number ({err}); using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Parse a boolean-ish environment variable (`"true"`/`"1"` are truthy, anything else is not).
fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
}

/// Per-instance initialization options for [`crate::RpcService`].
#[derive(Debug, Clone, Default)]
pub struct RpcServiceOptions {
    /// Disable the decode reviver for this service instance regardless of `RPC_NO_REVIVER`.
    pub no_reviver: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_expires_sums_wait_and_load_time() {
        let config = RpcConfig {
            exec_timeout: Duration::from_millis(1),
            wait_timeout: Duration::from_millis(60_000),
            service_load_time: Duration::from_millis(60_000),
            prefetch: 1000,
            no_reviver_env: false,
        };
        assert_eq!(config.queue_expires(), Duration::from_millis(120_000));
    }

    #[test]
    fn env_bool_recognises_truthy_values() {
        assert!(matches!("true".to_ascii_lowercase().as_str(), "true" | "1"));
        assert!(matches!("1".to_ascii_lowercase().as_str(), "true" | "1"));
        assert!(!matches!("false".to_ascii_lowercase().as_str(), "true" | "1"));
    }
}
