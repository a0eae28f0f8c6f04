//! [`QueueDeclareBuilder`] implementation.

use std::time::Duration;

use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;

use crate::{BuilderArgs, Queue, RabbitBroker};

/// Key name for queue expiry.
const XARGS_EXPIRES: &str = "x-expires";

/// Declare a queue.
pub struct QueueDeclareBuilder<'a> {
    /// The [`RabbitBroker`] to declare the queue with.
    client: &'a RabbitBroker,
    /// The queues name.
    name: &'a str,
    /// Queue declare options.
    opts: QueueDeclareOptions,
    /// Additional args.
    args: FieldTable,
}

impl<'a> QueueDeclareBuilder<'a> {
    /// Create a new instance of `QueueDeclareBuilder`
    #[must_use]
    pub fn new(client: &'a RabbitBroker, name: &'a str) -> Self {
        Self {
            client,
            name,
            opts: QueueDeclareOptions {
                auto_delete: false,
                durable: true,
                exclusive: false,
                nowait: false,
                passive: false,
            },
            args: FieldTable::default(),
        }
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.opts.auto_delete = auto_delete;
        self
    }

    /// Defaults to `true`.
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.opts.durable = durable;
        self
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.opts.exclusive = exclusive;
        self
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn nowait(mut self, nowait: bool) -> Self {
        self.opts.nowait = nowait;
        self
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn passive(mut self, passive: bool) -> Self {
        self.opts.passive = passive;
        self
    }

    /// Provide additional [`QueueDeclareOptions`].
    #[must_use]
    pub fn opts<F>(mut self, f: F) -> Self
    where
        F: FnOnce(QueueDeclareOptions) -> QueueDeclareOptions,
    {
        self.opts = f(self.opts);
        self
    }

    /// Sets `x-expires`: the queue is deleted by the broker if unused for this long. Used for
    /// both the per-instance response queue and procedure queues.
    ///
    /// # Errors
    ///
    /// When the duration millis are bigger than `u32::MAX`.
    pub fn expires(self, expires: Duration) -> Result<Self, DeclareError> {
        let millis: u32 =
            TryInto::<u32>::try_into(expires.as_millis()).map_err(|e| DeclareError(e.into()))?;
        Ok(self.arg_u32(XARGS_EXPIRES, millis))
    }

    /// Declare the queue.
    /// # Errors
    /// See [`DeclareError`].
    pub async fn declare(self) -> Result<Queue, DeclareError> {
        let chan = self
            .client
            .get_channel()
            .await
            .map_err(|err| DeclareError(err.into()))?;
        let queue = chan
            .queue_declare(self.name, self.opts, self.args)
            .await
            .map_err(|err| DeclareError(err.into()))?;

        Ok(Queue { inner: queue })
    }
}

/// Errors that can occur when declaring a queue.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct DeclareError(#[from] anyhow::Error);

impl<'a> BuilderArgs for QueueDeclareBuilder<'a> {
    fn get_args(&mut self) -> &mut FieldTable {
        &mut self.args
    }
}
