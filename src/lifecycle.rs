//! Lifecycle: `pause`/`resume`/`unregister` for one registered procedure's consumer, and
//! a hook-only `purge`.
use std::sync::Arc;

use lapin::options::BasicCancelOptions;

use crate::consume_envelope::{self, DeliveryHandler};
use crate::hooks::HookRegistry;
use crate::RabbitBroker;

/// Everything needed to pause, resume, or unregister one registered procedure's consumer.
#[derive(Clone)]
pub struct ConsumerRecord {
    /// The dedicated channel this consumer runs on, kept alive across pause/resume.
    channel: lapin::Channel,
    /// The procedure queue name.
    queue_name: String,
    /// The broker-visible consumer tag, stable across pause/resume.
    consumer_tag: String,
    /// The delivery handler to re-attach on [`resume`].
    handler: DeliveryHandler,
}

impl ConsumerRecord {
    /// Build a new record. `channel` must already be consuming `queue_name` under
    /// `consumer_tag` when this is constructed by [`crate::registrar::register`].
    #[must_use]
    pub fn new(
        channel: lapin::Channel,
        queue_name: String,
        consumer_tag: String,
        handler: DeliveryHandler,
    ) -> Self {
        Self {
            channel,
            queue_name,
            consumer_tag,
            handler,
        }
    }

    /// The procedure queue this record consumes.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The broker-visible consumer tag.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

/// Cancels the consumer tag so the broker stops dispatching. The channel and
/// handler are kept so [`resume`] can re-subscribe later.
///
/// # Errors
///
/// When `basic_cancel` fails.
pub async fn pause(record: &ConsumerRecord) -> Result<(), LifecycleError> {
    record
        .channel
        .basic_cancel(&record.consumer_tag, BasicCancelOptions::default())
        .await
        .map_err(|err| LifecycleError(err.into()))
}

/// Re-subscribes on `record`'s saved channel using its saved queue name, consumer tag, and
/// handler.
///
/// # Errors
///
/// When `basic_consume` fails.
pub async fn resume(broker: &RabbitBroker, record: &ConsumerRecord) -> Result<(), LifecycleError> {
    consume_envelope::start_consumer_on_channel(
        broker,
        record.channel.clone(),
        &record.queue_name,
        &record.consumer_tag,
        Arc::clone(&record.handler),
    )
    .await
    .map_err(|err| LifecycleError(err.into()))?;
    Ok(())
}

/// Cancels the consumer and closes its dedicated channel. The channel was
/// opened via [`crate::consume_envelope::open_consumer_channel`], bypassing the deadpool channel
/// pool, so there is no pool to release back to: closing the channel outright is the correct
/// teardown for a consumer that was never pooled to begin with.
///
/// # Errors
///
/// When cancelling or closing the channel fails.
pub async fn unregister(record: &ConsumerRecord) -> Result<(), LifecycleError> {
    pause(record).await?;
    record
        .channel
        .close(200, "rpc procedure unregistered")
        .await
        .map_err(|err| LifecycleError(err.into()))
}

/// Resets every registered hook. Does not cancel or otherwise touch any live consumer —
/// documents this as a known limitation rather than silently broadening `purge`'s scope.
pub async fn purge(hooks: &HookRegistry) {
    hooks.purge().await;
}

/// Errors from a lifecycle operation.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct LifecycleError(#[from] anyhow::Error);
