//! Broker-protocol ack/nack mechanics shared by the response multiplexer and the handler
//! registrar. Owns only delivery bookkeeping; reply semantics belong to the caller's
//! handler closure.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Consumer;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, error, info, Instrument};

use crate::error::RpcError;
use crate::RabbitBroker;

/// Minimum delay before nacking a requeue-requested delivery back onto the queue, so a handler
/// that is failing fast does not spin the broker.
const MIN_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// What a delivery handler decided to do with one message. Reply-sending is owned by the
/// registrar/multiplexer handler closure; this crate only needs to know how to ack/nack.
pub enum HandlerOutcome {
    /// The handler ran to completion and any reply it owed has already been sent.
    Replied,
    /// The handler raised an [`RpcError`] and already encoded/sent an error reply for it.
    ErrorReplied(RpcError),
    /// The handler raised an [`RpcError`] with `status_code == 503`: no reply was sent, and the
    /// message should be nacked with requeue after a short delay.
    Requeue(RpcError),
    /// The handler could not send any reply at all (e.g. a missing `reply_to`); the message is
    /// discarded without requeue.
    Fatal(RpcError),
}

/// A per-delivery handler. Boxed because closures capturing per-service state (hooks, pending
/// table, schema) can't be named as a concrete type at the call site.
pub type DeliveryHandler =
    Arc<dyn Fn(Arc<Delivery>) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send>> + Send + Sync>;

/// Opens a dedicated (non-pooled) channel for a long-lived consumer and sets its prefetch.
/// Bypasses the deadpool channel pool: `create_channel` is used for consumers, `get_channel`
/// for short-lived publishes.
///
/// # Errors
///
/// When the channel can not be created or `basic_qos` fails.
pub async fn open_consumer_channel(
    broker: &RabbitBroker,
    prefetch: u16,
) -> Result<lapin::Channel, ConsumeError> {
    let chan = broker
        .create_channel()
        .await
        .map_err(|err| ConsumeError(err.into()))?;
    chan.basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|err| ConsumeError(err.into()))?;
    Ok(chan)
}

/// Declares a consumer on `queue_name` over an already-open `chan`, and spawns a background
/// task (tracked by `broker`) that dispatches each delivery to `handler` and acks/nacks per its
/// [`HandlerOutcome`]. Kept separate from channel creation so callers that need to pause/resume
/// a consumer can hold onto `chan` across restarts.
///
/// # Errors
///
/// When `basic_consume` fails.
pub async fn start_consumer_on_channel(
    broker: &RabbitBroker,
    chan: lapin::Channel,
    queue_name: &str,
    consumer_tag: &str,
    handler: DeliveryHandler,
) -> Result<Consumer, ConsumeError> {
    let consumer = chan
        .basic_consume(
            queue_name,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| ConsumeError(err.into()))?;

    let span = debug_span!("consumer", queue_name, consumer_tag);
    broker
        .track_consumer(consumer_loop(consumer.clone(), handler).instrument(span))
        .await;
    Ok(consumer)
}

/// Declares a consumer on `queue_name`, sets the channel's prefetch, and spawns a background
/// task (tracked by `broker`) that dispatches each delivery to `handler` and acks/nacks per its
/// [`HandlerOutcome`]. Convenience wrapper over [`open_consumer_channel`] +
/// [`start_consumer_on_channel`] for callers (e.g. the response multiplexer) that never need to
/// pause/resume their consumer.
///
/// # Errors
///
/// When the channel can not be created, `basic_qos` fails, or `basic_consume` fails.
pub async fn start_consumer(
    broker: &RabbitBroker,
    queue_name: &str,
    consumer_tag: &str,
    prefetch: u16,
    handler: DeliveryHandler,
) -> Result<Consumer, ConsumeError> {
    let chan = open_consumer_channel(broker, prefetch).await?;
    start_consumer_on_channel(broker, chan, queue_name, consumer_tag, handler).await
}

/// Errors that can occur while setting up a consumer.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ConsumeError(#[from] anyhow::Error);

/// Errors that can occur while running the consumer loop.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerTaskError {
    /// The underlying `AMQP` consumer ended or errored.
    #[error(transparent)]
    Consumer(#[from] anyhow::Error),
}

/// Pulls deliveries off `consumer` and fans each one out to its own task.
async fn consumer_loop(
    mut consumer: Consumer,
    handler: DeliveryHandler,
) -> Result<(), ConsumerTaskError> {
    info!("consumer started");
    let mut delivery_set = JoinSet::<()>::new();

    loop {
        tokio::select! {
            delivery_result_opt = consumer.next() => {
                let Some(delivery_result) = delivery_result_opt else {
                    break;
                };
                let delivery = match delivery_result {
                    Ok(delivery) => Arc::new(delivery),
                    Err(err) => {
                        error!("consumer failed: {err}");
                        return Err(ConsumerTaskError::Consumer(err.into()));
                    }
                };
                let handler = Arc::clone(&handler);
                let delivery_span = debug_span!(
                    "delivery",
                    msg_id = %delivery
                        .properties
                        .message_id()
                        .clone()
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    delivery_tag = %delivery.delivery_tag,
                );
                delivery_set.spawn(dispatch_delivery(delivery, handler).instrument(delivery_span));
            },
            Some(_) = delivery_set.join_next() => (),
        }
    }
    while delivery_set.join_next().await.is_some() {}

    info!("consumer shut down");
    Ok(())
}

/// Runs `handler` against one delivery and resolves the ack/nack decision implied by its
/// [`HandlerOutcome`].
async fn dispatch_delivery(delivery: Arc<Delivery>, handler: DeliveryHandler) {
    let outcome = handler(Arc::clone(&delivery)).await;
    match outcome {
        HandlerOutcome::Replied | HandlerOutcome::ErrorReplied(_) => {
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!("acking delivery failed: {err}");
            }
        }
        HandlerOutcome::Requeue(err) => {
            debug!(%err, "requeueing delivery after delay");
            tokio::time::sleep(MIN_REQUEUE_DELAY).await;
            if let Err(err) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    multiple: false,
                })
                .await
            {
                error!("nacking (requeue) delivery failed: {err}");
            }
        }
        HandlerOutcome::Fatal(err) => {
            error!(%err, "discarding delivery that could not be replied to");
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!("acking delivery failed: {err}");
            }
        }
    }
}
