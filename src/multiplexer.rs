//! Response multiplexer: a single long-lived consumer on the service's private response
//! queue, routing each reply to the `invoke` caller still waiting for it.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::consume_envelope::{self, HandlerOutcome};
use crate::RabbitBroker;

/// The raw reply body bytes, handed to the waiting `invoke` caller for [`crate::codec::decode`].
pub type RawReply = Vec<u8>;

/// Pending-request table keyed by correlation id. A single
/// `DashMap` plus `tokio::time::timeout` around the `oneshot::Receiver` await collapses the
/// distilled design's separate executor/timeout tables: `timeout()` already guarantees exactly
/// one winner between "reply arrived" and "wait timeout elapsed".
pub type PendingTable = Arc<DashMap<Uuid, oneshot::Sender<RawReply>>>;

/// Installs a fresh [`oneshot::Receiver`] for `correlation_id` in `pending`. Must be called
/// before the corresponding request is published,
/// otherwise a reply that arrives faster than the installation would be dropped.
#[must_use]
pub fn install(pending: &PendingTable, correlation_id: Uuid) -> oneshot::Receiver<RawReply> {
    let (tx, rx) = oneshot::channel();
    pending.insert(correlation_id, tx);
    rx
}

/// Removes a pending entry without resolving it, used when `invoke` gives up (timeout or local
/// error) before a reply arrives.
pub fn cancel(pending: &PendingTable, correlation_id: Uuid) {
    pending.remove(&correlation_id);
}

/// Starts the response multiplexer's consumer on `queue_name`. Every delivery's
/// `correlation_id` is matched against `pending`; an unmatched or malformed delivery is logged
/// and dropped (it corresponds to a caller that has already timed out and removed its entry).
///
/// # Errors
///
/// When the consumer can not be declared on the broker.
pub async fn start(
    broker: &RabbitBroker,
    queue_name: &str,
    consumer_tag: &str,
    prefetch: u16,
    pending: PendingTable,
) -> Result<(), StartError> {
    let handler_pending = Arc::clone(&pending);
    consume_envelope::start_consumer(
        broker,
        queue_name,
        consumer_tag,
        prefetch,
        Arc::new(move |delivery| {
            let pending = Arc::clone(&handler_pending);
            Box::pin(async move {
                let Some(correlation_id) = delivery.properties.correlation_id().clone() else {
                    warn!("reply delivery is missing correlation_id; dropping");
                    return HandlerOutcome::Replied;
                };
                let Ok(correlation_id) = Uuid::parse_str(correlation_id.as_str()) else {
                    warn!(%correlation_id, "reply delivery has a non-UUID correlation_id; dropping");
                    return HandlerOutcome::Replied;
                };

                match pending.remove(&correlation_id) {
                    Some((_, sender)) => {
                        // The receiver may already be gone if `invoke`'s wait timeout won the
                        // race; sending into a dropped receiver is a benign no-op.
                        let _ = sender.send(delivery.data.clone());
                    }
                    None => {
                        warn!(%correlation_id, "no pending request for reply; caller likely already timed out");
                    }
                }
                HandlerOutcome::Replied
            })
        }),
    )
    .await
    .map_err(|err| StartError(err.into()))?;
    Ok(())
}

/// Errors that can occur while starting the response multiplexer.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct StartError(#[from] anyhow::Error);

/// Resolves a pending request from outside the consumer loop, e.g. in tests that don't start a
/// real broker connection.
#[cfg(test)]
pub(crate) fn resolve_for_test(pending: &PendingTable, correlation_id: Uuid, body: RawReply) {
    if let Some((_, sender)) = pending.remove(&correlation_id) {
        let _ = sender.send(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_then_resolve_delivers_body() {
        let pending: PendingTable = Arc::new(DashMap::new());
        let id = Uuid::new_v4();
        let rx = install(&pending, id);
        resolve_for_test(&pending, id, b"hello".to_vec());
        let body = rx.await.expect("sender should not be dropped");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn cancel_removes_entry_without_resolving() {
        let pending: PendingTable = Arc::new(DashMap::new());
        let id = Uuid::new_v4();
        let rx = install(&pending, id);
        cancel(&pending, id);
        assert!(pending.get(&id).is_none());
        drop(pending);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn resolve_for_unknown_correlation_id_is_a_no_op() {
        let pending: PendingTable = Arc::new(DashMap::new());
        resolve_for_test(&pending, Uuid::new_v4(), b"orphan".to_vec());
        assert!(pending.is_empty());
    }
}
