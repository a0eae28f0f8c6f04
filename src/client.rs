//! Main [`RabbitBroker`] implementation.
use std::ops::Deref;
use std::sync::Arc;

use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::consume_envelope::ConsumerTaskError;
use crate::prelude::*;
use crate::{
    BasicPublishBuilder, Channel, ChannelPool, ExchangeDeclareBuilder, Queue, QueueBindBuilder,
    QueueDeclareBuilder, QueueDeleteBuilder, QueueName, QueuePurgeBuilder, QueueUnbindBuilder,
};

/// Thin wrapper around a pooled `RabbitMQ` connection. Provides the broker-protocol primitives
/// (declare, bind, publish, and the raw consume loop in [`crate::consume_envelope`]) that the
/// response multiplexer, request issuer, and handler registrar are built on top of.
#[derive(Debug, Clone)]
pub struct RabbitBroker {
    /// `AMQP` connection.
    conn: Arc<Connection>,
    /// Channel Pool.
    chan_pool: ChannelPool,
    /// Background consumer tasks, joined by [`Self::completion`].
    pub(super) consumer_set: Arc<Mutex<JoinSet<Result<(), ConsumerTaskError>>>>,
    /// App ID for naming connections and stamping publishes.
    app_id: Arc<String>,
}

impl RabbitBroker {
    /// Connects to a `RabbitMQ` server and creates a pool of channels for you to use. You can
    /// temporarily get a pooled channel with [`Self::get_channel`].
    ///
    /// # Errors
    ///
    /// This function may return an error due to one of the following reasons:
    ///
    /// - A connection to the `RabbitMQ` server can not be established
    /// - The channel pool can not be created
    pub async fn connect(
        uri: impl AsRef<str>,
        props: ConnectionProperties,
        app_id: &str,
    ) -> Result<Self, NewError> {
        /// Prefix errors regarding the creation.
        const ERR_TRACE_PREFIX: &str = "RabbitMQ broker failed to connect";

        let conn = Arc::new(
            Connection::connect(uri.as_ref(), props.with_connection_name(app_id.into()))
                .await
                .map_err(|err| NewError::Connection(err.into()))
                .on_err(|err| error!("{ERR_TRACE_PREFIX}: {err}"))?,
        );

        let chan_pool = ChannelPool::new(conn.clone())
            .map_err(|err| NewError::ChannelPool(err.into()))
            .on_err(|err| error!("{ERR_TRACE_PREFIX}: {err}"))?;

        info!(
            "RabbitMQ broker connected to {}",
            uri.as_ref().split('@').last().unwrap_or_default()
        );
        Ok(Self {
            conn,
            chan_pool,
            consumer_set: Arc::new(Mutex::new(JoinSet::new())),
            app_id: Arc::new(app_id.to_string()),
        })
    }

    /// The `app_id` this broker stamps onto published messages.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// # Errors
    pub async fn get_channel(&self) -> Result<Channel, GetChannelError> {
        self.chan_pool
            .get()
            .await
            .map_err(|err| GetChannelError::Other(err.into()))
    }

    /// Creates an [`ExchangeDeclareBuilder`] to declare a new exchange.
    #[must_use]
    pub fn exchange_declare_builder<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
    ) -> ExchangeDeclareBuilder<'a> {
        ExchangeDeclareBuilder::new(self, name, kind)
    }

    /// Creates a [`QueueDeclareBuilder`] to declare a new queue.
    #[must_use]
    pub fn queue_declare_builder<'a>(&'a self, name: &'a str) -> QueueDeclareBuilder<'a> {
        QueueDeclareBuilder::new(self, name)
    }

    /// Creates a [`QueueBindBuilder`] to bind an existing queue to an exchange.
    #[must_use]
    pub fn queue_bind_builder<'a, N>(
        &'a self,
        name: &'a N,
        exchange_name: &'a str,
        routing_key: &'a str,
    ) -> QueueBindBuilder<'a>
    where
        N: QueueName,
    {
        QueueBindBuilder::new(self, name, exchange_name, routing_key)
    }

    /// Creates a [`QueueUnbindBuilder`] to unbind an existing queue from an exchange.
    #[must_use]
    pub fn queue_unbind_builder<'a, N>(
        &'a self,
        name: &'a N,
        exchange_name: &'a str,
        routing_key: &'a str,
    ) -> QueueUnbindBuilder<'a>
    where
        N: QueueName,
    {
        QueueUnbindBuilder::new(self, name, exchange_name, routing_key)
    }

    /// Creates a [`QueueDeleteBuilder`] to delete an existing queue.
    #[must_use]
    pub fn queue_delete_builder<'a, N>(&'a self, name: &'a N) -> QueueDeleteBuilder<'a>
    where
        N: QueueName,
    {
        QueueDeleteBuilder::new(self, name)
    }

    /// Creates a [`QueuePurgeBuilder`] to purge an existing queue.
    #[must_use]
    pub fn queue_purge_builder<'a, N>(&'a self, name: &'a N) -> QueuePurgeBuilder<'a>
    where
        N: QueueName,
    {
        QueuePurgeBuilder::new(self, name)
    }

    /// Creates a [`BasicPublishBuilder`] to publish a message to an exchange.
    #[must_use]
    pub fn basic_publish_builder<'a>(
        &'a self,
        exchange_name: &'a str,
        routing_key: &'a str,
    ) -> BasicPublishBuilder<'a> {
        BasicPublishBuilder::new(self, exchange_name, routing_key)
    }

    /// Creates a raw `AMQP` channel, bypassing the pool, for a long-lived consumer, which gets
    /// its own channel rather than a pooled/recycled one.
    ///
    /// # Errors
    ///
    /// When the connection can not produce a new channel.
    pub async fn create_channel(&self) -> Result<lapin::Channel, GetChannelError> {
        self.conn
            .create_channel()
            .await
            .map_err(|err| GetChannelError::Other(err.into()))
    }

    /// Hands a spawned consumer task to this broker's join set so [`Self::completion`] can wait
    /// on it alongside every other registered consumer.
    pub async fn track_consumer<F>(&self, task: F)
    where
        F: std::future::Future<Output = Result<(), ConsumerTaskError>> + Send + 'static,
    {
        self.consumer_set.lock().await.spawn(task);
    }

    /// Waits for every tracked consumer to finish, or for the connection to error.
    ///
    /// # Errors
    ///
    /// # Panics
    /// If the lapin connection errors in a way that drops its error sender.
    pub async fn completion(&self) -> Result<(), JoinConsumersError> {
        /// Prefix for errors happening here.
        const ERR_TRACE_PREFIX: &str = "a RabbitMQ broker consumer failed";

        let (conn_error_sender, mut conn_error_receiver) =
            tokio::sync::mpsc::unbounded_channel::<lapin::Error>();
        self.conn.on_error(move |e| {
            conn_error_sender
                .send(e)
                .expect("connection error receiver dropped.");
        });

        let mut consumer_set = std::mem::take(&mut *self.consumer_set.lock().await);

        loop {
            tokio::select! {
                conn_error_opt = conn_error_receiver.recv() => {
                    let Some(conn_err) = conn_error_opt else {
                        tracing::warn!("lapin connection error sender dropped");
                        return Err(JoinConsumersError::ConnectionErrorReceiverDropped);
                    };
                    tracing::error!("received lapin connection error: {:?}", conn_err);
                    return Err(JoinConsumersError::Connection(conn_err));
                },
                join_result_opt = consumer_set.join_next(), if !consumer_set.is_empty() => {
                    let Some(join_result) = join_result_opt else {
                        continue;
                    };
                    let delivery_result = join_result
                        .map_err(|err| JoinConsumersError::JoinTask(err.into()))
                        .on_err(|err| error!("{ERR_TRACE_PREFIX}: {err}"))?;
                    delivery_result
                        .map_err(|err| JoinConsumersError::Consumer(err.into()))
                        .on_err(|err| error!("{ERR_TRACE_PREFIX}: {err}"))?;
                }
            }
        }
    }
}

/// Possible errors when creating the [`RabbitBroker`].
#[derive(Debug, thiserror::Error)]
pub enum NewError {
    /// Connecting to the `RabbitMq` failed.
    #[error("connecting to RabbitMQ server failed: {0}")]
    Connection(anyhow::Error),
    /// Creating the channel pool failed.
    #[error("creating channel pool failed: {0}")]
    ChannelPool(anyhow::Error),
}

/// Errors when requesting a [`lapin::Channel`].
#[derive(Debug, thiserror::Error)]
pub enum GetChannelError {
    /// Any error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors when joining/starting tracked consumers.
#[derive(Debug, thiserror::Error)]
pub enum JoinConsumersError {
    /// Joining a consumer task failed.
    #[error("joining task failed: {0}")]
    JoinTask(anyhow::Error),
    /// Errors happening inside the consumer at runtime.
    #[error(transparent)]
    Consumer(#[from] anyhow::Error),

    /// The connection error receiver was dropped.
    #[error("lapin connection error listener dropped")]
    ConnectionErrorReceiverDropped,
    /// The currently held [`lapin::Connection`] has errored in any form, for
    /// example because it was interrupted.
    #[error(transparent)]
    Connection(#[from] lapin::Error),
}

impl Deref for RabbitBroker {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}
