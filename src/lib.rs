//! Warren: a broker-mediated RPC engine over `RabbitMQ`. One process's [`RpcService`] publishes
//! requests onto a callee's procedure queue and multiplexes replies off its own private queue;
//! another registers handlers behind the same queue and runs them through a shared hook
//! pipeline with schema guards, trace-scope propagation, and lifecycle control.
#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::pedantic,
    clippy::unwrap_used
)]
#![allow(clippy::unused_async)]

mod builder_arguments;
pub mod basic_publish_builder;
pub mod channel_pool;
pub mod client;
pub mod codec;
pub mod config;
pub mod consume_envelope;
pub mod error;
pub mod exchange_declare_builder;
pub mod hooks;
pub mod issuer;
pub mod lifecycle;
pub mod message;
pub mod multiplexer;
pub mod queue;
pub mod queue_bind_builder;
pub mod queue_declare_builder;
pub mod queue_delete_builder;
pub mod queue_purge_builder;
pub mod queue_unbind_builder;
pub mod registrar;
pub mod service;
pub mod trace_scope;

pub use builder_arguments::BuilderArgs;
pub use channel_pool::Channel;
pub use client::RabbitBroker;
pub use config::{RpcConfig, RpcServiceOptions};
pub use error::RpcError;
pub use hooks::{HookKindMismatch, RpcHookType};
pub use issuer::{InvokeOptions, InvokeOutcome};
pub use lapin;
pub use queue::Queue;
pub use registrar::RpcOptions;
pub use service::RpcService;
pub use trace_scope::{CallType, TraceScope};

use basic_publish_builder::BasicPublishBuilder;
use channel_pool::ChannelPool;
use exchange_declare_builder::ExchangeDeclareBuilder;
use queue::QueueName;
use queue_bind_builder::QueueBindBuilder;
use queue_declare_builder::QueueDeclareBuilder;
use queue_delete_builder::QueueDeleteBuilder;
use queue_purge_builder::QueuePurgeBuilder;
use queue_unbind_builder::QueueUnbindBuilder;

pub mod util;

/// Prelude
pub mod prelude {
    pub use crate::BuilderArgs as _;
    pub use crate::util::OnError as _;
}
