// src/rabbitmq/mod.rs
// RabbitMQ adapter: connection lifecycle, topology, publishing and subscriptions

pub mod errors;
pub mod types;
pub mod amqp_client;
pub mod connection;

mod channel_manager;
mod consumer;
mod publisher;
mod subscription;
mod supervisor;
mod topology;

pub use amqp_client::{Acknowledge, AmqpChannel, AmqpConnection, DeliveryResult};
pub use channel_manager::ChannelConfig;
pub use connection::RabbitService;
pub use consumer::{run_handler, HandlerError, Incoming};
pub use errors::{RabbitMQError, Result};
pub use publisher::{PublishOptions, RetryPolicy};
pub use subscription::DeliveryStream;
pub use supervisor::{FailurePolicy, SubscriptionOutcome, SubscriptionSupervisor};
pub use types::{ConsumeFlags, ExchangeType, Target, TopologyDescriptor};
