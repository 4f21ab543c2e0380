// src/lib.rs
// RabbitMQ broker adapter built on lapin and tokio

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::RabbitConfig;
pub use rabbitmq::{
    DeliveryStream, ExchangeType, RabbitMQError, RabbitService, Result, Target,
    TopologyDescriptor,
};
