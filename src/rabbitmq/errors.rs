// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ subscribe error: {0}")]
    SubscribeError(String),

    #[error("Invalid target type: {0}")]
    InvalidTarget(String),

    #[error("RabbitMQ service is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid exchange type: {0}")]
    InvalidExchangeType(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Errors while closing service: {}", .0.join("; "))]
    CloseError(Vec<String>),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether a caller-side retry could plausibly succeed.
    ///
    /// Programming errors and a closed service never heal on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RabbitMQError::NotInitialized
                | RabbitMQError::InvalidTarget(_)
                | RabbitMQError::InvalidExchangeType(_)
                | RabbitMQError::ConfigError(_)
                | RabbitMQError::SerializationError(_)
        )
    }
}
