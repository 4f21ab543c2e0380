// src/env.rs
// Bootstrap a RabbitConfig from RABBITMQ_* environment variables

use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::config::{
    default_connect_timeout_seconds, default_delivery_buffer, default_prefetch_count,
    RabbitConfig,
};
use crate::rabbitmq::{ExchangeType, RabbitMQError, Result};

/// Load `.env` (if present), read the environment and validate.
pub fn from_env() -> Result<RabbitConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

/// Build a config from any key lookup. `from_env` is this over `std::env`.
pub fn from_lookup<F>(lookup: F) -> Result<RabbitConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).unwrap_or_default();
    let flag = |key: &str| lookup(key).as_deref() == Some("true");

    let port = lookup("RABBITMQ_PORT")
        .ok_or_else(|| RabbitMQError::ConfigError("rabbitmq port is not configured".to_string()))
        .and_then(|raw| parse_number::<u16>("RABBITMQ_PORT", &raw))?;

    let exchange_type = match lookup("RABBITMQ_EXCHANGE_TYPE") {
        Some(raw) if !raw.is_empty() => raw.parse::<ExchangeType>()?,
        _ => {
            return Err(RabbitMQError::ConfigError(
                "rabbitmq exchange type is not configured".to_string(),
            ))
        }
    };

    let config = RabbitConfig {
        host: var("RABBITMQ_HOST"),
        port,
        user: var("RABBITMQ_USER"),
        password: var("RABBITMQ_PASSWORD"),
        vhost: var("RABBITMQ_VHOST"),
        queue: var("RABBITMQ_QUEUE"),
        exchange: var("RABBITMQ_EXCHANGE"),
        exchange_type,
        routing_key: var("RABBITMQ_ROUTING_KEY"),
        auto_ack: flag("RABBITMQ_AUTO_ACK"),
        exclusive: flag("RABBITMQ_EXCLUSIVE"),
        no_local: flag("RABBITMQ_NO_LOCAL"),
        no_wait: flag("RABBITMQ_NO_WAIT"),
        prefetch_count: match lookup("RABBITMQ_PREFETCH_COUNT") {
            Some(val) => parse_number("RABBITMQ_PREFETCH_COUNT", &val)?,
            None => default_prefetch_count(),
        },
        connect_timeout_seconds: match lookup("RABBITMQ_CONNECT_TIMEOUT_SECONDS") {
            Some(val) => parse_number("RABBITMQ_CONNECT_TIMEOUT_SECONDS", &val)?,
            None => default_connect_timeout_seconds(),
        },
        delivery_buffer: match lookup("RABBITMQ_DELIVERY_BUFFER") {
            Some(val) => parse_number("RABBITMQ_DELIVERY_BUFFER", &val)?,
            None => default_delivery_buffer(),
        },
    };

    config.validate()?;
    Ok(config)
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| RabbitMQError::ConfigError(format!("{} is not a valid number: {}", key, e)))
}
