// src/rabbitmq/types.rs
// Value types shared by the topology, publish and subscribe paths

use std::fmt;
use std::str::FromStr;

use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};

use super::errors::{RabbitMQError, Result};

/// Where a message is published to, or consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Exchange(String),
    Queue(String),
}

impl Target {
    pub fn exchange(name: impl Into<String>) -> Self {
        Target::Exchange(name.into())
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Target::Queue(name.into())
    }

    /// Build a target from a `"exchange"` / `"queue"` tag.
    ///
    /// Any other tag is a caller bug and fails with `InvalidTarget`.
    pub fn parse(target_type: &str, name: impl Into<String>) -> Result<Self> {
        match target_type {
            "exchange" => Ok(Target::Exchange(name.into())),
            "queue" => Ok(Target::Queue(name.into())),
            other => Err(RabbitMQError::InvalidTarget(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Exchange(name) | Target::Queue(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Exchange(_) => "exchange",
            Target::Queue(_) => "queue",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeType {
    type Err = RabbitMQError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(RabbitMQError::InvalidExchangeType(other.to_string())),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

/// Consumer and queue flags applied to every subscription of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeFlags {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// An exchange, a queue and the binding between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

impl TopologyDescriptor {
    /// Durable, non-exclusive topology. The exchange type is parsed here so
    /// an unknown kind never reaches the broker.
    pub fn new(
        exchange: impl Into<String>,
        exchange_type: &str,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            exchange: exchange.into(),
            exchange_type: exchange_type.parse()?,
            queue: queue.into(),
            routing_key: routing_key.into(),
            durable: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
        })
    }

    pub fn with_flags(mut self, flags: ConsumeFlags) -> Self {
        self.exclusive = flags.exclusive;
        self.no_local = flags.no_local;
        self.no_wait = flags.no_wait;
        self
    }
}
