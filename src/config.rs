// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::{ConsumeFlags, ExchangeType, RabbitMQError, Result, TopologyDescriptor};

const CONFIG_FILE_NAME: &str = "RabbitBroker.json";

/// Everything needed to connect, declare the initial topology and consume.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RabbitConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub queue: String,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,
}

pub(crate) fn default_prefetch_count() -> u16 {
    10
}

pub(crate) fn default_connect_timeout_seconds() -> u64 {
    10
}

pub(crate) fn default_delivery_buffer() -> usize {
    1
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue: String::new(),
            exchange: String::new(),
            exchange_type: ExchangeType::Direct,
            routing_key: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            prefetch_count: default_prefetch_count(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            delivery_buffer: default_delivery_buffer(),
        }
    }
}

// Hand-written so the password never reaches the logs.
impl std::fmt::Debug for RabbitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("exchange_type", &self.exchange_type)
            .field("routing_key", &self.routing_key)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .field("no_local", &self.no_local)
            .field("no_wait", &self.no_wait)
            .field("prefetch_count", &self.prefetch_count)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("delivery_buffer", &self.delivery_buffer)
            .finish()
    }
}

impl RabbitConfig {
    /// Check every required field once, before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("host", self.host.is_empty()),
            ("port", self.port == 0),
            ("user", self.user.is_empty()),
            ("password", self.password.is_empty()),
            ("vhost", self.vhost.is_empty()),
            ("queue", self.queue.is_empty()),
            ("exchange", self.exchange.is_empty()),
            ("routing key", self.routing_key.is_empty()),
        ];

        for (field, missing) in required {
            if missing {
                return Err(RabbitMQError::ConfigError(format!(
                    "rabbitmq {} is not configured",
                    field
                )));
            }
        }

        if self.delivery_buffer == 0 {
            return Err(RabbitMQError::ConfigError(
                "delivery buffer must hold at least one message".to_string(),
            ));
        }

        Ok(())
    }

    /// AMQP URI for this config, with the vhost percent-encoded (`/` becomes
    /// `%2f`).
    pub fn address(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            encode_vhost(&self.vhost)
        )
    }

    /// Same as `address` with the password masked.
    pub fn redacted_address(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.user,
            self.host,
            self.port,
            encode_vhost(&self.vhost)
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn consume_flags(&self) -> ConsumeFlags {
        ConsumeFlags {
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
        }
    }

    /// The exchange/queue/binding declared when the service starts.
    pub fn topology(&self) -> TopologyDescriptor {
        TopologyDescriptor {
            exchange: self.exchange.clone(),
            exchange_type: self.exchange_type,
            queue: self.queue.clone(),
            routing_key: self.routing_key.clone(),
            durable: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
        }
        .with_flags(self.consume_flags())
    }
}

fn encode_vhost(vhost: &str) -> String {
    let trimmed = vhost.strip_prefix('/').unwrap_or(vhost);
    if trimmed.is_empty() {
        return "%2f".to_string();
    }
    trimmed.replace('/', "%2f")
}

// Configuration file discovery and loading

pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let nested = Path::new("config").join(CONFIG_FILE_NAME);

    for (location_name, path) in [("Current directory", local), ("Config directory", nested)] {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path);
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or the home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> anyhow::Result<RabbitConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> anyhow::Result<RabbitConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: RabbitConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> anyhow::Result<()> {
    let default_config = RabbitConfig {
        queue: "rabbit_broker.events".to_string(),
        exchange: "rabbit_broker".to_string(),
        exchange_type: ExchangeType::Topic,
        routing_key: "events.#".to_string(),
        ..RabbitConfig::default()
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
