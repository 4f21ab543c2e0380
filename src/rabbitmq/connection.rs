// src/rabbitmq/connection.rs
// Connection lifecycle: dial, channel setup, initial topology, close

use lapin::{Connection, ConnectionProperties};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::channel_manager::{configure_channel, ChannelConfig};
use super::errors::{RabbitMQError, Result};
use super::topology::declare;
use crate::config::RabbitConfig;

/// The one connection/channel pair a service owns.
pub(crate) struct Session<C: AmqpConnection> {
    pub(crate) connection: C,
    pub(crate) channel: C::Channel,
}

/// RabbitMQ producer/consumer bound to a single connection and channel.
///
/// Every operation after `close` fails with `NotInitialized`.
pub struct RabbitService<C: AmqpConnection = Connection> {
    pub(crate) session: Mutex<Option<Session<C>>>,
    pub(crate) config: RabbitConfig,
    pub(crate) shutdown: CancellationToken,
}

impl RabbitService<Connection> {
    /// Dial the broker described by `config` and prepare the service.
    pub async fn connect(config: RabbitConfig) -> Result<Self> {
        config.validate()?;

        info!(address = %config.redacted_address(), "Connecting to RabbitMQ");
        let connect_timeout = config.connect_timeout();
        let connection = timeout(
            connect_timeout,
            Connection::connect(&config.address(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            RabbitMQError::ConnectionError(format!(
                "connection timed out after {} seconds",
                connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| RabbitMQError::ConnectionError(format!("failed to connect to RabbitMQ: {}", e)))?;

        Self::from_connection(connection, config).await
    }
}

impl<C: AmqpConnection> RabbitService<C> {
    /// Finish construction on an already open connection: open the channel,
    /// declare the configured topology and enable publisher confirms.
    ///
    /// On failure everything acquired so far is closed before returning.
    pub async fn from_connection(connection: C, config: RabbitConfig) -> Result<Self> {
        if let Err(e) = config.validate() {
            release(None, &connection).await;
            return Err(e);
        }

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                release(None, &connection).await;
                return Err(RabbitMQError::ConnectionError(format!(
                    "failed to open a channel: {}",
                    e
                )));
            }
        };

        if let Err(e) = prepare_channel(&channel, &config).await {
            error!(error = %e, "Channel setup failed, releasing connection");
            release(Some(&channel), &connection).await;
            return Err(e);
        }

        info!(
            exchange = %config.exchange,
            queue = %config.queue,
            routing_key = %config.routing_key,
            "RabbitMQ service ready"
        );

        Ok(Self {
            session: Mutex::new(Some(Session {
                connection,
                channel,
            })),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RabbitConfig {
        &self.config
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Close the channel, then the connection. Both are attempted; if either
    /// fails every failure is reported in one `CloseError`.
    pub async fn close(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .await
            .take()
            .ok_or(RabbitMQError::NotInitialized)?;

        info!("Closing RabbitMQ service");
        self.shutdown.cancel();

        let mut errors = Vec::new();
        if let Err(e) = session.channel.close().await {
            errors.push(format!("failed to close channel: {}", e));
        }
        if let Err(e) = session.connection.close().await {
            errors.push(format!("failed to close connection: {}", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RabbitMQError::CloseError(errors))
        }
    }

    /// Lock the session for one operation, failing if the service has been
    /// closed. Holding the guard serializes all use of the shared channel.
    pub(crate) async fn session(&self) -> Result<MappedMutexGuard<'_, Session<C>>> {
        MutexGuard::try_map(self.session.lock().await, |session| session.as_mut())
            .map_err(|_| RabbitMQError::NotInitialized)
    }

    /// Replace the channel if the broker closed it after a failed operation.
    ///
    /// Channel exceptions (a conflicting declare, binding to a missing
    /// exchange) close only the channel. The connection stays up, so a fresh
    /// channel restores the service for later calls. Must be called with the
    /// session lock held.
    pub(crate) async fn restore_channel(&self, session: &mut Session<C>) {
        if session.channel.is_open() {
            return;
        }

        warn!("Channel closed by broker, opening a new one");
        match open_configured_channel(&session.connection, &self.config).await {
            Ok(channel) => {
                session.channel = channel;
                info!("Channel restored");
            }
            Err(e) => error!(error = %e, "Failed to restore channel"),
        }
    }
}

async fn open_configured_channel<C: AmqpConnection>(
    connection: &C,
    config: &RabbitConfig,
) -> Result<C::Channel> {
    let channel = connection.open_channel().await.map_err(|e| {
        RabbitMQError::ConnectionError(format!("failed to open a channel: {}", e))
    })?;
    configure_channel(&channel, &channel_config(config)).await?;
    Ok(channel)
}

fn channel_config(config: &RabbitConfig) -> ChannelConfig {
    ChannelConfig::default().with_prefetch(config.prefetch_count)
}

async fn prepare_channel<Ch: AmqpChannel>(channel: &Ch, config: &RabbitConfig) -> Result<()> {
    declare(channel, &config.topology()).await?;
    configure_channel(channel, &channel_config(config)).await
}

async fn release<C: AmqpConnection>(channel: Option<&C::Channel>, connection: &C) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close channel after setup error");
        }
    }
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close connection after setup error");
    }
}
