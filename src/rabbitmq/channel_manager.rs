use tracing::{debug, info};
use uuid::Uuid;

use super::amqp_client::AmqpChannel;
use super::errors::{RabbitMQError, Result};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// Apply QoS and confirm mode to a freshly opened channel.
///
/// A channel that cannot enter confirm mode is unusable for publishing, so
/// that failure is reported as a connection error.
pub(crate) async fn configure_channel<Ch: AmqpChannel>(
    channel: &Ch,
    config: &ChannelConfig,
) -> Result<()> {
    if config.prefetch_count > 0 {
        debug!(channel_id = %config.id, prefetch = config.prefetch_count, "Setting channel QoS");
        channel.set_prefetch(config.prefetch_count).await.map_err(|e| {
            RabbitMQError::ConnectionError(format!("failed to set QoS: {}", e))
        })?;
    }

    if config.confirm_mode {
        debug!(channel_id = %config.id, "Enabling confirm mode");
        channel.enable_confirms().await.map_err(|e| {
            RabbitMQError::ConnectionError(format!("failed to enable confirm mode: {}", e))
        })?;
    }

    info!(channel_id = %config.id, "Channel configured");
    Ok(())
}
