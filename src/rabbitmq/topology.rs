// src/rabbitmq/topology.rs
// Exchange, queue and binding declaration

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use tracing::{debug, info, instrument};

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::connection::RabbitService;
use super::errors::{RabbitMQError, Result};
use super::types::{ExchangeType, TopologyDescriptor};

pub(crate) fn exchange_options(durable: bool, no_wait: bool) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable,
        auto_delete: false,
        internal: false,
        nowait: no_wait,
        ..ExchangeDeclareOptions::default()
    }
}

pub(crate) fn queue_options(durable: bool, exclusive: bool, no_wait: bool) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable,
        exclusive,
        auto_delete: false,
        nowait: no_wait,
        ..QueueDeclareOptions::default()
    }
}

/// Declare exchange, queue and binding, in that order, stopping at the first
/// failure. Nothing already declared is rolled back; redeclaring is safe.
pub(crate) async fn declare<Ch: AmqpChannel>(
    channel: &Ch,
    descriptor: &TopologyDescriptor,
) -> Result<()> {
    declare_exchange(
        channel,
        &descriptor.exchange,
        descriptor.exchange_type,
        exchange_options(descriptor.durable, descriptor.no_wait),
    )
    .await
    .map_err(RabbitMQError::TopologyError)?;

    let queue = channel
        .declare_queue(
            &descriptor.queue,
            queue_options(descriptor.durable, descriptor.exclusive, descriptor.no_wait),
        )
        .await
        .map_err(|e| {
            RabbitMQError::TopologyError(format!(
                "failed to declare queue '{}': {}",
                descriptor.queue, e
            ))
        })?;
    debug!(queue = %queue, "Queue declared");

    bind_queue(channel, &queue, &descriptor.exchange, &descriptor.routing_key)
        .await
        .map_err(RabbitMQError::TopologyError)?;

    info!(
        exchange = %descriptor.exchange,
        exchange_type = %descriptor.exchange_type,
        queue = %queue,
        routing_key = %descriptor.routing_key,
        "Topology declared"
    );
    Ok(())
}

// Shared with the subscribe path, which wraps failures in its own error kind.
pub(crate) async fn declare_exchange<Ch: AmqpChannel>(
    channel: &Ch,
    name: &str,
    kind: ExchangeType,
    options: ExchangeDeclareOptions,
) -> std::result::Result<(), String> {
    channel
        .declare_exchange(name, kind, options)
        .await
        .map_err(|e| format!("failed to declare exchange '{}': {}", name, e))?;
    debug!(exchange = %name, kind = %kind, "Exchange declared");
    Ok(())
}

pub(crate) async fn bind_queue<Ch: AmqpChannel>(
    channel: &Ch,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> std::result::Result<(), String> {
    channel
        .bind_queue(queue, exchange, routing_key, QueueBindOptions::default())
        .await
        .map_err(|e| {
            format!(
                "failed to bind queue '{}' to exchange '{}' on '{}': {}",
                queue, exchange, routing_key, e
            )
        })
}

impl<C: AmqpConnection> RabbitService<C> {
    /// Declare an exchange/queue/binding set on the shared channel.
    #[instrument(skip(self, descriptor), fields(exchange = %descriptor.exchange, queue = %descriptor.queue))]
    pub async fn declare_topology(&self, descriptor: &TopologyDescriptor) -> Result<()> {
        let mut session = self.session().await?;
        let result = declare(&session.channel, descriptor).await;
        if result.is_err() {
            self.restore_channel(&mut session).await;
        }
        result
    }
}
