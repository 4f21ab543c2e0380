// src/rabbitmq/consumer.rs
// Handler-driven consumption: ack on success, nack with requeue on failure

use std::future::Future;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::amqp_client::{Acknowledge, AmqpConnection};
use super::connection::RabbitService;
use super::errors::{RabbitMQError, Result};
use super::subscription::DeliveryStream;
use super::types::{ExchangeType, Target};

/// Error type handlers report failures with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A delivery as handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Incoming {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Drive `handler` over every delivery of `stream` until the stream ends or
/// `stop` is cancelled. Returns how many deliveries were handled.
///
/// With `auto_ack` the broker has already settled each delivery, so handler
/// failures are only logged. Otherwise a successful handler acks and a failed
/// one nacks with requeue. An ack or nack the broker refuses ends the loop.
pub async fn run_handler<D, F, Fut>(
    mut stream: DeliveryStream<D>,
    stop: CancellationToken,
    auto_ack: bool,
    mut handler: F,
) -> Result<u64>
where
    D: Acknowledge,
    F: FnMut(Incoming) -> Fut + Send,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    let queue = stream.queue().to_string();
    let mut handled: u64 = 0;

    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let incoming = Incoming {
            routing_key: delivery.routing_key().to_string(),
            body: delivery.body().to_vec(),
        };

        match handler(incoming).await {
            Ok(()) => {
                if !auto_ack {
                    delivery.acknowledge().await.map_err(|e| {
                        error!(queue = %queue, error = %e, "Failed to acknowledge message");
                        RabbitMQError::AckError(format!(
                            "failed to acknowledge message from '{}': {}",
                            queue, e
                        ))
                    })?;
                }
                debug!(queue = %queue, routing_key = %delivery.routing_key(), "Message handled");
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key(),
                    error = %e,
                    "Handler failed"
                );
                if !auto_ack {
                    delivery.reject(true).await.map_err(|e| {
                        error!(queue = %queue, error = %e, "Failed to negatively acknowledge message");
                        RabbitMQError::AckError(format!(
                            "failed to nack message from '{}': {}",
                            queue, e
                        ))
                    })?;
                }
            }
        }
        handled += 1;
    }

    info!(queue = %queue, handled, "Consumer loop finished");
    Ok(handled)
}

impl<C: AmqpConnection> RabbitService<C> {
    /// Subscribe to `target` and run `handler` on each delivery until `cancel`
    /// fires or the subscription ends.
    pub async fn consume<F, Fut>(
        &self,
        cancel: CancellationToken,
        target: &Target,
        exchange_type: ExchangeType,
        routing_key: &str,
        handler: F,
    ) -> Result<u64>
    where
        F: FnMut(Incoming) -> Fut + Send,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        let stream = self
            .subscribe(cancel.clone(), target, exchange_type, routing_key)
            .await?;
        run_handler(stream, cancel, self.config.auto_ack, handler).await
    }
}
