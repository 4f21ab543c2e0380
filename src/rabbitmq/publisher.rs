// src/rabbitmq/publisher.rs
// Confirmed publishing to an exchange or straight to a queue

use std::time::Duration;

use lapin::BasicProperties;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::connection::RabbitService;
use super::errors::{RabbitMQError, Result};
use super::types::Target;

/// Reply-to and correlation id for `publish_json`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

/// Caller-side retry for `publish_with_retry`. Plain `publish` never retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// `base_delay` with up to ±15% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::random::<f64>() * 0.3 - 0.15;
        base.mul_f64(1.0 + jitter)
    }
}

/// Exchange name and routing key a target resolves to.
///
/// Queue targets go through the default exchange with the queue name as
/// routing key; the caller's routing key is not used.
pub(crate) fn route<'a>(target: &'a Target, routing_key: &'a str) -> (&'a str, &'a str) {
    match target {
        Target::Exchange(exchange) => (exchange.as_str(), routing_key),
        Target::Queue(queue) => ("", queue.as_str()),
    }
}

impl<C: AmqpConnection> RabbitService<C> {
    /// Publish `body` as `text/plain` and wait for the broker's confirm.
    pub async fn publish(&self, target: &Target, routing_key: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default().with_content_type("text/plain".into());
        self.publish_with_properties(target, routing_key, body, properties)
            .await
    }

    pub async fn publish_with_properties(
        &self,
        target: &Target,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let mut session = self.session().await?;
        let (exchange, routing_key) = route(target, routing_key);

        let published = session
            .channel
            .publish(exchange, routing_key, body, properties)
            .await;
        let acked = match published {
            Ok(acked) => acked,
            Err(e) => {
                self.restore_channel(&mut session).await;
                return Err(RabbitMQError::PublishError(format!(
                    "failed to publish message to {} '{}': {}",
                    target.kind(),
                    target.name(),
                    e
                )));
            }
        };

        if !acked {
            return Err(RabbitMQError::PublishError(format!(
                "message to {} '{}' not acknowledged by RabbitMQ",
                target.kind(),
                target.name()
            )));
        }

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            bytes = body.len(),
            "Message published"
        );
        Ok(())
    }

    /// Serialize `message` as JSON and publish it. Returns the correlation id,
    /// generated when the caller did not supply one.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        target: &Target,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<String> {
        let payload = serde_json::to_vec(message)?;
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_correlation_id(correlation_id.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if let Some(reply_to) = options.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        self.publish_with_properties(target, routing_key, &payload, properties)
            .await?;

        info!(
            target = %target,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            "Published JSON message"
        );
        Ok(correlation_id)
    }

    /// `publish` with exponential backoff between attempts.
    ///
    /// Errors that cannot heal (closed service, bad target) return at once.
    /// Cancelling `cancel` during a backoff returns the last error.
    pub async fn publish_with_retry(
        &self,
        target: &Target,
        routing_key: &str,
        body: &[u8],
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.publish(target, routing_key, body).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt + 1 == attempts {
                break;
            }

            let delay = policy.delay(attempt);
            debug!("Waiting {:?} before next publish attempt", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(last_error.unwrap_or(RabbitMQError::NotInitialized));
                }
            }
        }

        Err(RabbitMQError::PublishError(format!(
            "max retries reached: {}",
            last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
        )))
    }
}
