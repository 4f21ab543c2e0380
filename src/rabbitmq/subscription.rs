// src/rabbitmq/subscription.rs
// Consumer setup and the cancellable delivery stream handed to callers

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use lapin::options::BasicConsumeOptions;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnection, DeliveryResult};
use super::connection::RabbitService;
use super::errors::{RabbitMQError, Result};
use super::topology::{bind_queue, declare_exchange, exchange_options, queue_options};
use super::types::{ExchangeType, Target};

type ConsumerStream<D> = BoxStream<'static, DeliveryResult<D>>;

/// Inbound deliveries of one subscription.
///
/// Ends when the caller's token is cancelled, the service is closed, or the
/// broker stops the consumer. After cancellation nothing more is yielded,
/// including deliveries already buffered. Dropping the stream stops its
/// forwarding task. The stream only ever cancels a child of the caller's
/// token, so other work sharing that token is unaffected.
pub struct DeliveryStream<D> {
    inner: ReceiverStream<D>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    queue: String,
}

impl<D: Send + 'static> DeliveryStream<D> {
    /// Start the forwarding task that moves items from `upstream` to the
    /// returned stream through a channel of `capacity` slots.
    pub(crate) fn forward<S, E>(
        upstream: S,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        capacity: usize,
        queue: String,
    ) -> Self
    where
        S: Stream<Item = std::result::Result<D, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(forward_deliveries(
            upstream,
            tx,
            cancel.clone(),
            shutdown.clone(),
            queue.clone(),
        ));

        Self {
            inner: ReceiverStream::new(rx),
            cancel,
            shutdown,
            queue,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Stop the forwarding task. The stream ends on the next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn recv(&mut self) -> Option<D> {
        self.next().await
    }
}

impl<D> Stream for DeliveryStream<D> {
    type Item = D;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<D>> {
        if self.cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<D> Drop for DeliveryStream<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_deliveries<D, E, S>(
    mut upstream: S,
    tx: mpsc::Sender<D>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    queue: String,
) where
    S: Stream<Item = std::result::Result<D, E>> + Unpin,
    E: Display,
{
    debug!(queue = %queue, "Delivery forwarder started");
    let mut forwarded: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                // A slow reader blocks here, which in turn stops pulling from
                // the broker.
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = shutdown.cancelled() => false,
                    res = tx.send(delivery) => res.is_ok(),
                };
                if !sent {
                    break;
                }
                forwarded += 1;
            }
            Some(Err(e)) => {
                warn!(queue = %queue, error = %e, "Consumer stream failed, ending subscription");
                break;
            }
            None => {
                debug!(queue = %queue, "Consumer stream closed by broker");
                break;
            }
        }
    }

    debug!(queue = %queue, forwarded, "Delivery forwarder stopped");
}

impl<C: AmqpConnection> RabbitService<C> {
    /// Open a consumer on `target` and return its deliveries as a stream.
    ///
    /// For an exchange target the exchange is declared with `exchange_type`
    /// and the service's configured queue is bound to it on `routing_key`.
    /// For a queue target that queue is declared and consumed directly.
    #[instrument(skip_all, fields(target = %target, routing_key = %routing_key))]
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        target: &Target,
        exchange_type: ExchangeType,
        routing_key: &str,
    ) -> Result<DeliveryStream<<C::Channel as AmqpChannel>::Delivery>> {
        let mut session = self.session().await?;
        let opened = self
            .open_consumer(&session.channel, target, exchange_type, routing_key)
            .await;
        let (queue, upstream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.restore_channel(&mut session).await;
                return Err(e);
            }
        };

        Ok(DeliveryStream::forward(
            upstream,
            cancel,
            self.shutdown.clone(),
            self.config.delivery_buffer,
            queue,
        ))
    }

    /// Declare, bind and start consuming. Returns the queue name and the
    /// broker's delivery stream.
    async fn open_consumer(
        &self,
        channel: &C::Channel,
        target: &Target,
        exchange_type: ExchangeType,
        routing_key: &str,
    ) -> Result<(String, ConsumerStream<<C::Channel as AmqpChannel>::Delivery>)> {
        let flags = self.config.consume_flags();

        if let Target::Exchange(exchange) = target {
            declare_exchange(
                channel,
                exchange,
                exchange_type,
                exchange_options(true, flags.no_wait),
            )
            .await
            .map_err(RabbitMQError::SubscribeError)?;
        }

        let queue_name = match target {
            Target::Exchange(_) => self.config.queue.as_str(),
            Target::Queue(queue) => queue.as_str(),
        };
        let queue = channel
            .declare_queue(queue_name, queue_options(true, flags.exclusive, flags.no_wait))
            .await
            .map_err(|e| {
                RabbitMQError::SubscribeError(format!(
                    "failed to declare queue '{}': {}",
                    queue_name, e
                ))
            })?;

        if let Target::Exchange(exchange) = target {
            bind_queue(channel, &queue, exchange, routing_key)
                .await
                .map_err(RabbitMQError::SubscribeError)?;
        }

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let options = BasicConsumeOptions {
            no_local: flags.no_local,
            no_ack: flags.auto_ack,
            exclusive: flags.exclusive,
            nowait: flags.no_wait,
            ..BasicConsumeOptions::default()
        };
        let upstream = channel
            .consume(&queue, &consumer_tag, options)
            .await
            .map_err(|e| {
                RabbitMQError::SubscribeError(format!(
                    "failed to consume messages from '{}': {}",
                    queue, e
                ))
            })?;

        info!(
            queue = %queue,
            routing_key = %routing_key,
            consumer_tag = %consumer_tag,
            auto_ack = flags.auto_ack,
            "Subscription started"
        );
        Ok((queue, upstream))
    }
}
