// src/rabbitmq/amqp_client.rs
// Transport seam between the service and the AMQP client library

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection,
};

use super::types::ExchangeType;

pub type DeliveryResult<D> = std::result::Result<D, lapin::Error>;

/// Reply code sent with a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// An open connection able to hand out channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    async fn open_channel(&self) -> Result<Self::Channel, lapin::Error>;

    async fn close(&self) -> Result<(), lapin::Error>;
}

/// The declare/bind/publish/consume primitives of one AMQP channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    /// What a consumer yields for each inbound message
    type Delivery: Acknowledge;

    /// False once the broker has closed the channel, e.g. after a failed
    /// declare. Every later call on it fails.
    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<(), lapin::Error>;

    /// Returns the queue name as the broker knows it (server-named queues
    /// come back filled in).
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, lapin::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), lapin::Error>;

    async fn set_prefetch(&self, count: u16) -> Result<(), lapin::Error>;

    async fn enable_confirms(&self) -> Result<(), lapin::Error>;

    /// Publish and wait for the broker's confirm. `Ok(false)` means nack.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<bool, lapin::Error>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<BoxStream<'static, DeliveryResult<Self::Delivery>>, lapin::Error>;

    async fn close(&self) -> Result<(), lapin::Error>;
}

/// Inbound message with its acknowledgment handle.
#[async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    fn routing_key(&self) -> &str;

    async fn acknowledge(&self) -> Result<(), lapin::Error>;

    async fn reject(&self, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl AmqpConnection for Connection {
    type Channel = Channel;

    async fn open_channel(&self) -> Result<Channel, lapin::Error> {
        self.create_channel().await
    }

    async fn close(&self) -> Result<(), lapin::Error> {
        Connection::close(self, REPLY_SUCCESS, "Closing connection").await
    }
}

#[async_trait]
impl AmqpChannel for Channel {
    type Delivery = Delivery;

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<(), lapin::Error> {
        self.exchange_declare(name, kind.into(), options, FieldTable::default())
            .await
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, lapin::Error> {
        let queue = self
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), lapin::Error> {
        self.queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), lapin::Error> {
        self.basic_qos(count, BasicQosOptions::default()).await
    }

    async fn enable_confirms(&self) -> Result<(), lapin::Error> {
        self.confirm_select(ConfirmSelectOptions::default()).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<bool, lapin::Error> {
        let confirmation = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(!confirmation.is_nack())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<BoxStream<'static, DeliveryResult<Delivery>>, lapin::Error> {
        let consumer = self
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer.boxed())
    }

    async fn close(&self) -> Result<(), lapin::Error> {
        Channel::close(self, REPLY_SUCCESS, "Closing channel").await
    }
}

#[async_trait]
impl Acknowledge for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn routing_key(&self) -> &str {
        self.routing_key.as_str()
    }

    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        self.acker.ack(BasicAckOptions::default()).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), lapin::Error> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
    }
}
