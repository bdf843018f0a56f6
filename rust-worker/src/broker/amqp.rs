//! lapin implementation of [`BrokerChannel`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection,
};
use tracing::{info, warn};

use super::BrokerChannel;
use crate::envelope::{Envelope, Incoming};
use crate::error::ChannelError;
use crate::topology::ExchangeKind;

/// Stream of deliveries from one consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Incoming, ChannelError>>;

/// A confirm-mode channel owned by one worker instance.
///
/// Publishes wait for the broker's confirm, and every publish is mandatory
/// so an unroutable retry or quarantine message surfaces as an error
/// instead of vanishing.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    /// Open a channel with publisher confirms and a prefetch of one.
    pub async fn open(connection: &Connection) -> Result<Self, ChannelError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ChannelError::new("channel.open", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ChannelError::new("confirm.select", e))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| ChannelError::new("basic.qos", e))?;

        info!(channel_id = channel.id(), prefetch_count = 1, "rabbitmq_channel_created");

        Ok(Self { channel })
    }

    /// Start consuming `queue` with manual acknowledgements.
    pub async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::new("basic.consume", e))?;

        info!(queue = queue, consumer_tag = consumer_tag, "rabbitmq_consumer_started");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Incoming::from)
                    .map_err(|e| ChannelError::new("basic.deliver", e))
            })
            .boxed())
    }

    /// Stop the broker from sending further deliveries to `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) {
        if let Err(e) = self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer_tag = consumer_tag, error = %e, "rabbitmq_consumer_cancel_error");
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ChannelError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::new("exchange.declare", e))
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), ChannelError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::new("queue.declare", e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::new("queue.bind", e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_headers(envelope.headers.to_field_table());
        if let Some(message_id) = &envelope.message_id {
            properties = properties.with_message_id(message_id.clone().into());
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| ChannelError::new("basic.publish", e))?
            .await
            .map_err(|e| ChannelError::new("basic.publish", e))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(ChannelError::new(
                "basic.publish",
                "message was returned as unroutable",
            )),
            Confirmation::Nack(_) => Err(ChannelError::new(
                "basic.publish",
                "broker nacked the publish",
            )),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| ChannelError::new("basic.ack", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ChannelError::new("basic.nack", e))
    }
}
