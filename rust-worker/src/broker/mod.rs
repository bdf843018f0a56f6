//! Broker access for the reliability layer.
//!
//! - `connection`: connect with bounded retry
//! - `amqp`: lapin-backed channel used in production
//!
//! Everything above this module talks to the broker through
//! [`BrokerChannel`], so topology, consumer and inspector logic can run
//! against an in-memory broker in tests.

pub mod amqp;
pub mod connection;

use std::sync::Arc;

use async_trait::async_trait;
use lapin::types::FieldTable;

use crate::envelope::Envelope;
use crate::error::ChannelError;
use crate::topology::ExchangeKind;

pub use amqp::{AmqpChannel, DeliveryStream};
pub use connection::{connect, retry_connect, BrokerConnection, ConnectPolicy};

/// The channel operations the reliability layer needs.
///
/// Publishes must only return `Ok` once the broker has taken responsibility
/// for the message.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ChannelError>;

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), ChannelError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), ChannelError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;
}

#[async_trait]
impl<T: BrokerChannel + ?Sized> BrokerChannel for Arc<T> {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ChannelError> {
        (**self).declare_exchange(name, kind, durable).await
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), ChannelError> {
        (**self).declare_queue(name, durable, arguments).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError> {
        (**self).bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        (**self).publish(exchange, routing_key, envelope).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        (**self).ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        (**self).nack(delivery_tag, requeue).await
    }
}
