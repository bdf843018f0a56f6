//! Producer: publish job envelopes.
//!
//! The Producer never sets retry bookkeeping headers; every job starts its
//! life without `x-retry-count`, which consumers read as 0.

use serde::Serialize;
use tracing::{error, info};

use crate::broker::BrokerChannel;
use crate::envelope::Envelope;
use crate::error::PublishError;
use crate::topology::Topology;

pub struct Producer<C> {
    channel: C,
}

impl<C: BrokerChannel> Producer<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Publish `envelope` and wait for the broker to take it.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        publish_envelope(&self.channel, exchange, routing_key, envelope).await?;

        info!(
            exchange = exchange,
            routing_key = routing_key,
            job_type = %envelope.job_type,
            message_id = ?envelope.message_id,
            "job_published"
        );
        Ok(())
    }

    /// Encode `payload` as a `job_type` job and publish it into `topology`.
    ///
    /// Returns the message id assigned to the job.
    pub async fn send<T: Serialize>(
        &self,
        topology: &Topology,
        job_type: &str,
        payload: &T,
    ) -> Result<Option<String>, PublishError> {
        let envelope = Envelope::encode(job_type, payload)?;
        let routing_key = topology.publish_routing_key(job_type);

        self.publish(topology.publish_exchange(), &routing_key, &envelope)
            .await?;

        Ok(envelope.message_id)
    }
}

/// Publish with confirms, mapping channel failures to [`PublishError`].
pub(crate) async fn publish_envelope<C>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    envelope: &Envelope,
) -> Result<(), PublishError>
where
    C: BrokerChannel + ?Sized,
{
    channel
        .publish(exchange, routing_key, envelope)
        .await
        .map_err(|source| {
            error!(
                exchange = exchange,
                routing_key = routing_key,
                message_id = ?envelope.message_id,
                error = %source,
                "rabbitmq_publish_failed"
            );
            PublishError::Rejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                source,
            }
        })
}
