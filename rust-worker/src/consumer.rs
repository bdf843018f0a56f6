//! Consumer loop: run the handler for each delivery and settle it.
//!
//! Every delivery ends in exactly one [`Disposition`]. Retry and quarantine
//! envelopes are published and confirmed before the original delivery is
//! acknowledged, so a crash between the two steps duplicates a job rather
//! than losing it.

use futures::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::broker::BrokerChannel;
use crate::envelope::{Incoming, Origin};
use crate::error::{ChannelError, ConsumeError, HandlerError};
use crate::handler::JobHandler;
use crate::policy::{plan_failure, Disposition};
use crate::producer::publish_envelope;
use crate::shutdown::Shutdown;
use crate::topology::{Topology, DEAD_LETTER_ROUTING_KEY};

pub struct JobConsumer<C, H> {
    channel: C,
    topology: Topology,
    handler: H,
}

impl<C, H> JobConsumer<C, H>
where
    C: BrokerChannel,
    H: JobHandler,
{
    pub fn new(channel: C, topology: Topology, handler: H) -> Self {
        Self {
            channel,
            topology,
            handler,
        }
    }

    /// Process deliveries until the stream ends or shutdown is triggered.
    ///
    /// Shutdown is only observed between deliveries; an in-flight handler
    /// and its disposition always complete.
    pub async fn run<S>(&self, deliveries: S, mut shutdown: Shutdown) -> Result<(), ConsumeError>
    where
        S: Stream<Item = Result<Incoming, ChannelError>> + Unpin,
    {
        let mut deliveries = deliveries;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!(queue = %self.topology.queue, "consumer_stopping");
                    break;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(incoming)) => {
                            self.handle(incoming).await?;
                        }
                        Some(Err(e)) => {
                            error!(queue = %self.topology.queue, error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!(queue = %self.topology.queue, "rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the handler for one delivery and carry out its disposition.
    ///
    /// On `Err` the delivery has not been settled.
    pub async fn handle(&self, incoming: Incoming) -> Result<Disposition, ConsumeError> {
        let envelope = &incoming.envelope;
        let retry_count = envelope.retry_count();

        info!(
            queue = %self.topology.queue,
            job_type = %envelope.job_type,
            message_id = ?envelope.message_id,
            delivery_tag = incoming.delivery_tag,
            retry_count = retry_count,
            redelivered = incoming.redelivered,
            "job_received"
        );

        let outcome = match envelope.job() {
            Ok(job) => self.handler.handle(&job).await,
            Err(e) => Err(HandlerError::from(e)),
        };

        let (disposition, failure) = match outcome {
            Ok(()) => (Disposition::Acknowledge, None),
            Err(e) => {
                warn!(
                    queue = %self.topology.queue,
                    job_type = %envelope.job_type,
                    message_id = ?envelope.message_id,
                    retry_count = retry_count,
                    permanent = e.is_permanent(),
                    error = %e,
                    "job_failed"
                );
                (plan_failure(&self.topology, retry_count, &e), Some(e))
            }
        };

        self.settle(&incoming, disposition, failure.as_ref()).await?;
        Ok(disposition)
    }

    async fn settle(
        &self,
        incoming: &Incoming,
        disposition: Disposition,
        failure: Option<&HandlerError>,
    ) -> Result<(), ConsumeError> {
        let envelope = &incoming.envelope;
        let error = failure.map(HandlerError::message).unwrap_or_default();
        let origin = Origin::resolve(&envelope.headers, &incoming.exchange, &incoming.routing_key);

        match disposition {
            Disposition::Acknowledge => {
                self.ack(incoming.delivery_tag).await?;
                info!(
                    queue = %self.topology.queue,
                    job_type = %envelope.job_type,
                    message_id = ?envelope.message_id,
                    "job_completed"
                );
            }
            Disposition::RequeueRetry { retry_count } => {
                let retry_queue = self.topology.retry_queue();
                let retried = envelope.for_retry(retry_count, error, &origin);
                publish_envelope(&self.channel, "", &retry_queue, &retried).await?;
                self.ack(incoming.delivery_tag).await?;
                info!(
                    queue = %self.topology.queue,
                    job_type = %envelope.job_type,
                    message_id = ?envelope.message_id,
                    retry_count = retry_count,
                    max_retries = self.topology.max_retries,
                    delay_ms = self.topology.retry_ttl_ms(),
                    "job_retry_scheduled"
                );
            }
            Disposition::Quarantine { retry_count } => {
                let dlx = self.topology.dead_letter_exchange();
                let quarantined = envelope.for_quarantine(retry_count, error, &origin);
                publish_envelope(&self.channel, &dlx, DEAD_LETTER_ROUTING_KEY, &quarantined).await?;
                self.ack(incoming.delivery_tag).await?;
                warn!(
                    queue = %self.topology.queue,
                    job_type = %envelope.job_type,
                    message_id = ?envelope.message_id,
                    retry_count = retry_count,
                    dead_letter_queue = %self.topology.dead_letter_queue(),
                    error = error,
                    "job_quarantined"
                );
            }
            Disposition::Reject => {
                self.channel
                    .nack(incoming.delivery_tag, false)
                    .await
                    .map_err(|source| ConsumeError::Settle {
                        delivery_tag: incoming.delivery_tag,
                        source,
                    })?;
                warn!(
                    queue = %self.topology.queue,
                    job_type = %envelope.job_type,
                    message_id = ?envelope.message_id,
                    error = error,
                    "job_rejected"
                );
            }
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError> {
        self.channel.ack(delivery_tag).await.map_err(|source| {
            error!(delivery_tag = delivery_tag, error = %source, "rabbitmq_ack_failed");
            ConsumeError::Settle {
                delivery_tag,
                source,
            }
        })
    }
}
