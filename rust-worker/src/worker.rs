//! One worker instance: a channel of its own plus the topology it serves.

use serde::Serialize;
use tracing::info;

use crate::broker::{AmqpChannel, BrokerConnection, DeliveryStream};
use crate::consumer::JobConsumer;
use crate::error::{ConnectionError, ConsumeError, PublishError, TopologyError};
use crate::handler::JobHandler;
use crate::inspector::{DeadLetterInspector, InspectMode};
use crate::producer::Producer;
use crate::shutdown::Shutdown;
use crate::topology::{ensure_topology, Topology};

pub struct JobWorker {
    channel: AmqpChannel,
    topology: Topology,
    consumer_tag: String,
}

impl JobWorker {
    /// Open a dedicated channel on `connection` for `topology`.
    pub async fn open(connection: &BrokerConnection, topology: Topology) -> Result<Self, ConnectionError> {
        let channel = connection.open_channel().await?;
        let consumer_tag = format!(
            "jobrelay-{}-{:08x}",
            topology.category,
            rand::random::<u32>()
        );
        Ok(Self {
            channel,
            topology,
            consumer_tag,
        })
    }

    pub async fn declare(&self) -> Result<(), TopologyError> {
        ensure_topology(&self.channel, &self.topology).await
    }

    /// Publish one job into this worker's topology.
    pub async fn send<T: Serialize>(&self, job_type: &str, payload: &T) -> Result<Option<String>, PublishError> {
        Producer::new(self.channel.clone())
            .send(&self.topology, job_type, payload)
            .await
    }

    /// Start receiving deliveries from `queue`.
    pub async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ConsumeError> {
        self.channel
            .subscribe(queue, &self.consumer_tag)
            .await
            .map_err(|source| ConsumeError::Subscribe {
                queue: queue.to_string(),
                source,
            })
    }

    /// Consume the main queue until shutdown, then release the channel.
    pub async fn run_consumer<H: JobHandler>(
        self,
        deliveries: DeliveryStream,
        handler: H,
        shutdown: Shutdown,
    ) -> Result<(), ConsumeError> {
        let consumer = JobConsumer::new(self.channel.clone(), self.topology.clone(), handler);
        let result = consumer.run(deliveries, shutdown).await;
        self.release().await;
        result
    }

    /// Inspect the dead-letter queue until shutdown, then release the channel.
    pub async fn run_inspector(
        self,
        deliveries: DeliveryStream,
        mode: InspectMode,
        shutdown: Shutdown,
    ) -> Result<(), ConsumeError> {
        let inspector = DeadLetterInspector::new(
            self.channel.clone(),
            self.topology.dead_letter_queue(),
            mode,
        );
        let result = inspector.run(deliveries, shutdown).await;
        self.release().await;
        result
    }

    async fn release(&self) {
        self.channel.cancel(&self.consumer_tag).await;
        self.channel.close().await;
        info!(
            category = %self.topology.category,
            consumer_tag = %self.consumer_tag,
            "worker_channel_released"
        );
    }
}
