//! Dead-letter inspector: observe quarantined jobs, optionally replay them.

use std::str::FromStr;

use futures::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::broker::BrokerChannel;
use crate::envelope::Incoming;
use crate::error::{ChannelError, ConsumeError};
use crate::producer::publish_envelope;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InspectMode {
    /// Report and acknowledge.
    #[default]
    Observe,
    /// Re-publish to the recorded origin with a fresh retry budget, then acknowledge.
    /// A job already replayed `max_replays` times is only reported.
    Replay { max_replays: u32 },
}

pub const DEFAULT_MAX_REPLAYS: u32 = 3;

impl FromStr for InspectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observe" | "log" => Ok(InspectMode::Observe),
            "replay" => Ok(InspectMode::Replay {
                max_replays: DEFAULT_MAX_REPLAYS,
            }),
            other => Err(format!("unknown inspect mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectOutcome {
    Logged,
    Replayed,
    /// Replay requested but the origin headers were missing; acknowledged without publishing.
    MissingOrigin,
    /// The job has used up its replays; acknowledged without publishing.
    ReplayLimitReached,
}

/// Receives every dead-lettered delivery before it is settled.
pub trait DeadLetterObserver: Send + Sync {
    fn observe(&self, queue: &str, incoming: &Incoming);
}

/// Default observer: one structured warning per quarantined job.
pub struct LoggingObserver;

impl DeadLetterObserver for LoggingObserver {
    fn observe(&self, queue: &str, incoming: &Incoming) {
        let headers = &incoming.envelope.headers;
        warn!(
            dead_letter_queue = queue,
            job_type = %incoming.envelope.job_type,
            message_id = ?incoming.envelope.message_id,
            retry_count = incoming.envelope.retry_count(),
            replay_count = headers.replay_count.unwrap_or(0),
            error = ?headers.error,
            original_error = ?headers.original_error,
            original_exchange = ?headers.original_exchange,
            original_routing_key = ?headers.original_routing_key,
            "dead_letter_received"
        );
    }
}

pub struct DeadLetterInspector<C, O = LoggingObserver> {
    channel: C,
    queue: String,
    mode: InspectMode,
    observer: O,
}

impl<C: BrokerChannel> DeadLetterInspector<C, LoggingObserver> {
    pub fn new(channel: C, queue: impl Into<String>, mode: InspectMode) -> Self {
        Self::with_observer(channel, queue, mode, LoggingObserver)
    }
}

impl<C, O> DeadLetterInspector<C, O>
where
    C: BrokerChannel,
    O: DeadLetterObserver,
{
    pub fn with_observer(channel: C, queue: impl Into<String>, mode: InspectMode, observer: O) -> Self {
        Self {
            channel,
            queue: queue.into(),
            mode,
            observer,
        }
    }

    pub async fn run<S>(&self, deliveries: S, mut shutdown: Shutdown) -> Result<(), ConsumeError>
    where
        S: Stream<Item = Result<Incoming, ChannelError>> + Unpin,
    {
        let mut deliveries = deliveries;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!(dead_letter_queue = %self.queue, "inspector_stopping");
                    break;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(incoming)) => {
                            self.inspect(incoming).await?;
                        }
                        Some(Err(e)) => {
                            error!(dead_letter_queue = %self.queue, error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!(dead_letter_queue = %self.queue, "rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Observe one dead-lettered delivery and settle it.
    pub async fn inspect(&self, incoming: Incoming) -> Result<InspectOutcome, ConsumeError> {
        self.observer.observe(&self.queue, &incoming);

        let outcome = match self.mode {
            InspectMode::Observe => InspectOutcome::Logged,
            InspectMode::Replay { max_replays }
                if incoming.envelope.headers.replay_count.unwrap_or(0) >= max_replays =>
            {
                warn!(
                    dead_letter_queue = %self.queue,
                    message_id = ?incoming.envelope.message_id,
                    max_replays = max_replays,
                    "dead_letter_replay_limit_reached"
                );
                InspectOutcome::ReplayLimitReached
            }
            InspectMode::Replay { .. } => match incoming.envelope.recorded_origin() {
                Some(origin) => {
                    let replayed = incoming.envelope.for_replay();
                    publish_envelope(&self.channel, &origin.exchange, &origin.routing_key, &replayed)
                        .await?;
                    info!(
                        dead_letter_queue = %self.queue,
                        message_id = ?incoming.envelope.message_id,
                        exchange = %origin.exchange,
                        routing_key = %origin.routing_key,
                        replay_count = replayed.headers.replay_count.unwrap_or(0),
                        "dead_letter_replayed"
                    );
                    InspectOutcome::Replayed
                }
                None => {
                    warn!(
                        dead_letter_queue = %self.queue,
                        message_id = ?incoming.envelope.message_id,
                        "dead_letter_missing_origin"
                    );
                    InspectOutcome::MissingOrigin
                }
            },
        };

        self.channel
            .ack(incoming.delivery_tag)
            .await
            .map_err(|source| ConsumeError::Settle {
                delivery_tag: incoming.delivery_tag,
                source,
            })?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Origin};
    use crate::testing::MemoryBroker;
    use crate::topology::{ensure_topology, ExchangeKind, Topology, DEAD_LETTER_ROUTING_KEY};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording(Mutex<Vec<Option<String>>>);

    impl DeadLetterObserver for Arc<Recording> {
        fn observe(&self, _queue: &str, incoming: &Incoming) {
            self.0.lock().unwrap().push(incoming.envelope.message_id.clone());
        }
    }

    fn email() -> Topology {
        Topology::new("email", "email-queue")
            .with_exchange("email.topic", ExchangeKind::Topic, "email.#")
            .with_retry(3, 5000)
            .with_dlq()
    }

    async fn quarantine(broker: &Arc<MemoryBroker>, envelope: &Envelope) {
        broker
            .publish("email-queue.dlx", DEAD_LETTER_ROUTING_KEY, envelope)
            .await
            .unwrap();
    }

    const REPLAY: InspectMode = InspectMode::Replay { max_replays: 3 };

    fn dead_envelope() -> Envelope {
        let origin = Origin {
            exchange: "email.topic".to_string(),
            routing_key: "email.send-otp".to_string(),
        };
        Envelope::encode("send-otp", &json!({"to": "a@example.com"}))
            .unwrap()
            .for_quarantine(3, "smtp down", &origin)
    }

    #[tokio::test]
    async fn test_observe_logs_and_acks() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        let dead = dead_envelope();
        quarantine(&broker, &dead).await;

        let recording = Arc::new(Recording::default());
        let inspector = DeadLetterInspector::with_observer(
            broker.clone(),
            "email-queue.dlq",
            InspectMode::Observe,
            recording.clone(),
        );

        let incoming = broker.deliver("email-queue.dlq").unwrap();
        let outcome = inspector.inspect(incoming).await.unwrap();

        assert_eq!(outcome, InspectOutcome::Logged);
        assert_eq!(*recording.0.lock().unwrap(), vec![dead.message_id.clone()]);
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.depth("email-queue"), 0);
    }

    #[tokio::test]
    async fn test_replay_republishes_to_origin() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        let dead = dead_envelope();
        quarantine(&broker, &dead).await;

        let inspector = DeadLetterInspector::new(broker.clone(), "email-queue.dlq", REPLAY);
        let incoming = broker.deliver("email-queue.dlq").unwrap();
        let outcome = inspector.inspect(incoming).await.unwrap();

        assert_eq!(outcome, InspectOutcome::Replayed);
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.depth("email-queue.dlq"), 0);

        let replayed = &broker.messages("email-queue")[0];
        assert_eq!(replayed.body, dead.body);
        assert_eq!(replayed.retry_count(), 0);
        assert_eq!(replayed.headers.replay_count, Some(1));
        assert_eq!(replayed.headers.original_error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn test_replay_without_origin_warns_and_acks() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        let bare = Envelope::encode("send-otp", &json!({})).unwrap();
        quarantine(&broker, &bare).await;

        let inspector = DeadLetterInspector::new(broker.clone(), "email-queue.dlq", REPLAY);
        let incoming = broker.deliver("email-queue.dlq").unwrap();
        let published_before = broker.published().len();
        let outcome = inspector.inspect(incoming).await.unwrap();

        assert_eq!(outcome, InspectOutcome::MissingOrigin);
        assert_eq!(broker.published().len(), published_before);
        assert_eq!(broker.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_publish_failure_leaves_delivery_unacked() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        quarantine(&broker, &dead_envelope()).await;

        let inspector = DeadLetterInspector::new(broker.clone(), "email-queue.dlq", REPLAY);
        let incoming = broker.deliver("email-queue.dlq").unwrap();
        broker.fail_publishes(true);

        assert!(inspector.inspect(incoming).await.is_err());
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn test_replay_stops_at_max_replays() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        quarantine(&broker, &dead_envelope()).await;
        let origin = Origin {
            exchange: "email.topic".to_string(),
            routing_key: "email.send-otp".to_string(),
        };

        let inspector = DeadLetterInspector::new(
            broker.clone(),
            "email-queue.dlq",
            InspectMode::Replay { max_replays: 2 },
        );

        // The job keeps failing: every replay lands back in the DLQ.
        let mut outcomes = Vec::new();
        while let Some(dead) = broker.deliver("email-queue.dlq") {
            outcomes.push(inspector.inspect(dead).await.unwrap());
            if let Some(replayed) = broker.deliver("email-queue") {
                broker.ack(replayed.delivery_tag).await.unwrap();
                let failed = replayed.envelope.for_quarantine(3, "smtp down", &origin);
                quarantine(&broker, &failed).await;
            }
            assert!(outcomes.len() <= 3, "replay never stopped");
        }

        assert_eq!(
            outcomes,
            vec![
                InspectOutcome::Replayed,
                InspectOutcome::Replayed,
                InspectOutcome::ReplayLimitReached,
            ]
        );
        assert_eq!(broker.depth("email-queue"), 0);
        assert_eq!(broker.depth("email-queue.dlq"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_limit_acks_without_publishing() {
        let broker = Arc::new(MemoryBroker::new());
        ensure_topology(&broker, &email()).await.unwrap();
        let origin = Origin {
            exchange: "email.topic".to_string(),
            routing_key: "email.send-otp".to_string(),
        };
        let spent = dead_envelope()
            .for_replay()
            .for_replay()
            .for_replay()
            .for_quarantine(3, "smtp down", &origin);
        quarantine(&broker, &spent).await;

        let inspector = DeadLetterInspector::new(broker.clone(), "email-queue.dlq", REPLAY);
        let incoming = broker.deliver("email-queue.dlq").unwrap();
        let published_before = broker.published().len();
        let outcome = inspector.inspect(incoming).await.unwrap();

        assert_eq!(outcome, InspectOutcome::ReplayLimitReached);
        assert_eq!(broker.published().len(), published_before);
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.depth("email-queue"), 0);
    }

    #[test]
    fn test_inspect_mode_from_str() {
        assert_eq!(
            "replay".parse::<InspectMode>().unwrap(),
            InspectMode::Replay {
                max_replays: DEFAULT_MAX_REPLAYS
            }
        );
        assert_eq!(" Observe ".parse::<InspectMode>().unwrap(), InspectMode::Observe);
        assert!("forward".parse::<InspectMode>().is_err());
    }
}
