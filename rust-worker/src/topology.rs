//! Topology builder: exchanges, queues and bindings for one job category.
//!
//! ```text
//!                 routing key              TTL expiry (retry_delay_ms)
//! Producer → exchange ──────→ <queue> ←──────────────── <queue>.retry
//!                                │   handler failed, retries left ↑
//!                                ├────────────────────────────────┘
//!                                │   retries exhausted
//!                                └──→ <queue>.dlx ──→ <queue>.dlq
//! ```
//!
//! Derived names are pure functions of the base queue name, so every process
//! declares the same objects without coordination and redeclaration is
//! idempotent.

use std::fmt;
use std::str::FromStr;

use lapin::types::{AMQPValue, FieldTable, LongString};
use tracing::info;

use crate::broker::BrokerChannel;
use crate::error::TopologyError;

/// Lower bound on the retry delay.
pub const MIN_RETRY_DELAY_MS: u64 = 1000;

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";

/// Routing key used between the dead-letter exchange and queue.
pub const DEAD_LETTER_ROUTING_KEY: &str = "";

pub fn retry_queue_name(queue: &str) -> String {
    format!("{}.retry", queue)
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}.dlq", queue)
}

pub fn dead_letter_exchange_name(queue: &str) -> String {
    format!("{}.dlx", queue)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind: {other}")),
        }
    }
}

/// Declarative description of one job category's broker objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Job category name, e.g. `email`.
    pub category: String,
    pub queue: String,
    /// `None` publishes through the default exchange straight to `queue`.
    pub exchange: Option<String>,
    pub exchange_kind: ExchangeKind,
    /// Binding key between `exchange` and `queue`.
    pub routing_key: String,
    pub durable: bool,
    pub retry_enabled: bool,
    pub dlq_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Topology {
    /// A durable queue with no exchange, retry or DLQ.
    pub fn new(category: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            queue: queue.into(),
            exchange: None,
            exchange_kind: ExchangeKind::Direct,
            routing_key: String::new(),
            durable: true,
            retry_enabled: false,
            dlq_enabled: false,
            max_retries: 3,
            retry_delay_ms: 5000,
        }
    }

    pub fn with_exchange(
        mut self,
        exchange: impl Into<String>,
        kind: ExchangeKind,
        routing_key: impl Into<String>,
    ) -> Self {
        let exchange = exchange.into();
        self.exchange = (!exchange.is_empty()).then_some(exchange);
        self.exchange_kind = kind;
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.retry_enabled = true;
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_dlq(mut self) -> Self {
        self.dlq_enabled = true;
        self
    }

    pub fn retry_queue(&self) -> String {
        retry_queue_name(&self.queue)
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue_name(&self.queue)
    }

    pub fn dead_letter_exchange(&self) -> String {
        dead_letter_exchange_name(&self.queue)
    }

    pub fn retry_ttl_ms(&self) -> u64 {
        self.retry_delay_ms.max(MIN_RETRY_DELAY_MS)
    }

    /// Routing key a Producer uses to reach this category's queue for `job_type`.
    ///
    /// A topic binding ending in a wildcard (`email.#`) gets the job type
    /// substituted (`email.send-otp`); any other binding key is used as is.
    pub fn publish_routing_key(&self, job_type: &str) -> String {
        if self.exchange.is_none() {
            return self.queue.clone();
        }
        if self.exchange_kind == ExchangeKind::Topic {
            if let Some(prefix) = self
                .routing_key
                .strip_suffix(".#")
                .or_else(|| self.routing_key.strip_suffix(".*"))
            {
                return format!("{}.{}", prefix, job_type);
            }
        }
        self.routing_key.clone()
    }

    /// Exchange a Producer publishes to; the default exchange when none is configured.
    pub fn publish_exchange(&self) -> &str {
        self.exchange.as_deref().unwrap_or("")
    }

    /// Arguments for the main queue.
    ///
    /// With retry enabled, broker-side dead-lettering (TTL expiry or a
    /// non-requeue nack) redirects to the retry queue.
    pub fn main_queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if self.retry_enabled {
            args.insert(DEAD_LETTER_EXCHANGE_ARG.into(), long_string(""));
            args.insert(
                DEAD_LETTER_ROUTING_KEY_ARG.into(),
                long_string(&self.retry_queue()),
            );
        }
        args
    }

    /// Arguments for the retry queue: hold for the TTL, then dead-letter back.
    pub fn retry_queue_arguments(&self) -> FieldTable {
        let (exchange, routing_key) = match &self.exchange {
            Some(exchange) if !self.routing_key.is_empty() => (exchange.as_str(), self.routing_key.as_str()),
            Some(exchange) => (exchange.as_str(), self.queue.as_str()),
            None => ("", self.queue.as_str()),
        };

        let mut args = FieldTable::default();
        args.insert(
            MESSAGE_TTL_ARG.into(),
            AMQPValue::LongLongInt(i64::try_from(self.retry_ttl_ms()).unwrap_or(i64::MAX)),
        );
        args.insert(DEAD_LETTER_EXCHANGE_ARG.into(), long_string(exchange));
        args.insert(DEAD_LETTER_ROUTING_KEY_ARG.into(), long_string(routing_key));
        args
    }

    /// Check the invariants that must hold before anything is declared.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let invalid = |reason: &str| TopologyError::Invalid {
            queue: self.queue.clone(),
            reason: reason.to_string(),
        };

        if self.queue.is_empty() {
            return Err(invalid("queue name is empty"));
        }
        if self.queue.starts_with("amq.") {
            return Err(invalid("queue names starting with amq. are reserved"));
        }
        if let Some(exchange) = &self.exchange {
            if exchange.starts_with("amq.") {
                return Err(invalid("exchange names starting with amq. are reserved"));
            }
        }
        if self.retry_enabled && !self.dlq_enabled {
            return Err(invalid("retry requires a dead-letter queue for exhausted jobs"));
        }
        if self.retry_enabled && self.max_retries == 0 {
            return Err(invalid("retry requires max_retries of at least 1"));
        }
        Ok(())
    }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

fn rejected(object: String) -> impl FnOnce(crate::error::ChannelError) -> TopologyError {
    move |source| TopologyError::Rejected { object, source }
}

/// Declare-if-absent every broker object `topology` describes.
///
/// Safe to call repeatedly with the same topology. A mismatch with an
/// existing object's arguments is a fatal [`TopologyError`].
pub async fn ensure_topology<C>(channel: &C, topology: &Topology) -> Result<(), TopologyError>
where
    C: BrokerChannel + ?Sized,
{
    topology.validate()?;

    channel
        .declare_queue(&topology.queue, topology.durable, topology.main_queue_arguments())
        .await
        .map_err(rejected(format!("queue {}", topology.queue)))?;

    if let Some(exchange) = &topology.exchange {
        channel
            .declare_exchange(exchange, topology.exchange_kind, topology.durable)
            .await
            .map_err(rejected(format!("exchange {}", exchange)))?;

        channel
            .bind_queue(&topology.queue, exchange, &topology.routing_key)
            .await
            .map_err(rejected(format!("binding {} -> {}", exchange, topology.queue)))?;
    }

    info!(
        category = %topology.category,
        queue = %topology.queue,
        exchange = ?topology.exchange,
        exchange_kind = %topology.exchange_kind,
        routing_key = %topology.routing_key,
        "rabbitmq_main_queue_declared"
    );

    if topology.dlq_enabled {
        let dlx = topology.dead_letter_exchange();
        let dlq = topology.dead_letter_queue();

        channel
            .declare_exchange(&dlx, ExchangeKind::Direct, true)
            .await
            .map_err(rejected(format!("exchange {}", dlx)))?;

        channel
            .declare_queue(&dlq, true, FieldTable::default())
            .await
            .map_err(rejected(format!("queue {}", dlq)))?;

        channel
            .bind_queue(&dlq, &dlx, DEAD_LETTER_ROUTING_KEY)
            .await
            .map_err(rejected(format!("binding {} -> {}", dlx, dlq)))?;

        info!(dead_letter_exchange = %dlx, dead_letter_queue = %dlq, "rabbitmq_dead_letter_declared");
    }

    if topology.retry_enabled {
        let retry = topology.retry_queue();

        channel
            .declare_queue(&retry, true, topology.retry_queue_arguments())
            .await
            .map_err(rejected(format!("queue {}", retry)))?;

        info!(
            retry_queue = %retry,
            ttl_ms = topology.retry_ttl_ms(),
            max_retries = topology.max_retries,
            "rabbitmq_retry_queue_declared"
        );
    }

    Ok(())
}
