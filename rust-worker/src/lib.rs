//! JobRelay - reliable background jobs on RabbitMQ.
//!
//! Shared modules for the two JobRelay binaries:
//! - `jobrelay-worker`: consumes every job category, retries and quarantines failures
//! - `jobrelay-publish`: enqueues a single job by hand
//!
//! ## Architecture
//!
//! ```text
//! Producer → exchange → <queue> → JobConsumer → handler
//!                          ↑          │ failed, retries left
//!                   TTL    │          ├──→ <queue>.retry
//!                          └──────────┘
//!                                     │ retries exhausted / permanent
//!                                     └──→ <queue>.dlx → <queue>.dlq → DeadLetterInspector
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod health;
pub mod inspector;
pub mod jobs;
pub mod mailer;
pub mod policy;
pub mod producer;
pub mod shutdown;
pub mod topology;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use broker::{connect, BrokerChannel, BrokerConnection, ConnectPolicy};
pub use config::{BrokerEndpoint, Config};
pub use consumer::JobConsumer;
pub use envelope::{Envelope, Job};
pub use error::HandlerError;
pub use handler::{HandlerRegistry, JobHandler};
pub use inspector::{DeadLetterInspector, InspectMode};
pub use policy::{decide, Disposition, RetryDecision};
pub use producer::Producer;
pub use topology::{ensure_topology, ExchangeKind, Topology};
pub use worker::JobWorker;
