//! Error taxonomy for the reliability layer.
//!
//! Each failure class maps to one recovery rule:
//! - [`ConnectionError`]: retried a bounded number of times, then fatal at start-up
//! - [`TopologyError`]: fatal, redeclaring cannot change broker-side state
//! - [`PublishError`]: fatal for the delivery being processed, which stays unacknowledged
//! - [`HandlerError`]: recoverable through retry or quarantine
//! - [`MailError`]: becomes a retryable or permanent `HandlerError`

use thiserror::Error;

/// A single broker channel operation that failed.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {reason}")]
pub struct ChannelError {
    pub operation: &'static str,
    pub reason: String,
}

impl ChannelError {
    pub fn new(operation: &'static str, reason: impl ToString) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// The broker could not be reached.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("could not connect to broker after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("failed to open channel: {0}")]
    Channel(#[from] ChannelError),
}

/// The broker rejected (or we refused to send) a topology declaration.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid topology for queue {queue}: {reason}")]
    Invalid { queue: String, reason: String },

    #[error("broker rejected {object}: {source}")]
    Rejected {
        object: String,
        #[source]
        source: ChannelError,
    },
}

/// A message could not be enqueued.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] EnvelopeError),

    #[error("publish to exchange {exchange:?} with routing key {routing_key:?} failed: {source}")]
    Rejected {
        exchange: String,
        routing_key: String,
        #[source]
        source: ChannelError,
    },
}

/// A consumer stopped because a delivery could not be settled safely.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("failed to settle delivery {delivery_tag}: {source}")]
    Settle {
        delivery_tag: u64,
        #[source]
        source: ChannelError,
    },

    #[error("failed to start consumer on {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: ChannelError,
    },
}

/// A message body that is not a valid job envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("body has no string jobType field")]
    MissingJobType,
}

/// The email API refused or never answered a send.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("email API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("email API returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl MailError {
    /// Client errors other than timeouts and throttling will fail again on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            MailError::Transport(_) => false,
            MailError::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
        }
    }
}

/// A handler's failure, classified for the retry escalation policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    /// A failure that may succeed on a later attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure no retry can fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(e: EnvelopeError) -> Self {
        Self::permanent(e.to_string())
    }
}

impl From<MailError> for HandlerError {
    fn from(e: MailError) -> Self {
        if e.is_permanent() {
            Self::permanent(e.to_string())
        } else {
            Self::retryable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent(format!("invalid payload: {e}"))
    }
}
