//! Configuration module for environment variable parsing.
//!
//! Everything is read once at start-up into [`Config`]; the per-category
//! topologies are plain values handed to the workers.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::broker::ConnectPolicy;
use crate::error::ConnectionError;
use crate::inspector::{InspectMode, DEFAULT_MAX_REPLAYS};
use crate::topology::{ExchangeKind, Topology};

/// Where the broker lives and how to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// `None` means the broker's default vhost.
    pub vhost: Option<String>,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: None,
        }
    }
}

impl std::fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl BrokerEndpoint {
    /// AMQP URI with percent-encoded credentials and vhost.
    pub fn uri(&self) -> Result<String, ConnectionError> {
        let invalid = |reason: &str| ConnectionError::InvalidEndpoint(reason.to_string());

        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| invalid(&format!("{}: {}", self.host, e)))?;
        url.set_username(&self.username)
            .map_err(|_| invalid("cannot set username"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid("cannot set password"))?;

        if let Some(vhost) = &self.vhost {
            url.path_segments_mut()
                .map_err(|_| invalid("cannot set vhost"))?
                .clear()
                .push(vhost);
        }

        Ok(url.to_string())
    }

    /// The endpoint as it may appear in logs.
    pub fn redacted(&self) -> String {
        let vhost = self.vhost.as_deref().unwrap_or("/");
        format!(
            "amqp://{}:***@{}:{} vhost={}",
            self.username, self.host, self.port, vhost
        )
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerEndpoint,

    /// Connection attempts before start-up is aborted
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts
    pub connect_delay_ms: u64,

    /// Port for /health and /ready
    pub health_port: u16,

    /// HTTP email API; log-only mailer when unset
    pub mailer_api_url: Option<String>,

    pub mailer_api_key: Option<String>,

    /// Sender for jobs that do not name one
    pub mail_from: String,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Dead-letter inspector mode
    pub inspect_mode: InspectMode,

    /// One topology per job category
    pub topologies: Vec<Topology>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let broker = BrokerEndpoint {
            host: env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_or("RABBITMQ_PORT", 5672),
            username: env::var("RABBITMQ_DEFAULT_USER").unwrap_or_else(|_| "guest".to_string()),
            password: env::var("RABBITMQ_DEFAULT_PASS").unwrap_or_else(|_| "guest".to_string()),
            vhost: env::var("RABBITMQ_VHOST").ok().filter(|v| !v.is_empty()),
        };

        Config {
            broker,
            connect_attempts: parse_or("RABBITMQ_CONNECT_ATTEMPTS", 5),
            connect_delay_ms: parse_or("RABBITMQ_CONNECT_DELAY_MS", 3000),
            health_port: parse_or("HEALTH_PORT", 8080),
            mailer_api_url: env::var("MAILER_API_URL").ok().filter(|v| !v.is_empty()),
            mailer_api_key: env::var("MAILER_API_KEY").ok().filter(|v| !v.is_empty()),
            mail_from: env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@localhost".to_string()),
            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", 8000),
            inspect_mode: inspect_mode_from_env(),
            topologies: vec![
                category_from_env("EMAIL", email_topology()),
                category_from_env("ORDER", order_topology()),
            ],
        }
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_delay_ms),
        }
    }

    pub fn topology(&self, category: &str) -> Option<&Topology> {
        self.topologies.iter().find(|t| t.category == category)
    }
}

pub fn email_topology() -> Topology {
    Topology::new("email", "email-queue")
        .with_exchange("email.topic", ExchangeKind::Topic, "email.#")
        .with_retry(3, 5000)
        .with_dlq()
}

pub fn order_topology() -> Topology {
    Topology::new("order", "order-queue")
        .with_exchange("order.topic", ExchangeKind::Topic, "order.#")
        .with_retry(3, 5000)
        .with_dlq()
}

/// Apply `<PREFIX>_MAX_RETRIES`, `_RETRY_DELAY_MS`, `_RETRY_ENABLED` and
/// `_DLQ_ENABLED` overrides to a category's default topology.
fn category_from_env(prefix: &str, mut topology: Topology) -> Topology {
    topology.max_retries = parse_or(&format!("{prefix}_MAX_RETRIES"), topology.max_retries);
    topology.retry_delay_ms = parse_or(&format!("{prefix}_RETRY_DELAY_MS"), topology.retry_delay_ms);
    topology.retry_enabled = parse_bool(&format!("{prefix}_RETRY_ENABLED"), topology.retry_enabled);
    topology.dlq_enabled = parse_bool(&format!("{prefix}_DLQ_ENABLED"), topology.dlq_enabled);
    topology
}

/// Parse an environment variable, warning and falling back on malformed values.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, default = %default, "Invalid value, using default");
            default
        }
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, default = default, "Invalid boolean, using default");
            default
        }
    }
}

/// `DLQ_REPLAY` turns on replay, capped at `DLQ_MAX_REPLAYS` per job.
fn inspect_mode_from_env() -> InspectMode {
    if parse_bool("DLQ_REPLAY", false) {
        InspectMode::Replay {
            max_replays: parse_or("DLQ_MAX_REPLAYS", DEFAULT_MAX_REPLAYS),
        }
    } else {
        InspectMode::Observe
    }
}
