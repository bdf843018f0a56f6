//! Connection manager: connect to the broker with a bounded number of attempts.
//!
//! Every attempt is a fresh handshake; nothing from a failed attempt is kept.
//! Exhausting the attempts is fatal so that a worker without a broker never
//! reports itself ready.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use lapin::{Connection, ConnectionProperties};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::AmqpChannel;
use crate::config::BrokerEndpoint;
use crate::error::ConnectionError;

/// How many times to try connecting and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Process-wide broker connection. Each worker instance opens its own channel on it.
pub struct BrokerConnection {
    connection: Connection,
}

impl BrokerConnection {
    pub async fn open_channel(&self) -> Result<AmqpChannel, ConnectionError> {
        Ok(AmqpChannel::open(&self.connection).await?)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }
        info!("rabbitmq_connection_closed");
    }
}

/// Connect to `endpoint`, retrying per `policy`.
pub async fn connect(
    endpoint: &BrokerEndpoint,
    policy: &ConnectPolicy,
) -> Result<BrokerConnection, ConnectionError> {
    let uri = endpoint.uri()?;

    info!(endpoint = %endpoint.redacted(), "rabbitmq_connect_start");

    let connection = retry_connect(policy, |_| {
        Connection::connect(&uri, ConnectionProperties::default())
    })
    .await?;

    Ok(BrokerConnection { connection })
}

/// Run `connect_once` until it succeeds or `policy.max_attempts` is reached.
///
/// `connect_once` receives the 1-based attempt number.
pub async fn retry_connect<T, E, F, Fut>(
    policy: &ConnectPolicy,
    mut connect_once: F,
) -> Result<T, ConnectionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        info!(attempt = attempt, max_attempts = attempts, "rabbitmq_connecting");

        match connect_once(attempt).await {
            Ok(connection) => {
                info!(attempt = attempt, "rabbitmq_connected");
                return Ok(connection);
            }
            Err(e) => {
                last_error = e.to_string();
                error!(
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %last_error,
                    "rabbitmq_connect_failed"
                );
                if attempt < attempts {
                    sleep(policy.delay).await;
                }
            }
        }
    }

    Err(ConnectionError::Exhausted {
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    fn policy(delay: Duration) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: 5,
            delay,
        }
    }

    #[tokio::test]
    async fn test_retry_connect_succeeds_after_failures() {
        let calls = Cell::new(0);

        let result = retry_connect(&policy(Duration::ZERO), |attempt| {
            calls.set(calls.get() + 1);
            async move {
                if attempt < 3 {
                    Err("connection refused")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_connect_exhausts_attempts() {
        let calls = Cell::new(0);

        let result: Result<(), _> = retry_connect(&policy(Duration::ZERO), |_| {
            calls.set(calls.get() + 1);
            async { Err("connection refused") }
        })
        .await;

        assert_eq!(calls.get(), 5);
        match result {
            Err(ConnectionError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_connect_sleeps_between_attempts_only() {
        let started = Instant::now();

        let _: Result<(), _> = retry_connect(&ConnectPolicy::default(), |_| async {
            Err("connection refused")
        })
        .await;

        // 5 attempts, 4 gaps of 3s, no sleep after the last one
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_retry_connect_zero_attempts_still_tries_once() {
        let calls = Cell::new(0);
        let policy = ConnectPolicy {
            max_attempts: 0,
            delay: Duration::ZERO,
        };

        let result = retry_connect(&policy, |_| {
            calls.set(calls.get() + 1);
            async { Ok::<_, String>(()) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.get(), 1);
    }
}
