//! JobRelay Worker - RabbitMQ consumer with bounded retry and dead-letter quarantine.
//!
//! Declares the topology of every configured job category, consumes each
//! main queue, inspects each dead-letter queue, and serves /health and /ready.
//! Exits non-zero if the broker is unreachable or a consumer fails.

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobrelay::error::ConsumeError;
use jobrelay::health::{self, Readiness};
use jobrelay::shutdown::{self, shutdown_signal};
use jobrelay::{connect, jobs, mailer, Config, JobWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        broker = %config.broker.redacted(),
        connect_attempts = config.connect_attempts,
        health_port = config.health_port,
        mailer_api_configured = config.mailer_api_url.is_some(),
        inspect_mode = ?config.inspect_mode,
        categories = config.topologies.len(),
        "config_loaded"
    );

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let readiness = Readiness::new();
    let (trigger, shutdown) = shutdown::channel();

    let health_server = tokio::spawn(health::serve(
        config.health_port,
        readiness.clone(),
        shutdown.clone(),
    ));

    let connection = connect(&config.broker, &config.connect_policy())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let mail_sender = mailer::from_config(&config).context("Failed to create mailer")?;

    let mut tasks: JoinSet<Result<(), ConsumeError>> = JoinSet::new();

    for topology in &config.topologies {
        let handlers = jobs::registry_for(&topology.category, mail_sender.clone())
            .with_context(|| format!("No handlers for job category {}", topology.category))?;

        let worker = JobWorker::open(&connection, topology.clone()).await?;
        worker
            .declare()
            .await
            .with_context(|| format!("Failed to declare topology for {}", topology.category))?;

        let deliveries = worker.subscribe(&topology.queue).await?;
        tasks.spawn(worker.run_consumer(deliveries, handlers, shutdown.clone()));

        if topology.dlq_enabled {
            let inspector = JobWorker::open(&connection, topology.clone()).await?;
            let dead_letters = inspector.subscribe(&topology.dead_letter_queue()).await?;
            tasks.spawn(inspector.run_inspector(dead_letters, config.inspect_mode, shutdown.clone()));
        }
    }

    readiness.set_ready(true);
    info!("worker_ready");

    // Run until a signal arrives or any consumer stops on its own
    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = tasks.join_next() => {
            failure = Some(task_failure(joined));
        }
    }

    info!("worker_stopping");
    readiness.set_ready(false);
    trigger.trigger();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from)) {
            error!(error = %e, "worker_task_failed");
            failure.get_or_insert(e);
        }
    }

    connection.close().await;

    if let Ok(Err(e)) = health_server.await {
        error!(error = %e, "health_server_error");
    }

    info!("worker_shutdown_complete");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A task that finished before shutdown is a failure even if it returned `Ok`.
fn task_failure(joined: Result<Result<(), ConsumeError>, tokio::task::JoinError>) -> anyhow::Error {
    let e = match joined {
        Ok(Ok(())) => anyhow!("consumer stopped before shutdown"),
        Ok(Err(e)) => anyhow::Error::from(e),
        Err(e) => anyhow::Error::from(e),
    };
    error!(error = %e, "worker_task_failed");
    e
}
