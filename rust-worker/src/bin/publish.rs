//! JobRelay Publish - enqueue one job from the command line.
//!
//! ```text
//! jobrelay-publish email send-otp '{"to":"a@example.com","subject":"Code","text":"123456"}'
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobrelay::{connect, Config, JobWorker};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish a job to a JobRelay category")]
struct Args {
    /// Job category, e.g. email or order
    category: String,

    /// Job type within the category, e.g. send-otp
    job_type: String,

    /// Job payload as a JSON object
    #[arg(default_value = "{}")]
    payload: String,

    /// Declare the category's topology before publishing
    #[arg(long)]
    declare: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;
    if !payload.is_object() {
        bail!("Payload must be a JSON object");
    }

    let topology = match config.topology(&args.category) {
        Some(topology) => topology.clone(),
        None => bail!("Unknown job category {}", args.category),
    };

    let connection = connect(&config.broker, &config.connect_policy())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let worker = JobWorker::open(&connection, topology).await?;
    if args.declare {
        worker.declare().await.context("Failed to declare topology")?;
    }

    let result = worker.send(&args.job_type, &payload).await;
    connection.close().await;

    let message_id = result.context("Failed to publish job")?;
    info!(
        category = %args.category,
        job_type = %args.job_type,
        message_id = ?message_id,
        "job_enqueued"
    );
    println!("{}", message_id.unwrap_or_default());

    Ok(())
}
