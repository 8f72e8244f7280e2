use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hermes_core::job::CreateJobRequest;
use hermes_core::runner::{RunnerConfig, TracingJobReporter};
use hermes_core::{Batch, JobService};
use hermes_db::{PgExecutor, StaticTenantResolver};
use hermes_store::{RedisConfig, RedisJobQueue, RedisJobStore, RedisPublisher, RedisSubscriber};

type Service = JobService<RedisJobStore, RedisJobQueue, RedisPublisher, PgExecutor<StaticTenantResolver>>;

#[derive(Parser)]
#[command(name = "hermes", version, about = "Asynchronous SQL job runner for tenant databases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batch processor until interrupted
    Run {
        /// Global statement timeout ceiling in seconds; per-job timeouts
        /// never exceed it
        #[arg(long, env = "DEFAULT_TIMEOUT_SECONDS", default_value_t = 12 * 60 * 60)]
        default_timeout: u64,
    },

    /// Submit a SQL job
    Submit {
        /// Submitting user
        #[arg(short, long)]
        user: String,

        /// Target host id (selects queue and tenant database)
        #[arg(long)]
        host: String,

        /// Query payload: a SQL string, a JSON array of statements, or a
        /// JSON fallback object
        query: String,

        /// Per-job statement timeout in seconds (0 means use the default)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show a job
    Status {
        /// Job id
        id: Uuid,
    },

    /// Cancel a pending or running job
    Cancel {
        /// Job id
        id: Uuid,
    },

    /// List a user's jobs
    List {
        /// Owning user
        #[arg(short, long)]
        user: String,

        /// Only jobs still waiting or executing
        #[arg(long, default_value_t = false)]
        wip: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hermes=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { default_timeout } => cmd_run(default_timeout).await?,
        Commands::Submit {
            user,
            host,
            query,
            timeout,
        } => {
            let service = build_service().await?;
            cmd_submit(&service, user, host, &query, timeout).await?;
        }
        Commands::Status { id } => {
            let service = build_service().await?;
            let job = service.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Cancel { id } => {
            let service = build_service().await?;
            let job = service.cancel(id, &TracingJobReporter).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::List { user, wip } => {
            let service = build_service().await?;
            let jobs = if wip {
                service.list_work_in_progress(&user).await?
            } else {
                service.list(&user).await?
            };
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
    }

    Ok(())
}

/// Wire the Redis store/queue and tenant executor behind a [`JobService`].
async fn build_service() -> Result<Service> {
    let config = RedisConfig::from_env()?;
    let (_client, manager) = hermes_store::connect(&config).await?;

    let store = RedisJobStore::new(manager.clone(), config.retention);
    let queue = RedisJobQueue::new(manager.clone());
    let publisher = RedisPublisher::new(manager, config.wake_channel.clone());
    let executor = PgExecutor::new(StaticTenantResolver::from_env()?);

    Ok(JobService::new(store, queue, publisher, executor))
}

async fn cmd_run(default_timeout: u64) -> Result<()> {
    let config = RedisConfig::from_env()?;
    let (client, manager) = hermes_store::connect(&config).await?;

    let store = RedisJobStore::new(manager.clone(), config.retention);
    let queue = RedisJobQueue::new(manager);
    let subscriber = RedisSubscriber::new(
        client,
        queue.clone(),
        config.wake_channel.clone(),
        config.discovery_interval,
    );
    let executor = PgExecutor::new(StaticTenantResolver::from_env()?);

    let batch = Arc::new(Batch::new(
        store,
        queue,
        executor,
        subscriber,
        Arc::new(TracingJobReporter),
        RunnerConfig {
            default_timeout: Duration::from_secs(default_timeout),
        },
    ));

    tracing::info!("Batch processor started");
    let runner = {
        let batch = Arc::clone(&batch);
        tokio::spawn(async move { batch.run().await })
    };

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received, draining");
    batch.drain().await?;
    runner.await.context("Batch task panicked")??;
    tracing::info!("Drained cleanly");
    Ok(())
}

async fn cmd_submit(
    service: &Service,
    user: String,
    host: String,
    query: &str,
    timeout: Option<u64>,
) -> Result<()> {
    // Accept raw SQL as shorthand for the JSON string form.
    let payload: serde_json::Value = serde_json::from_str(query)
        .unwrap_or_else(|_| serde_json::Value::String(query.to_string()));

    let mut request = CreateJobRequest::new(user, host, payload);
    if let Some(timeout) = timeout {
        request = request.with_timeout(timeout);
    }

    let job = service.create(request).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}
