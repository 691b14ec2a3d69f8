//! fsrelay server
//!
//! Run with: fsrelay-server --db-uri redis://localhost:6379/0 --token <admin token>

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fsrelay::dispatch::Dispatcher;
use fsrelay::realtime::RelayServer;
use fsrelay::storage::{open_log, Engine, EventLog, LogDescriptor};
use fsrelay::tasks::TaskTracker;
use fsrelay::types::{DispatchConfig, PullConfig, RelayConfig, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "fsrelay-server", version)]
#[command(about = "Filesystem event relay: capture, log and pull")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "FSRELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "FSRELAY_PORT", default_value = "5245")]
    port: u16,

    /// Upstream storage service base URL
    #[arg(long, env = "FSRELAY_BASE_URL", default_value = "http://localhost:5244")]
    base_url: String,

    /// Upstream admin token; without it the task tracker is disabled
    #[arg(long, env = "FSRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Backend log descriptor: {engine}://{host}:{port}/{path}, a bare engine
    /// name, a SQLite file path, or `console` for no log (empty = temporary SQLite)
    #[arg(long, env = "FSRELAY_DB_URI", default_value = "")]
    db_uri: String,

    /// Webhook URL (repeatable, or comma separated in the environment)
    #[arg(long = "webhooks", env = "FSRELAY_WEBHOOKS", value_delimiter = ',')]
    webhooks: Vec<String>,

    /// Task tracker poll interval in milliseconds
    #[arg(long, env = "FSRELAY_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Webhook deliveries allowed in flight at once
    #[arg(long, env = "FSRELAY_MAX_WEBHOOK_DELIVERIES", default_value = "64")]
    max_webhook_deliveries: usize,

    /// Worker threads for blocking hooks (0 = run inline)
    #[arg(long, env = "FSRELAY_BLOCKING_WORKERS", default_value = "4")]
    blocking_workers: usize,

    /// Leave finished jobs in the upstream list after their event is emitted
    /// (they are emitted again after a restart)
    #[arg(long, env = "FSRELAY_KEEP_DONE_TASKS")]
    keep_done_tasks: bool,

    /// Stream key for the stream engine
    #[arg(long, env = "FSRELAY_STREAM_KEY", default_value = "fsrelay:fs")]
    stream_key: String,

    /// Debug logging
    #[arg(long, env = "FSRELAY_DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "FSRELAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn relay_config(&self, engine: Engine) -> RelayConfig {
        RelayConfig {
            db_uri: self.db_uri.clone(),
            log_name: (engine == Engine::Stream).then(|| self.stream_key.clone()),
            tracker: TrackerConfig {
                base_url: self.base_url.clone(),
                token: self.token.clone(),
                poll_interval_ms: self.poll_interval_ms,
                remove_done: !self.keep_done_tasks,
                ..Default::default()
            },
            dispatch: DispatchConfig {
                webhooks: self.webhooks.clone(),
                blocking_workers: self.blocking_workers,
                max_webhook_deliveries: self.max_webhook_deliveries,
                ..Default::default()
            },
            pull: PullConfig::default(),
        }
    }
}

fn init_tracing(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.log_json);

    let descriptor = LogDescriptor::parse(&args.db_uri).context("invalid --db-uri")?;
    let config = args.relay_config(descriptor.engine);

    let log: Option<Arc<dyn EventLog>> = match descriptor.engine {
        Engine::Console => {
            tracing::info!("no backend log, events go to the console");
            None
        }
        _ => Some(
            open_log(&descriptor, config.log_name.as_deref())
                .await
                .with_context(|| format!("failed to open backend log {}", descriptor))?,
        ),
    };

    let mut builder = Dispatcher::builder(config.dispatch.clone());
    if let Some(log) = &log {
        builder = builder.log(log.clone());
    }
    let dispatcher = builder.start().context("failed to start dispatcher")?;

    let tracker = if config.tracker.enabled() {
        let tracker = TaskTracker::new(config.tracker.clone(), dispatcher.clone())?;
        let user = tracker
            .client()
            .verify_admin()
            .await
            .context("upstream token check failed")?;
        tracing::info!(user = %user.username, "upstream token verified");
        Some(tracker.start())
    } else {
        tracing::info!("no upstream token, task tracker disabled");
        None
    };

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
    let server = RelayServer::new(log.clone(), dispatcher.clone(), config.pull.clone());
    server.serve(listener, shutdown_signal()).await?;

    if let Some(tracker) = tracker {
        tracker.stop().await;
    }
    dispatcher.shutdown().await?;
    if let Some(log) = log {
        log.close().await?;
    }
    tracing::info!("fsrelay stopped");
    Ok(())
}
