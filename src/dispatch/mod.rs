//! Dispatcher: the single ingestion funnel for events
//!
//! Producers (the capture endpoint and the task tracker) submit events to a
//! cloneable [`Dispatcher`] handle. One ingestion task consumes them in FIFO
//! order and, per event, stamps the timestamp, applies `project`, awaits the
//! log append, spawns webhook deliveries and finally spawns `collect`.
//! Only the append is awaited in line, which keeps log order equal to
//! submission order.

mod hook;
mod pool;
mod webhook;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::error::{RelayError, Result};
use crate::storage::EventLog;
use crate::types::{DispatchConfig, Event};

pub use hook::{console_collect, Collect, Hook, Project};
pub use pool::WorkerPool;
pub use webhook::{WebhookSender, MAX_IN_FLIGHT, WEBHOOK_CONTENT_TYPE};

enum Command {
    Event(Event),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Ingestion counters
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    projected_out: AtomicU64,
    appended: AtomicU64,
    append_failed: AtomicU64,
    collected: AtomicU64,
    collect_failed: AtomicU64,
}

/// Point-in-time copy of the dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub received: u64,
    pub projected_out: u64,
    pub appended: u64,
    pub append_failed: u64,
    pub collected: u64,
    pub collect_failed: u64,
    pub webhook_delivered: u64,
    pub webhook_failed: u64,
}

/// Builder for a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: DispatchConfig,
    log: Option<Arc<dyn EventLog>>,
    project: Option<Project>,
    collect: Option<Collect>,
}

impl DispatcherBuilder {
    /// Append every surviving event to `log`
    pub fn log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn project(mut self, project: Project) -> Self {
        self.project = Some(project);
        self
    }

    /// Explicit collect sink; without one, the console sink is used only
    /// when no log is configured
    pub fn collect(mut self, collect: Collect) -> Self {
        self.collect = Some(collect);
        self
    }

    /// Spawn the ingestion task. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Dispatcher> {
        let config = self.config;
        let needs_pool = config.blocking_workers > 0
            && (self.project.as_ref().is_some_and(Hook::is_blocking)
                || self.collect.as_ref().map_or(self.log.is_none(), Hook::is_blocking));
        let pool = if needs_pool {
            Some(Arc::new(WorkerPool::new(
                config.blocking_workers,
                config.queue_capacity,
            )?))
        } else {
            None
        };

        let webhooks = if config.webhooks.is_empty() {
            None
        } else {
            Some(WebhookSender::with_limit(
                config.webhooks.clone(),
                Duration::from_millis(config.webhook_timeout_ms),
                config.max_webhook_deliveries,
            )?)
        };

        let collect = match (self.collect, &self.log) {
            (Some(collect), _) => Some(collect),
            (None, None) => Some(console_collect()),
            (None, Some(_)) => None,
        };

        let counters = Arc::new(Counters::default());
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let ingestor = Ingestor {
            log: self.log,
            project: self.project,
            collect,
            webhooks: webhooks.clone(),
            pool,
            counters: counters.clone(),
            last_timestamp: None,
        };
        tokio::spawn(ingestor.run(receiver));

        tracing::info!(
            webhooks = config.webhooks.len(),
            blocking_workers = config.blocking_workers,
            "dispatcher started"
        );
        Ok(Dispatcher {
            sender,
            counters,
            webhooks,
        })
    }
}

/// Handle to the ingestion funnel
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    webhooks: Option<WebhookSender>,
}

impl Dispatcher {
    pub fn builder(config: DispatchConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            log: None,
            project: None,
            collect: None,
        }
    }

    /// Queue an event for ingestion
    pub async fn submit(&self, event: Event) -> Result<()> {
        self.sender
            .send(Command::Event(event))
            .await
            .map_err(|_| RelayError::Internal("dispatcher is stopped".to_string()))
    }

    /// Queue several events, preserving their order
    pub async fn submit_all(&self, events: impl IntoIterator<Item = Event>) -> Result<usize> {
        let mut count = 0;
        for event in events {
            self.submit(event).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Wait until every event submitted so far is appended and collected
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Flush(tx))
            .await
            .map_err(|_| RelayError::Internal("dispatcher is stopped".to_string()))?;
        rx.await
            .map_err(|_| RelayError::Internal("dispatcher stopped while flushing".to_string()))
    }

    /// Drain queued events, then stop the ingestion task.
    ///
    /// In-flight webhook deliveries are abandoned.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Shutdown(tx)).await.is_err() {
            // already stopped
            return Ok(());
        }
        rx.await
            .map_err(|_| RelayError::Internal("dispatcher stopped while draining".to_string()))
    }

    pub fn stats(&self) -> DispatchStats {
        let (webhook_delivered, webhook_failed) =
            self.webhooks.as_ref().map_or((0, 0), WebhookSender::totals);
        DispatchStats {
            received: self.counters.received.load(Ordering::Relaxed),
            projected_out: self.counters.projected_out.load(Ordering::Relaxed),
            appended: self.counters.appended.load(Ordering::Relaxed),
            append_failed: self.counters.append_failed.load(Ordering::Relaxed),
            collected: self.counters.collected.load(Ordering::Relaxed),
            collect_failed: self.counters.collect_failed.load(Ordering::Relaxed),
            webhook_delivered,
            webhook_failed,
        }
    }
}

/// State owned by the ingestion task
struct Ingestor {
    log: Option<Arc<dyn EventLog>>,
    project: Option<Project>,
    collect: Option<Collect>,
    webhooks: Option<WebhookSender>,
    pool: Option<Arc<WorkerPool>>,
    counters: Arc<Counters>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Ingestor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        let mut collects: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(Command::Event(event)) => self.ingest(event, &mut collects).await,
                    Some(Command::Flush(reply)) => {
                        Self::drain_collects(&mut collects).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown(reply)) => {
                        receiver.close();
                        while let Some(command) = receiver.recv().await {
                            match command {
                                Command::Event(event) => self.ingest(event, &mut collects).await,
                                Command::Flush(tx) | Command::Shutdown(tx) => {
                                    let _ = tx.send(());
                                }
                            }
                        }
                        Self::drain_collects(&mut collects).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                Some(joined) = collects.join_next(), if !collects.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "collect task failed");
                    }
                }
            }
        }

        if let Some(pool) = &self.pool {
            pool.close();
        }
        tracing::info!("dispatcher stopped");
    }

    async fn drain_collects(collects: &mut JoinSet<()>) {
        while let Some(joined) = collects.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "collect task failed");
            }
        }
    }

    /// Non-decreasing per process, even if the wall clock steps back
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(stamp);
        stamp
    }

    async fn ingest(&mut self, mut event: Event, collects: &mut JoinSet<()>) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        event.timestamp = Some(self.next_timestamp());

        let event = match &self.project {
            None => event,
            Some(project) => match project.call(event, self.pool.as_deref()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.counters.projected_out.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    self.counters.projected_out.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "project hook failed, event dropped");
                    return;
                }
            },
        };

        if let Some(log) = &self.log {
            match log.append(&event).await {
                Ok(id) => {
                    self.counters.appended.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(id = %id, category = %event.category, event_type = %event.event_type, "event appended");
                }
                Err(e) => {
                    self.counters.append_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        engine = %log.engine(),
                        error = %e,
                        category = %event.category,
                        event_type = %event.event_type,
                        "log append failed, event dropped for the log"
                    );
                }
            }
        }

        if let Some(webhooks) = &self.webhooks {
            webhooks.fan_out(&event);
        }

        if let Some(collect) = &self.collect {
            let collect = collect.clone();
            let pool = self.pool.clone();
            let counters = self.counters.clone();
            collects.spawn(async move {
                match collect.call(event, pool.as_deref()).await {
                    Ok(()) => {
                        counters.collected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.collect_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "collect hook failed");
                    }
                }
            });
        }
    }
}
