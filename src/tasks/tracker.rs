//! Background poller turning finished upstream jobs into task events

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::names::task_event;
use super::snapshot::TaskSnapshot;
use crate::dispatch::Dispatcher;
use crate::error::{RelayError, Result};
use crate::types::{TaskKind, TrackerConfig};
use crate::upstream::{UpstreamClient, UpstreamTask};

/// Commands for the tracker worker
#[derive(Debug)]
pub enum TrackerCommand {
    /// Poll immediately; replies with the number of events emitted
    Poll(oneshot::Sender<usize>),
    /// Stop the worker
    Stop,
}

/// Outcome of one poll round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub emitted: usize,
    /// Kinds whose request failed; their previous snapshot was kept
    pub skipped: Vec<TaskKind>,
}

/// Polls the upstream job lists and diffs them against the last snapshot
pub struct TaskTracker {
    client: UpstreamClient,
    config: TrackerConfig,
    dispatcher: Dispatcher,
    snapshot: TaskSnapshot,
}

impl TaskTracker {
    /// Fails when the config carries no token
    pub fn new(config: TrackerConfig, dispatcher: Dispatcher) -> Result<Self> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RelayError::Config("task tracker requires an upstream token".into()))?;
        let client = UpstreamClient::new(&config.base_url, token)?;
        Ok(Self {
            client,
            config,
            dispatcher,
            snapshot: TaskSnapshot::new(),
        })
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    pub fn snapshot(&self) -> &TaskSnapshot {
        &self.snapshot
    }

    /// Poll every configured kind once
    pub async fn poll_once(&mut self) -> PollReport {
        let mut report = PollReport::default();
        let kinds = self.config.kinds.clone();

        for kind in kinds {
            let tasks = match self.fetch(kind).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!(kind = kind.as_str(), error = %e, "task poll failed, keeping previous snapshot");
                    report.skipped.push(kind);
                    continue;
                }
            };

            for completion in self.snapshot.observe(kind, tasks) {
                let Some(event) = task_event(kind, &completion.task) else {
                    tracing::warn!(
                        kind = kind.as_str(),
                        job_id = %completion.task.id,
                        name = %completion.task.name,
                        "finished job name not recognized, skipped"
                    );
                    continue;
                };

                if let Err(e) = self.dispatcher.submit(event).await {
                    tracing::error!(job_id = %completion.task.id, error = %e, "failed to submit task event");
                    continue;
                }
                report.emitted += 1;
                tracing::debug!(kind = kind.as_str(), job_id = %completion.task.id, "task event emitted");

                if self.config.remove_done {
                    if let Err(e) = self.client.remove(kind, &completion.task.id).await {
                        tracing::warn!(job_id = %completion.task.id, error = %e, "failed to remove finished job");
                    }
                }
            }
        }
        report
    }

    /// Undone and done lists of one kind, merged
    async fn fetch(&self, kind: TaskKind) -> Result<Vec<UpstreamTask>> {
        let mut tasks = self.client.list_undone(kind).await?;
        tasks.extend(self.client.list_done(kind).await?);
        Ok(tasks)
    }

    /// Spawn the periodic poll loop
    pub fn start(mut self) -> TrackerHandle {
        let (sender, mut receiver) = mpsc::channel::<TrackerCommand>(16);
        let period = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                base_url = %self.client.base_url(),
                interval_ms = period.as_millis() as u64,
                "task tracker started"
            );

            loop {
                tokio::select! {
                    command = receiver.recv() => match command {
                        Some(TrackerCommand::Poll(reply)) => {
                            let report = self.poll_once().await;
                            let _ = reply.send(report.emitted);
                        }
                        Some(TrackerCommand::Stop) | None => break,
                    },
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }

            tracing::info!("task tracker stopped");
        });

        TrackerHandle { sender, handle }
    }
}

/// Handle to a running tracker
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerCommand>,
    handle: JoinHandle<()>,
}

impl TrackerHandle {
    /// Poll now instead of waiting for the next tick
    pub async fn poll_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TrackerCommand::Poll(tx))
            .await
            .map_err(|_| RelayError::Internal("task tracker is stopped".to_string()))?;
        rx.await
            .map_err(|_| RelayError::Internal("task tracker stopped while polling".to_string()))
    }

    /// Stop the worker and wait for the current poll to finish
    pub async fn stop(self) {
        let _ = self.sender.send(TrackerCommand::Stop).await;
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "task tracker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EventLog, MemoryBackend, ReadRequest};
    use crate::types::{DispatchConfig, EventType};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn envelope(tasks: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"code": 200, "message": "success", "data": tasks}))
    }

    async fn mount_list(server: &MockServer, route: &str, tasks: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(envelope(tasks))
            .mount(server)
            .await;
    }

    fn config(server: &MockServer, kinds: Vec<TaskKind>) -> TrackerConfig {
        TrackerConfig {
            base_url: server.uri(),
            token: Some("tok".into()),
            poll_interval_ms: 50,
            remove_done: false,
            kinds,
        }
    }

    #[tokio::test]
    async fn test_requires_token() {
        let log = Arc::new(MemoryBackend::new());
        let dispatcher = Dispatcher::builder(DispatchConfig::default())
            .log(log)
            .start()
            .unwrap();
        assert!(TaskTracker::new(TrackerConfig::default(), dispatcher).is_err());
    }

    #[tokio::test]
    async fn test_done_copy_emits_once() {
        let server = MockServer::start().await;
        mount_list(&server, "/api/admin/task/copy/undone", json!([])).await;
        mount_list(
            &server,
            "/api/admin/task/copy/done",
            json!([{"id": "T1", "name": "copy [/115](/a) to [/115](/b)", "state": 2, "status": "", "progress": 100, "error": ""}]),
        )
        .await;

        let log = Arc::new(MemoryBackend::new());
        let dispatcher = Dispatcher::builder(DispatchConfig::default())
            .log(log.clone())
            .start()
            .unwrap();
        let mut tracker =
            TaskTracker::new(config(&server, vec![TaskKind::Copy]), dispatcher.clone()).unwrap();

        assert_eq!(tracker.poll_once().await.emitted, 1);
        assert_eq!(tracker.poll_once().await.emitted, 0);
        dispatcher.flush().await.unwrap();

        let entries = log.read(&ReadRequest::after(None, 10)).await.unwrap();
        assert_eq!(entries.len(), 1);
        let event = &entries[0].event;
        assert_eq!(event.event_type, EventType::Copy);
        assert_eq!(event.payload["dst_path"], json!("/115/b/a"));
    }

    #[tokio::test]
    async fn test_restart_does_not_replay_removed_jobs() {
        use wiremock::matchers::query_param;

        let server = MockServer::start().await;
        mount_list(&server, "/api/admin/task/copy/undone", json!([])).await;
        // the upstream lists the job until it is deleted
        Mock::given(method("GET"))
            .and(path("/api/admin/task/copy/done"))
            .respond_with(envelope(json!([
                {"id": "OLD", "name": "copy [/115](/a) to [/115](/b)", "state": 2}
            ])))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/admin/task/copy/done"))
            .respond_with(envelope(json!([])))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/admin/task/copy/delete"))
            .and(query_param("tid", "OLD"))
            .respond_with(envelope(json!(null)))
            .expect(1)
            .mount(&server)
            .await;

        let log = Arc::new(MemoryBackend::new());
        let dispatcher = Dispatcher::builder(DispatchConfig::default())
            .log(log.clone())
            .start()
            .unwrap();

        // each tracker starts from an empty snapshot, like a fresh process
        for _ in 0..3 {
            let cfg = TrackerConfig {
                base_url: server.uri(),
                token: Some("tok".into()),
                kinds: vec![TaskKind::Copy],
                ..Default::default()
            };
            assert!(cfg.remove_done);
            let mut tracker = TaskTracker::new(cfg, dispatcher.clone()).unwrap();
            tracker.poll_once().await;
        }
        dispatcher.flush().await.unwrap();

        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::builder(DispatchConfig::default())
            .log(Arc::new(MemoryBackend::new()))
            .start()
            .unwrap();
        let mut tracker =
            TaskTracker::new(config(&server, vec![TaskKind::Upload]), dispatcher).unwrap();
        let report = tracker.poll_once().await;
        assert_eq!(report.emitted, 0);
        assert_eq!(report.skipped, vec![TaskKind::Upload]);
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_worker_poll_now_and_stop() {
        let server = MockServer::start().await;
        mount_list(&server, "/api/admin/task/upload/undone", json!([])).await;
        mount_list(
            &server,
            "/api/admin/task/upload/done",
            json!([{"id": "U1", "name": "upload a.mp4 to [/115](/v)", "state": 2}]),
        )
        .await;

        let dispatcher = Dispatcher::builder(DispatchConfig::default())
            .log(Arc::new(MemoryBackend::new()))
            .start()
            .unwrap();
        let mut cfg = config(&server, vec![TaskKind::Upload]);
        cfg.poll_interval_ms = 60_000;
        let handle = TaskTracker::new(cfg, dispatcher).unwrap().start();

        // the first interval tick fires immediately and already emits the job
        handle.poll_now().await.unwrap();
        assert_eq!(handle.poll_now().await.unwrap(), 0);
        handle.stop().await;
    }
}
