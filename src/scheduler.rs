//! Periodic background jobs with per-project single-flight and shared cancellation.

use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::MemoryEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Optimize,
    Cluster,
    Evict,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Optimize => "optimize",
            Self::Cluster => "cluster",
            Self::Evict => "evict",
        }
    }
}

/// Identity of a job for single-flight purposes. Project-less jobs are global.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub kind: JobKind,
    pub project: Option<String>,
}

impl JobKey {
    pub fn global(kind: JobKind) -> Self {
        Self { kind, project: None }
    }

    pub fn project(kind: JobKind, project: impl Into<String>) -> Self {
        Self {
            kind,
            project: Some(project.into()),
        }
    }
}

/// Set of jobs currently running. A job that is already in flight is not started again.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: Mutex<HashSet<JobKey>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already running. The claim ends when the guard drops.
    pub fn try_acquire(self: &Arc<Self>, key: JobKey) -> Option<FlightGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            flights: Arc::clone(self),
            key,
        })
    }

    pub fn is_running(&self, key: &JobKey) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    flights: Arc<SingleFlight>,
    key: JobKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flights
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Handle to the engine's background tasks.
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the sync, optimize, cluster, and evict loops.
    pub fn start(engine: Arc<MemoryEngine>) -> Self {
        let config = engine.config().clone();
        let mut scheduler = Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };

        let e = Arc::clone(&engine);
        scheduler.spawn_periodic(
            JobKind::Sync,
            Duration::from_secs(config.sync.interval_secs.max(1)),
            move |_| {
                let e = Arc::clone(&e);
                async move {
                    if let Err(err) = e.run_sync_cycle().await {
                        report_failure(&e, JobKind::Sync, None, &err.to_string());
                    }
                }
            },
        );

        let e = Arc::clone(&engine);
        scheduler.spawn_periodic(
            JobKind::Optimize,
            Duration::from_secs(config.scheduler.optimize_interval_secs.max(1)),
            move |cancel| {
                let e = Arc::clone(&e);
                async move {
                    for project in projects(&e, JobKind::Optimize).await {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(err) = e.optimize_project_with(&project, &cancel).await {
                            report_failure(&e, JobKind::Optimize, Some(&project), &err.to_string());
                        }
                    }
                }
            },
        );

        let e = Arc::clone(&engine);
        scheduler.spawn_periodic(
            JobKind::Cluster,
            Duration::from_secs(config.scheduler.cluster_interval_secs.max(1)),
            move |cancel| {
                let e = Arc::clone(&e);
                async move {
                    for project in projects(&e, JobKind::Cluster).await {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(err) = e.cluster_project_with(&project, &cancel).await {
                            report_failure(&e, JobKind::Cluster, Some(&project), &err.to_string());
                        }
                    }
                }
            },
        );

        let e = engine;
        scheduler.spawn_periodic(
            JobKind::Evict,
            Duration::from_secs(config.scheduler.evict_interval_secs.max(1)),
            move |_| {
                let e = Arc::clone(&e);
                async move {
                    if let Err(err) = e.evict_idle_contexts().await {
                        report_failure(&e, JobKind::Evict, None, &err.to_string());
                    }
                }
            },
        );

        tracing::info!(tasks = scheduler.tasks.len(), "background scheduler started");
        scheduler
    }

    fn spawn_periodic<F, Fut>(&mut self, kind: JobKind, period: Duration, job: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => job(cancel.clone()).await,
                }
            }
            tracing::debug!(job = kind.as_str(), "periodic job stopped");
        }));
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait for in-flight jobs to reach a batch boundary.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("background scheduler stopped");
    }
}

async fn projects(engine: &MemoryEngine, kind: JobKind) -> Vec<String> {
    match engine.projects().await {
        Ok(projects) => projects,
        Err(err) => {
            report_failure(engine, kind, None, &err.to_string());
            Vec::new()
        }
    }
}

fn report_failure(engine: &MemoryEngine, kind: JobKind, project: Option<&str>, error: &str) {
    tracing::error!(job = kind.as_str(), project = project.unwrap_or("-"), error, "background job failed");
    engine
        .monitor()
        .record_job_failure(kind.as_str(), project, error);
}
