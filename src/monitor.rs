//! Rolling performance counters, alerting, and health classification.
//!
//! The monitor is the only component that decides whether the engine runs degraded.
//! Health is derived from how many thresholds are breached at once; any isolation
//! violation inside the window is CRITICAL on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::MonitorConfig;

/// Fixed-capacity window of samples, oldest evicted first.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl RollingWindow<f64> {
    pub fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        LatencySummary {
            count: sorted.len(),
            avg_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50_ms: nearest_rank(&sorted, 50.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
        }
    }
}

impl RollingWindow<bool> {
    /// Fraction of `true` samples, or `None` when empty.
    pub fn rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let hits = self.samples.iter().filter(|b| **b).count();
        Some(hits as f64 / self.samples.len() as f64)
    }

    pub fn any_false(&self) -> bool {
        self.samples.iter().any(|b| !*b)
    }
}

/// Nearest-rank percentile over an ascending slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    Good,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RetrievalLatency,
    CacheHitRate,
    SyncLatency,
    SwitchLatency,
    IsolationViolation,
    JobFailure,
    DeadLetter,
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub raised_at: DateTime<Utc>,
}

/// What the engine turns off while health is CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DegradationMode {
    pub active: bool,
    pub clustering_disabled: bool,
    pub merge_disabled: bool,
    pub local_only: bool,
    /// Multiplier applied to the context idle TTL.
    pub ttl_multiplier: f64,
}

impl DegradationMode {
    pub fn normal() -> Self {
        Self {
            active: false,
            clustering_disabled: false,
            merge_disabled: false,
            local_only: false,
            ttl_multiplier: 1.0,
        }
    }

    fn degraded(ttl_multiplier: f64) -> Self {
        Self {
            active: true,
            clustering_disabled: true,
            merge_disabled: true,
            local_only: true,
            ttl_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub retrieval: LatencySummary,
    pub sync: LatencySummary,
    pub context_switch: LatencySummary,
    /// `None` until the first cache lookup.
    pub cache_hit_rate: Option<f64>,
    pub isolation_checks: u64,
    pub isolation_violations: u64,
    pub remote_timeouts: u64,
    pub job_failures: u64,
    pub breaches: Vec<AlertKind>,
    pub health: Health,
    pub degradation: DegradationMode,
    pub recent_alerts: Vec<Alert>,
}

struct MonitorState {
    retrieval: RollingWindow<f64>,
    sync: RollingWindow<f64>,
    switch: RollingWindow<f64>,
    cache: RollingWindow<bool>,
    isolation: RollingWindow<bool>,
    isolation_checks: u64,
    isolation_violations: u64,
    remote_timeouts: u64,
    job_failures: u64,
    breached: BTreeSet<AlertKind>,
    alerts: VecDeque<Alert>,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let window = config.window_size;
        Self {
            state: Mutex::new(MonitorState {
                retrieval: RollingWindow::new(window),
                sync: RollingWindow::new(window),
                switch: RollingWindow::new(window),
                cache: RollingWindow::new(window),
                isolation: RollingWindow::new(window),
                isolation_checks: 0,
                isolation_violations: 0,
                remote_timeouts: 0,
                job_failures: 0,
                breached: BTreeSet::new(),
                alerts: VecDeque::new(),
            }),
            config,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MonitorState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn record_retrieval(&self, elapsed: Duration) {
        self.with_state(|s| {
            s.retrieval.push(millis(elapsed));
            self.evaluate(s);
        });
    }

    pub fn record_sync(&self, elapsed: Duration) {
        self.with_state(|s| {
            s.sync.push(millis(elapsed));
            self.evaluate(s);
        });
    }

    pub fn record_switch(&self, elapsed: Duration) {
        self.with_state(|s| {
            s.switch.push(millis(elapsed));
            self.evaluate(s);
        });
    }

    pub fn record_cache(&self, hit: bool) {
        self.with_state(|s| {
            s.cache.push(hit);
            self.evaluate(s);
        });
    }

    pub fn record_isolation(&self, passed: bool) {
        self.with_state(|s| {
            s.isolation.push(passed);
            s.isolation_checks += 1;
            if !passed {
                s.isolation_violations += 1;
            }
            self.evaluate(s);
        });
    }

    pub fn record_remote_timeout(&self) {
        self.with_state(|s| s.remote_timeouts += 1);
    }

    pub fn record_job_failure(&self, job: &str, project_id: Option<&str>, error: &str) {
        self.with_state(|s| {
            s.job_failures += 1;
            self.push_alert(
                s,
                AlertKind::JobFailure,
                format!("{job} failed: {error}"),
                project_id.map(str::to_string),
            );
        });
    }

    pub fn record_dead_letter(&self, record_id: &str, project_id: &str, attempts: u32) {
        self.with_state(|s| {
            self.push_alert(
                s,
                AlertKind::DeadLetter,
                format!("record {record_id} dead-lettered after {attempts} attempts"),
                Some(project_id.to_string()),
            );
        });
    }

    pub fn record_budget_exceeded(&self, project_id: &str, footprint: u64, ceiling: u64) {
        self.with_state(|s| {
            self.push_alert(
                s,
                AlertKind::BudgetExceeded,
                format!("footprint {footprint}B over ceiling {ceiling}B"),
                Some(project_id.to_string()),
            );
        });
    }

    pub fn health(&self) -> Health {
        self.with_state(|s| classify(&s.breached))
    }

    pub fn degradation(&self) -> DegradationMode {
        self.mode_for(self.health())
    }

    fn mode_for(&self, health: Health) -> DegradationMode {
        match health {
            Health::Critical => DegradationMode::degraded(self.config.degraded_ttl_multiplier),
            _ => DegradationMode::normal(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with_state(|s| {
            let health = classify(&s.breached);
            MetricsSnapshot {
                retrieval: s.retrieval.summary(),
                sync: s.sync.summary(),
                context_switch: s.switch.summary(),
                cache_hit_rate: s.cache.rate(),
                isolation_checks: s.isolation_checks,
                isolation_violations: s.isolation_violations,
                remote_timeouts: s.remote_timeouts,
                job_failures: s.job_failures,
                breaches: s.breached.iter().copied().collect(),
                health,
                degradation: self.mode_for(health),
                recent_alerts: s.alerts.iter().cloned().collect(),
            }
        })
    }

    /// Recompute threshold breaches and alert on each one that is new.
    fn evaluate(&self, s: &mut MonitorState) {
        let mut now_breached = BTreeSet::new();
        if !s.retrieval.is_empty() && s.retrieval.summary().p95_ms > self.config.retrieval_p95_ms {
            now_breached.insert(AlertKind::RetrievalLatency);
        }
        if s.cache.len() >= self.config.min_hit_samples {
            if let Some(rate) = s.cache.rate() {
                if rate < self.config.min_hit_rate {
                    now_breached.insert(AlertKind::CacheHitRate);
                }
            }
        }
        if !s.sync.is_empty() && s.sync.summary().p95_ms > self.config.sync_p95_ms {
            now_breached.insert(AlertKind::SyncLatency);
        }
        if !s.switch.is_empty() && s.switch.summary().p95_ms > self.config.switch_p95_ms {
            now_breached.insert(AlertKind::SwitchLatency);
        }
        if s.isolation.any_false() {
            now_breached.insert(AlertKind::IsolationViolation);
        }

        let before = classify(&s.breached);
        for kind in now_breached.difference(&s.breached).copied().collect::<Vec<_>>() {
            let message = match kind {
                AlertKind::RetrievalLatency => format!(
                    "retrieval p95 {:.1}ms above {:.0}ms",
                    s.retrieval.summary().p95_ms,
                    self.config.retrieval_p95_ms
                ),
                AlertKind::CacheHitRate => format!(
                    "context cache hit rate {:.0}% below {:.0}%",
                    s.cache.rate().unwrap_or(0.0) * 100.0,
                    self.config.min_hit_rate * 100.0
                ),
                AlertKind::SyncLatency => format!(
                    "sync p95 {:.1}ms above {:.0}ms",
                    s.sync.summary().p95_ms,
                    self.config.sync_p95_ms
                ),
                AlertKind::SwitchLatency => format!(
                    "context switch p95 {:.1}ms above {:.0}ms",
                    s.switch.summary().p95_ms,
                    self.config.switch_p95_ms
                ),
                _ => "isolation violation detected".to_string(),
            };
            self.push_alert(s, kind, message, None);
        }
        s.breached = now_breached;

        let after = classify(&s.breached);
        if after != before {
            if after == Health::Critical {
                tracing::error!(?before, ?after, "health critical, entering degradation mode");
            } else {
                tracing::info!(?before, ?after, "health changed");
            }
        }
    }

    fn push_alert(
        &self,
        s: &mut MonitorState,
        kind: AlertKind,
        message: String,
        project_id: Option<String>,
    ) {
        tracing::warn!(
            ?kind,
            project = project_id.as_deref().unwrap_or("-"),
            %message,
            "alert raised"
        );
        if s.alerts.len() >= self.config.max_alerts.max(1) {
            s.alerts.pop_front();
        }
        s.alerts.push_back(Alert {
            kind,
            message,
            project_id,
            raised_at: Utc::now(),
        });
    }
}

fn classify(breached: &BTreeSet<AlertKind>) -> Health {
    if breached.contains(&AlertKind::IsolationViolation) || breached.len() >= 3 {
        Health::Critical
    } else if breached.is_empty() {
        Health::Good
    } else {
        Health::Degraded
    }
}
