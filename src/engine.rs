//! The monitoring engine: one explicit context object owning the state store,
//! recorder, blocklist and background tasks.  Constructed once at startup and
//! shared as `Arc<Engine>` with every [`TransitionGuard`](crate::TransitionGuard).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blocklist::Blocklist;
use crate::config::MonitorConfig;
use crate::detector::{self, AnomalyDetector, DetectionPolicy, TickSummary};
use crate::notify::AdminNotifier;
use crate::recorder::{EventRecorder, MetricsSnapshot};
use crate::report::{self, MetricsPersister, PersistError, StatsSnapshot};
use crate::retention::{self, RetentionManager, RetentionSummary};
use crate::state::{StateStore, TransitionTable};

pub struct Engine {
    config: MonitorConfig,
    transitions: TransitionTable,
    states: StateStore,
    recorder: EventRecorder,
    blocklist: Blocklist,
    notifier: AdminNotifier,
    persister: MetricsPersister,
    detector: AnomalyDetector,
    retention: RetentionManager,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

pub struct EngineBuilder {
    config: MonitorConfig,
    transitions: TransitionTable,
    notifier: AdminNotifier,
    persister: MetricsPersister,
}

impl EngineBuilder {
    pub fn transitions(mut self, table: TransitionTable) -> Self {
        self.transitions = table;
        self
    }

    pub fn notifier(mut self, notifier: AdminNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn persister(mut self, persister: MetricsPersister) -> Self {
        self.persister = persister;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let EngineBuilder {
            config,
            transitions,
            notifier,
            persister,
        } = self;
        Arc::new(Engine {
            recorder: EventRecorder::new(config.max_events),
            detector: AnomalyDetector::new(DetectionPolicy::from(&config)),
            retention: RetentionManager::new(config.event_retention),
            states: StateStore::new(),
            blocklist: Blocklist::new(),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            config,
            transitions,
            notifier,
            persister,
        })
    }
}

impl Engine {
    /// Builder with a log-only notifier and persistence disabled.
    pub fn builder(config: MonitorConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            transitions: TransitionTable::default(),
            notifier: AdminNotifier::disabled(),
            persister: MetricsPersister::disabled(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn notifier(&self) -> &AdminNotifier {
        &self.notifier
    }

    pub fn persister(&self) -> &MetricsPersister {
        &self.persister
    }

    pub fn current_metrics(&self) -> MetricsSnapshot {
        self.recorder.current_metrics(self.blocklist.len())
    }

    pub fn generate_report(&self) -> String {
        report::generate_report(&self.current_metrics())
    }

    /// One detection pass followed by a metrics log line.
    pub async fn monitor_tick(&self) -> TickSummary {
        let summary = self
            .detector
            .tick(&self.recorder, &self.blocklist, &self.notifier)
            .await;
        self.persister.append_metrics(&self.current_metrics());
        summary
    }

    pub fn retention_tick(&self) -> RetentionSummary {
        self.retention.tick(&self.recorder)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            saved_at: Utc::now(),
            total_events: self.recorder.len(),
            transition_counts: self.recorder.transition_counts(),
            anomalies: self.recorder.anomalies(),
            metrics: self.current_metrics(),
        }
    }

    pub async fn save_stats(&self) -> Result<PathBuf, PersistError> {
        self.persister.write_snapshot(&self.stats_snapshot()).await
    }

    /// Spawn the monitor and retention loops.  Calling it again while they
    /// run has no effect; after a loop has died it respawns both.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.is_cancelled() {
            return;
        }
        if !loops.is_empty() && loops.iter().all(|h| !h.is_finished()) {
            return;
        }
        // a loop ended unexpectedly; restart the pair
        for handle in loops.drain(..) {
            handle.abort();
        }
        loops.push(tokio::spawn(detector::run_monitor_loop(
            Arc::clone(self),
            self.shutdown.child_token(),
        )));
        loops.push(tokio::spawn(retention::run_retention_loop(
            Arc::clone(self),
            self.shutdown.child_token(),
        )));
    }

    /// True while both background loops are alive.
    pub fn is_running(&self) -> bool {
        let loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        !loops.is_empty() && loops.iter().all(|h| !h.is_finished())
    }

    /// Stop the loops, abort pending unblock timers and write a final stats
    /// snapshot.  Returns the snapshot path when one was written.
    pub async fn shutdown(&self) -> Option<PathBuf> {
        self.shutdown.cancel();
        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background loop ended abnormally");
            }
        }
        let cancelled = self.blocklist.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "pending unblock timers cancelled");
        }
        match self.save_stats().await {
            Ok(path) => Some(path),
            Err(PersistError::Disabled) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to save state stats");
                None
            }
        }
    }
}
