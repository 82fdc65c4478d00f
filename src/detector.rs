//! Periodic anomaly detection.
//!
//! A tick scans the recorder for users whose error counter crossed the
//! threshold, for users repeating the same run of transitions inside the
//! sliding window, and for handlers whose average latency is too high.
//! Findings are written to the anomaly log before any notification is
//! awaited.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::blocklist::Blocklist;
use crate::config::MonitorConfig;
use crate::notify::AdminNotifier;
use crate::recorder::{Anomaly, AnomalyKind, EventRecorder};
use crate::state::{state_key, TransitionPair, UserId};
use crate::util::window_start;
use crate::Engine;

/// Slow handlers included in one admin alert.
const SLOW_HANDLERS_REPORTED: usize = 5;

/// Location of the first immediately repeated run found by [`detect_cycles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleMatch {
    pub start: usize,
    pub cycle_len: usize,
}

impl CycleMatch {
    /// The repeating run itself.
    pub fn segment<'a, T>(&self, transitions: &'a [T]) -> &'a [T] {
        &transitions[self.start..self.start + self.cycle_len]
    }
}

/// Finds a run of at least `min_cycle_length` consecutive items that is
/// immediately repeated.  Shorter runs are tried first, then earlier starts.
/// Quadratic in the input, which is bounded by the detection window.
pub fn detect_cycles<T: PartialEq>(transitions: &[T], min_cycle_length: usize) -> Option<CycleMatch> {
    let min = min_cycle_length.max(1);
    let len = transitions.len();
    if len < min * 2 {
        return None;
    }
    for cycle_len in min..=len / 2 {
        for start in 0..=len - cycle_len * 2 {
            let pattern = &transitions[start..start + cycle_len];
            let next = &transitions[start + cycle_len..start + cycle_len * 2];
            if pattern == next {
                return Some(CycleMatch { start, cycle_len });
            }
        }
    }
    None
}

/// Runs [`detect_cycles`] for every user and keeps only the repeating
/// segment of each hit.
fn scan_users(
    by_user: BTreeMap<UserId, Vec<TransitionPair>>,
    min_cycle_length: usize,
) -> Vec<(UserId, Vec<TransitionPair>, usize)> {
    by_user
        .into_iter()
        .filter_map(|(user_id, transitions)| {
            let hit = detect_cycles(&transitions, min_cycle_length)?;
            Some((user_id, hit.segment(&transitions).to_vec(), transitions.len()))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DetectionPolicy {
    pub anomaly_threshold: u64,
    pub window: Duration,
    pub block_duration: Duration,
    pub min_cycle_length: usize,
    pub slow_handler_ms: u64,
}

impl From<&MonitorConfig> for DetectionPolicy {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            anomaly_threshold: cfg.anomaly_threshold,
            window: cfg.window,
            block_duration: cfg.block_duration,
            min_cycle_length: cfg.min_cycle_length,
            slow_handler_ms: cfg.slow_handler_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowHandler {
    pub handler: String,
    pub avg_duration_ms: f64,
    pub samples: usize,
}

/// What a single tick found.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub anomalies: Vec<Anomaly>,
    pub newly_blocked: Vec<UserId>,
    pub slow_handlers: Vec<SlowHandler>,
}

pub struct AnomalyDetector {
    policy: DetectionPolicy,
}

impl AnomalyDetector {
    pub fn new(policy: DetectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }

    pub async fn tick(
        &self,
        recorder: &EventRecorder,
        blocklist: &Blocklist,
        notifier: &AdminNotifier,
    ) -> TickSummary {
        let now = Utc::now();
        let mut summary = TickSummary::default();
        let threshold = self.policy.anomaly_threshold;

        for (user_id, error_count) in recorder.error_counts() {
            if error_count < threshold {
                continue;
            }
            if error_count >= threshold.saturating_mul(2) && !blocklist.is_blocked(user_id) {
                blocklist.block(user_id, self.policy.block_duration);
                summary.newly_blocked.push(user_id);
            }
            summary
                .anomalies
                .push(Anomaly::high_error_rate(user_id, error_count, now));
        }

        let since = window_start(now, self.policy.window);
        let by_user = recorder.transitions_by_user(since);
        let min_cycle_length = self.policy.min_cycle_length;
        match tokio::task::spawn_blocking(move || scan_users(by_user, min_cycle_length)).await {
            Ok(hits) => {
                for (user_id, segment, window_len) in hits {
                    summary
                        .anomalies
                        .push(Anomaly::cyclic(user_id, segment, window_len, now));
                }
            }
            Err(e) => tracing::error!(error = %e, "cycle scan failed"),
        }

        summary.slow_handlers = self.slow_handlers(recorder);

        for anomaly in &summary.anomalies {
            recorder.push_anomaly(anomaly.clone());
        }
        for anomaly in &summary.anomalies {
            tracing::warn!(
                user_id = anomaly.user_id,
                kind = anomaly.type_name(),
                "anomaly detected"
            );
            notifier.alert(&format_anomaly_alert(anomaly)).await;
        }
        if !summary.slow_handlers.is_empty() {
            tracing::warn!(count = summary.slow_handlers.len(), "slow handlers detected");
            notifier
                .alert(&format_slow_handlers(&summary.slow_handlers))
                .await;
        }
        summary
    }

    /// Handlers whose average sample exceeds the limit, slowest first.
    pub fn slow_handlers(&self, recorder: &EventRecorder) -> Vec<SlowHandler> {
        let limit = self.policy.slow_handler_ms as f64;
        let mut slow: Vec<SlowHandler> = recorder
            .handler_averages()
            .into_iter()
            .filter(|(_, (avg, _))| *avg > limit)
            .map(|(handler, (avg_duration_ms, samples))| SlowHandler {
                handler,
                avg_duration_ms,
                samples,
            })
            .collect();
        slow.sort_by(|a, b| b.avg_duration_ms.total_cmp(&a.avg_duration_ms));
        slow
    }
}

pub fn format_anomaly_alert(anomaly: &Anomaly) -> String {
    match &anomaly.kind {
        AnomalyKind::HighErrorRate { error_count } => format!(
            "Anomaly detected\n\nType: high error rate\nUser ID: {}\nErrors: {}",
            anomaly.user_id, error_count
        ),
        AnomalyKind::CyclicTransitions {
            transitions,
            window_transitions,
        } => {
            let path: Vec<String> = transitions
                .iter()
                .take(6)
                .map(|(from, to)| format!("{}->{}", state_key(*from), to))
                .collect();
            format!(
                "Anomaly detected\n\nType: cyclic transitions\nUser ID: {}\nCycle: {}\nTransitions in window: {}",
                anomaly.user_id,
                path.join(", "),
                window_transitions
            )
        }
    }
}

pub fn format_slow_handlers(slow: &[SlowHandler]) -> String {
    let mut message = String::from("Slow handlers\n");
    for h in slow.iter().take(SLOW_HANDLERS_REPORTED) {
        message.push_str(&format!(
            "\n- {}: {:.0}ms ({} samples)",
            h.handler, h.avg_duration_ms, h.samples
        ));
    }
    message
}

/// Runs [`Engine::monitor_tick`] every `monitor_interval` until cancelled.
/// A failed tick is logged and the loop carries on.
pub async fn run_monitor_loop(engine: Arc<Engine>, token: CancellationToken) {
    let period = engine.config().monitor_interval;
    tracing::info!(interval_secs = period.as_secs(), "state monitoring started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        // A panic inside a tick (for example in an admin sink) ends only
        // that tick's task.
        let tick = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.monitor_tick().await }
        });
        match tick.await {
            Ok(summary) => tracing::debug!(
                anomalies = summary.anomalies.len(),
                blocked = summary.newly_blocked.len(),
                slow_handlers = summary.slow_handlers.len(),
                "monitor tick complete"
            ),
            Err(e) => tracing::error!(error = %e, "monitor tick failed"),
        }
    }
    tracing::info!("state monitoring stopped");
}
