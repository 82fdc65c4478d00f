//! Periodic pruning of recorder state so memory stays bounded and stale
//! abuse decays away.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::recorder::EventRecorder;
use crate::util::window_start;
use crate::Engine;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSummary {
    pub events_dropped: usize,
    pub anomalies_dropped: usize,
    pub counters_removed: usize,
}

pub struct RetentionManager {
    max_age: Duration,
}

impl RetentionManager {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn tick(&self, recorder: &EventRecorder) -> RetentionSummary {
        self.tick_at(recorder, Utc::now())
    }

    /// Drop events and anomalies with `timestamp <= now - max_age`, then halve
    /// every error counter.
    pub fn tick_at(&self, recorder: &EventRecorder, now: DateTime<Utc>) -> RetentionSummary {
        let cutoff = window_start(now, self.max_age);
        let (events_dropped, anomalies_dropped) = recorder.prune(cutoff);
        let counters_removed = recorder.decay_error_counts();
        RetentionSummary {
            events_dropped,
            anomalies_dropped,
            counters_removed,
        }
    }
}

/// Runs [`Engine::retention_tick`] every `retention_interval` until cancelled.
pub async fn run_retention_loop(engine: Arc<Engine>, token: CancellationToken) {
    let period = engine.config().retention_interval;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let pass = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.retention_tick() }
        });
        match pass.await {
            Ok(summary) => tracing::info!(
                events_dropped = summary.events_dropped,
                anomalies_dropped = summary.anomalies_dropped,
                counters_removed = summary.counters_removed,
                "retention pass complete"
            ),
            Err(e) => tracing::error!(error = %e, "retention pass failed"),
        }
    }
    tracing::debug!("retention loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{Anomaly, StateTransitionEvent};
    use crate::state::StateId;

    fn event(user_id: i64, age: chrono::Duration, valid: bool) -> StateTransitionEvent {
        StateTransitionEvent {
            user_id,
            from_state: None,
            to_state: StateId(1),
            handler_name: "start".into(),
            is_valid: valid,
            timestamp: Utc::now() - age,
            duration_ms: None,
            error: None,
        }
    }

    #[test]
    fn drops_old_events_and_decays_counters() {
        let recorder = EventRecorder::new(100);
        recorder.record(event(1, chrono::Duration::hours(25), false));
        recorder.record(event(2, chrono::Duration::hours(1), false));
        recorder.record(event(2, chrono::Duration::hours(1), false));
        recorder.record(event(2, chrono::Duration::hours(1), false));
        recorder.record(event(3, chrono::Duration::minutes(5), true));
        recorder.push_anomaly(Anomaly::high_error_rate(
            1,
            5,
            Utc::now() - chrono::Duration::hours(30),
        ));
        recorder.push_anomaly(Anomaly::high_error_rate(2, 5, Utc::now()));

        let manager = RetentionManager::new(Duration::from_secs(24 * 3600));
        let now = Utc::now();
        let summary = manager.tick_at(&recorder, now);

        assert_eq!(summary.events_dropped, 1);
        assert_eq!(summary.anomalies_dropped, 1);
        assert_eq!(summary.counters_removed, 1);
        let cutoff = now - chrono::Duration::hours(24);
        assert!(recorder.events().iter().all(|e| e.timestamp > cutoff));
        assert_eq!(recorder.error_count(1), 0);
        assert_eq!(recorder.error_count(2), 1);
        assert_eq!(recorder.anomaly_count(), 1);
    }

    #[test]
    fn repeated_ticks_clear_counters() {
        let recorder = EventRecorder::new(100);
        for _ in 0..8 {
            recorder.record(event(4, chrono::Duration::minutes(1), false));
        }
        let manager = RetentionManager::new(Duration::from_secs(24 * 3600));
        // 8 -> 4 -> 2 -> 1 -> 0
        for expected in [4, 2, 1, 0] {
            manager.tick(&recorder);
            assert_eq!(recorder.error_count(4), expected);
        }
        assert!(recorder.error_counts().is_empty());
    }
}
