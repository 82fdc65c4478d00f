//! Transition event recording.
//!
//! The recorder owns a bounded ring buffer of [`StateTransitionEvent`]s and
//! the running counters derived from it: transition frequencies, per-user
//! error counts and per-handler latency samples.  It also keeps the anomaly
//! log written by the detector.  Everything sits behind one mutex whose guard
//! is never held across an await, so each read-modify-write completes as a
//! unit.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{transition_key, StateId, TransitionPair, TransitionTable, UserId};
use crate::util::window_start;

/// Latency samples kept per handler.
pub const MAX_HANDLER_SAMPLES: usize = 100;
/// Number of transitions listed in metrics.
pub const TOP_TRANSITIONS: usize = 5;
/// Window covered by [`EventRecorder::current_metrics`].
pub const METRICS_WINDOW: Duration = Duration::from_secs(3600);

/// One intercepted handler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    pub user_id: UserId,
    pub from_state: Option<StateId>,
    pub to_state: StateId,
    pub handler_name: String,
    pub is_valid: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateTransitionEvent {
    pub fn pair(&self) -> TransitionPair {
        (self.from_state, self.to_state)
    }

    /// A call that left a user without live state still without one (`None`
    /// to `END`), e.g. a `Stay` or a failure before the dialogue started.
    pub fn is_noop(&self) -> bool {
        self.from_state.is_none() && self.to_state.is_end()
    }

    /// JSON form with state names resolved through `table`.
    pub fn to_json(&self, table: &TransitionTable) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "from_state_name".into(),
                table.state_name(self.from_state).into(),
            );
            obj.insert(
                "to_state_name".into(),
                table.state_name(Some(self.to_state)).into(),
            );
        }
        value
    }
}

/// Kind-specific anomaly payload.  Serialized flat next to the common fields
/// with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnomalyKind {
    HighErrorRate { error_count: u64 },
    /// `transitions` holds only the repeating segment, never the whole window.
    CyclicTransitions {
        transitions: Vec<TransitionPair>,
        window_transitions: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    #[serde(flatten)]
    pub kind: AnomalyKind,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl Anomaly {
    pub fn high_error_rate(user_id: UserId, error_count: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: AnomalyKind::HighErrorRate { error_count },
            user_id,
            timestamp,
        }
    }

    pub fn cyclic(
        user_id: UserId,
        segment: Vec<TransitionPair>,
        window_transitions: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: AnomalyKind::CyclicTransitions {
                transitions: segment,
                window_transitions,
            },
            user_id,
            timestamp,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            AnomalyKind::HighErrorRate { .. } => "high_error_rate",
            AnomalyKind::CyclicTransitions { .. } => "cyclic_transitions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopTransition {
    pub transition: String,
    pub count: u64,
    pub percentage: f64,
}

/// Windowed aggregate written once per monitor tick and served to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_transitions: usize,
    pub invalid_transitions: usize,
    pub unique_users: usize,
    pub blocked_users: usize,
    pub anomalies_detected: usize,
    pub top_transitions: Vec<TopTransition>,
    pub error_rate: f64,
    pub avg_handler_performance: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct Ledger {
    events: VecDeque<StateTransitionEvent>,
    transition_counts: HashMap<String, u64>,
    user_errors: HashMap<UserId, u64>,
    handler_samples: HashMap<String, VecDeque<u64>>,
    anomalies: VecDeque<Anomaly>,
}

pub struct EventRecorder {
    capacity: usize,
    inner: Mutex<Ledger>,
}

impl EventRecorder {
    /// `max_events` bounds both the event buffer and the anomaly log.
    pub fn new(max_events: usize) -> Self {
        let capacity = max_events.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ledger {
                events: VecDeque::with_capacity(capacity.min(1024)),
                ..Ledger::default()
            }),
        }
    }

    // Recording must never fail, so a poisoned lock is recovered.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: StateTransitionEvent) {
        let mut ledger = self.ledger();
        *ledger
            .transition_counts
            .entry(transition_key(event.from_state, event.to_state))
            .or_insert(0) += 1;
        if !event.is_valid {
            *ledger.user_errors.entry(event.user_id).or_insert(0) += 1;
        }
        if let Some(ms) = event.duration_ms {
            let samples = ledger
                .handler_samples
                .entry(event.handler_name.clone())
                .or_default();
            samples.push_back(ms);
            while samples.len() > MAX_HANDLER_SAMPLES {
                samples.pop_front();
            }
        }
        if ledger.events.len() >= self.capacity {
            ledger.events.pop_front();
        }
        ledger.events.push_back(event);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ledger().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger().events.is_empty()
    }

    /// Copy of the buffer, oldest first.
    pub fn events(&self) -> Vec<StateTransitionEvent> {
        self.ledger().events.iter().cloned().collect()
    }

    /// A user's events newer than `since`, ordered by timestamp.
    pub fn events_for_user(&self, user_id: UserId, since: DateTime<Utc>) -> Vec<StateTransitionEvent> {
        let mut events: Vec<_> = self
            .ledger()
            .events
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp > since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Transition pairs per user for events newer than `since`, skipping
    /// no-op calls.  Handlers can complete out of order, so pairs are ordered
    /// by event timestamp rather than buffer position.
    pub fn transitions_by_user(&self, since: DateTime<Utc>) -> BTreeMap<UserId, Vec<TransitionPair>> {
        let mut grouped: BTreeMap<UserId, Vec<(DateTime<Utc>, TransitionPair)>> = BTreeMap::new();
        {
            let ledger = self.ledger();
            for e in ledger
                .events
                .iter()
                .filter(|e| e.timestamp > since && !e.is_noop())
            {
                grouped
                    .entry(e.user_id)
                    .or_default()
                    .push((e.timestamp, e.pair()));
            }
        }
        grouped
            .into_iter()
            .map(|(user, mut pairs)| {
                pairs.sort_by_key(|(ts, _)| *ts);
                (user, pairs.into_iter().map(|(_, p)| p).collect())
            })
            .collect()
    }

    /// Error counters sorted by user id.
    pub fn error_counts(&self) -> Vec<(UserId, u64)> {
        let mut counts: Vec<_> = self
            .ledger()
            .user_errors
            .iter()
            .map(|(u, c)| (*u, *c))
            .collect();
        counts.sort_unstable();
        counts
    }

    pub fn error_count(&self, user_id: UserId) -> u64 {
        self.ledger().user_errors.get(&user_id).copied().unwrap_or(0)
    }

    pub fn transition_counts(&self) -> BTreeMap<String, u64> {
        self.ledger()
            .transition_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn handler_samples(&self, handler: &str) -> Vec<u64> {
        self.ledger()
            .handler_samples
            .get(handler)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `(average ms, sample count)` per handler with at least one sample.
    pub fn handler_averages(&self) -> BTreeMap<String, (f64, usize)> {
        self.ledger()
            .handler_samples
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(name, s)| {
                let sum: u64 = s.iter().sum();
                (name.clone(), (sum as f64 / s.len() as f64, s.len()))
            })
            .collect()
    }

    pub fn push_anomaly(&self, anomaly: Anomaly) {
        let mut ledger = self.ledger();
        if ledger.anomalies.len() >= self.capacity {
            ledger.anomalies.pop_front();
        }
        ledger.anomalies.push_back(anomaly);
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.ledger().anomalies.iter().cloned().collect()
    }

    pub fn anomaly_count(&self) -> usize {
        self.ledger().anomalies.len()
    }

    /// Drop events and anomalies with `timestamp <= cutoff`.  Returns how many
    /// of each were removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> (usize, usize) {
        let mut ledger = self.ledger();
        let events_before = ledger.events.len();
        ledger.events.retain(|e| e.timestamp > cutoff);
        let anomalies_before = ledger.anomalies.len();
        ledger.anomalies.retain(|a| a.timestamp > cutoff);
        (
            events_before - ledger.events.len(),
            anomalies_before - ledger.anomalies.len(),
        )
    }

    /// Halve every error counter, removing those that reach zero.  Returns the
    /// number of removed entries.
    pub fn decay_error_counts(&self) -> usize {
        let mut ledger = self.ledger();
        let before = ledger.user_errors.len();
        ledger.user_errors.retain(|_, count| {
            *count /= 2;
            *count > 0
        });
        before - ledger.user_errors.len()
    }

    pub fn current_metrics(&self, blocked_users: usize) -> MetricsSnapshot {
        self.metrics_at(Utc::now(), blocked_users)
    }

    /// Metrics over the hour preceding `now`.  Read only.
    pub fn metrics_at(&self, now: DateTime<Utc>, blocked_users: usize) -> MetricsSnapshot {
        let since = window_start(now, METRICS_WINDOW);
        let ledger = self.ledger();

        let mut total = 0usize;
        let mut invalid = 0usize;
        let mut users = HashSet::new();
        for e in ledger.events.iter().filter(|e| e.timestamp > since) {
            total += 1;
            if !e.is_valid {
                invalid += 1;
            }
            users.insert(e.user_id);
        }

        let all_transitions: u64 = ledger.transition_counts.values().sum();
        let mut ranked: Vec<(&String, &u64)> = ledger.transition_counts.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top_transitions = ranked
            .into_iter()
            .take(TOP_TRANSITIONS)
            .map(|(key, count)| TopTransition {
                transition: key.clone(),
                count: *count,
                percentage: if all_transitions > 0 {
                    *count as f64 / all_transitions as f64 * 100.0
                } else {
                    0.0
                },
            })
            .collect();

        let avg_handler_performance = ledger
            .handler_samples
            .iter()
            .map(|(name, s)| {
                let avg = if s.is_empty() {
                    0.0
                } else {
                    s.iter().sum::<u64>() as f64 / s.len() as f64
                };
                (name.clone(), avg)
            })
            .collect();

        MetricsSnapshot {
            timestamp: now,
            total_transitions: total,
            invalid_transitions: invalid,
            unique_users: users.len(),
            blocked_users,
            anomalies_detected: ledger.anomalies.len(),
            top_transitions,
            error_rate: if total > 0 {
                invalid as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_handler_performance,
        }
    }
}
