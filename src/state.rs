//! Conversation state primitives.
//!
//! A dialogue state is an opaque small integer owned by the embedding
//! application.  This module keeps one live value per user and, optionally,
//! a table of transitions the application considers legal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identifier of the user driving a dialogue.
pub type UserId = i64;

/// User id recorded when a request context carries no user.
pub const ANONYMOUS_USER: UserId = 0;

/// Opaque dialogue state identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub i32);

impl StateId {
    /// Terminal sentinel.  Reaching it ends the dialogue; it is never stored.
    pub const END: StateId = StateId(-1);

    pub fn is_end(self) -> bool {
        self == Self::END
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for StateId {
    fn from(value: i32) -> Self {
        StateId(value)
    }
}

/// A `(from, to)` pair as observed by the recorder.  `from` is `None` when
/// the user had no live state.
pub type TransitionPair = (Option<StateId>, StateId);

/// Renders an optional state, `None` when the user had no live state.
pub fn state_key(state: Option<StateId>) -> String {
    match state {
        Some(s) => s.to_string(),
        None => "None".to_string(),
    }
}

/// Key used by the transition frequency counters, e.g. `None->3`.
pub fn transition_key(from: Option<StateId>, to: StateId) -> String {
    format!("{}->{}", state_key(from), to)
}

/// Per-user live state.  Operations on a single user are atomic; a caller
/// doing get→compute→set must not await in between.
#[derive(Debug, Default)]
pub struct StateStore {
    states: DashMap<UserId, StateId>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: UserId) -> Option<StateId> {
        self.states.get(&user_id).map(|entry| *entry)
    }

    /// Store a new state.  Setting [`StateId::END`] clears the user instead.
    pub fn set(&self, user_id: UserId, state: StateId) {
        if state.is_end() {
            self.clear(user_id);
        } else {
            self.states.insert(user_id, state);
        }
    }

    pub fn clear(&self, user_id: UserId) {
        self.states.remove(&user_id);
    }

    /// Number of users currently inside a dialogue.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Allowed transitions and display names for states.
///
/// An empty table places no restriction on transitions.  Loaded from JSON of
/// the form `{"names": {"1": "CHOOSING_MODE"}, "allowed": {"1": [2, 3]}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionTable {
    #[serde(default)]
    names: HashMap<StateId, String>,
    #[serde(default)]
    allowed: HashMap<StateId, HashSet<StateId>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_state(mut self, state: StateId, name: impl Into<String>) -> Self {
        self.names.insert(state, name.into());
        self
    }

    pub fn allow(mut self, from: StateId, to: impl IntoIterator<Item = StateId>) -> Self {
        self.allowed.entry(from).or_default().extend(to);
        self
    }

    /// True when at least one rule has been declared.
    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Starting a dialogue and ending one are always legal; anything else must
    /// be listed under its source state.
    pub fn is_valid_transition(&self, from: Option<StateId>, to: StateId) -> bool {
        match from {
            None => true,
            Some(f) if f.is_end() => true,
            Some(_) if to.is_end() => true,
            Some(f) => self.allowed.get(&f).is_some_and(|set| set.contains(&to)),
        }
    }

    pub fn state_name(&self, state: Option<StateId>) -> String {
        match state {
            None => "None".to_string(),
            Some(s) if s.is_end() => "END".to_string(),
            Some(s) => self
                .names
                .get(&s)
                .cloned()
                .unwrap_or_else(|| format!("STATE_{}", s.0)),
        }
    }

    /// Sorted, human readable rendering of a state set, e.g. `{ANSWERING, STATE_7}`.
    pub fn describe_states(&self, states: &HashSet<StateId>) -> String {
        let ordered: BTreeSet<_> = states.iter().copied().collect();
        let names: Vec<String> = ordered
            .into_iter()
            .map(|s| self.state_name(Some(s)))
            .collect();
        format!("{{{}}}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_set_get_clear() {
        let store = StateStore::new();
        assert_eq!(store.get(7), None);
        store.set(7, StateId(3));
        assert_eq!(store.get(7), Some(StateId(3)));
        store.set(7, StateId(4));
        assert_eq!(store.get(7), Some(StateId(4)));
        store.clear(7);
        assert_eq!(store.get(7), None);
        assert!(store.is_empty());
    }

    #[test]
    fn setting_end_clears_user() {
        let store = StateStore::new();
        store.set(1, StateId(2));
        store.set(1, StateId::END);
        assert_eq!(store.get(1), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn table_rules() {
        let table = TransitionTable::new().allow(StateId(1), [StateId(2), StateId(3)]);
        assert!(table.is_restricted());
        assert!(table.is_valid_transition(None, StateId(9)));
        assert!(table.is_valid_transition(Some(StateId::END), StateId(9)));
        assert!(table.is_valid_transition(Some(StateId(5)), StateId::END));
        assert!(table.is_valid_transition(Some(StateId(1)), StateId(3)));
        assert!(!table.is_valid_transition(Some(StateId(1)), StateId(4)));
        assert!(!table.is_valid_transition(Some(StateId(2)), StateId(1)));
    }

    #[test]
    fn names_fall_back_to_numeric() {
        let table = TransitionTable::new().name_state(StateId(1), "CHOOSING_MODE");
        assert_eq!(table.state_name(Some(StateId(1))), "CHOOSING_MODE");
        assert_eq!(table.state_name(Some(StateId(8))), "STATE_8");
        assert_eq!(table.state_name(Some(StateId::END)), "END");
        assert_eq!(table.state_name(None), "None");
        let set: HashSet<_> = [StateId(8), StateId(1)].into_iter().collect();
        assert_eq!(table.describe_states(&set), "{CHOOSING_MODE, STATE_8}");
    }

    #[test]
    fn table_parses_from_json() {
        let raw = r#"{"names": {"1": "CHOOSING_MODE"}, "allowed": {"1": [2, -1]}}"#;
        let table: TransitionTable = serde_json::from_str(raw).unwrap();
        assert!(table.is_valid_transition(Some(StateId(1)), StateId(2)));
        assert!(!table.is_valid_transition(Some(StateId(1)), StateId(5)));
        assert_eq!(table.state_name(Some(StateId(1))), "CHOOSING_MODE");
    }

    #[test]
    fn transition_keys() {
        assert_eq!(transition_key(None, StateId(1)), "None->1");
        assert_eq!(transition_key(Some(StateId(1)), StateId::END), "1->-1");
    }
}
