//! Handler interception.
//!
//! Dialogue step handlers implement [`StepHandler`].  At setup time they are
//! wrapped by a [`HandlerChain`] of [`Layer`]s; [`TransitionGuard`] is the
//! layer that enforces the state contract, updates the state store and feeds
//! the recorder.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::recorder::StateTransitionEvent;
use crate::state::{state_key, StateId, UserId, ANONYMOUS_USER};
use crate::util::elapsed_ms;
use crate::Engine;

/// Request context passed to handlers.  Only the user id is inspected.
pub trait UserScoped {
    fn user_id(&self) -> Option<UserId>;
}

/// What a handler asks the state store to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Move the user to this state.
    Goto(StateId),
    /// Leave the state untouched.  The event records `to_state` as the
    /// current state, or `END` when the user has none; such `None -> END`
    /// events are counted but skipped by cycle detection.
    Stay,
    /// The dialogue is over; forget the user's state.
    End,
}

#[derive(Debug, Error)]
pub enum StepError {
    /// Raised before the handler runs for users on the blocklist.
    #[error("user {user_id} is temporarily blocked, retry in {retry_after_secs}s")]
    TemporarilyBlocked {
        user_id: UserId,
        retry_after_secs: u64,
    },
    /// Failure inside the wrapped handler, passed through unchanged.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

#[async_trait]
pub trait StepHandler<C>: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, ctx: &C) -> Result<HandlerOutcome, StepError>;
}

/// Middleware: takes the next handler and returns a wrapped one with the same
/// signature.
pub trait Layer<C>: Send + Sync {
    fn wrap(&self, next: Arc<dyn StepHandler<C>>) -> Arc<dyn StepHandler<C>>;
}

/// Ordered list of layers.  The first registered layer is the outermost.
pub struct HandlerChain<C> {
    layers: Vec<Arc<dyn Layer<C>>>,
}

impl<C> Default for HandlerChain<C> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<C> HandlerChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: impl Layer<C> + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn build(&self, handler: Arc<dyn StepHandler<C>>) -> Arc<dyn StepHandler<C>> {
        self.layers
            .iter()
            .rev()
            .fold(handler, |next, layer| layer.wrap(next))
    }
}

/// Validates and records every call of the wrapped handler.
#[derive(Clone)]
pub struct TransitionGuard {
    engine: Arc<Engine>,
    expected: Option<Arc<HashSet<StateId>>>,
}

impl TransitionGuard {
    /// Guard without source state expectations.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            expected: None,
        }
    }

    /// Guard that expects the user to be in one of `states` when called.
    pub fn expecting(engine: Arc<Engine>, states: impl IntoIterator<Item = StateId>) -> Self {
        Self {
            engine,
            expected: Some(Arc::new(states.into_iter().collect())),
        }
    }
}

impl<C> Layer<C> for TransitionGuard
where
    C: UserScoped + Send + Sync + 'static,
{
    fn wrap(&self, next: Arc<dyn StepHandler<C>>) -> Arc<dyn StepHandler<C>> {
        Arc::new(Guarded {
            inner: next,
            engine: Arc::clone(&self.engine),
            expected: self.expected.clone(),
        })
    }
}

struct Guarded<C> {
    inner: Arc<dyn StepHandler<C>>,
    engine: Arc<Engine>,
    expected: Option<Arc<HashSet<StateId>>>,
}

impl<C> Guarded<C> {
    fn source_mismatch(&self, current: Option<StateId>) -> Option<String> {
        let expected = self.expected.as_ref()?;
        if current.is_some_and(|s| expected.contains(&s)) {
            return None;
        }
        let table = self.engine.transitions();
        Some(format!(
            "Expected {}, got {}",
            table.describe_states(expected),
            table.state_name(current)
        ))
    }
}

#[async_trait]
impl<C> StepHandler<C> for Guarded<C>
where
    C: UserScoped + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, ctx: &C) -> Result<HandlerOutcome, StepError> {
        let user_id = ctx.user_id().unwrap_or(ANONYMOUS_USER);
        let handler_name = self.inner.name();

        if let Some(remaining) = self.engine.blocklist().remaining(user_id) {
            tracing::warn!(user_id, handler = %handler_name, "blocked user tried to access handler");
            return Err(StepError::TemporarilyBlocked {
                user_id,
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        let current = self.engine.states().get(user_id);
        let mut error = self.source_mismatch(current);
        if let Some(reason) = &error {
            tracing::warn!(
                user_id,
                handler = %handler_name,
                reason = %reason,
                "handler called from unexpected state"
            );
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let result = self.inner.handle(ctx).await;

        let event = match &result {
            Ok(outcome) => {
                let duration_ms = elapsed_ms(started);
                let to_state = match outcome {
                    HandlerOutcome::Goto(state) => *state,
                    HandlerOutcome::End => StateId::END,
                    HandlerOutcome::Stay => current.unwrap_or(StateId::END),
                };
                if !matches!(outcome, HandlerOutcome::Stay) {
                    let table = self.engine.transitions();
                    if table.is_restricted() && !table.is_valid_transition(current, to_state) {
                        let reason = format!(
                            "Transition {} -> {} is not allowed",
                            table.state_name(current),
                            table.state_name(Some(to_state))
                        );
                        tracing::warn!(user_id, handler = %handler_name, reason = %reason, "invalid state transition");
                        error = Some(match error {
                            Some(prev) => format!("{}; {}", prev, reason),
                            None => reason,
                        });
                    }
                    self.engine.states().set(user_id, to_state);
                }
                StateTransitionEvent {
                    user_id,
                    from_state: current,
                    to_state,
                    handler_name: handler_name.to_string(),
                    is_valid: error.is_none(),
                    timestamp,
                    duration_ms: Some(duration_ms),
                    error,
                }
            }
            Err(e) => {
                tracing::debug!(user_id, handler = %handler_name, error = %e, "handler failed");
                StateTransitionEvent {
                    user_id,
                    from_state: current,
                    to_state: current.unwrap_or(StateId::END),
                    handler_name: handler_name.to_string(),
                    is_valid: false,
                    timestamp,
                    duration_ms: None,
                    error: Some(e.to_string()),
                }
            }
        };
        tracing::trace!(
            user_id,
            handler = %handler_name,
            from = %state_key(event.from_state),
            to = %event.to_state,
            valid = event.is_valid,
            "transition recorded"
        );
        self.engine.recorder().record(event);
        result
    }
}
