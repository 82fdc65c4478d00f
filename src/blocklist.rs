//! Temporary user blocks.
//!
//! Each block owns a timer task that removes the entry when it fires.  The
//! timers are kept in the entry itself so that an explicit unblock or a
//! shutdown can abort them instead of leaving detached sleeps behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::state::UserId;
use crate::util::to_chrono;

struct BlockEntry {
    until: DateTime<Utc>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedUser {
    pub user_id: UserId,
    pub until: DateTime<Utc>,
}

#[derive(Default)]
pub struct Blocklist {
    entries: Arc<DashMap<UserId, BlockEntry>>,
    generation: AtomicU64,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `user_id` for `duration`.  An existing block for the same user is
    /// replaced and its timer aborted.  Must be called from within a tokio
    /// runtime.
    pub fn block(&self, user_id: UserId, duration: Duration) -> DateTime<Utc> {
        let until = Utc::now() + to_chrono(duration);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.entries.insert(
            user_id,
            BlockEntry {
                until,
                generation,
                timer: None,
            },
        ) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
        }

        let entries = Arc::clone(&self.entries);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if entries
                .remove_if(&user_id, |_, entry| entry.generation == generation)
                .is_some()
            {
                tracing::info!(user_id, delay_secs = duration.as_secs(), "user unblocked");
            }
        });
        // The timer may already have fired for very short durations; then the
        // entry is gone and the finished handle is simply dropped.
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            if entry.generation == generation {
                entry.timer = Some(timer);
            }
        }
        tracing::warn!(user_id, until = %until, "user temporarily blocked");
        until
    }

    /// Lift a block early.  Returns false when the user was not blocked.
    pub fn unblock(&self, user_id: UserId) -> bool {
        match self.entries.remove(&user_id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_blocked(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }

    /// Time left on a user's block, `None` when not blocked.
    pub fn remaining(&self, user_id: UserId) -> Option<Duration> {
        self.entries.get(&user_id).map(|entry| {
            (entry.until - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Blocked users sorted by id.
    pub fn blocked_users(&self) -> Vec<BlockedUser> {
        let mut users: Vec<_> = self
            .entries
            .iter()
            .map(|entry| BlockedUser {
                user_id: *entry.key(),
                until: entry.until,
            })
            .collect();
        users.sort_by_key(|u| u.user_id);
        users
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort every pending unblock timer and clear all blocks.
    pub fn cancel_all(&self) -> usize {
        let users: Vec<UserId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for user_id in users {
            if let Some((_, entry)) = self.entries.remove(&user_id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn block_expires_after_duration() {
        let blocklist = Blocklist::new();
        blocklist.block(7, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(blocklist.is_blocked(7));
        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!blocklist.is_blocked(7));
        assert!(blocklist.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unblock_cancels_timer() {
        let blocklist = Blocklist::new();
        blocklist.block(1, Duration::from_secs(5));
        assert!(blocklist.unblock(1));
        assert!(!blocklist.unblock(1));
        blocklist.block(1, Duration::from_secs(10));
        // the first timer must not remove the second block
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(blocklist.is_blocked(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(!blocklist.is_blocked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reblocking_replaces_deadline() {
        let blocklist = Blocklist::new();
        blocklist.block(3, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(3)).await;
        blocklist.block(3, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(blocklist.is_blocked(3));
    }

    #[tokio::test]
    async fn cancel_all_clears_blocks() {
        let blocklist = Blocklist::new();
        blocklist.block(1, Duration::from_secs(300));
        blocklist.block(2, Duration::from_secs(300));
        assert_eq!(blocklist.len(), 2);
        let listed: Vec<_> = blocklist.blocked_users().iter().map(|u| u.user_id).collect();
        assert_eq!(listed, vec![1, 2]);
        assert!(blocklist.remaining(1).unwrap() <= Duration::from_secs(300));
        assert_eq!(blocklist.cancel_all(), 2);
        assert!(blocklist.is_empty());
    }
}
