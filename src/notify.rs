//! Best-effort admin alerting.
//!
//! The engine only ever talks to an [`AdminSink`]; delivery errors are logged
//! and counted by [`AdminNotifier`] and never reach detection or reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::UserId;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("admin webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("admin webhook returned status {0}")]
    Status(u16),
    #[error("{0}")]
    Rejected(String),
}

/// Outbound channel to administrators.
#[async_trait]
pub trait AdminSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, admin_id: UserId, text: &str) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AdminSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, admin_id: UserId, text: &str) -> Result<(), NotifyError> {
        tracing::info!(admin_id, alert = %text, "admin alert");
        Ok(())
    }
}

/// POSTs `{"chat_id": .., "text": ..}` to a messaging gateway.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AdminSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, admin_id: UserId, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({ "chat_id": admin_id, "text": text });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Routes alerts to the primary (first configured) admin.
#[derive(Clone)]
pub struct AdminNotifier {
    sink: Arc<dyn AdminSink>,
    admins: Arc<Vec<UserId>>,
    sent_total: Arc<AtomicU64>,
    failures_total: Arc<AtomicU64>,
}

impl AdminNotifier {
    pub fn new(sink: Arc<dyn AdminSink>, admins: Vec<UserId>) -> Self {
        Self {
            sink,
            admins: Arc::new(admins),
            sent_total: Arc::new(AtomicU64::new(0)),
            failures_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Log-only notifier without admins; alerts are logged and dropped.
    pub fn disabled() -> Self {
        Self::new(Arc::new(LogSink), Vec::new())
    }

    pub fn primary_admin(&self) -> Option<UserId> {
        self.admins.first().copied()
    }

    /// Deliver `text` to `admin_id`.  Never fails.
    pub async fn notify(&self, admin_id: UserId, text: &str) {
        match self.sink.send(admin_id, text).await {
            Ok(()) => {
                self.sent_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures_total.fetch_add(1, Ordering::Relaxed);
                tracing::error!(admin_id, sink = %self.sink.name(), error = %e, "failed to notify admin");
            }
        }
    }

    /// Deliver `text` to the primary admin, if any.
    pub async fn alert(&self, text: &str) {
        match self.primary_admin() {
            Some(admin_id) => self.notify(admin_id, text).await,
            None => tracing::debug!(alert = %text, "no admin configured, alert dropped"),
        }
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingSink;

    #[async_trait]
    impl AdminSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        async fn send(&self, _admin_id: UserId, _text: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("gateway down".into()))
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        sent: Mutex<Vec<(UserId, String)>>,
    }

    #[async_trait]
    impl AdminSink for CapturingSink {
        fn name(&self) -> &str {
            "capture"
        }
        async fn send(&self, admin_id: UserId, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push((admin_id, text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_counted() {
        let notifier = AdminNotifier::new(Arc::new(FailingSink), vec![1]);
        notifier.alert("boom").await;
        notifier.notify(2, "boom").await;
        assert_eq!(notifier.failures_total(), 2);
        assert_eq!(notifier.sent_total(), 0);
    }

    #[tokio::test]
    async fn alerts_go_to_primary_admin() {
        let sink = Arc::new(CapturingSink::default());
        let notifier = AdminNotifier::new(sink.clone(), vec![11, 22]);
        notifier.alert("hello").await;
        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(11, "hello".to_string())]);
        assert_eq!(notifier.sent_total(), 1);
    }

    #[tokio::test]
    async fn no_admins_means_no_delivery() {
        let sink = Arc::new(CapturingSink::default());
        let notifier = AdminNotifier::new(sink.clone(), Vec::new());
        notifier.alert("dropped").await;
        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(notifier.failures_total(), 0);
    }
}
