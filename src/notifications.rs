//! Fire-and-forget operator notifications.
//!
//! Notifiers never fail the caller: delivery errors are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

crate::sql_text_enum! {
    pub enum NotificationKind {
        ManualReview => "manual_review",
        CriticalError => "critical_error",
        HealingIssue => "healing_issue",
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: String,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            data,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::CriticalError => {
                tracing::error!(kind = %n.kind, title = %n.title, data = %n.data, "{}", n.message)
            }
            _ => tracing::warn!(kind = %n.kind, title = %n.title, data = %n.data, "{}", n.message),
        }
    }
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, crate::error::AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::error::AppError::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(kind = %notification.kind, "No runtime available for webhook notification");
            return;
        };
        let http = self.http.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            let result = http
                .post(&url)
                .json(&notification)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                tracing::warn!(kind = %notification.kind, error = %e, "Webhook notification failed");
            }
        });
    }
}

/// Delivers to every inner notifier.
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notification: Notification) {
        for n in &self.inner {
            n.notify(notification.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Public notification helpers
// ---------------------------------------------------------------------------

pub fn notify_manual_review(notifier: &dyn Notifier, error_id: &str, fix_id: Option<&str>, reason: &str) {
    notifier.notify(Notification::new(
        NotificationKind::ManualReview,
        "Manual Review Needed",
        reason,
        serde_json::json!({ "errorId": error_id, "fixId": fix_id }),
    ));
}

pub fn notify_critical_error(notifier: &dyn Notifier, error_id: &str, message: &str) {
    notifier.notify(Notification::new(
        NotificationKind::CriticalError,
        "Critical Error Detected",
        message,
        serde_json::json!({ "errorId": error_id }),
    ));
}

pub fn notify_healing_issue(notifier: &dyn Notifier, error_id: &str, fix_id: Option<&str>, message: &str) {
    notifier.notify(Notification::new(
        NotificationKind::HealingIssue,
        "Healing Issue",
        message,
        serde_json::json!({ "errorId": error_id, "fixId": fix_id }),
    ));
}
