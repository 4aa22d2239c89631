//! Outbound notification queue and the delivery job that drains it.
//!
//! The alarm evaluator appends to the [`Outbox`]; delivery runs on its own
//! tick and hands each queued notification to a [`Notifier`]. Delivery is
//! best effort: a notification that fails to deliver is logged and dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::Notification;

// ---

/// Append-only queue shared by the evaluator (producer) and the delivery
/// job (consumer).
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<Notification>>>,
}

impl Outbox {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: Notification) {
        // ---
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(notification);
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&self) -> Vec<Notification> {
        // ---
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivery collaborator for queued notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that writes each notification to the log instead of sending it.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    sender: String,
}

impl LogNotifier {
    // ---
    pub fn new(sender: impl Into<String>) -> Self {
        Self { sender: sender.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    // ---
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            id = %notification.id,
            from = %self.sender,
            to = %notification.recipients.join(", "),
            "Notification: {}",
            notification.subject
        );
        debug!("Notification body:\n{}", notification.body);
        Ok(())
    }
}

/// Drain the outbox and hand every notification to `notifier`.
/// Returns the number delivered successfully.
pub async fn deliver_pending(outbox: &Outbox, notifier: &dyn Notifier) -> usize {
    // ---
    let pending = outbox.drain();
    if pending.is_empty() {
        return 0;
    }

    let mut delivered = 0;
    for notification in &pending {
        match notifier.deliver(notification).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("Failed to deliver notification {}: {:#}", notification.id, e),
        }
    }
    info!("Delivered {} of {} notifications", delivered, pending.len());
    delivered
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use anyhow::bail;
    use chrono::Utc;
    use uuid::Uuid;

    fn notification(subject: &str) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            subject: subject.to_string(),
            body: String::new(),
            recipients: vec!["ops@example.com".to_string()],
        }
    }

    struct Flaky;

    #[async_trait]
    impl Notifier for Flaky {
        async fn deliver(&self, notification: &Notification) -> Result<()> {
            if notification.subject.starts_with("TOO_HIGH") {
                bail!("smtp unavailable");
            }
            Ok(())
        }
    }

    #[test]
    fn test_outbox_drains_in_order() {
        // ---
        let outbox = Outbox::new();
        outbox.push(notification("first"));
        outbox.push(notification("second"));
        assert_eq!(outbox.len(), 2);

        let subjects: Vec<_> = outbox.drain().into_iter().map(|n| n.subject).collect();
        assert_eq!(subjects, vec!["first", "second"]);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dropped_not_retried() {
        // ---
        let outbox = Outbox::new();
        outbox.push(notification("TOO_LOW: humidity"));
        outbox.push(notification("TOO_HIGH: temperature"));

        assert_eq!(deliver_pending(&outbox, &Flaky).await, 1);
        assert!(outbox.is_empty());
        assert_eq!(deliver_pending(&outbox, &Flaky).await, 0);
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_everything() {
        // ---
        let outbox = Outbox::new();
        outbox.push(notification("HEALTHY: humidity"));
        let notifier = LogNotifier::new("humidscope@localhost");
        assert_eq!(deliver_pending(&outbox, &notifier).await, 1);
    }
}
