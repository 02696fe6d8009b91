//! The fan-out queue and its drain task.

use crate::{DeliveryStatus, Notification, NotificationDraft};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Delivery timing. Both delays are fixed — the simulation has no jitter.
#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    /// Time between a message being picked up (`Sent`) and `Delivered`.
    pub delivery_delay: Duration,
    /// Pause after each delivery before the next message is drained.
    pub drain_gap: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            delivery_delay: Duration::from_millis(1200),
            drain_gap: Duration::from_millis(400),
        }
    }
}

/// Handle to the in-memory notification queue.
///
/// Cloning is cheap; all clones share one ledger and one drain task. The
/// drain task processes one message at a time in enqueue order, so status
/// transitions are observed strictly FIFO.
#[derive(Clone)]
pub struct Fanout {
    ledger: Arc<Mutex<Vec<Notification>>>,
    tx: mpsc::UnboundedSender<Uuid>,
}

impl Fanout {
    /// Start the drain task and return a queue handle.
    pub fn spawn(config: FanoutConfig) -> Self {
        let ledger: Arc<Mutex<Vec<Notification>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(drain(ledger.clone(), rx, config));

        Self { ledger, tx }
    }

    /// Enqueue a notification and return its id. The message is `Queued`
    /// until the drain task picks it up.
    pub fn send(&self, draft: NotificationDraft) -> Uuid {
        let id = Uuid::new_v4();
        let notification = Notification {
            id,
            sender: draft.sender,
            recipient: draft.recipient,
            subject: draft.subject,
            body: draft.body,
            related_event: draft.related_event,
            read: false,
            status: DeliveryStatus::Queued,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
        };

        self.ledger
            .lock()
            .expect("notification ledger poisoned")
            .push(notification);

        // The drain task only stops when the runtime shuts down; a closed
        // channel just means the message stays Queued.
        if self.tx.send(id).is_err() {
            tracing::warn!(%id, "notification drain task is gone");
        } else {
            tracing::debug!(%id, "notification enqueued");
        }

        id
    }

    /// Copy of the full ledger, oldest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.ledger
            .lock()
            .expect("notification ledger poisoned")
            .clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.ledger
            .lock()
            .expect("notification ledger poisoned")
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Mark a notification read. Returns false for unknown ids.
    pub fn mark_read(&self, id: Uuid) -> bool {
        let mut ledger = self.ledger.lock().expect("notification ledger poisoned");
        match ledger.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn unread_for(&self, recipient: &str) -> usize {
        self.ledger
            .lock()
            .expect("notification ledger poisoned")
            .iter()
            .filter(|n| n.recipient == recipient && !n.read)
            .count()
    }
}

async fn drain(
    ledger: Arc<Mutex<Vec<Notification>>>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    config: FanoutConfig,
) {
    while let Some(id) = rx.recv().await {
        transition(&ledger, id, DeliveryStatus::Sent);
        tokio::time::sleep(config.delivery_delay).await;
        transition(&ledger, id, DeliveryStatus::Delivered);
        tokio::time::sleep(config.drain_gap).await;
    }
}

fn transition(ledger: &Mutex<Vec<Notification>>, id: Uuid, status: DeliveryStatus) {
    let mut ledger = ledger.lock().expect("notification ledger poisoned");
    let Some(n) = ledger.iter_mut().find(|n| n.id == id) else {
        return;
    };
    n.status = status;
    match status {
        DeliveryStatus::Sent => n.sent_at = Some(Utc::now()),
        DeliveryStatus::Delivered => n.delivered_at = Some(Utc::now()),
        DeliveryStatus::Queued => {}
    }
    tracing::debug!(%id, ?status, "notification transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn draft(subject: &str) -> NotificationDraft {
        NotificationDraft {
            sender: "front-desk".into(),
            recipient: "member-7".into(),
            subject: subject.into(),
            body: "see you at the gym".into(),
            related_event: None,
        }
    }

    fn quick_config() -> FanoutConfig {
        FanoutConfig {
            delivery_delay: Duration::from_millis(5),
            drain_gap: Duration::from_millis(2),
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn delivery_follows_enqueue_order() {
        let fanout = Fanout::spawn(quick_config());
        let m1 = fanout.send(draft("first"));
        let m2 = fanout.send(draft("second"));
        let m3 = fanout.send(draft("third"));

        let f = fanout.clone();
        wait_until(move || {
            f.snapshot()
                .iter()
                .all(|n| n.status == DeliveryStatus::Delivered)
        })
        .await;

        let n1 = fanout.get(m1).unwrap();
        let n2 = fanout.get(m2).unwrap();
        let n3 = fanout.get(m3).unwrap();

        // Strict FIFO: each message is fully delivered before the next is
        // even picked up.
        assert!(n1.delivered_at.unwrap() <= n2.sent_at.unwrap());
        assert!(n2.delivered_at.unwrap() <= n3.sent_at.unwrap());
        assert!(n1.sent_at.unwrap() <= n2.sent_at.unwrap());
        assert!(n2.sent_at.unwrap() <= n3.sent_at.unwrap());
    }

    #[tokio::test]
    async fn sent_precedes_delivered() {
        let fanout = Fanout::spawn(FanoutConfig {
            delivery_delay: Duration::from_millis(50),
            drain_gap: Duration::from_millis(2),
        });
        let id = fanout.send(draft("hello"));

        let f = fanout.clone();
        wait_until(move || f.get(id).unwrap().status != DeliveryStatus::Queued).await;

        // Observed mid-flight: sent but not yet delivered.
        let n = fanout.get(id).unwrap();
        assert_eq!(n.status, DeliveryStatus::Sent);
        assert!(n.sent_at.is_some());
        assert!(n.delivered_at.is_none());

        let f = fanout.clone();
        wait_until(move || f.get(id).unwrap().status == DeliveryStatus::Delivered).await;

        let n = fanout.get(id).unwrap();
        assert!(n.sent_at.unwrap() <= n.delivered_at.unwrap());
    }

    #[tokio::test]
    async fn starts_queued() {
        // A long delivery delay keeps the first message in flight, so the
        // second stays Queued long enough to observe.
        let fanout = Fanout::spawn(FanoutConfig {
            delivery_delay: Duration::from_secs(60),
            drain_gap: Duration::from_secs(60),
        });
        fanout.send(draft("blocker"));
        let id = fanout.send(draft("parked"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fanout.get(id).unwrap().status, DeliveryStatus::Queued);
    }

    #[tokio::test]
    async fn mark_read_and_unread_count() {
        let fanout = Fanout::spawn(quick_config());
        let id = fanout.send(draft("promo"));
        fanout.send(draft("reminder"));

        assert_eq!(fanout.unread_for("member-7"), 2);
        assert_eq!(fanout.unread_for("member-8"), 0);

        assert!(fanout.mark_read(id));
        assert_eq!(fanout.unread_for("member-7"), 1);

        assert!(!fanout.mark_read(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn snapshot_preserves_enqueue_order() {
        let fanout = Fanout::spawn(quick_config());
        fanout.send(draft("a"));
        fanout.send(draft("b"));
        fanout.send(draft("c"));

        let subjects: Vec<String> = fanout.snapshot().into_iter().map(|n| n.subject).collect();
        assert_eq!(subjects, vec!["a", "b", "c"]);
    }
}
