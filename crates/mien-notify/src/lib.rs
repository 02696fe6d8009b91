//! mien-notify — In-memory notification fan-out.
//!
//! A deliberately small delivery simulation for member notifications:
//! messages are queued, "sent" when the drain task picks them up and
//! "delivered" after a fixed delay. Strictly sequential — delivery order is
//! enqueue order. Nothing is persisted and "delivered" is a local timer
//! transition, not a remote acknowledgment.

pub mod fanout;

pub use fanout::{Fanout, FanoutConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
}

/// A member notification and its delivery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Optional reference to a related event (class, booking, check-in).
    pub related_event: Option<String>,
    pub read: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// What callers hand to [`Fanout::send`].
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub related_event: Option<String>,
}
