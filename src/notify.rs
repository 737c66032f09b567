use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Reservation, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Something a member should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ReservationCreated(Reservation),
    ReservationApproved(Reservation),
}

impl Notice {
    pub fn recipient(&self) -> &UserId {
        match self {
            Notice::ReservationCreated(r) | Notice::ReservationApproved(r) => &r.owner,
        }
    }
}

#[derive(Debug)]
pub enum NotifyError {
    NoRecipient(UserId),
    Delivery(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::NoRecipient(id) => write!(f, "nobody listening for {id}"),
            NotifyError::Delivery(e) => write!(f, "delivery failed: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound notification channel. The engine calls it fire-and-forget after
/// commit; an error here never affects the reservation outcome.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError>;
}

/// Writes notices to the log. Default sender for the server binary.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError> {
        match &notice {
            Notice::ReservationCreated(r) => tracing::info!(
                "notify {}: reservation {} at {} on {} {} received",
                r.owner, r.id, r.facility_id, r.date, r.span
            ),
            Notice::ReservationApproved(r) => tracing::info!(
                "notify {}: reservation {} at {} on {} {} confirmed",
                r.owner, r.id, r.facility_id, r.date, r.span
            ),
        }
        Ok(())
    }
}

/// In-process broadcast hub, one channel per recipient.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a user. Creates the channel if needed.
    pub fn subscribe(&self, user: UserId) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(user)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn remove(&self, user: &UserId) {
        self.channels.remove(user);
    }
}

#[async_trait]
impl NotificationSender for NotifyHub {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError> {
        let recipient = notice.recipient().clone();
        match self.channels.get(&recipient) {
            Some(sender) => sender
                .send(notice)
                .map(|_| ())
                .map_err(|_| NotifyError::NoRecipient(recipient)),
            None => Err(NotifyError::NoRecipient(recipient)),
        }
    }
}
