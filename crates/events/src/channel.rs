//! Notification channel abstraction (receive / acknowledge mechanics only).
//!
//! Delivery is **at-least-once**:
//! - a received message stays on the channel, hidden, until it is acknowledged
//! - if it is not acknowledged before its visibility timeout it is delivered again
//! - unrelated messages may arrive in any order
//!
//! Consumers must therefore be idempotent. The receipt handle on a
//! [`Delivery`] identifies one specific delivery; acknowledging with a handle
//! from an older delivery of the same message is rejected, which stops two
//! consumers from both durably completing the same delivery.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::Notification;

/// One delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    /// Handle proving custody of this particular delivery.
    pub receipt_handle: String,
    pub body: String,
    /// How many times the message has been delivered, including this one.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The receipt handle no longer identifies the current delivery.
    #[error("stale receipt handle: {0}")]
    StaleReceipt(String),

    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Internal lock poisoning.
    #[error("channel state poisoned")]
    Poisoned,
}

/// Queue-like channel with explicit acknowledgement.
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a raw body; returns the message id.
    fn publish(&self, body: String) -> Result<String, ChannelError>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Returns an empty batch on timeout.
    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, ChannelError>;

    /// Delete a processed message.
    fn acknowledge(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Keep a received message hidden for `delay` from now, then redeliver it.
    fn change_visibility(&self, delivery: &Delivery, delay: Duration) -> Result<(), ChannelError>;

    /// Publish a notification the way a fan-out topic delivers it.
    fn publish_notification(&self, notification: &Notification) -> Result<String, ChannelError> {
        self.publish(notification.encode_wrapped())
    }
}

impl<C> NotificationChannel for Arc<C>
where
    C: NotificationChannel + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn publish(&self, body: String) -> Result<String, ChannelError> {
        (**self).publish(body)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, ChannelError> {
        (**self).receive(max_messages, wait)
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        (**self).acknowledge(delivery)
    }

    fn change_visibility(&self, delivery: &Delivery, delay: Duration) -> Result<(), ChannelError> {
        (**self).change_visibility(delivery, delay)
    }
}
