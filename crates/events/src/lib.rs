//! Notifications exchanged between workers and the channel they travel on.

pub mod channel;
pub mod envelope;
pub mod in_memory_channel;

pub use channel::{ChannelError, Delivery, NotificationChannel};
pub use envelope::{
    ArchiveRetrievalCompleted, DecodeError, JobFinished, JobSubmitted, Notification,
    RestoreRequested, RetrievalStatus,
};
pub use in_memory_channel::{DeadLetter, InMemoryChannel};
