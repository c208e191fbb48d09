//! In-memory notification channel for tests/dev.
//!
//! Models a visibility-timeout queue: received messages are hidden rather
//! than removed, and reappear unless acknowledged in time.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use strata_core::{Clock, SystemClock};

use crate::channel::{ChannelError, Delivery, NotificationChannel};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one condvar wait, so messages whose visibility expires
/// mid-poll are noticed.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
    visible_at: DateTime<Utc>,
    receipt: Option<String>,
}

/// A message moved aside after too many deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub receive_count: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    messages: VecDeque<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    next_receipt: u64,
}

#[derive(Debug)]
pub struct InMemoryChannel {
    name: String,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    max_receive_count: Option<u32>,
    state: Mutex<ChannelState>,
    arrived: Condvar,
}

impl InMemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: Arc::new(SystemClock),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receive_count: None,
            state: Mutex::new(ChannelState::default()),
            arrived: Condvar::new(),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Redrive policy: after `max` deliveries a message is dead-lettered
    /// instead of delivered again.
    pub fn with_max_receive_count(mut self, max: u32) -> Self {
        self.max_receive_count = Some(max);
        self
    }

    /// Messages still on the channel (visible or in flight).
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by an unacknowledged delivery or a delay.
    pub fn in_flight(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .map(|s| s.messages.iter().filter(|m| m.visible_at > now).count())
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().map(|s| s.dead_letters.clone()).unwrap_or_default()
    }

    /// Bodies of every message still on the channel, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChannelState>, ChannelError> {
        self.state.lock().map_err(|_| ChannelError::Poisoned)
    }

    fn take_visible(&self, state: &mut ChannelState, max: usize) -> Vec<Delivery> {
        let now = self.clock.now();
        let hide_until = now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_default();
        let mut out = Vec::new();
        let mut expired = Vec::new();

        for (idx, msg) in state.messages.iter_mut().enumerate() {
            if out.len() >= max {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            if let Some(limit) = self.max_receive_count
                && msg.receive_count >= limit
            {
                expired.push(idx);
                continue;
            }

            state.next_receipt += 1;
            let receipt = format!("{}#{}", msg.id, state.next_receipt);
            msg.receive_count += 1;
            msg.visible_at = hide_until;
            msg.receipt = Some(receipt.clone());
            out.push(Delivery {
                message_id: msg.id.clone(),
                receipt_handle: receipt,
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
        }

        for idx in expired.into_iter().rev() {
            if let Some(msg) = state.messages.remove(idx) {
                warn!(
                    channel = %self.name,
                    message_id = %msg.id,
                    receive_count = msg.receive_count,
                    "message exceeded max receive count; dead-lettered"
                );
                state.dead_letters.push(DeadLetter {
                    message_id: msg.id,
                    body: msg.body,
                    receive_count: msg.receive_count,
                });
            }
        }

        out
    }

    fn find_by_receipt<'a>(
        state: &'a mut ChannelState,
        delivery: &Delivery,
    ) -> Result<Option<&'a mut StoredMessage>, ChannelError> {
        match state
            .messages
            .iter_mut()
            .find(|m| m.id == delivery.message_id)
        {
            None => Ok(None),
            Some(m) if m.receipt.as_deref() == Some(delivery.receipt_handle.as_str()) => Ok(Some(m)),
            Some(_) => Err(ChannelError::StaleReceipt(delivery.receipt_handle.clone())),
        }
    }
}

impl NotificationChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, body: String) -> Result<String, ChannelError> {
        let id = Uuid::now_v7().to_string();
        let mut state = self.lock()?;
        state.messages.push_back(StoredMessage {
            id: id.clone(),
            body,
            receive_count: 0,
            visible_at: self.clock.now(),
            receipt: None,
        });
        drop(state);
        self.arrived.notify_all();
        Ok(id)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, ChannelError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            let batch = self.take_visible(&mut state, max_messages.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let (guard, _) = self
                .arrived
                .wait_timeout(state, slice)
                .map_err(|_| ChannelError::Poisoned)?;
            state = guard;
        }
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        // Already gone: an earlier acknowledgement of this delivery won.
        if Self::find_by_receipt(&mut state, delivery)?.is_none() {
            return Ok(());
        }
        state.messages.retain(|m| m.id != delivery.message_id);
        Ok(())
    }

    fn change_visibility(&self, delivery: &Delivery, delay: Duration) -> Result<(), ChannelError> {
        let visible_at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let mut state = self.lock()?;
        match Self::find_by_receipt(&mut state, delivery)? {
            Some(msg) => {
                msg.visible_at = visible_at;
                Ok(())
            }
            None => Err(ChannelError::StaleReceipt(delivery.receipt_handle.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ManualClock;

    fn channel() -> (Arc<ManualClock>, InMemoryChannel) {
        let clock = Arc::new(ManualClock::default());
        let ch = InMemoryChannel::new("test")
            .with_clock(clock.clone())
            .with_visibility_timeout(Duration::from_secs(30));
        (clock, ch)
    }

    #[test]
    fn received_message_is_hidden_until_acknowledged() {
        let (_clock, ch) = channel();
        ch.publish("a".into()).unwrap();

        let batch = ch.receive(10, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(ch.receive(10, Duration::ZERO).unwrap().is_empty());

        ch.acknowledge(&batch[0]).unwrap();
        assert!(ch.is_empty());
    }

    #[test]
    fn unacknowledged_message_is_redelivered_after_timeout() {
        let (clock, ch) = channel();
        ch.publish("a".into()).unwrap();

        let first = ch.receive(1, Duration::ZERO).unwrap().remove(0);
        clock.advance(chrono::Duration::seconds(31));
        let second = ch.receive(1, Duration::ZERO).unwrap().remove(0);

        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.receive_count, 2);
        assert_eq!(
            ch.acknowledge(&first),
            Err(ChannelError::StaleReceipt(first.receipt_handle.clone()))
        );
        ch.acknowledge(&second).unwrap();
        assert!(ch.is_empty());
    }

    #[test]
    fn change_visibility_defers_redelivery() {
        let (clock, ch) = channel();
        ch.publish("a".into()).unwrap();
        let d = ch.receive(1, Duration::ZERO).unwrap().remove(0);

        ch.change_visibility(&d, Duration::from_secs(120)).unwrap();
        clock.advance(chrono::Duration::seconds(60));
        assert!(ch.receive(1, Duration::ZERO).unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(ch.receive(1, Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn batch_size_is_respected() {
        let (_clock, ch) = channel();
        for i in 0..5 {
            ch.publish(format!("m{i}")).unwrap();
        }
        assert_eq!(ch.receive(3, Duration::ZERO).unwrap().len(), 3);
        assert_eq!(ch.receive(3, Duration::ZERO).unwrap().len(), 2);
        assert_eq!(ch.in_flight(), 5);
    }

    #[test]
    fn redrive_policy_dead_letters_poison_messages() {
        let clock = Arc::new(ManualClock::default());
        let ch = InMemoryChannel::new("test")
            .with_clock(clock.clone())
            .with_max_receive_count(2);
        ch.publish("poison".into()).unwrap();

        for _ in 0..2 {
            assert_eq!(ch.receive(1, Duration::ZERO).unwrap().len(), 1);
            clock.advance(chrono::Duration::seconds(31));
        }
        assert!(ch.receive(1, Duration::ZERO).unwrap().is_empty());
        assert_eq!(ch.dead_letters().len(), 1);
        assert_eq!(ch.dead_letters()[0].body, "poison");
        assert!(ch.is_empty());
    }

    #[test]
    fn long_poll_wakes_on_publish() {
        let ch = Arc::new(InMemoryChannel::new("test"));
        let publisher = ch.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish("late".into()).unwrap();
        });

        let batch = ch.receive(1, Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[test]
    fn empty_receive_times_out() {
        let ch = InMemoryChannel::new("test");
        let batch = ch.receive(10, Duration::from_millis(10)).unwrap();
        assert!(batch.is_empty());
    }
}
