use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::model::{CourtDay, ReservationChange};

const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeFilter {
    /// Every change to reservations of one court on one date.
    CourtDay(CourtDay),
    /// Every change touching a reservation that is, or just stopped being, active.
    StatusActive,
}

impl ChangeFilter {
    pub fn matches(&self, change: &ReservationChange) -> bool {
        match self {
            ChangeFilter::CourtDay(key) => change.key() == *key,
            ChangeFilter::StatusActive => true,
        }
    }
}

/// Signal delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Changed(ReservationChange),
    /// The subscriber fell behind and `n` changes were dropped; treat the
    /// cached set as stale.
    Lagged(u64),
}

/// Broadcast hub for reservation changes: one channel per (court, date)
/// plus one channel for the "all active reservations" view.
pub struct NotifyHub {
    channels: DashMap<CourtDay, broadcast::Sender<ReservationChange>>,
    active: broadcast::Sender<ReservationChange>,
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
            active: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes matching `filter`. Creates the channel if needed.
    pub fn subscribe(self: &Arc<Self>, filter: ChangeFilter) -> Subscription {
        let rx = match filter {
            ChangeFilter::CourtDay(key) => self
                .channels
                .entry(key)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe(),
            ChangeFilter::StatusActive => self.active.subscribe(),
        };
        Subscription {
            hub: Arc::clone(self),
            filter,
            rx,
        }
    }

    /// Publish a change. No-op if nobody is listening.
    pub fn send(&self, change: &ReservationChange) {
        if let Some(sender) = self.channels.get(&change.key()) {
            let _ = sender.send(change.clone());
        }
        let _ = self.active.send(change.clone());
    }

    /// Number of live per-day channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop the channel for `key` once its last receiver is going away.
    fn release(&self, key: &CourtDay) {
        self.channels.remove_if(key, |_, tx| tx.receiver_count() <= 1);
    }
}

/// A live feed handle. Dropping it unsubscribes.
pub struct Subscription {
    hub: Arc<NotifyHub>,
    filter: ChangeFilter,
    rx: broadcast::Receiver<ReservationChange>,
}

impl Subscription {
    pub fn filter(&self) -> ChangeFilter {
        self.filter
    }

    /// Wait for the next change. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => return Some(FeedEvent::Changed(change)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(FeedEvent::Lagged(n)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.filter.matches(&change) => return Some(FeedEvent::Changed(change)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(FeedEvent::Lagged(n)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let ChangeFilter::CourtDay(key) = self.filter {
            self.hub.release(&key);
        }
    }
}
