//! Per-lifecycle telemetry channels.
//!
//! Each channel keeps a capped in-memory log, optionally journals every
//! event to an on-disk [`EventLog`], and fans events out over a bounded
//! broadcast queue. Publishing never waits on
//! subscribers: a subscriber that falls more than `capacity` events behind
//! loses the oldest ones, sees the loss in [`Subscription::dropped`], and
//! keeps receiving in order from there.

use crate::lock;
use fuzzdeck_core::{EventSink, TelemetryEvent};
use run_store::EventLog;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};

struct Channel {
    /// `None` once closed.
    tx: Option<broadcast::Sender<TelemetryEvent>>,
    log: VecDeque<TelemetryEvent>,
    trimmed: u64,
    journal: Option<EventLog>,
}

pub struct TelemetryHub<K> {
    capacity: usize,
    history: usize,
    channels: Mutex<HashMap<K, Channel>>,
}

impl<K> TelemetryHub<K>
where
    K: Eq + Hash + Clone,
{
    /// `capacity` bounds each subscriber's backlog, `history` the retained log.
    pub fn new(capacity: usize, history: usize) -> Self {
        TelemetryHub { capacity: capacity.max(1), history: history.max(1), channels: Mutex::new(HashMap::new()) }
    }

    /// Creates the channel for `id`; reopening an existing id is a no-op.
    pub fn open(&self, id: K) {
        let capacity = self.capacity;
        lock(&self.channels).entry(id).or_insert_with(|| Channel {
            tx: Some(broadcast::channel(capacity).0),
            log: VecDeque::new(),
            trimmed: 0,
            journal: None,
        });
    }

    /// Journals every later event of `id` to `log`, uncapped. Returns `false`
    /// when the channel is unknown.
    pub fn attach_log(&self, id: &K, log: EventLog) -> bool {
        match lock(&self.channels).get_mut(id) {
            Some(ch) => {
                ch.journal = Some(log);
                true
            }
            None => false,
        }
    }

    /// Takes the journal back, flushed.
    pub fn detach_log(&self, id: &K) -> Option<EventLog> {
        let mut log = lock(&self.channels).get_mut(id)?.journal.take()?;
        if let Err(e) = log.flush() {
            tracing::warn!(path = %log.path().display(), error = %format!("{e:#}"), "flushing event log");
        }
        Some(log)
    }

    /// Appends to the log and fans out. Returns `false` when the channel is
    /// unknown or already closed.
    pub fn publish(&self, id: &K, event: TelemetryEvent) -> bool {
        let mut channels = lock(&self.channels);
        let Some(ch) = channels.get_mut(id) else { return false };
        let Some(tx) = &ch.tx else { return false };
        // Sending under the lock keeps the log order and the delivery order identical.
        let _ = tx.send(event.clone());
        if let Some(journal) = &mut ch.journal {
            // Heartbeats set the flush cadence for the file.
            let flush = matches!(event, TelemetryEvent::Heartbeat { .. });
            let written = journal.append(&event).and_then(|_| if flush { journal.flush() } else { Ok(()) });
            if let Err(e) = written {
                tracing::warn!(path = %journal.path().display(), error = %format!("{e:#}"), "event log disabled");
                ch.journal = None;
            }
        }
        ch.log.push_back(event);
        if ch.log.len() > self.history {
            ch.log.pop_front();
            ch.trimmed += 1;
        }
        true
    }

    /// Live subscription that sees only events published after this call.
    /// Subscribing to a closed channel yields a subscription that ends at once.
    pub fn subscribe(&self, id: &K) -> Option<Subscription> {
        let channels = lock(&self.channels);
        let ch = channels.get(id)?;
        let rx = match &ch.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        Some(Subscription { rx, dropped: 0 })
    }

    pub fn history(&self, id: &K) -> Option<Vec<TelemetryEvent>> {
        lock(&self.channels).get(id).map(|ch| ch.log.iter().cloned().collect())
    }

    /// Events evicted from the retained log of `id`.
    pub fn trimmed(&self, id: &K) -> u64 {
        lock(&self.channels).get(id).map_or(0, |ch| ch.trimmed)
    }

    /// Ends the channel: subscribers drain what is queued, then see the end.
    pub fn close(&self, id: &K) {
        if let Some(ch) = lock(&self.channels).get_mut(id) {
            ch.tx = None;
        }
    }

    pub fn remove(&self, id: &K) {
        lock(&self.channels).remove(id);
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<TelemetryEvent>,
    dropped: u64,
}

impl Subscription {
    /// Next event in publish order, or `None` after the channel closed.
    pub async fn next(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(RecvError::Lagged(n)) => self.dropped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost by lagging.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// [`EventSink`] bound to one channel of a hub.
pub struct ChannelPublisher<K> {
    hub: Arc<TelemetryHub<K>>,
    id: K,
}

impl<K> ChannelPublisher<K> {
    pub fn new(hub: Arc<TelemetryHub<K>>, id: K) -> Self {
        ChannelPublisher { hub, id }
    }
}

impl<K> EventSink for ChannelPublisher<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn emit(&self, event: TelemetryEvent) {
        self.hub.publish(&self.id, event);
    }
}
