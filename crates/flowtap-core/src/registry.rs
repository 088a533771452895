//! Connection registry
//!
//! A fixed-capacity ring of connections. New connections overwrite the oldest once the ring
//! is full. The registry keeps per-app aggregates over the live connections and notifies
//! subscribed listeners of every change.
//!
//! Positions reported to listeners are logical: position 0 is the oldest live connection.
//! Notifications are delivered on the calling thread after the ring lock is released, so a
//! listener may query the registry from its callback.

use crate::connection::{Connection, ConnectionUpdate};
use crate::metrics::EngineMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives registry change notifications
///
/// All methods default to no-ops so listeners only implement what they need.
pub trait ConnectionsListener: Send + Sync {
    /// The registry was reset or the listener just subscribed
    fn connections_changed(&self, _count: usize) {}

    /// The oldest connections were evicted, starting at logical position `start`
    fn connections_removed(&self, _start: usize, _removed: &[Arc<Connection>]) {}

    /// New connections were appended, starting at logical position `start`
    fn connections_added(&self, _start: usize, _added: &[Arc<Connection>]) {}

    /// Connections at these logical positions were updated in place
    fn connections_updated(&self, _positions: &[usize]) {}
}

/// Opaque subscription handle returned by [`ConnectionRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Per-app aggregate over live connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStats {
    pub uid: i32,
    pub num_connections: u64,
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
}

impl AppStats {
    fn new(uid: i32) -> Self {
        Self {
            uid,
            ..Default::default()
        }
    }

    /// Total bytes in both directions
    pub fn bytes(&self) -> u64 {
        self.sent_bytes + self.rcvd_bytes
    }
}

enum Event {
    Removed(usize, Vec<Arc<Connection>>),
    Added(usize, Vec<Arc<Connection>>),
    Updated(Vec<usize>),
    Changed(usize),
}

struct RingState {
    items: Vec<Option<Arc<Connection>>>,
    /// Next slot to write
    tail: usize,
    num_items: usize,
    untracked: u64,
    app_stats: HashMap<i32, AppStats>,
    seen_uids: HashSet<i32>,
}

impl RingState {
    fn new(capacity: usize) -> Self {
        Self {
            items: vec![None; capacity],
            tail: 0,
            num_items: 0,
            untracked: 0,
            app_stats: HashMap::new(),
            seen_uids: HashSet::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.items.len()
    }

    fn first_slot(&self) -> usize {
        if self.num_items < self.capacity() {
            0
        } else {
            self.tail
        }
    }

    fn get(&self, pos: usize) -> Option<&Arc<Connection>> {
        if pos >= self.num_items {
            return None;
        }
        let slot = (self.first_slot() + pos) % self.capacity();
        self.items[slot].as_ref()
    }

    fn first_id(&self) -> Option<u64> {
        self.get(0).map(|c| c.incr_id())
    }

    fn position_of(&self, incr_id: u64) -> Option<usize> {
        let first_id = self.first_id()?;
        let offset = incr_id.checked_sub(first_id)?;
        if offset >= self.num_items as u64 {
            return None;
        }

        let pos = offset as usize;
        match self.get(pos) {
            Some(conn) if conn.incr_id() == incr_id => Some(pos),
            _ => {
                debug!("Connection id {} not at its expected position {}", incr_id, pos);
                None
            }
        }
    }

    fn credit(&mut self, conn: &Connection) {
        let stats = conn.stats();
        let app = self
            .app_stats
            .entry(conn.uid())
            .or_insert_with(|| AppStats::new(conn.uid()));
        app.num_connections += 1;
        app.sent_bytes += stats.sent_bytes;
        app.rcvd_bytes += stats.rcvd_bytes;
        self.seen_uids.insert(conn.uid());
    }

    fn debit(&mut self, conn: &Connection) {
        let stats = conn.stats();
        if let Some(app) = self.app_stats.get_mut(&conn.uid()) {
            app.num_connections = app.num_connections.saturating_sub(1);
            app.sent_bytes = app.sent_bytes.saturating_sub(stats.sent_bytes);
            app.rcvd_bytes = app.rcvd_bytes.saturating_sub(stats.rcvd_bytes);

            if app.num_connections == 0 {
                self.app_stats.remove(&conn.uid());
            }
        }
    }
}

/// Bounded registry of connections
pub struct ConnectionRegistry {
    state: Mutex<RingState>,
    listeners: Mutex<Vec<(ListenerHandle, Arc<dyn ConnectionsListener>)>>,
    notifications: Mutex<Notifications>,
    next_handle: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

/// Events queued under the ring lock, delivered in order by one thread at a time
#[derive(Default)]
struct Notifications {
    queue: VecDeque<(Vec<Event>, Vec<Arc<dyn ConnectionsListener>>)>,
    draining: bool,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionRegistry")
            .field("capacity", &state.capacity())
            .field("live", &state.num_items)
            .field("untracked", &state.untracked)
            .finish()
    }
}

impl ConnectionRegistry {
    /// Create a registry holding at most `capacity` connections
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self::with_metrics(capacity, Arc::new(EngineMetrics::new()))
    }

    pub fn with_metrics(capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            state: Mutex::new(RingState::new(capacity.max(1))),
            listeners: Mutex::new(Vec::new()),
            notifications: Mutex::new(Notifications::default()),
            next_handle: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().num_items
    }

    /// Connections evicted since the last reset
    pub fn untracked_count(&self) -> u64 {
        self.state.lock().untracked
    }

    /// Register a listener; it immediately receives the current size
    ///
    /// The size is queued under the ring lock, ahead of any later mutation, so every
    /// connection is counted either in the replayed size or in a later event.
    pub fn subscribe(&self, listener: Arc<dyn ConnectionsListener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        {
            let state = self.state.lock();
            self.listeners.lock().push((handle, listener.clone()));
            self.enqueue(vec![Event::Changed(state.num_items)], vec![listener]);
        }

        self.drain_notifications();
        handle
    }

    /// Remove a listener; returns false if the handle was unknown
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Append new connections, evicting the oldest when the ring is full
    pub fn insert(&self, batch: Vec<Connection>) {
        if batch.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock();
            let capacity = state.capacity();
            let mut batch: Vec<Arc<Connection>> = batch.into_iter().map(Arc::new).collect();

            // Entries that would be overwritten within this same batch never become live
            if batch.len() > capacity {
                let skipped = batch.len() - capacity;
                warn!(
                    "Connection batch of {} exceeds registry capacity {}, skipping {}",
                    batch.len(),
                    capacity,
                    skipped
                );
                for conn in batch.drain(..skipped) {
                    state.seen_uids.insert(conn.uid());
                }
                state.untracked += skipped as u64;
                self.metrics
                    .registry
                    .evicted
                    .fetch_add(skipped as u64, Ordering::Relaxed);
            }

            let mut removed = Vec::new();
            for conn in &batch {
                let tail = state.tail;
                if let Some(old) = state.items[tail].take() {
                    state.debit(&old);
                    removed.push(old);
                }
                state.items[tail] = Some(conn.clone());
                state.tail = (tail + 1) % capacity;
                state.num_items = (state.num_items + 1).min(capacity);
                state.credit(conn);
            }

            state.untracked += removed.len() as u64;
            self.metrics
                .registry
                .inserted
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.metrics
                .registry
                .evicted
                .fetch_add(removed.len() as u64, Ordering::Relaxed);

            if !removed.is_empty() {
                debug!("Evicted {} connections", removed.len());
            }

            let added_start = state.num_items - batch.len();
            let mut events = Vec::with_capacity(2);
            if !removed.is_empty() {
                events.push(Event::Removed(0, removed));
            }
            events.push(Event::Added(added_start, batch));
            self.enqueue(events, self.listener_snapshot());
        }

        self.drain_notifications();
    }

    /// Apply updates keyed by insertion id; ids outside the live window are ignored
    pub fn apply_updates(&self, updates: &[ConnectionUpdate]) {
        {
            let mut state = self.state.lock();
            let mut positions = Vec::with_capacity(updates.len());
            let mut changed = HashSet::with_capacity(updates.len());
            let mut applied = 0u64;

            for update in updates {
                let Some(pos) = state.position_of(update.incr_id) else {
                    self.metrics
                        .registry
                        .updates_ignored
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                let Some(conn) = state.get(pos).cloned() else {
                    continue;
                };

                let (sent_delta, rcvd_delta) = conn.apply_update(update);
                if let Some(app) = state.app_stats.get_mut(&conn.uid()) {
                    app.sent_bytes = app.sent_bytes.saturating_add_signed(sent_delta);
                    app.rcvd_bytes = app.rcvd_bytes.saturating_add_signed(rcvd_delta);
                }

                applied += 1;
                if changed.insert(pos) {
                    positions.push(pos);
                }
            }

            self.metrics
                .registry
                .updates_applied
                .fetch_add(applied, Ordering::Relaxed);
            if !positions.is_empty() {
                self.enqueue(vec![Event::Updated(positions)], self.listener_snapshot());
            }
        }

        self.drain_notifications();
    }

    /// Drop every connection and aggregate
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            let capacity = state.capacity();
            *state = RingState::new(capacity);
            self.enqueue(vec![Event::Changed(0)], self.listener_snapshot());
        }
        debug!("Connection registry reset");
        self.drain_notifications();
    }

    /// Connection at a logical position (0 is the oldest)
    pub fn lookup_by_position(&self, pos: usize) -> Option<Arc<Connection>> {
        self.state.lock().get(pos).cloned()
    }

    /// Live connection with the given insertion id
    pub fn lookup_by_id(&self, incr_id: u64) -> Option<Arc<Connection>> {
        let state = self.state.lock();
        let pos = state.position_of(incr_id)?;
        state.get(pos).cloned()
    }

    /// Logical position of a live connection
    pub fn position_of(&self, incr_id: u64) -> Option<usize> {
        self.state.lock().position_of(incr_id)
    }

    /// Newest live connection whose local port is `port`
    pub fn find_by_local_port(&self, port: u16) -> Option<Arc<Connection>> {
        let state = self.state.lock();
        (0..state.num_items)
            .rev()
            .filter_map(|pos| state.get(pos))
            .find(|conn| conn.local_port() == port)
            .cloned()
    }

    /// Live connections, oldest first
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let state = self.state.lock();
        (0..state.num_items)
            .filter_map(|pos| state.get(pos).cloned())
            .collect()
    }

    /// Aggregate for one app, if it has live connections
    pub fn app_stats(&self, uid: i32) -> Option<AppStats> {
        self.state.lock().app_stats.get(&uid).copied()
    }

    /// Copy of all per-app aggregates
    pub fn app_stats_snapshot(&self) -> Vec<AppStats> {
        let state = self.state.lock();
        let mut stats: Vec<AppStats> = state.app_stats.values().copied().collect();
        stats.sort_by_key(|s| s.uid);
        stats
    }

    /// Every app id seen since the last reset, including evicted ones
    pub fn seen_uids(&self) -> HashSet<i32> {
        self.state.lock().seen_uids.clone()
    }

    /// Largest per-connection byte total among live connections
    pub fn max_bytes(&self) -> u64 {
        let state = self.state.lock();
        (0..state.num_items)
            .filter_map(|pos| state.get(pos))
            .map(|conn| conn.total_bytes())
            .max()
            .unwrap_or(0)
    }

    /// Listeners to notify of the mutation in progress; call with the ring lock held
    fn listener_snapshot(&self) -> Vec<Arc<dyn ConnectionsListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Queue events for delivery; call with the ring lock held so queue order is ring order
    fn enqueue(&self, events: Vec<Event>, listeners: Vec<Arc<dyn ConnectionsListener>>) {
        if listeners.is_empty() {
            return;
        }
        self.notifications.lock().queue.push_back((events, listeners));
    }

    /// Deliver queued events with no registry lock held
    ///
    /// If another thread is already delivering, it picks up what we queued.
    fn drain_notifications(&self) {
        {
            let mut pending = self.notifications.lock();
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        let _guard = DrainGuard(&self.notifications);
        loop {
            let next = self.notifications.lock().queue.pop_front();
            let Some((events, listeners)) = next else {
                break;
            };
            Self::dispatch(&events, &listeners);
        }
    }

    fn dispatch(events: &[Event], listeners: &[Arc<dyn ConnectionsListener>]) {
        for event in events {
            for listener in listeners {
                match event {
                    Event::Removed(start, conns) => listener.connections_removed(*start, conns),
                    Event::Added(start, conns) => listener.connections_added(*start, conns),
                    Event::Updated(positions) => listener.connections_updated(positions),
                    Event::Changed(count) => listener.connections_changed(*count),
                }
            }
        }
    }
}

/// Clears the draining flag when delivery ends, including by a panicking listener
struct DrainGuard<'a>(&'a Mutex<Notifications>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::info;
    use crate::connection::{ConnStatus, StatsUpdate};

    const CAPACITY: usize = 8;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl ConnectionsListener for RecordingListener {
        fn connections_changed(&self, count: usize) {
            self.events.lock().push(format!("changed:{}", count));
        }

        fn connections_removed(&self, start: usize, removed: &[Arc<Connection>]) {
            self.events
                .lock()
                .push(format!("removed:{}:{}", start, removed.len()));
        }

        fn connections_added(&self, start: usize, added: &[Arc<Connection>]) {
            self.events
                .lock()
                .push(format!("added:{}:{}", start, added.len()));
        }

        fn connections_updated(&self, positions: &[usize]) {
            self.events.lock().push(format!("updated:{:?}", positions));
        }
    }

    struct Fixture {
        reg: ConnectionRegistry,
        next_id: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                reg: ConnectionRegistry::new(CAPACITY),
                next_id: 0,
            }
        }

        fn conn(&mut self, uid: i32, sent: u64, rcvd: u64) -> Connection {
            let id = self.next_id;
            self.next_id += 1;
            Connection::with_stats(
                info(id, uid, 40000 + id as u16),
                StatsUpdate {
                    sent_bytes: sent,
                    rcvd_bytes: rcvd,
                    status: ConnStatus::Connected,
                    ..Default::default()
                },
            )
        }

        fn add(&mut self, uids: &[i32]) {
            let batch: Vec<Connection> = uids.iter().map(|&uid| self.conn(uid, 0, 0)).collect();
            self.reg.insert(batch);
        }
    }

    fn assert_aggregates_consistent(reg: &ConnectionRegistry) {
        let total: u64 = reg
            .app_stats_snapshot()
            .iter()
            .map(|s| s.num_connections)
            .sum();
        assert_eq!(total, reg.live_count() as u64);
    }

    #[test]
    fn test_insert() {
        let mut fx = Fixture::new();
        fx.add(&[1000, 1000]);

        assert_eq!(fx.reg.live_count(), 2);
        assert_eq!(fx.reg.untracked_count(), 0);
        assert_eq!(fx.reg.lookup_by_position(0).unwrap().incr_id(), 0);
        assert_eq!(fx.reg.lookup_by_position(1).unwrap().incr_id(), 1);
        assert!(fx.reg.lookup_by_position(2).is_none());
    }

    #[test]
    fn test_rollover() {
        let mut fx = Fixture::new();
        fx.add(&[1000; CAPACITY]);
        assert_eq!(fx.reg.live_count(), CAPACITY);

        fx.add(&[1000, 1000]);
        assert_eq!(fx.reg.live_count(), CAPACITY);
        assert_eq!(fx.reg.untracked_count(), 2);
        assert_eq!(fx.reg.lookup_by_position(0).unwrap().incr_id(), 2);
        assert_eq!(
            fx.reg.lookup_by_position(CAPACITY - 1).unwrap().incr_id(),
            9
        );
    }

    #[test]
    fn test_partial_fill_then_overflow() {
        let mut fx = Fixture::new();
        fx.add(&[1; 7]);
        fx.add(&[2, 2, 2]);

        assert_eq!(fx.reg.live_count(), CAPACITY);
        assert_eq!(fx.reg.untracked_count(), 2);
        assert_eq!(fx.reg.lookup_by_position(0).unwrap().incr_id(), 2);
        assert_eq!(fx.reg.position_of(9), Some(7));
        assert_aggregates_consistent(&fx.reg);
    }

    #[test]
    fn test_lookup_by_id() {
        let mut fx = Fixture::new();
        fx.add(&[1000, 1000, 1000]);

        assert!(fx.reg.lookup_by_id(0).is_some());
        assert!(fx.reg.lookup_by_id(2).is_some());
        assert!(fx.reg.lookup_by_id(3).is_none());
        assert_eq!(fx.reg.position_of(1), Some(1));
        assert_eq!(fx.reg.position_of(3), None);
    }

    #[test]
    fn test_position_after_rollover() {
        let mut fx = Fixture::new();
        fx.add(&[1000; CAPACITY]);
        fx.add(&[1000, 1000]);

        assert_eq!(fx.reg.position_of(0), None);
        assert_eq!(fx.reg.position_of(1), None);
        assert_eq!(fx.reg.position_of(2), Some(0));
        assert_eq!(fx.reg.position_of(9), Some(7));
    }

    #[test]
    fn test_lookup_on_empty_registry() {
        let reg = ConnectionRegistry::new(CAPACITY);
        assert!(reg.lookup_by_id(0).is_none());
        assert!(reg.lookup_by_position(0).is_none());
        assert_eq!(reg.max_bytes(), 0);
    }

    #[test]
    fn test_listener_events() {
        let mut fx = Fixture::new();
        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        assert_eq!(listener.take(), vec!["changed:0"]);

        fx.add(&[1000; CAPACITY]);
        assert_eq!(listener.take(), vec!["added:0:8"]);

        fx.add(&[1000, 1000]);
        assert_eq!(listener.take(), vec!["removed:0:2", "added:6:2"]);

        fx.reg.reset();
        assert_eq!(listener.take(), vec!["changed:0"]);
    }

    #[test]
    fn test_subscribe_replays_current_size() {
        let mut fx = Fixture::new();
        fx.add(&[1, 2, 3]);

        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        assert_eq!(listener.take(), vec!["changed:3"]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut fx = Fixture::new();
        let listener = Arc::new(RecordingListener::default());
        let handle = fx.reg.subscribe(listener.clone());
        listener.take();

        assert!(fx.reg.unsubscribe(handle));
        assert!(!fx.reg.unsubscribe(handle));

        fx.add(&[1]);
        assert!(listener.take().is_empty());
    }

    #[test]
    fn test_updates() {
        let mut fx = Fixture::new();
        fx.add(&[1000, 1000, 1000]);
        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        listener.take();

        let updates = vec![
            ConnectionUpdate::stats(
                2,
                StatsUpdate {
                    sent_bytes: 10,
                    rcvd_bytes: 20,
                    ..Default::default()
                },
            ),
            ConnectionUpdate::stats(0, StatsUpdate::default()),
        ];
        fx.reg.apply_updates(&updates);

        assert_eq!(listener.take(), vec!["updated:[2, 0]"]);
        let app = fx.reg.app_stats(1000).unwrap();
        assert_eq!(app.sent_bytes, 10);
        assert_eq!(app.rcvd_bytes, 20);
        assert_eq!(fx.reg.max_bytes(), 30);
    }

    #[test]
    fn test_repeated_updates_report_position_once() {
        let mut fx = Fixture::new();
        fx.add(&[1000, 1000]);
        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        listener.take();

        let bump = StatsUpdate {
            sent_bytes: 5,
            ..Default::default()
        };
        let bigger = StatsUpdate {
            sent_bytes: 8,
            ..Default::default()
        };
        fx.reg.apply_updates(&[
            ConnectionUpdate::stats(1, bump),
            ConnectionUpdate::stats(0, StatsUpdate::default()),
            ConnectionUpdate::stats(1, bigger),
        ]);

        assert_eq!(listener.take(), vec!["updated:[1, 0]"]);
        assert_eq!(fx.reg.app_stats(1000).unwrap().sent_bytes, 8);
        assert_eq!(fx.reg.metrics().registry.updates_applied.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_updates_outside_window_are_ignored() {
        let mut fx = Fixture::new();
        fx.add(&[1000; CAPACITY]);
        fx.add(&[1000, 1000]);
        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        listener.take();

        let before = fx.reg.app_stats_snapshot();
        let stale = StatsUpdate {
            sent_bytes: 999,
            ..Default::default()
        };
        fx.reg.apply_updates(&[
            ConnectionUpdate::stats(0, stale.clone()),
            ConnectionUpdate::stats(1, stale.clone()),
            ConnectionUpdate::stats(100, stale),
        ]);

        assert!(listener.take().is_empty());
        assert_eq!(fx.reg.app_stats_snapshot(), before);
        assert_eq!(fx.reg.metrics().registry.updates_ignored.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_app_stats_follow_evictions() {
        let mut fx = Fixture::new();
        let first: Vec<Connection> = (0..CAPACITY)
            .map(|i| {
                let uid = if i < 2 { 1 } else { 2 };
                fx.conn(uid, 100, 50)
            })
            .collect();
        fx.reg.insert(first);

        assert_eq!(fx.reg.app_stats(1).unwrap().num_connections, 2);
        assert_eq!(fx.reg.app_stats(1).unwrap().bytes(), 300);

        let more = vec![fx.conn(3, 1, 1), fx.conn(3, 1, 1)];
        fx.reg.insert(more);

        assert!(fx.reg.app_stats(1).is_none());
        assert_eq!(fx.reg.app_stats(2).unwrap().num_connections, 6);
        assert_eq!(fx.reg.app_stats(3).unwrap().num_connections, 2);
        assert!(fx.reg.seen_uids().contains(&1));
        assert_aggregates_consistent(&fx.reg);
    }

    #[test]
    fn test_oversized_batch() {
        let mut fx = Fixture::new();
        fx.add(&[1, 1]);
        let listener = Arc::new(RecordingListener::default());
        fx.reg.subscribe(listener.clone());
        listener.take();

        fx.add(&[2; CAPACITY + 3]);

        assert_eq!(listener.take(), vec!["removed:0:2", "added:0:8"]);
        assert_eq!(fx.reg.live_count(), CAPACITY);
        assert_eq!(fx.reg.untracked_count(), 5);
        assert_eq!(fx.reg.lookup_by_position(0).unwrap().incr_id(), 5);
        assert!(fx.reg.app_stats(1).is_none());
        assert_aggregates_consistent(&fx.reg);
    }

    #[test]
    fn test_oldest_id_increases_monotonically() {
        let mut fx = Fixture::new();
        let mut last_oldest = None;
        for round in 0..10 {
            fx.add(&vec![round; 3]);
            assert!(fx.reg.live_count() <= CAPACITY);
            let oldest = fx.reg.lookup_by_position(0).unwrap().incr_id();
            if let Some(prev) = last_oldest {
                assert!(oldest >= prev);
            }
            last_oldest = Some(oldest);
            assert_aggregates_consistent(&fx.reg);
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut fx = Fixture::new();
        fx.add(&[1000; CAPACITY]);
        fx.add(&[1000]);
        fx.reg.reset();

        assert_eq!(fx.reg.live_count(), 0);
        assert_eq!(fx.reg.untracked_count(), 0);
        assert!(fx.reg.app_stats_snapshot().is_empty());
        assert!(fx.reg.seen_uids().is_empty());
        assert!(fx.reg.connections().is_empty());
    }

    #[test]
    fn test_listener_can_query_registry() {
        struct Querying {
            reg: std::sync::Weak<ConnectionRegistry>,
            seen: Mutex<Vec<u64>>,
        }

        impl ConnectionsListener for Querying {
            fn connections_added(&self, _start: usize, added: &[Arc<Connection>]) {
                let reg = self.reg.upgrade().unwrap();
                for conn in added {
                    let found = reg.lookup_by_id(conn.incr_id()).unwrap();
                    self.seen.lock().push(found.incr_id());
                }
            }
        }

        let reg = Arc::new(ConnectionRegistry::new(CAPACITY));
        let listener = Arc::new(Querying {
            reg: Arc::downgrade(&reg),
            seen: Mutex::new(Vec::new()),
        });
        reg.subscribe(listener.clone());
        reg.insert(vec![
            Connection::new(info(0, 1, 40000)),
            Connection::new(info(1, 1, 40001)),
        ]);

        assert_eq!(*listener.seen.lock(), vec![0, 1]);
    }

    #[test]
    fn test_find_by_local_port() {
        let mut fx = Fixture::new();
        fx.add(&[1, 2, 3]);

        assert_eq!(fx.reg.find_by_local_port(40001).unwrap().incr_id(), 1);
        assert!(fx.reg.find_by_local_port(39999).is_none());

        // Evicted connections are no longer found
        fx.add(&[4; CAPACITY]);
        assert!(fx.reg.find_by_local_port(40001).is_none());
        assert_eq!(fx.reg.find_by_local_port(40010).unwrap().incr_id(), 10);
    }

    #[test]
    fn test_find_by_local_port_prefers_newest() {
        let reg = ConnectionRegistry::new(CAPACITY);
        reg.insert(vec![
            Connection::new(info(0, 1, 40000)),
            Connection::new(info(1, 1, 40500)),
            Connection::new(info(2, 1, 40000)),
        ]);

        assert_eq!(reg.find_by_local_port(40000).unwrap().incr_id(), 2);
    }

    #[test]
    fn test_subscribe_during_inserts_tracks_live_count() {
        #[derive(Default)]
        struct Counting {
            count: Mutex<i64>,
        }

        impl ConnectionsListener for Counting {
            fn connections_changed(&self, count: usize) {
                *self.count.lock() = count as i64;
            }

            fn connections_removed(&self, _start: usize, removed: &[Arc<Connection>]) {
                *self.count.lock() -= removed.len() as i64;
            }

            fn connections_added(&self, _start: usize, added: &[Arc<Connection>]) {
                *self.count.lock() += added.len() as i64;
            }
        }

        for _ in 0..20 {
            let reg = Arc::new(ConnectionRegistry::new(CAPACITY));
            let writer = {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for id in 0..64u64 {
                        reg.insert(vec![Connection::new(info(id, 1, 40000 + id as u16))]);
                    }
                })
            };

            let listener = Arc::new(Counting::default());
            reg.subscribe(listener.clone());
            writer.join().unwrap();

            assert_eq!(*listener.count.lock(), reg.live_count() as i64);
        }
    }
}
