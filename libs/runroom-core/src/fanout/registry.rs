use runroom_common::types::Envelope;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// How many recent sequence numbers are remembered per origin
const DEDUP_WINDOW: usize = 4096;

/// Origins silent for this long are forgotten
const ORIGIN_IDLE: Duration = Duration::from_secs(10 * 60);

struct Connection {
    tx: mpsc::Sender<Arc<Envelope>>,
    rooms: HashSet<String>,
}

/// Recently delivered sequence numbers from one origin
struct SeenWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    last_seen: Instant,
}

impl Default for SeenWindow {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            last_seen: Instant::now(),
        }
    }
}

impl SeenWindow {
    /// `false` if `seq` was already recorded
    fn record(&mut self, seq: u64) -> bool {
        self.last_seen = Instant::now();
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    seen: HashMap<String, SeenWindow>,
}

impl Inner {
    fn record_seen(&mut self, origin: &str, seq: u64, origin_idle: Duration) -> bool {
        if let Some(window) = self.seen.get_mut(origin) {
            return window.record(seq);
        }

        // A new origin is the only way the map grows, so sweep here
        let before = self.seen.len();
        self.seen.retain(|_, window| window.last_seen.elapsed() < origin_idle);
        let evicted = before - self.seen.len();
        if evicted > 0 {
            debug!(evicted, "Forgot idle origins");
        }

        let mut window = SeenWindow::default();
        window.record(seq);
        self.seen.insert(origin.to_string(), window);
        true
    }

    fn leave(&mut self, id: &ConnectionId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    fn drop_connection(&mut self, id: &ConnectionId) -> Vec<String> {
        let Some(connection) = self.connections.remove(id) else {
            return Vec::new();
        };
        let rooms: Vec<String> = connection.rooms.into_iter().collect();
        for room in &rooms {
            self.leave(id, room);
        }
        rooms
    }
}

/// Live connections on this instance and the rooms each has joined.
///
/// Owned by the router; one per instance. Membership only changes through
/// `join`, `leave` and `leave_all`, plus removal of connections whose
/// receiving side has gone away.
pub struct RoomRegistry {
    inner: Mutex<Inner>,
    origin_idle: Duration,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::with_origin_idle(ORIGIN_IDLE)
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that forgets an origin's seen-window after `origin_idle` of silence
    pub fn with_origin_idle(origin_idle: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            origin_idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a connection; envelopes for its rooms arrive on the returned receiver
    pub fn register(&self, buffer: usize) -> (ConnectionId, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = Uuid::new_v4();
        self.lock().connections.insert(
            id,
            Connection {
                tx,
                rooms: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Returns `false` for unknown connections
    pub fn join(&self, id: &ConnectionId, room: &str) -> bool {
        let mut inner = self.lock();
        let Some(connection) = inner.connections.get_mut(id) else {
            return false;
        };
        connection.rooms.insert(room.to_string());
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(*id);
        true
    }

    pub fn leave(&self, id: &ConnectionId, room: &str) {
        let mut inner = self.lock();
        if let Some(connection) = inner.connections.get_mut(id) {
            connection.rooms.remove(room);
        }
        inner.leave(id, room);
    }

    /// Forget the connection entirely; returns the rooms it was in
    pub fn leave_all(&self, id: &ConnectionId) -> Vec<String> {
        self.lock().drop_connection(id)
    }

    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<String> {
        let inner = self.lock();
        let mut rooms: Vec<String> = inner
            .connections
            .get(id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.lock().rooms.get(room).map_or(0, |m| m.len())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Origins whose seen-window is currently kept
    pub fn tracked_origins(&self) -> usize {
        self.lock().seen.len()
    }

    /// Hand `envelope` to every local member of its room.
    ///
    /// Redelivered envelopes (same origin and seq) are dropped. A member whose
    /// buffer is full misses this envelope; a member whose receiver is closed
    /// is removed. Returns how many members received it.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        let mut inner = self.lock();

        if !inner.record_seen(&envelope.origin, envelope.seq, self.origin_idle) {
            debug!(origin = %envelope.origin, seq = envelope.seq, "Dropping duplicate envelope");
            return 0;
        }

        let Some(members) = inner.rooms.get(&envelope.room) else {
            return 0;
        };

        let envelope = Arc::new(envelope);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for id in members {
            let Some(connection) = inner.connections.get(id) else {
                continue;
            };
            match connection.tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %id,
                        room = %envelope.room,
                        "Connection buffer full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            debug!(connection_id = %id, "Removing closed connection");
            inner.drop_connection(&id);
        }

        delivered
    }
}
