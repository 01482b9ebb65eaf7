//! Room registry and dispatch coordinator.
//!
//! The hub fans realtime contest events out to every viewer currently
//! subscribed to the contest's room, and routes user-targeted notifications
//! to that user's connections inside a room.
//!
//! # Architecture
//!
//! A single coordinator task exclusively owns the room index. Everything
//! that touches the index arrives as a message on one of two bounded queues:
//!
//! - **control**: register, unregister, subscribe, unsubscribe and
//!   introspection queries. Senders wait for capacity; these are never
//!   dropped.
//! - **dispatch**: outbound [`Envelope`]s. Submission is a non-blocking
//!   `try_send`; when the queue is saturated the envelope is dropped and
//!   logged.
//!
//! The coordinator applies one message at a time, preferring control over
//! dispatch, so a dispatch never observes a half-applied membership change.
//! The preference is bounded: after [`CONTROL_BURST`] consecutive control
//! commands a waiting envelope is dispatched before control resumes, so a
//! flood of connects and disconnects cannot starve delivery.
//!
//! Delivery to a connection is a non-blocking attempt on its bounded
//! outbound queue. A full queue evicts the connection (slow-consumer
//! eviction) instead of stalling the coordinator.
//!
//! # Example
//!
//! ```rust
//! use toppet_server::hub::{HubConfig, HubHandle};
//! use toppet_server::types::{ContestId, ContestStatus, HubEvent, UserId};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let hub = HubHandle::spawn(HubConfig::default());
//! let registration = hub.register(UserId(1)).await;
//! let contest = ContestId::new("contest-1");
//! hub.subscribe(registration.connection.id(), contest.clone()).await;
//!
//! hub.broadcast_to_room(
//!     &contest,
//!     &HubEvent::ContestStatusUpdated {
//!         contest_id: contest.clone(),
//!         status: ContestStatus::Voting,
//!     },
//! );
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, ConnectionId};
use crate::types::{ContestId, Envelope, Frame, HubEvent, UserId};

/// Default capacity of the coordinator's dispatch queue.
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;

/// Default capacity of the coordinator's control queue.
pub const DEFAULT_CONTROL_CAPACITY: usize = 1024;

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

/// Control commands applied back to back before a waiting envelope gets a turn.
pub const CONTROL_BURST: usize = 64;

/// Queue sizing for the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Envelopes waiting for the coordinator before new ones are dropped.
    pub dispatch_capacity: usize,

    /// Membership and query commands waiting for the coordinator.
    pub control_capacity: usize,

    /// Frames a single connection may have queued before it is evicted.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Point-in-time counters reported by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered live connections.
    pub connections: usize,

    /// Rooms with at least one member.
    pub rooms: usize,
}

/// A freshly admitted connection and the receiving end of its outbound queue.
///
/// The receiver belongs to the connection's writer task.
pub struct Registration {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<Frame>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

enum Control {
    Register(Arc<Connection>),
    Unregister(ConnectionId),
    Subscribe {
        connection_id: ConnectionId,
        contest_id: ContestId,
    },
    Unsubscribe {
        connection_id: ConnectionId,
        contest_id: ContestId,
    },
    Stats(oneshot::Sender<HubStats>),
    Members {
        contest_id: ContestId,
        reply: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },
}

/// Cloneable handle to the hub coordinator.
///
/// This is the only surface domain services and connection sessions use.
/// Dispatch methods ([`broadcast_to_room`](Self::broadcast_to_room),
/// [`send_to_user`](Self::send_to_user)) never block and never report
/// per-recipient outcomes.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<Control>,
    dispatch: mpsc::Sender<Envelope>,
    outbound_capacity: usize,
}

impl fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubHandle")
            .field("dispatch_capacity", &self.dispatch.max_capacity())
            .field("control_capacity", &self.control.max_capacity())
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

impl HubHandle {
    /// Starts the coordinator task and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime. The coordinator runs
    /// until every handle has been dropped.
    #[must_use]
    pub fn spawn(config: HubConfig) -> Self {
        let (control, control_rx) = mpsc::channel(config.control_capacity.max(1));
        let (dispatch, dispatch_rx) = mpsc::channel(config.dispatch_capacity.max(1));

        tokio::spawn(Coordinator::new(control_rx, dispatch_rx).run());
        debug!(
            dispatch_capacity = config.dispatch_capacity,
            control_capacity = config.control_capacity,
            outbound_capacity = config.outbound_capacity,
            "Hub coordinator started"
        );

        Self {
            control,
            dispatch,
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }

    /// Admits a new connection for `user_id` with no room memberships.
    pub async fn register(&self, user_id: UserId) -> Registration {
        let (connection, outbound) = Connection::new(user_id, self.outbound_capacity);
        self.send_control(Control::Register(Arc::clone(&connection)))
            .await;
        Registration {
            connection,
            outbound,
        }
    }

    /// Adds a connection to a contest room. A repeated subscribe is a no-op.
    pub async fn subscribe(&self, connection_id: ConnectionId, contest_id: ContestId) {
        self.send_control(Control::Subscribe {
            connection_id,
            contest_id,
        })
        .await;
    }

    /// Removes a connection from a contest room.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, contest_id: ContestId) {
        self.send_control(Control::Unsubscribe {
            connection_id,
            contest_id,
        })
        .await;
    }

    /// Tears a connection down.
    ///
    /// Idempotent: only the first call (from any session task or external
    /// caller) stops the connection's pumps and unregisters it.
    pub async fn close(&self, connection: &Connection) {
        if !connection.begin_teardown() {
            return;
        }
        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            "Closing connection"
        );
        self.send_control(Control::Unregister(connection.id())).await;
    }

    /// Delivers `event` to every connection currently subscribed to `contest_id`.
    ///
    /// A room without members is a silent no-op.
    pub fn broadcast_to_room(&self, contest_id: &ContestId, event: &HubEvent) {
        self.submit(contest_id, None, event);
    }

    /// Delivers `event` to the connections of `user_id` inside `contest_id`.
    pub fn send_to_user(&self, contest_id: &ContestId, user_id: UserId, event: &HubEvent) {
        self.submit(contest_id, Some(user_id), event);
    }

    /// Broadcasts `event` to the room named by its own `contest_id`.
    pub fn publish(&self, event: &HubEvent) {
        self.broadcast_to_room(event.contest_id(), event);
    }

    /// Returns live connection and room counts.
    ///
    /// Reports zeros once the coordinator has stopped.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if !self.send_control(Control::Stats(reply)).await {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Returns the members of a room, or `None` if the room is not indexed.
    pub async fn room_members(&self, contest_id: &ContestId) -> Option<Vec<ConnectionId>> {
        let (reply, rx) = oneshot::channel();
        let command = Control::Members {
            contest_id: contest_id.clone(),
            reply,
        };
        if !self.send_control(command).await {
            return None;
        }
        rx.await.ok().flatten()
    }

    fn submit(&self, contest_id: &ContestId, target_user: Option<UserId>, event: &HubEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, kind = event.kind(), "Failed to encode hub event");
                return;
            }
        };

        let envelope = Envelope {
            contest_id: contest_id.clone(),
            target_user,
            kind: event.kind(),
            frame,
        };

        match self.dispatch.try_send(envelope) {
            Ok(()) => {
                trace!(contest_id = %contest_id, kind = event.kind(), "Envelope queued");
            }
            Err(TrySendError::Full(envelope)) => {
                warn!(
                    contest_id = %envelope.contest_id,
                    kind = envelope.kind,
                    "Dispatch queue full, dropping envelope"
                );
            }
            Err(TrySendError::Closed(envelope)) => {
                warn!(
                    contest_id = %envelope.contest_id,
                    kind = envelope.kind,
                    "Hub coordinator stopped, dropping envelope"
                );
            }
        }
    }

    async fn send_control(&self, command: Control) -> bool {
        if self.control.send(command).await.is_err() {
            debug!("Hub coordinator stopped, control command discarded");
            return false;
        }
        true
    }
}

struct Coordinator {
    control: mpsc::Receiver<Control>,
    dispatch: mpsc::Receiver<Envelope>,
    index: RoomIndex,
}

impl Coordinator {
    fn new(control: mpsc::Receiver<Control>, dispatch: mpsc::Receiver<Envelope>) -> Self {
        Self {
            control,
            dispatch,
            index: RoomIndex::default(),
        }
    }

    async fn run(mut self) {
        let mut streak = 0;
        loop {
            if streak >= CONTROL_BURST {
                streak = 0;
                if let Ok(envelope) = self.dispatch.try_recv() {
                    self.index.dispatch(&envelope);
                    continue;
                }
            }
            tokio::select! {
                biased;
                Some(command) = self.control.recv() => {
                    streak += 1;
                    self.apply(command);
                }
                Some(envelope) = self.dispatch.recv() => {
                    streak = 0;
                    self.index.dispatch(&envelope);
                }
                else => break,
            }
        }
        debug!("Hub coordinator stopped");
    }

    fn apply(&mut self, command: Control) {
        match command {
            Control::Register(connection) => self.index.register(connection),
            Control::Unregister(connection_id) => self.index.unregister(connection_id),
            Control::Subscribe {
                connection_id,
                contest_id,
            } => self.index.subscribe(connection_id, contest_id),
            Control::Unsubscribe {
                connection_id,
                contest_id,
            } => self.index.unsubscribe(connection_id, &contest_id),
            Control::Stats(reply) => {
                let _ = reply.send(self.index.stats());
            }
            Control::Members { contest_id, reply } => {
                let _ = reply.send(self.index.members(&contest_id));
            }
        }
    }
}

/// The room → members index. Owned by the coordinator task only.
#[derive(Default)]
struct RoomIndex {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    rooms: HashMap<ContestId, HashMap<ConnectionId, Arc<Connection>>>,
}

impl RoomIndex {
    fn register(&mut self, connection: Arc<Connection>) {
        if connection.is_closed() {
            debug!(connection_id = %connection.id(), "Ignoring registration of closed connection");
            return;
        }
        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            connections = self.connections.len() + 1,
            "Connection registered"
        );
        self.connections.insert(connection.id(), connection);
    }

    fn unregister(&mut self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            trace!(connection_id = %connection_id, "Connection already unregistered");
            return;
        };

        let rooms = connection.take_rooms();
        for contest_id in &rooms {
            self.remove_member(contest_id, connection_id);
        }
        info!(
            connection_id = %connection_id,
            user_id = %connection.user_id(),
            rooms_left = rooms.len(),
            connections = self.connections.len(),
            "Connection unregistered"
        );
    }

    fn subscribe(&mut self, connection_id: ConnectionId, contest_id: ContestId) {
        let Some(connection) = self.connections.get(&connection_id) else {
            debug!(connection_id = %connection_id, contest_id = %contest_id, "Subscribe for unknown connection");
            return;
        };
        if connection.is_closed() {
            return;
        }
        if !connection.join_room(&contest_id) {
            debug!(
                connection_id = %connection_id,
                contest_id = %contest_id,
                "Connection already subscribed"
            );
            return;
        }

        let members = self.rooms.entry(contest_id.clone()).or_default();
        members.insert(connection_id, Arc::clone(connection));
        info!(
            connection_id = %connection_id,
            user_id = %connection.user_id(),
            contest_id = %contest_id,
            members = members.len(),
            "Connection subscribed"
        );
    }

    fn unsubscribe(&mut self, connection_id: ConnectionId, contest_id: &ContestId) {
        let Some(connection) = self.connections.get(&connection_id) else {
            return;
        };
        if !connection.leave_room(contest_id) {
            debug!(
                connection_id = %connection_id,
                contest_id = %contest_id,
                "Unsubscribe for a room the connection is not in"
            );
            return;
        }
        self.remove_member(contest_id, connection_id);
        info!(connection_id = %connection_id, contest_id = %contest_id, "Connection unsubscribed");
    }

    fn remove_member(&mut self, contest_id: &ContestId, connection_id: ConnectionId) {
        let Some(members) = self.rooms.get_mut(contest_id) else {
            return;
        };
        members.remove(&connection_id);
        if members.is_empty() {
            self.rooms.remove(contest_id);
            debug!(contest_id = %contest_id, "Room empty, removed from index");
        }
    }

    /// Enqueues the envelope on every matching member and returns the number
    /// of connections it was queued for.
    fn dispatch(&mut self, envelope: &Envelope) -> usize {
        let Some(members) = self.rooms.get(&envelope.contest_id) else {
            trace!(contest_id = %envelope.contest_id, kind = envelope.kind, "No subscribers for room");
            return 0;
        };

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (connection_id, connection) in members {
            if let Some(target) = envelope.target_user {
                if connection.user_id() != target {
                    continue;
                }
            }
            match connection.try_enqueue(envelope.frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => evicted.push(Arc::clone(connection)),
                Err(TrySendError::Closed(_)) => {
                    trace!(connection_id = %connection_id, "Outbound queue closed, skipping");
                }
            }
        }

        for connection in evicted {
            if connection.begin_teardown() {
                warn!(
                    connection_id = %connection.id(),
                    user_id = %connection.user_id(),
                    contest_id = %envelope.contest_id,
                    "Outbound queue full, evicting slow consumer"
                );
                self.unregister(connection.id());
            }
        }

        trace!(
            contest_id = %envelope.contest_id,
            kind = envelope.kind,
            delivered,
            "Envelope dispatched"
        );
        delivered
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
        }
    }

    fn members(&self, contest_id: &ContestId) -> Option<Vec<ConnectionId>> {
        self.rooms.get(contest_id).map(|members| {
            let mut ids: Vec<ConnectionId> = members.keys().copied().collect();
            ids.sort();
            ids
        })
    }
}
