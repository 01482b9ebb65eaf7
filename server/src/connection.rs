//! Viewer connections and their session tasks.
//!
//! A [`Connection`] is the hub-side record of one WebSocket client: its
//! identity, the rooms it has joined and the sending end of its bounded
//! outbound queue. A [`Session`] drives the transport for that connection
//! with two cooperating pumps:
//!
//! - the **reader** parses inbound text frames into [`ClientAction`]s and
//!   hands them to an [`ActionHandler`];
//! - the **writer** drains the outbound queue into the socket in FIFO order
//!   and optionally emits keepalive pings.
//!
//! Whichever pump stops first tears the connection down through
//! [`HubHandle::close`]; the other one observes the shutdown signal and
//! exits. Teardown happens exactly once per connection.
//!
//! The pumps are generic over the transport so they can be exercised with
//! in-memory sinks and streams.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::hub::{HubHandle, Registration};
use crate::protocol::{parse_client_frame, ClientAction};
use crate::types::{ContestId, Frame, UserId};

/// Largest inbound text frame accepted, in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// How long the writer waits for the close frame to be flushed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Unique identifier of a live connection.
pub type ConnectionId = Uuid;

/// Hub-side record of a viewer connection.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    rooms: Mutex<HashSet<ContestId>>,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(user_id: UserId, outbound_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, receiver) = mpsc::channel(outbound_capacity.max(1));
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            rooms: Mutex::new(HashSet::new()),
            outbound,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Returns `true` once teardown has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the rooms this connection belongs to, sorted.
    pub fn rooms(&self) -> Vec<ContestId> {
        let mut rooms: Vec<ContestId> = self.lock_rooms().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Resolves once teardown has started.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Marks the connection closed and wakes both pumps.
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub(crate) fn begin_teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    pub(crate) fn try_enqueue(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.outbound.try_send(frame)
    }

    pub(crate) fn join_room(&self, contest_id: &ContestId) -> bool {
        self.lock_rooms().insert(contest_id.clone())
    }

    pub(crate) fn leave_room(&self, contest_id: &ContestId) -> bool {
        self.lock_rooms().remove(contest_id)
    }

    pub(crate) fn take_rooms(&self) -> HashSet<ContestId> {
        std::mem::take(&mut *self.lock_rooms())
    }

    fn lock_rooms(&self) -> MutexGuard<'_, HashSet<ContestId>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Per-session transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest inbound message, in bytes.
    ///
    /// The WebSocket transport rejects anything bigger while reading it,
    /// which ends the session; over other transports the reader discards it.
    pub max_frame_bytes: usize,

    /// Interval between keepalive pings. `None` disables them.
    pub keepalive: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            keepalive: None,
        }
    }
}

/// Receives the actions parsed from a connection's inbound frames.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, connection: &Arc<Connection>, action: ClientAction);
}

/// Drives one registered connection over a message transport.
pub struct Session {
    hub: HubHandle,
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<Frame>,
    handler: Arc<dyn ActionHandler>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        hub: HubHandle,
        registration: Registration,
        handler: Arc<dyn ActionHandler>,
        config: SessionConfig,
    ) -> Self {
        Self {
            hub,
            connection: registration.connection,
            outbound: registration.outbound,
            handler,
            config,
        }
    }

    /// Runs the reader inline and the writer on its own task until both stop.
    pub async fn run<Si, St, E>(self, sink: Si, stream: St)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: fmt::Display + Send,
    {
        let Self {
            hub,
            connection,
            outbound,
            handler,
            config,
        } = self;

        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            "Session started"
        );

        let writer = tokio::spawn(write_pump(
            hub.clone(),
            Arc::clone(&connection),
            outbound,
            sink,
            config.keepalive,
        ));

        read_pump(
            &hub,
            &connection,
            stream,
            handler.as_ref(),
            config.max_frame_bytes,
        )
        .await;

        if let Err(err) = writer.await {
            warn!(connection_id = %connection.id(), error = %err, "Writer task failed");
        }

        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            "Session ended"
        );
    }
}

async fn read_pump<St, E>(
    hub: &HubHandle,
    connection: &Arc<Connection>,
    mut stream: St,
    handler: &dyn ActionHandler,
    max_frame_bytes: usize,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let message = tokio::select! {
            () = connection.closed() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_bytes {
                    debug!(
                        connection_id = %connection.id(),
                        len = text.len(),
                        max = max_frame_bytes,
                        "Discarding oversized frame"
                    );
                    continue;
                }
                if let Some(action) = parse_client_frame(text.as_str()) {
                    handler.handle(connection, action).await;
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!(connection_id = %connection.id(), "Peer closed connection");
                break;
            }
            Some(Ok(_)) => {
                trace!(connection_id = %connection.id(), "Ignoring non-text frame");
            }
            Some(Err(err)) => {
                debug!(connection_id = %connection.id(), error = %err, "Read failed");
                break;
            }
            None => break,
        }
    }

    hub.close(connection).await;
}

async fn write_pump<Si>(
    hub: HubHandle,
    connection: Arc<Connection>,
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: Si,
    keepalive: Option<Duration>,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    let mut keepalive = keepalive.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let message = tokio::select! {
            biased;
            () = connection.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            () = next_keepalive(&mut keepalive) => Message::Ping(Bytes::new()),
        };

        let result = tokio::select! {
            () = connection.closed() => break,
            result = sink.send(message) => result,
        };
        if let Err(err) = result {
            debug!(connection_id = %connection.id(), error = %err, "Write failed");
            break;
        }
    }

    outbound.close();
    hub.close(&connection).await;

    // The peer may already be gone or stalled.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
}

async fn next_keepalive(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
