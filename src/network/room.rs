//! Room Broadcaster
//!
//! Routing table from game id to the connections watching it. Holds only
//! sender halves; connections are owned by the gateway. Rebuilt from
//! nothing on restart, so clients must re-join after reconnecting.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::id::{GameId, UserId};
use crate::network::protocol::{ServerMessage, REASON_SHUTDOWN};

/// Per-connection outbound queue depth.
pub const OUTBOUND_BUFFER: usize = 64;

/// WebSocket "going away" close code.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Connection identifier, unique per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work item for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send a protocol message.
    Message(ServerMessage),
    /// Send a close frame and stop writing.
    Close(u16, &'static str),
}

/// Sending side of one authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection id.
    pub id: ConnectionId,
    /// User bound at handshake.
    pub user_id: UserId,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Wrap the sender for a connection's writer task.
    pub fn new(id: ConnectionId, user_id: UserId, sender: mpsc::Sender<Outbound>) -> Self {
        Self { id, user_id, sender }
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queue a message without waiting. Returns false if it was not queued.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        self.try_push(Outbound::Message(message))
    }

    /// Queue a message, waiting for buffer space.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(Outbound::Message(message)).await.is_ok()
    }

    /// Queue a close frame.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        self.try_push(Outbound::Close(code, reason))
    }

    fn try_push(&self, item: Outbound) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "outbound queue full, dropping message");
                false
            }
        }
    }
}

#[derive(Default)]
struct Rooms {
    by_game: BTreeMap<GameId, BTreeMap<ConnectionId, ConnectionHandle>>,
    by_conn: BTreeMap<ConnectionId, BTreeSet<GameId>>,
}

/// Game id to watching connections.
#[derive(Default)]
pub struct RoomBroadcaster {
    rooms: RwLock<Rooms>,
}

impl RoomBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the room for `game_id`. Joining twice is a no-op.
    pub async fn join(&self, game_id: &GameId, conn: ConnectionHandle) {
        let mut rooms = self.rooms.write().await;
        rooms
            .by_conn
            .entry(conn.id)
            .or_default()
            .insert(game_id.clone());
        rooms
            .by_game
            .entry(game_id.clone())
            .or_default()
            .insert(conn.id, conn);
    }

    /// Remove `conn` from every room, deleting rooms left empty.
    pub async fn leave(&self, conn: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let Some(games) = rooms.by_conn.remove(&conn) else {
            return;
        };
        for game_id in games {
            let now_empty = match rooms.by_game.get_mut(&game_id) {
                Some(members) => {
                    members.remove(&conn);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                rooms.by_game.remove(&game_id);
                debug!(game_id = %game_id, "room closed");
            }
        }
    }

    /// Send `message` to every open connection in the room.
    ///
    /// Closed connections are skipped silently. Returns how many
    /// connections the message was queued for.
    pub async fn broadcast(&self, game_id: &GameId, message: &ServerMessage) -> usize {
        let members: Vec<ConnectionHandle> = {
            let rooms = self.rooms.read().await;
            match rooms.by_game.get(game_id) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };

        members
            .iter()
            .filter(|conn| !conn.is_closed())
            .filter(|conn| conn.try_send(message.clone()))
            .count()
    }

    /// Ask every member connection to close with "going away".
    pub async fn close_all(&self) -> usize {
        let members: Vec<ConnectionHandle> = {
            let rooms = self.rooms.read().await;
            rooms
                .by_game
                .values()
                .flat_map(|m| m.values().cloned())
                .collect()
        };

        let mut seen = BTreeSet::new();
        members
            .iter()
            .filter(|conn| seen.insert(conn.id))
            .filter(|conn| conn.close(CLOSE_GOING_AWAY, REASON_SHUTDOWN))
            .count()
    }

    /// Number of connections in the room for `game_id`.
    pub async fn room_size(&self, game_id: &GameId) -> usize {
        self.rooms
            .read()
            .await
            .by_game
            .get(game_id)
            .map_or(0, |m| m.len())
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.by_game.len()
    }
}
