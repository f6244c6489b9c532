//! Durable Game Storage
//!
//! The session cache hands records to a [`GameStore`] when games are
//! created, evicted or drained at shutdown, and falls back to it on a
//! cache miss.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::id::{GameId, UserId};
use crate::game::state::Game;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A record with this id already exists.
    #[error("game {0} already exists")]
    AlreadyExists(GameId),

    /// Id cannot be used as a storage key.
    #[error("invalid game id: {0}")]
    InvalidId(GameId),

    /// Backend refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable document store for game records.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Look up a game scoped to its owner. Another user's game is `None`.
    async fn find_by_id(&self, id: &GameId, owner: &UserId) -> Result<Option<Game>, StoreError>;

    /// Insert a new record.
    async fn create(&self, game: Game) -> Result<Game, StoreError>;

    /// Insert or replace the full record by id.
    async fn upsert(&self, id: &GameId, game: &Game) -> Result<(), StoreError>;
}
