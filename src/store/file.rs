//! File-backed store.
//!
//! One JSON document per game at `<root>/<game_id>.json`. Writes go to a
//! temporary sibling and are renamed into place so a crash never leaves a
//! half-written record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{GameStore, StoreError};
use crate::core::id::{GameId, UserId};
use crate::game::state::Game;

/// Directory-backed [`GameStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Fails if the directory cannot be created or written, so an
    /// unusable store is caught at startup rather than at first eviction.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let marker = root.join(".write-check");
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;

        debug!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &GameId) -> Result<PathBuf, StoreError> {
        if !id.is_path_safe() {
            return Err(StoreError::InvalidId(id.clone()));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    async fn read(&self, id: &GameId) -> Result<Option<Game>, StoreError> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &GameId, game: &Game) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let tmp = self.root.join(format!(".{}.json.tmp", id));
        let bytes = serde_json::to_vec_pretty(game)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl GameStore for FileStore {
    async fn find_by_id(&self, id: &GameId, owner: &UserId) -> Result<Option<Game>, StoreError> {
        // Ids from the wire that could never have been stored are simply absent.
        if !id.is_path_safe() {
            return Ok(None);
        }
        Ok(self.read(id).await?.filter(|g| g.is_owned_by(owner)))
    }

    async fn create(&self, game: Game) -> Result<Game, StoreError> {
        if fs::try_exists(self.path_for(&game.id)?).await? {
            return Err(StoreError::AlreadyExists(game.id));
        }
        self.write(&game.id, &game).await?;
        Ok(game)
    }

    async fn upsert(&self, id: &GameId, game: &Game) -> Result<(), StoreError> {
        self.write(id, game).await
    }
}
