//! In-process store.
//!
//! Nothing survives a restart. Used by tests and `STORE_DIR=:memory:`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{GameStore, StoreError};
use crate::core::id::{GameId, UserId};
use crate::game::state::Game;

/// Map-backed [`GameStore`].
#[derive(Default)]
pub struct MemoryStore {
    games: RwLock<BTreeMap<GameId, Game>>,
    upserts: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Read a record regardless of owner.
    pub async fn get(&self, id: &GameId) -> Option<Game> {
        self.games.read().await.get(id).cloned()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn find_by_id(&self, id: &GameId, owner: &UserId) -> Result<Option<Game>, StoreError> {
        let games = self.games.read().await;
        Ok(games.get(id).filter(|g| g.is_owned_by(owner)).cloned())
    }

    async fn create(&self, game: Game) -> Result<Game, StoreError> {
        self.check_writable()?;
        let mut games = self.games.write().await;
        if games.contains_key(&game.id) {
            return Err(StoreError::AlreadyExists(game.id));
        }
        games.insert(game.id.clone(), game.clone());
        Ok(game)
    }

    async fn upsert(&self, id: &GameId, game: &Game) -> Result<(), StoreError> {
        self.check_writable()?;
        self.games.write().await.insert(id.clone(), game.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::game::state::Card;

    fn test_game(id: &str, owner: &str) -> Game {
        let deck = vec![Card::hidden(0, "A"), Card::hidden(1, "A")];
        Game::new(GameId::new(id), UserId::new(owner), deck, Utc::now())
    }

    #[tokio::test]
    async fn test_find_is_owner_scoped() {
        let store = MemoryStore::new();
        store.create(test_game("g1", "alice")).await.unwrap();

        let id = GameId::new("g1");
        assert!(store.find_by_id(&id, &UserId::new("alice")).await.unwrap().is_some());
        assert!(store.find_by_id(&id, &UserId::new("bob")).await.unwrap().is_none());
        assert!(store.find_by_id(&GameId::new("nope"), &UserId::new("alice")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryStore::new();
        store.create(test_game("g1", "alice")).await.unwrap();
        let result = store.create(test_game("g1", "alice")).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_counts() {
        let store = MemoryStore::new();
        let mut game = test_game("g1", "alice");
        store.upsert(&game.id, &game).await.unwrap();
        game.score = 1;
        store.upsert(&game.id, &game).await.unwrap();

        assert_eq!(store.upsert_count(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&game.id).await.unwrap().score, 1);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let game = test_game("g1", "alice");
        assert!(matches!(store.upsert(&game.id, &game).await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.upsert_count(), 0);
        assert!(store.is_empty().await);
    }
}
