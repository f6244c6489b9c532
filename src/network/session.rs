//! Game Session Cache
//!
//! Owns the authoritative in-memory copy of every active game. Games enter
//! on creation or on a cache miss that hits durable storage, are mutated
//! only through [`SessionCache::with_game_mut`], and leave through idle
//! eviction (flush, then remove) or the shutdown drain.
//!
//! ## Locking
//!
//! The map lock is only held to look up, insert or remove a slot; it is
//! never held while waiting on a slot. Each slot has its own mutex, held
//! across store I/O for that game only, which serializes all operations
//! on one game without blocking the others. A slot marked `evicted` has
//! already been removed from the map; whoever finds one retries the lookup.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::id::{GameId, UserId};
use crate::core::rng::DeterministicRng;
use crate::game::deck::{deal_deck, DEFAULT_PAIRS};
use crate::game::rules::GameError;
use crate::game::state::Game;
use crate::store::{GameStore, StoreError};

/// Idle time after which a game is evicted and flushed.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

/// Period of the eviction sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Idle time before eviction.
    pub idle_ttl: Duration,
    /// How often expired entries are swept.
    pub sweep_interval: Duration,
    /// Deck size for games created without an explicit size.
    pub default_pairs: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_IDLE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_pairs: DEFAULT_PAIRS,
        }
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Game absent, or owned by someone else.
    #[error("Game not found")]
    NotFound,

    /// Transition rejected.
    #[error(transparent)]
    Game(#[from] GameError),

    /// Durable store failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Cache is draining for shutdown.
    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Outcome of the shutdown drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Games written to storage.
    pub flushed: usize,
    /// Games whose write failed.
    pub failed: usize,
}

/// A committed transition that still holds its game's lock.
pub struct Committed<T> {
    output: T,
    game: Game,
    _guard: OwnedMutexGuard<CacheEntry>,
}

impl<T> Committed<T> {
    /// What the transition returned.
    pub fn output(&self) -> &T {
        &self.output
    }

    /// The game as committed.
    pub fn game(&self) -> &Game {
        &self.game
    }

    /// Release the lock, keeping the output and game.
    pub fn into_parts(self) -> (T, Game) {
        (self.output, self.game)
    }
}

/// One cached game.
#[derive(Debug)]
struct CacheEntry {
    /// `None` only while the slot is being loaded.
    game: Option<Game>,
    /// Evict once this passes without a mutation.
    deadline: Instant,
    /// Removed from the map; holders must look up again.
    evicted: bool,
}

type Slot = Arc<Mutex<CacheEntry>>;

/// Process-wide cache of active games.
pub struct SessionCache {
    config: CacheConfig,
    entries: RwLock<BTreeMap<GameId, Slot>>,
    store: Arc<dyn GameStore>,
    closed: AtomicBool,
}

impl SessionCache {
    /// Create an empty cache over `store`.
    pub fn new(config: CacheConfig, store: Arc<dyn GameStore>) -> Self {
        Self {
            config,
            entries: RwLock::new(BTreeMap::new()),
            store,
            closed: AtomicBool::new(false),
        }
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + self.config.idle_ttl
    }

    /// Whether the shutdown drain has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of cached games.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn slot(&self, id: &GameId) -> Option<Slot> {
        self.entries.read().await.get(id).cloned()
    }

    async fn remove_slot(&self, id: &GameId, slot: &Slot) {
        let mut entries = self.entries.write().await;
        if entries.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            entries.remove(id);
        }
    }

    /// Cached game, if present and owned by `user`. Never touches storage.
    pub async fn get(&self, id: &GameId, user: &UserId) -> Option<Game> {
        let slot = self.slot(id).await?;
        let entry = slot.lock().await;
        if entry.evicted {
            return None;
        }
        entry.game.as_ref().filter(|g| g.is_owned_by(user)).cloned()
    }

    /// Cached game, loading it from storage on a miss.
    ///
    /// Storage failures are logged and reported as a miss.
    pub async fn load_or_fetch(&self, id: &GameId, user: &UserId) -> Option<Game> {
        match self.acquire(id, user).await {
            Ok(guard) => guard.game.clone(),
            Err(_) => None,
        }
    }

    /// Lock the live slot for `id`, loading it on a miss.
    async fn acquire(
        &self,
        id: &GameId,
        user: &UserId,
    ) -> Result<OwnedMutexGuard<CacheEntry>, SessionError> {
        loop {
            let slot = match self.slot(id).await {
                Some(slot) => slot,
                None => {
                    let fresh: Slot = Arc::new(Mutex::new(CacheEntry {
                        game: None,
                        deadline: self.next_deadline(),
                        evicted: false,
                    }));
                    // Not shared yet, so this cannot wait.
                    let guard = fresh.clone().lock_owned().await;
                    {
                        let mut entries = self.entries.write().await;
                        if entries.contains_key(id) {
                            continue;
                        }
                        entries.insert(id.clone(), fresh.clone());
                    }
                    return self.fill(id, user, fresh, guard).await;
                }
            };

            let guard = slot.lock_owned().await;
            if guard.evicted {
                continue;
            }
            return match &guard.game {
                Some(game) if game.is_owned_by(user) => Ok(guard),
                _ => Err(SessionError::NotFound),
            };
        }
    }

    /// Populate a freshly claimed slot from storage.
    async fn fill(
        &self,
        id: &GameId,
        user: &UserId,
        slot: Slot,
        mut guard: OwnedMutexGuard<CacheEntry>,
    ) -> Result<OwnedMutexGuard<CacheEntry>, SessionError> {
        let loaded = self.store.find_by_id(id, user).await;
        match loaded {
            Ok(Some(game)) => {
                info!(game_id = %id, user_id = %user, "game loaded from storage");
                guard.game = Some(game);
                guard.deadline = self.next_deadline();
                Ok(guard)
            }
            Ok(None) => {
                guard.evicted = true;
                self.remove_slot(id, &slot).await;
                Err(SessionError::NotFound)
            }
            Err(e) => {
                warn!(game_id = %id, error = %e, "failed to load game");
                guard.evicted = true;
                self.remove_slot(id, &slot).await;
                Err(SessionError::NotFound)
            }
        }
    }

    /// Replace the cached record and re-arm its deadline.
    pub async fn put(&self, id: GameId, game: Game, user: &UserId) -> Result<(), SessionError> {
        if !game.is_owned_by(user) || game.id != id {
            return Err(SessionError::NotFound);
        }

        let mut game = Some(game);
        loop {
            match self.slot(&id).await {
                Some(slot) => {
                    let mut entry = slot.lock().await;
                    if entry.evicted {
                        continue;
                    }
                    if entry.game.as_ref().is_some_and(|g| !g.is_owned_by(user)) {
                        return Err(SessionError::NotFound);
                    }
                    entry.game = game.take();
                    entry.deadline = self.next_deadline();
                    return Ok(());
                }
                None => {
                    let mut entries = self.entries.write().await;
                    if entries.contains_key(&id) {
                        continue;
                    }
                    entries.insert(id, Arc::new(Mutex::new(CacheEntry {
                        game: game.take(),
                        deadline: self.next_deadline(),
                        evicted: false,
                    })));
                    return Ok(());
                }
            }
        }
    }

    /// Apply a transition to a game atomically.
    ///
    /// `apply` runs on a working copy with the current Unix-millisecond
    /// time; the copy is committed (with `updated_at` bumped and the
    /// deadline re-armed) only if it returns `Ok`.
    pub async fn with_game_mut<T, F>(
        &self,
        id: &GameId,
        user: &UserId,
        apply: F,
    ) -> Result<(T, Game), SessionError>
    where
        F: FnOnce(&mut Game, i64) -> Result<T, GameError>,
    {
        Ok(self.commit(id, user, apply).await?.into_parts())
    }

    /// Like [`SessionCache::with_game_mut`], but keeps the game locked
    /// until the returned [`Committed`] is dropped.
    ///
    /// Work done while holding it, such as publishing the new state, is
    /// ordered before any later transition on the same game.
    pub async fn commit<T, F>(
        &self,
        id: &GameId,
        user: &UserId,
        apply: F,
    ) -> Result<Committed<T>, SessionError>
    where
        F: FnOnce(&mut Game, i64) -> Result<T, GameError>,
    {
        if self.is_closed() {
            return Err(SessionError::ShuttingDown);
        }
        let mut guard = self.acquire(id, user).await?;
        // The drain may have flushed this game while we waited.
        if self.is_closed() {
            return Err(SessionError::ShuttingDown);
        }

        let mut working = guard.game.clone().ok_or(SessionError::NotFound)?;
        let now = Utc::now();
        let output = apply(&mut working, now.timestamp_millis())?;
        working.updated_at = now;

        #[cfg(feature = "debug-tracing")]
        debug!(game_id = %id, game = ?working, "transition committed");

        guard.game = Some(working.clone());
        guard.deadline = self.next_deadline();
        Ok(Committed { output, game: working, _guard: guard })
    }

    /// Deal, persist and cache a new game for `owner`.
    pub async fn create(&self, owner: &UserId, pairs: Option<usize>) -> Result<Game, SessionError> {
        if self.is_closed() {
            return Err(SessionError::ShuttingDown);
        }
        let id = GameId::generate();
        let mut rng = DeterministicRng::for_deal(&id, owner, rand::random());
        let deck = deal_deck(pairs.unwrap_or(self.config.default_pairs), &mut rng)?;

        let game = self.store.create(Game::new(id, owner.clone(), deck, Utc::now())).await?;
        self.put(game.id.clone(), game.clone(), owner).await?;

        info!(game_id = %game.id, user_id = %owner, cards = game.deck.len(), "game created");
        Ok(game)
    }

    /// Write the cached record to storage. No-op if not cached.
    pub async fn flush(&self, id: &GameId) -> Result<(), SessionError> {
        let Some(slot) = self.slot(id).await else {
            return Ok(());
        };
        let entry = slot.lock().await;
        if entry.evicted {
            return Ok(());
        }
        if let Some(game) = &entry.game {
            self.store.upsert(id, game).await?;
            debug!(game_id = %id, "game flushed");
        }
        Ok(())
    }

    /// Flush, then drop the game from the cache.
    ///
    /// If the write fails the game stays cached.
    pub async fn evict_and_flush(&self, id: &GameId) -> Result<(), SessionError> {
        let Some(slot) = self.slot(id).await else {
            return Ok(());
        };
        let mut entry = slot.lock().await;
        if entry.evicted {
            return Ok(());
        }
        if let Some(game) = &entry.game {
            self.store.upsert(id, game).await?;
        }
        entry.evicted = true;
        self.remove_slot(id, &slot).await;
        info!(game_id = %id, "game evicted");
        Ok(())
    }

    /// Point-in-time copy of every cached game.
    pub async fn all_active(&self) -> Vec<Game> {
        let slots: Vec<Slot> = self.entries.read().await.values().cloned().collect();
        let mut games = Vec::with_capacity(slots.len());
        for slot in slots {
            let entry = slot.lock().await;
            if !entry.evicted {
                if let Some(game) = &entry.game {
                    games.push(game.clone());
                }
            }
        }
        games
    }

    /// Evict every game whose deadline has passed. Returns how many left.
    ///
    /// Slots that are locked are in use and skipped. A failed write keeps
    /// the game and pushes its deadline out a full TTL.
    pub async fn sweep_expired(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let now = Instant::now();
        let slots: Vec<(GameId, Slot)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut evicted = 0;
        for (id, slot) in slots {
            let Ok(mut entry) = slot.try_lock() else {
                continue;
            };
            if entry.evicted || entry.deadline > now {
                continue;
            }
            let written = match &entry.game {
                Some(game) => self.store.upsert(&id, game).await,
                None => Ok(()),
            };
            match written {
                Ok(()) => {
                    entry.evicted = true;
                    self.remove_slot(&id, &slot).await;
                    evicted += 1;
                    info!(game_id = %id, "idle game evicted");
                }
                Err(e) => {
                    error!(game_id = %id, error = %e, "failed to flush idle game, retrying later");
                    entry.deadline = now + self.config.idle_ttl;
                }
            }
        }
        evicted
    }

    /// Sweep every `period` until `shutdown` fires.
    pub async fn run_eviction_loop(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired().await;
                    if evicted > 0 {
                        debug!(evicted, "eviction sweep");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Close the cache and flush every game, best effort.
    ///
    /// After this starts, mutations fail with [`SessionError::ShuttingDown`].
    /// Games stay cached; failures are logged and counted, never fatal.
    pub async fn drain(&self) -> DrainReport {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<(GameId, Slot)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut report = DrainReport::default();
        for (id, slot) in slots {
            let entry = slot.lock().await;
            if entry.evicted {
                continue;
            }
            let Some(game) = &entry.game else {
                continue;
            };
            match self.store.upsert(&id, game).await {
                Ok(()) => report.flushed += 1,
                Err(e) => {
                    error!(game_id = %id, error = %e, "failed to flush game during shutdown");
                    report.failed += 1;
                }
            }
        }

        info!(flushed = report.flushed, failed = report.failed, "session cache drained");
        report
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::{flip, resolve_match};
    use crate::game::state::{Card, CardStatus};
    use crate::store::MemoryStore;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn test_game(id: &str, owner: &UserId) -> Game {
        let deck = ["A", "A", "B", "B"]
            .iter()
            .enumerate()
            .map(|(i, v)| Card::hidden(i, *v))
            .collect();
        Game::new(GameId::new(id), owner.clone(), deck, Utc::now())
    }

    fn test_cache() -> (Arc<SessionCache>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            idle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            ..Default::default()
        };
        (Arc::new(SessionCache::new(config, store.clone())), store)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        assert_eq!(cache.get(&game.id, &alice()).await, Some(game));
    }

    #[tokio::test]
    async fn test_other_owner_sees_nothing() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        store.create(game.clone()).await.unwrap();
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        let bob = UserId::new("bob");
        assert!(cache.get(&game.id, &bob).await.is_none());
        assert!(cache.load_or_fetch(&game.id, &bob).await.is_none());
        let result = cache.with_game_mut(&game.id, &bob, |g, now| flip(g, 0, now)).await;
        assert!(matches!(result, Err(SessionError::NotFound)));
        assert!(matches!(
            cache.put(game.id.clone(), game.clone(), &bob).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_load_on_miss() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        store.create(game.clone()).await.unwrap();

        assert!(cache.get(&game.id, &alice()).await.is_none());
        assert_eq!(cache.load_or_fetch(&game.id, &alice()).await, Some(game.clone()));
        assert_eq!(cache.get(&game.id, &alice()).await, Some(game));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_durable_miss_leaves_no_entry() {
        let (cache, _) = test_cache();
        assert!(cache.load_or_fetch(&GameId::new("ghost"), &alice()).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_mutation_commits_on_success_only() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        let (_, updated) = cache
            .with_game_mut(&game.id, &alice(), |g, now| flip(g, 0, now))
            .await
            .unwrap();
        assert_eq!(updated.deck[0].status, CardStatus::Flipped);

        let result = cache.with_game_mut(&game.id, &alice(), |g, now| flip(g, 99, now)).await;
        assert!(matches!(result, Err(SessionError::Game(GameError::InvalidIndex(99)))));
        assert_eq!(cache.get(&game.id, &alice()).await, Some(updated));
    }

    #[tokio::test]
    async fn test_failed_flip_keeps_pending_pair() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game, &alice()).await.unwrap();
        let id = GameId::new("g1");

        cache.with_game_mut(&id, &alice(), |g, now| flip(g, 0, now)).await.unwrap();
        let (_, pending) = cache
            .with_game_mut(&id, &alice(), |g, now| flip(g, 1, now))
            .await
            .unwrap();
        assert_eq!(pending.flipped_indices(), vec![0, 1]);

        // Both fail after auto-resolving the pair on the working copy.
        let result = cache.with_game_mut(&id, &alice(), |g, now| flip(g, 99, now)).await;
        assert!(matches!(result, Err(SessionError::Game(GameError::InvalidIndex(99)))));
        let result = cache.with_game_mut(&id, &alice(), |g, now| flip(g, 0, now)).await;
        assert!(matches!(result, Err(SessionError::Game(GameError::AlreadyRevealed(0)))));

        let current = cache.get(&id, &alice()).await.unwrap();
        assert_eq!(current.deck[0].status, CardStatus::Flipped);
        assert_eq!(current.deck[1].status, CardStatus::Flipped);
        assert_eq!(current.score, 0);
        assert_eq!(current.actions, pending.actions);
        assert_eq!(current, pending);
    }

    #[tokio::test]
    async fn test_commit_holds_game_lock() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        let committed = cache.commit(&game.id, &alice(), |g, now| flip(g, 0, now)).await.unwrap();
        assert_eq!(committed.output().card_index, 0);

        let waiting = {
            let cache = cache.clone();
            let id = game.id.clone();
            tokio::spawn(async move {
                cache.with_game_mut(&id, &alice(), |g, now| flip(g, 1, now)).await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        assert_eq!(committed.game().flipped_indices(), vec![0]);

        drop(committed);
        let (_, after) = waiting.await.unwrap().unwrap();
        assert_eq!(after.flipped_indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent_and_keeps_entry() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        cache.flush(&game.id).await.unwrap();
        cache.flush(&game.id).await.unwrap();
        assert_eq!(store.get(&game.id).await, Some(game.clone()));
        assert_eq!(cache.len().await, 1);

        cache.flush(&GameId::new("absent")).await.unwrap();
    }

    #[tokio::test]
    async fn test_evict_and_flush() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();
        cache.with_game_mut(&game.id, &alice(), |g, now| flip(g, 2, now)).await.unwrap();

        cache.evict_and_flush(&game.id).await.unwrap();
        assert!(cache.is_empty().await);
        let stored = store.get(&game.id).await.unwrap();
        assert_eq!(stored.deck[2].status, CardStatus::Flipped);

        // Reloads the flushed copy.
        let reloaded = cache.load_or_fetch(&game.id, &alice()).await.unwrap();
        assert_eq!(reloaded.deck[2].status, CardStatus::Flipped);
    }

    #[tokio::test]
    async fn test_failed_evict_keeps_entry() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        store.set_fail_writes(true);
        assert!(cache.evict_and_flush(&game.id).await.is_err());
        assert_eq!(cache.get(&game.id, &alice()).await, Some(game));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_evicted_once() {
        let (cache, store) = test_cache();
        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = tokio::spawn(
            cache.clone().run_eviction_loop(Duration::from_secs(1), shutdown_tx.subscribe()),
        );

        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.get(&game.id, &alice()).await, Some(game.clone()));
        assert_eq!(store.upsert_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cache.get(&game.id, &alice()).await.is_none());
        assert_eq!(store.upsert_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.upsert_count(), 1);

        let _ = shutdown_tx.send(());
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_rearms_deadline() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        cache.with_game_mut(&game.id, &alice(), |g, now| flip(g, 0, now)).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(cache.sweep_expired().await, 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sweep_retries_later() {
        let (cache, store) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        store.set_fail_writes(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.sweep_expired().await, 0);
        assert_eq!(cache.len().await, 1);

        store.set_fail_writes(false);
        assert_eq!(cache.sweep_expired().await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.sweep_expired().await, 1);
    }

    #[tokio::test]
    async fn test_drain_flushes_all_and_closes() {
        let (cache, store) = test_cache();
        for id in ["g1", "g2", "g3"] {
            let game = test_game(id, &alice());
            cache.put(game.id.clone(), game, &alice()).await.unwrap();
        }

        let report = cache.drain().await;
        assert_eq!(report, DrainReport { flushed: 3, failed: 0 });
        assert_eq!(store.len().await, 3);

        let result = cache.with_game_mut(&GameId::new("g1"), &alice(), |g, now| flip(g, 0, now)).await;
        assert!(matches!(result, Err(SessionError::ShuttingDown)));
        assert!(matches!(cache.create(&alice(), None).await, Err(SessionError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_drain_survives_failures() {
        let (cache, store) = test_cache();
        for id in ["g1", "g2"] {
            let game = test_game(id, &alice());
            cache.put(game.id.clone(), game, &alice()).await.unwrap();
        }
        store.set_fail_writes(true);

        let report = cache.drain().await;
        assert_eq!(report, DrainReport { flushed: 0, failed: 2 });
        assert_eq!(cache.all_active().await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_persists_and_caches() {
        let (cache, store) = test_cache();
        let game = cache.create(&alice(), Some(3)).await.unwrap();

        assert_eq!(game.deck.len(), 6);
        assert!(store.get(&game.id).await.is_some());
        assert_eq!(cache.get(&game.id, &alice()).await, Some(game));

        let result = cache.create(&alice(), Some(1)).await;
        assert!(matches!(result, Err(SessionError::Game(GameError::InvalidDeckSize(1)))));
    }

    #[tokio::test]
    async fn test_concurrent_flips_serialize() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();

        let mut handles = Vec::new();
        for index in 0..4 {
            let cache = cache.clone();
            let id = game.id.clone();
            handles.push(tokio::spawn(async move {
                cache.with_game_mut(&id, &alice(), |g, now| flip(g, index, now)).await.is_ok()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let game = cache.get(&game.id, &alice()).await.unwrap();
        assert!(game.flipped_count() <= 2);
        assert!(game.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_all_active_snapshot() {
        let (cache, _) = test_cache();
        let game = test_game("g1", &alice());
        cache.put(game.id.clone(), game.clone(), &alice()).await.unwrap();
        cache.with_game_mut(&game.id, &alice(), |g, now| flip(g, 0, now)).await.unwrap();
        cache.with_game_mut(&game.id, &alice(), |g, now| flip(g, 1, now)).await.unwrap();
        cache.with_game_mut(&game.id, &alice(), resolve_match).await.unwrap();

        let active = cache.all_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].score, 1);
    }
}
