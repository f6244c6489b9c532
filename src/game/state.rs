//! Game State Definitions
//!
//! The authoritative record of one game and its client-visible projection.
//! The full `Game` is what the cache and the durable store hold; only
//! `SafeGame` ever leaves the server.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::id::{GameId, UserId};

// =============================================================================
// CARDS
// =============================================================================

/// Face state of a single card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    /// Face down.
    Hidden,
    /// Face up, awaiting a match attempt.
    Flipped,
    /// Matched. Terminal.
    Found,
}

/// One card in the deck.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Position in the deck. Stable for the game's lifetime.
    pub index: usize,
    /// Face symbol. Equal values form a pair.
    pub value: String,
    /// Current face state.
    pub status: CardStatus,
}

impl Card {
    /// Create a face-down card.
    pub fn hidden(index: usize, value: impl Into<String>) -> Self {
        Self {
            index,
            value: value.into(),
            status: CardStatus::Hidden,
        }
    }
}

// =============================================================================
// ACTION LOG
// =============================================================================

/// Kind of audit log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// A card was flipped face up.
    Flip,
    /// Two flipped cards matched.
    Match,
    /// Game created.
    Start,
    /// Game completed.
    End,
}

/// Append-only audit log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Entry kind.
    pub action_type: ActionType,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Flipped card (FLIP only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_index: Option<usize>,
    /// Matched pair (MATCH only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_card_indices: Option<[usize; 2]>,
}

impl Action {
    /// FLIP entry.
    pub fn flip(card_index: usize, timestamp: i64) -> Self {
        Self {
            action_type: ActionType::Flip,
            timestamp,
            card_index: Some(card_index),
            matched_card_indices: None,
        }
    }

    /// MATCH entry.
    pub fn matched(first: usize, second: usize, timestamp: i64) -> Self {
        Self {
            action_type: ActionType::Match,
            timestamp,
            card_index: None,
            matched_card_indices: Some([first, second]),
        }
    }

    /// START or END entry.
    pub fn marker(action_type: ActionType, timestamp: i64) -> Self {
        Self {
            action_type,
            timestamp,
            card_index: None,
            matched_card_indices: None,
        }
    }
}

// =============================================================================
// GAME
// =============================================================================

/// Game-level status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Cards remain to be found.
    InProgress,
    /// Every card found. Terminal.
    Completed,
}

/// Complete state of a game.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Game identifier
    pub id: GameId,

    /// Owning user; every lookup is scoped to it
    pub owner_user_id: UserId,

    /// Cards in stable position order
    pub deck: Vec<Card>,

    /// Append-only action log
    pub actions: Vec<Action>,

    /// Game status
    pub status: GameStatus,

    /// Successful matches
    pub score: u32,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Game {
    /// Create a new in-progress game over an already dealt deck.
    pub fn new(id: GameId, owner_user_id: UserId, deck: Vec<Card>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_user_id,
            deck,
            actions: vec![Action::marker(ActionType::Start, now.timestamp_millis())],
            status: GameStatus::InProgress,
            score: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user` owns this game.
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        self.owner_user_id == *user
    }

    /// Indices of cards currently face up, in deck order.
    pub fn flipped_indices(&self) -> Vec<usize> {
        self.deck
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == CardStatus::Flipped)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of cards currently face up.
    pub fn flipped_count(&self) -> usize {
        self.deck.iter().filter(|c| c.status == CardStatus::Flipped).count()
    }

    /// Whether every card has been found.
    pub fn all_found(&self) -> bool {
        self.deck.iter().all(|c| c.status == CardStatus::Found)
    }

    /// Completed flip pairs. Derived from the log, never stored.
    pub fn tries(&self) -> u32 {
        (self.count_actions(ActionType::Flip) / 2) as u32
    }

    /// Number of log entries of the given kind.
    pub fn count_actions(&self, kind: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action_type == kind).count()
    }

    /// Check the state invariants.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let flipped = self.flipped_count();
        if flipped > 2 {
            return Err(format!("{} cards flipped", flipped));
        }
        let completed = self.status == GameStatus::Completed;
        if completed != self.all_found() {
            return Err(format!(
                "status {:?} disagrees with deck (all found: {})",
                self.status,
                self.all_found()
            ));
        }
        let matches = self.count_actions(ActionType::Match);
        if self.score as usize != matches {
            return Err(format!("score {} but {} match actions", self.score, matches));
        }
        if let Some((pos, card)) = self.deck.iter().enumerate().find(|(i, c)| c.index != *i) {
            return Err(format!("card at position {} has index {}", pos, card.index));
        }
        Ok(())
    }

    /// Client-visible projection with hidden faces redacted.
    pub fn to_safe(&self) -> SafeGame {
        SafeGame {
            id: self.id.clone(),
            owner_user_id: self.owner_user_id.clone(),
            deck: self.deck.iter().map(SafeCard::from).collect(),
            actions: self.actions.clone(),
            status: self.status,
            score: self.score,
            tries: self.tries(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// =============================================================================
// CLIENT PROJECTION
// =============================================================================

/// Card as seen by clients. `value` is absent while the card is hidden.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeCard {
    /// Deck position.
    pub index: usize,
    /// Face state.
    pub status: CardStatus,
    /// Face symbol, only once revealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl From<&Card> for SafeCard {
    fn from(card: &Card) -> Self {
        Self {
            index: card.index,
            status: card.status,
            value: match card.status {
                CardStatus::Hidden => None,
                CardStatus::Flipped | CardStatus::Found => Some(card.value.clone()),
            },
        }
    }
}

/// Game as seen by clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeGame {
    /// Game identifier.
    pub id: GameId,
    /// Owning user.
    pub owner_user_id: UserId,
    /// Redacted cards.
    pub deck: Vec<SafeCard>,
    /// Action log.
    pub actions: Vec<Action>,
    /// Game status.
    pub status: GameStatus,
    /// Successful matches.
    pub score: u32,
    /// Completed flip pairs.
    pub tries: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}
