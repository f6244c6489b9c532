//! Game Logic Module
//!
//! Pure game code: no I/O, no clocks (timestamps are passed in).
//!
//! ## Module Structure
//!
//! - `state`: Game record, cards, action log, client projection
//! - `deck`: Dealing shuffled decks
//! - `rules`: Flip/match state machine

pub mod state;
pub mod deck;
pub mod rules;

// Re-export key types
pub use state::{Action, ActionType, Card, CardStatus, Game, GameStatus, SafeCard, SafeGame};
pub use deck::{deal_deck, DEFAULT_PAIRS, MAX_PAIRS, MIN_PAIRS};
pub use rules::{flip, resolve_match, FlipOutcome, GameError, MatchOutcome};
