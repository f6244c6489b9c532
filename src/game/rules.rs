//! Card-flip state machine.
//!
//! Pure transitions over a [`Game`]. Cards move HIDDEN -> FLIPPED, then
//! either FLIPPED -> FOUND on a match or FLIPPED -> HIDDEN on a miss.
//! The game moves IN_PROGRESS -> COMPLETED once every card is found.
//!
//! Callers own scoping (which game, which user) and atomicity; see
//! `network::session::SessionCache::with_game_mut`.

use thiserror::Error;

use crate::game::state::{Action, ActionType, CardStatus, Game, GameStatus};

/// Transition errors.
///
/// Display strings are sent to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// Game is already completed.
    #[error("Game is not in progress")]
    InvalidState,

    /// Card index outside the deck.
    #[error("Invalid card index")]
    InvalidIndex(usize),

    /// Target card is not hidden.
    #[error("Card already flipped or matched")]
    AlreadyRevealed(usize),

    /// Two cards are still face up after auto-resolve.
    #[error("Already 2 cards flipped")]
    AlreadyTwoFlipped,

    /// Match requested without exactly two face-up cards.
    #[error("Need exactly 2 flipped cards")]
    NeedTwoFlipped,

    /// Requested deck size is out of range.
    #[error("Deck must have between 2 and 32 pairs, got {0}")]
    InvalidDeckSize(usize),

    /// State the invariants rule out was reached.
    #[error("Internal consistency fault: {0}")]
    ConsistencyFault(String),
}

impl GameError {
    /// Whether this is a server-side fault rather than client misuse.
    pub fn is_internal(&self) -> bool {
        matches!(self, GameError::ConsistencyFault(_))
    }
}

/// Result of comparing the two face-up cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Values were equal; both cards are now found.
    Matched {
        /// First card index.
        first: usize,
        /// Second card index.
        second: usize,
        /// Whether this match completed the game.
        completed: bool,
    },
    /// Values differed; both cards are hidden again.
    Missed {
        /// First card index.
        first: usize,
        /// Second card index.
        second: usize,
    },
}

/// What a successful flip did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipOutcome {
    /// Card turned face up.
    pub card_index: usize,
    /// Pending pair resolved before the flip, if any.
    pub auto_resolved: Option<MatchOutcome>,
}

fn ensure_in_progress(game: &Game) -> Result<(), GameError> {
    if game.status != GameStatus::InProgress {
        return Err(GameError::InvalidState);
    }
    Ok(())
}

/// Turn one hidden card face up.
///
/// If two cards are already face up the pending pair is resolved first,
/// which reconciles a client that skipped its match call.
pub fn flip(game: &mut Game, card_index: usize, now_ms: i64) -> Result<FlipOutcome, GameError> {
    ensure_in_progress(game)?;

    let mut auto_resolved = None;
    if game.flipped_count() == 2 {
        let outcome = resolve_match(game, now_ms).map_err(|e| {
            GameError::ConsistencyFault(format!("auto-resolve failed: {}", e))
        })?;
        auto_resolved = Some(outcome);
        // The resolved pair may have been the last one.
        ensure_in_progress(game)?;
    }
    if game.flipped_count() >= 2 {
        return Err(GameError::AlreadyTwoFlipped);
    }

    let card = game
        .deck
        .get_mut(card_index)
        .ok_or(GameError::InvalidIndex(card_index))?;
    if card.status != CardStatus::Hidden {
        return Err(GameError::AlreadyRevealed(card_index));
    }

    card.status = CardStatus::Flipped;
    game.actions.push(Action::flip(card_index, now_ms));

    debug_assert!(game.check_invariants().is_ok());
    Ok(FlipOutcome { card_index, auto_resolved })
}

/// Compare the two face-up cards.
///
/// Equal values become FOUND and score a point; unequal values return to
/// HIDDEN with nothing logged (the two FLIP entries already record the try).
pub fn resolve_match(game: &mut Game, now_ms: i64) -> Result<MatchOutcome, GameError> {
    ensure_in_progress(game)?;

    let flipped = game.flipped_indices();
    let [first, second] = flipped[..] else {
        return Err(GameError::NeedTwoFlipped);
    };

    let outcome = if game.deck[first].value == game.deck[second].value {
        game.deck[first].status = CardStatus::Found;
        game.deck[second].status = CardStatus::Found;
        game.actions.push(Action::matched(first, second, now_ms));
        game.score += 1;

        let completed = game.all_found();
        if completed {
            game.status = GameStatus::Completed;
            game.actions.push(Action::marker(ActionType::End, now_ms));
        }
        MatchOutcome::Matched { first, second, completed }
    } else {
        game.deck[first].status = CardStatus::Hidden;
        game.deck[second].status = CardStatus::Hidden;
        MatchOutcome::Missed { first, second }
    };

    debug_assert!(game.check_invariants().is_ok());
    Ok(outcome)
}

// =============================================================================
// TESTS
// =============================================================================
