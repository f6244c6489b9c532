//! Deck dealing.
//!
//! A deck is `pairs` distinct symbols, each dealt twice, shuffled with the
//! deterministic RNG.

use crate::core::rng::DeterministicRng;
use crate::game::rules::GameError;
use crate::game::state::Card;

/// Smallest playable deck, in pairs.
pub const MIN_PAIRS: usize = 2;

/// Largest deck, in pairs. Bounded by the symbol table.
pub const MAX_PAIRS: usize = SYMBOLS.len();

/// Deck size when the client does not ask for one.
pub const DEFAULT_PAIRS: usize = 8;

/// Card faces, in dealing order.
pub const SYMBOLS: [&str; 32] = [
    "apple", "anchor", "bell", "bolt", "cactus", "castle", "clover", "comet",
    "crown", "diamond", "dragon", "feather", "flame", "gem", "globe", "heart",
    "key", "leaf", "lotus", "moon", "mushroom", "owl", "palm", "pearl",
    "rocket", "rose", "shell", "skull", "star", "sun", "tree", "wave",
];

/// Deal a shuffled deck of `pairs` pairs.
pub fn deal_deck(pairs: usize, rng: &mut DeterministicRng) -> Result<Vec<Card>, GameError> {
    if !(MIN_PAIRS..=MAX_PAIRS).contains(&pairs) {
        return Err(GameError::InvalidDeckSize(pairs));
    }

    let mut values: Vec<&str> = SYMBOLS[..pairs]
        .iter()
        .flat_map(|s| [*s, *s])
        .collect();
    rng.shuffle(&mut values);

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(index, value)| Card::hidden(index, value))
        .collect())
}
