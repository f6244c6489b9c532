//! # Memory Match Game Server
//!
//! Authoritative backend for real-time multiplayer memory-match games.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MEMORY MATCH SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── id.rs       - Game and user identifiers                 │
//! │  └── rng.rs      - Seeded Xorshift128+ for dealing           │
//! │                                                              │
//! │  game/           - Game logic (pure, no I/O)                 │
//! │  ├── state.rs    - Game record and client projection         │
//! │  ├── deck.rs     - Dealing shuffled decks                    │
//! │  └── rules.rs    - Flip/match state machine                  │
//! │                                                              │
//! │  store/          - Durable storage                           │
//! │  ├── file.rs     - One JSON file per game                    │
//! │  └── memory.rs   - In-process map                            │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket gateway and config              │
//! │  ├── auth.rs     - JWT verification                          │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── session.rs  - Active game cache, eviction, drain        │
//! │  └── room.rs     - Per-game broadcast rooms                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Every mutation of a game runs under that game's lock in the session
//! cache, on a working copy that is committed only if the transition
//! succeeds. Games are written to the durable store on creation, on idle
//! eviction and during the shutdown drain; the cache is authoritative in
//! between.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::id::{GameId, UserId};
pub use core::rng::DeterministicRng;
pub use game::state::{Game, SafeGame};
pub use network::server::{GameServer, ServerConfig};
pub use network::session::SessionCache;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
