//! Network Layer
//!
//! WebSocket gateway, authentication, the session cache that owns live
//! games, and room fan-out. All rule logic runs through `game/`.

pub mod auth;
pub mod protocol;
pub mod room;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, AuthError, JwtVerifier, TokenClaims, TokenVerifier, validate_token};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use room::{ConnectionHandle, ConnectionId, Outbound, RoomBroadcaster};
pub use session::{CacheConfig, Committed, DrainReport, SessionCache, SessionError};
pub use server::{extract_credential, ConfigError, GameServer, GameServerError, ServerConfig, StoreLocation};
