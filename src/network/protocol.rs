//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message shaped `{"type": ..., "payload": ...}`.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::id::GameId;
use crate::game::state::SafeGame;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start watching a game.
    Join(JoinRequest),

    /// Turn a card face up.
    Flip(FlipRequest),

    /// Resolve the two face-up cards.
    Match(MatchRequest),

    /// Deal a new game for the connected user.
    Create(CreateRequest),
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Game to watch.
    pub game_id: GameId,
}

/// Flip request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlipRequest {
    /// Target game.
    pub game_id: GameId,
    /// Deck position. Signed so out-of-range input reaches the rules as
    /// an invalid index rather than a parse error.
    pub card_index: i64,
}

/// Match request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    /// Target game.
    pub game_id: GameId,
}

/// Create request. `{}` asks for the default deck size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Number of pairs to deal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<usize>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Redacted game snapshot.
    State(SafeGame),

    /// Error for the originating connection only.
    ErrorMessage(String),
}

impl ServerMessage {
    /// Error message from anything displayable.
    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerMessage::ErrorMessage(err.to_string())
    }
}

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Close code sent when the handshake carried no credential.
pub const CLOSE_MISSING_CREDENTIAL: u16 = 4001;

/// Close code sent when the credential failed verification.
pub const CLOSE_INVALID_CREDENTIAL: u16 = 4003;

/// Close reason for [`CLOSE_MISSING_CREDENTIAL`].
pub const REASON_MISSING_CREDENTIAL: &str = "missing credential";

/// Close reason for [`CLOSE_INVALID_CREDENTIAL`].
pub const REASON_INVALID_CREDENTIAL: &str = "invalid credential";

/// Close reason on server shutdown (code 1001, going away).
pub const REASON_SHUTDOWN: &str = "server shutting down";

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

/// Inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not valid JSON or not a known `{type, payload}` shape.
    #[error("Invalid message format")]
    Malformed(#[from] serde_json::Error),

    /// Binary frames are not part of the protocol.
    #[error("Invalid message format")]
    Binary,
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join() {
        let msg = ClientMessage::from_json(r#"{"type":"join","payload":{"gameId":"g1"}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Join(JoinRequest { game_id: GameId::new("g1") }));
    }

    #[test]
    fn test_parse_flip() {
        let msg = ClientMessage::from_json(
            r#"{"type":"flip","payload":{"gameId":"g1","cardIndex":3}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Flip(FlipRequest { game_id: GameId::new("g1"), card_index: 3 })
        );
    }

    #[test]
    fn test_parse_match_and_create() {
        let msg = ClientMessage::from_json(r#"{"type":"match","payload":{"gameId":"g1"}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Match(_)));

        let msg = ClientMessage::from_json(r#"{"type":"create","payload":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Create(CreateRequest { pairs: None }));

        let msg = ClientMessage::from_json(r#"{"type":"create","payload":{"pairs":4}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Create(CreateRequest { pairs: Some(4) }));
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        for raw in [
            "not json",
            r#"{"type":"dance","payload":{}}"#,
            r#"{"type":"flip","payload":{"gameId":"g1"}}"#,
            r#"{"type":"flip","payload":{"gameId":"g1","cardIndex":"x"}}"#,
            r#"{"payload":{"gameId":"g1"}}"#,
        ] {
            let err = ClientMessage::from_json(raw).unwrap_err();
            assert_eq!(err.to_string(), "Invalid message format");
        }
    }

    #[test]
    fn test_error_message_shape() {
        let json = ServerMessage::error("Game not found").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"type": "error_message", "payload": "Game not found"}));
    }

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::Flip(FlipRequest { game_id: GameId::new("g9"), card_index: -1 });
        let parsed = ClientMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }
}
