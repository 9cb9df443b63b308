//! Shared types for the callcoach platform.
//!
//! Defines the connection identity model (who is on the other end of a
//! signaling socket) and the normalized application error used at the
//! protocol boundary.

pub mod error;

pub use error::AppError;

use serde::{Deserialize, Serialize};

/// Role of a connected participant.
///
/// A call pairs a customer (`User`) with a salesperson running the copilot
/// dashboard (`Agent`). The role gates which side may create rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn is_agent(self) -> bool {
        matches!(self, Role::Agent)
    }
}

/// The identity token a client presents during the WebSocket handshake.
///
/// Sent as an opaque JSON string; must parse to exactly this shape or the
/// connection is rejected before any server-side state is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectToken {
    pub name: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub role: Role,
}

/// A logical identity bound to its current transport (socket).
///
/// The socket binding churns across reconnections; the `user_id` is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub name: String,
    pub role: Role,
    pub socket_id: String,
}

impl UserIdentity {
    pub fn from_token(token: &ConnectToken, socket_id: impl Into<String>) -> Self {
        Self {
            user_id: token.user_id.clone(),
            name: token.name.clone(),
            role: token.role,
            socket_id: socket_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_token_parses_camel_case() {
        let token: ConnectToken =
            serde_json::from_str(r#"{"name":"Ada","userId":"u-1","role":"agent"}"#)
                .expect("token should parse");
        assert_eq!(token.user_id, "u-1");
        assert_eq!(token.role, Role::Agent);
    }

    #[test]
    fn connect_token_rejects_unknown_role() {
        let result = serde_json::from_str::<ConnectToken>(
            r#"{"name":"Ada","userId":"u-1","role":"admin"}"#,
        );
        assert!(result.is_err(), "unknown role must not parse");
    }

    #[test]
    fn identity_binds_socket() {
        let token: ConnectToken =
            serde_json::from_str(r#"{"name":"Ada","userId":"u-1","role":"user"}"#).unwrap();
        let identity = UserIdentity::from_token(&token, "sock-9");
        assert_eq!(identity.socket_id, "sock-9");
        assert!(!identity.role.is_agent());
    }
}
