use shared::domain::ConversationId;
use shared::error::ErrorCode;
use shared::protocol::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The identity has no stable user id; the messaging feature stays inert.
    #[error("identity has no stable user id")]
    MissingIdentity,

    /// No role-scoped bearer token is available for authentication.
    #[error("no role token available for authentication")]
    Unauthenticated,

    #[error("live session is not connected")]
    NotConnected,

    #[error("message content is empty")]
    EmptyMessage,

    /// Direct conversation with no resolvable counterpart; rejected locally
    /// before any network call.
    #[error("no resolvable recipient in direct conversation")]
    NoRecipient,

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// An invitation is already pending for this (community, user) pair.
    #[error("an invitation is already pending for this user")]
    InvitationPending,

    /// A join request is already pending for this (community, user) pair.
    #[error("a join request is already pending for this community")]
    JoinRequestPending,

    #[error("not permitted: {0}")]
    PermissionDenied(String),

    #[error("request timed out")]
    Timeout,

    #[error("server rejected request ({code:?}): {message}")]
    Api { code: ErrorCode, message: String },

    #[error("http request failed: {0}")]
    Http(reqwest::Error),

    #[error("websocket transport failed: {0}")]
    Transport(String),
}

impl ClientError {
    /// Retriable conditions that leave no corrupted state behind.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::InvitationPending
                | ClientError::JoinRequestPending
                | ClientError::Timeout
                | ClientError::Unauthenticated
                | ClientError::NotConnected
        )
    }

    pub fn http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(err)
        }
    }

    /// Maps a non-success REST response to the error taxonomy. Duplicate
    /// membership actions surface as `Duplicate` so call sites can turn them
    /// into their recoverable pending states.
    pub fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| body.trim().to_string());

        if status == reqwest::StatusCode::FORBIDDEN {
            return ClientError::PermissionDenied(message);
        }

        let duplicate = (status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::CONFLICT)
            && message.to_ascii_lowercase().contains("already");

        let code = if status == reqwest::StatusCode::UNAUTHORIZED {
            ErrorCode::Unauthorized
        } else if status == reqwest::StatusCode::NOT_FOUND {
            ErrorCode::NotFound
        } else if duplicate {
            ErrorCode::Duplicate
        } else if status == reqwest::StatusCode::BAD_REQUEST {
            ErrorCode::Validation
        } else {
            ErrorCode::Internal
        };

        ClientError::Api { code, message }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            ClientError::Api {
                code: ErrorCode::Duplicate,
                ..
            }
        )
    }
}
