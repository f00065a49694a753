#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Failures reported by a [`Transport`](super::Transport).
///
/// The variant decides how the manager reacts: [`TransportError::Auth`] halts automatic
/// reconnection, [`TransportError::Network`] drives the backoff loop, and
/// [`TransportError::Protocol`] only drops the offending frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The credential was rejected (expired, revoked or malformed on the server side)
    Auth(String),
    /// Transient failure reaching or talking to the server
    Network(String),
    /// A malformed or unexpected inbound frame
    Protocol(String),
}

impl TransportError {
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Auth(reason.into())
    }

    pub fn network<S: Into<String>>(reason: S) -> Self {
        Self::Network(reason.into())
    }

    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::Protocol(reason.into())
    }

    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(reason) => write!(f, "Auth error: {reason}"),
            Self::Network(reason) => write!(f, "Transport error: {reason}"),
            Self::Protocol(reason) => write!(f, "Protocol error: {reason}"),
        }
    }
}

impl StdError for TransportError {}

impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

#[cfg(feature = "ws")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        use tokio_tungstenite::tungstenite::http::StatusCode;

        match e {
            WsError::Http(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Self::Auth(format!("handshake rejected with {}", response.status()))
            }
            WsError::Protocol(err) => Self::Protocol(err.to_string()),
            other => Self::Network(other.to_string()),
        }
    }
}
