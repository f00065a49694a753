/// Secret string types that redact values in debug output.
pub use secrecy::{ExposeSecret, SecretString};

use crate::Result;
use crate::error::Error;

/// Bearer token presented to the transport when connecting.
///
/// The token is issued elsewhere; this type only carries it and performs the structural checks
/// that can be done locally before any network attempt is made.
#[derive(Clone, Debug)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Returns the token.
    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Rejects tokens that can never be valid: empty, or containing whitespace or control
    /// characters (which would also break the `Authorization` header).
    pub fn validate(&self) -> Result<()> {
        let token = self.token.expose_secret();
        if token.is_empty() {
            return Err(Error::validation("credential must not be empty"));
        }
        if token
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::validation(
                "credential must not contain whitespace or control characters",
            ));
        }

        Ok(())
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn debug_should_redact_token() {
        let credential = Credential::new("super-secret-token");

        assert!(!format!("{credential:?}").contains("super-secret-token"));
    }

    #[test]
    fn validate_rejects_structurally_invalid_tokens() {
        assert!(Credential::new("eyJhbGciOi.abc.def").validate().is_ok());

        for bad in ["", "has space", "tab\there", "new\nline"] {
            let err = Credential::new(bad).validate().unwrap_err();
            assert_eq!(err.kind(), Kind::Validation, "{bad:?} should be rejected");
        }
    }
}
