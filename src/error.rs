//! Error taxonomy shared by sessions and side-effect resources.

use std::fmt;

use thiserror::Error;

/// Transient connection failure classes that are retried before giving up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransientClass {
    /// The SSH daemon does not (yet) offer the requested authentication
    /// method.
    AuthMethodUnavailable,
    /// The host refused or could not route the TCP connection.
    Unreachable,
}

impl fmt::Display for TransientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthMethodUnavailable => f.write_str("authentication method unavailable"),
            Self::Unreachable => f.write_str("host unreachable"),
        }
    }
}

/// Errors surfaced while establishing sessions or performing side effects.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Inputs were malformed or contradictory. Raised before any remote
    /// interaction.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A transient failure class exhausted its retry budget.
    #[error("gave up connecting to {host} after {attempts} attempts ({class}): {message}")]
    Connectivity {
        /// Host that could not be reached.
        host: String,
        /// Failure class that exhausted its budget.
        class: TransientClass,
        /// Number of connection attempts made.
        attempts: u32,
        /// Message from the final failed attempt.
        message: String,
    },
    /// Any other connection, session, or channel failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The side effect itself could not complete.
    #[error("remote effect failed: {0}")]
    RemoteEffect(String),
}

impl ProvisionError {
    /// Builds a [`ProvisionError::Configuration`] from any displayable value.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Builds a [`ProvisionError::Transport`] prefixed with the failed action.
    #[must_use]
    pub fn transport(action: &str, err: impl fmt::Display) -> Self {
        Self::Transport(format!("{action}: {err}"))
    }
}
