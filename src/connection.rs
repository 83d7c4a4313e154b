//! Connection descriptions for reaching a remote host over SSH.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

const fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// String wrapper that keeps credential material out of debug output.
///
/// The value still serialises verbatim so resource inputs can be compared
/// and persisted.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a credential value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the wrapped credential.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How to reach and authenticate against a remote host.
///
/// Values are immutable once built and may be shared between resources.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Host name or address to connect to.
    pub host: String,
    /// TCP port of the SSH daemon.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
    /// PEM-encoded private key for key authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Secret>,
    /// Passphrase unlocking `private_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<Secret>,
}

impl ConnectionSpec {
    /// Creates a spec for `host` on the default port with no credentials.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: None,
            password: None,
            private_key: None,
            private_key_passphrase: None,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the login user.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the login password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<Secret>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the private key and its optional passphrase.
    #[must_use]
    pub fn with_private_key(
        mut self,
        private_key: impl Into<Secret>,
        passphrase: Option<Secret>,
    ) -> Self {
        self.private_key = Some(private_key.into());
        self.private_key_passphrase = passphrase;
        self
    }

    /// Returns `host:port` for logging and socket resolution.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the spec before any network activity.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when the host is blank or
    /// the port is zero.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.host.trim().is_empty() {
            return Err(ProvisionError::configuration("connection host is empty"));
        }
        if self.port == 0 {
            return Err(ProvisionError::configuration(
                "connection port must be between 1 and 65535",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn port_defaults_to_22_when_absent() {
        let spec: ConnectionSpec =
            serde_json::from_value(json!({ "host": "vm.example" })).expect("deserialise spec");
        assert_eq!(spec.port, 22);
        assert!(spec.validate().is_ok());
    }

    #[rstest]
    #[case(json!({ "host": "vm", "port": 0 }))]
    #[case(json!({ "host": "  " }))]
    fn validate_rejects_bad_values(#[case] value: serde_json::Value) {
        let spec: ConnectionSpec = serde_json::from_value(value).expect("deserialise spec");
        let err = spec.validate().expect_err("spec should be rejected");
        assert!(matches!(err, ProvisionError::Configuration(_)), "{err}");
    }

    #[test]
    fn port_above_range_fails_to_deserialise() {
        let result = serde_json::from_value::<ConnectionSpec>(json!({ "host": "vm", "port": 70000 }));
        assert!(result.is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let spec = ConnectionSpec::new("vm")
            .with_username("controller")
            .with_password("hunter2");
        let rendered = format!("{spec:?}");
        assert!(!rendered.contains("hunter2"), "{rendered}");
        assert!(rendered.contains("controller"));
    }
}
