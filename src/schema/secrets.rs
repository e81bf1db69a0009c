use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sensitive string material.
///
/// `Debug` and `Display` render `<redacted>`; only the YAML emitter and
/// explicit [Secret::expose] calls see the plaintext, keeping secrets out of
/// log lines and error contexts by construction.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-user secret material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UserSecrets {
    /// Plaintext password used for both mail and HTTP digest projections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
    /// Dovecot password scheme override (`PLAIN`, `SHA512-CRYPT`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// ACME account material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AcmeSecrets {
    /// PEM-encoded account key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key: Option<Secret>,
    /// ACME directory URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// The `secrets.yaml` document. Written with mode 0600; never logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecretBundle {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, UserSecrets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeSecrets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rndc_key: Option<Secret>,
}

impl SecretBundle {
    pub fn password(&self, username: &str) -> Option<&Secret> {
        self.users.get(username).and_then(|s| s.password.as_ref())
    }

    /// The dovecot scheme for a user, falling back to the given default.
    pub fn scheme<'a>(&'a self, username: &str, default: &'a str) -> &'a str {
        self.users
            .get(username)
            .and_then(|s| s.scheme.as_deref())
            .unwrap_or(default)
    }

    pub fn set_password(&mut self, username: &str, password: Secret) {
        self.users.entry(username.to_string()).or_default().password = Some(password);
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::{Secret, SecretBundle};

    #[test]
    fn test_secret_redacted_in_debug() {
        let bundle = SecretBundle {
            users: [(
                "admin".to_string(),
                super::UserSecrets {
                    password: Some(Secret::new("s3cret")),
                    scheme: None,
                },
            )]
            .into(),
            ..Default::default()
        };
        let rendered = format!("{:?}", bundle);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_bundle_roundtrip_keeps_plaintext() {
        let mut bundle = SecretBundle::default();
        bundle.set_password("admin", Secret::new("s3cret"));
        let emitted = serde_yaml::to_string(&bundle).unwrap();
        assert!(emitted.contains("s3cret"));
        let parsed: SecretBundle = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(parsed.password("admin").unwrap().expose(), "s3cret");
    }

    #[test]
    fn test_scheme_fallback() {
        let bundle = SecretBundle::default();
        assert_eq!(bundle.scheme("nobody", "PLAIN"), "PLAIN");
    }
}
