use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::default_true;

/// A user account, projected into mailboxes, aliases and HTTP auth entries.
///
/// For every domain listed in [User::domains] the user implies exactly one
/// mailbox path `<domain>/<username>/` under the mail state directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct User {
    /// Unique, lowercase, DNS-label-safe login name.
    pub username: String,
    pub email: String,
    /// Domains this user has a mailbox in. Must not be empty.
    #[serde(default)]
    pub domains: Vec<String>,
    /// `admin` grants cross-domain write.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    /// Human-readable size, e.g. `1G`.
    #[serde(default = "User::default_quota")]
    pub mailbox_quota: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pre-computed hashes keyed by scheme (`plain`, `digest-{realm}`,
    /// `sha512-crypt`). Plaintext material lives in the secret bundle.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub password_hashes: BTreeMap<String, String>,
}

impl User {
    pub const ROLE_ADMIN: &str = "admin";

    fn default_quota() -> String {
        "1G".to_string()
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(Self::ROLE_ADMIN)
    }

    /// Relative mailbox path for one of the user's domains.
    pub fn mailbox_path(&self, domain: &str) -> String {
        format!("{}/{}/", domain, self.username)
    }
}

impl Default for User {
    fn default() -> Self {
        Self {
            username: String::new(),
            email: String::new(),
            domains: vec![],
            roles: BTreeSet::new(),
            mailbox_quota: Self::default_quota(),
            enabled: true,
            password_hashes: BTreeMap::new(),
        }
    }
}

/// The `users.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<User>,
}

impl UsersFile {
    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &User> {
        self.users.iter().filter(|u| u.enabled)
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::{User, UsersFile};

    #[test]
    fn test_user_roundtrip() {
        let file = UsersFile {
            users: vec![User {
                username: "admin".to_string(),
                email: "admin@local.dev".to_string(),
                domains: vec!["local.dev".to_string()],
                roles: [User::ROLE_ADMIN.to_string()].into(),
                ..Default::default()
            }],
        };
        let emitted = serde_yaml::to_string(&file).unwrap();
        let parsed: UsersFile = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(serde_yaml::to_string(&parsed).unwrap(), emitted);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "users:\n- username: a\n  email: a@b.c\n  shell: /bin/sh\n";
        assert!(serde_yaml::from_str::<UsersFile>(yaml).is_err());
    }

    #[test]
    fn test_mailbox_path() {
        let user = User {
            username: "admin".to_string(),
            ..Default::default()
        };
        assert_eq!(user.mailbox_path("local.dev"), "local.dev/admin/");
    }
}
