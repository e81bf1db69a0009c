use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The `global.yaml` document: system identity plus per-service defaults.
///
/// Unknown top-level sections are preserved verbatim so that services can
/// carry free-form defaults without schema changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    pub system: SystemSection,
    #[serde(default)]
    pub mail: MailSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(flatten)]
    pub service_defaults: BTreeMap<String, serde_yaml::Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            system: SystemSection::default(),
            mail: MailSection::default(),
            http: HttpSection::default(),
            service_defaults: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SystemSection {
    /// Primary FQDN of the deployment.
    pub domain: String,
    pub admin_email: String,
    #[serde(default = "SystemSection::default_timezone")]
    pub timezone: String,
}

impl SystemSection {
    fn default_timezone() -> String {
        "UTC".to_string()
    }
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            timezone: Self::default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MailSection {
    /// Owner of the virtual mailbox trees.
    #[serde(default = "MailSection::default_vmail_id")]
    pub vmail_uid: u32,
    #[serde(default = "MailSection::default_vmail_id")]
    pub vmail_gid: u32,
    /// Default dovecot password scheme when the secret bundle does not
    /// override it for a user.
    #[serde(default = "MailSection::default_scheme")]
    pub password_scheme: String,
}

impl MailSection {
    fn default_vmail_id() -> u32 {
        5000
    }

    fn default_scheme() -> String {
        "PLAIN".to_string()
    }
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            vmail_uid: Self::default_vmail_id(),
            vmail_gid: Self::default_vmail_id(),
            password_scheme: Self::default_scheme(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    #[serde(default = "HttpSection::default_realm")]
    pub auth_realm: String,
}

impl HttpSection {
    pub const DEFAULT_REALM: &str = "WebDAV Secure Area";

    fn default_realm() -> String {
        Self::DEFAULT_REALM.to_string()
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            auth_realm: Self::default_realm(),
        }
    }
}
