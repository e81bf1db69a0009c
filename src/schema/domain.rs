use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::default_true;

/// How a certificate is provisioned for a domain or an environment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CertificateMode {
    #[default]
    None,
    SelfSigned,
    Acme,
}

impl CertificateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateMode::None => "none",
            CertificateMode::SelfSigned => "self_signed",
            CertificateMode::Acme => "acme",
        }
    }
}

/// A hosted domain: mail routing, host records and certificate policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Domain {
    /// Fully-qualified domain name.
    pub name: String,
    /// Ordered MX target hostnames. Each must resolve to an `a_records`
    /// entry of some domain, or be listed in `external_mx`.
    #[serde(default)]
    pub mx_records: Vec<String>,
    /// Short name to IPv4 address.
    #[serde(default)]
    pub a_records: BTreeMap<String, Ipv4Addr>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub certificate_mode: CertificateMode,
    /// Mail aliases, local part to destination address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mail_aliases: BTreeMap<String, String>,
    /// MX targets that are deliberately outside of managed zones.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub external_mx: BTreeSet<String>,
    /// Whether a reverse zone is emitted alongside the forward zone.
    #[serde(default)]
    pub reverse_zone: bool,
}

impl Domain {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            mx_records: vec![],
            a_records: BTreeMap::new(),
            enabled: true,
            certificate_mode: CertificateMode::default(),
            mail_aliases: BTreeMap::new(),
            external_mx: BTreeSet::new(),
            reverse_zone: false,
        }
    }

    /// The fully-qualified name of a short host record.
    pub fn fqdn_of(&self, short: &str) -> String {
        if short == "@" {
            self.name.clone()
        } else {
            format!("{}.{}", short, self.name)
        }
    }
}

/// The `domains.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DomainsFile {
    #[serde(default)]
    pub domains: Vec<Domain>,
}

impl DomainsFile {
    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter().filter(|d| d.enabled)
    }

    /// Returns whether any domain defines the given FQDN as an A record.
    pub fn resolves(&self, fqdn: &str) -> bool {
        self.domains
            .iter()
            .any(|d| d.a_records.keys().any(|short| d.fqdn_of(short) == fqdn))
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::{CertificateMode, Domain, DomainsFile};

    #[test]
    fn test_domain_roundtrip() {
        let mut domain = Domain::new("local.dev");
        domain
            .a_records
            .insert("mail".to_string(), "10.0.0.25".parse().unwrap());
        domain.mx_records.push("mail.local.dev".to_string());
        domain.certificate_mode = CertificateMode::SelfSigned;
        let file = DomainsFile {
            domains: vec![domain],
        };
        let emitted = serde_yaml::to_string(&file).unwrap();
        let parsed: DomainsFile = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(serde_yaml::to_string(&parsed).unwrap(), emitted);
    }

    #[test]
    fn test_fqdn_of() {
        let domain = Domain::new("local.dev");
        assert_eq!(domain.fqdn_of("mail"), "mail.local.dev");
        assert_eq!(domain.fqdn_of("@"), "local.dev");
    }

    #[test]
    fn test_resolves() {
        let mut domain = Domain::new("local.dev");
        domain
            .a_records
            .insert("mail".to_string(), "10.0.0.25".parse().unwrap());
        let file = DomainsFile {
            domains: vec![domain],
        };
        assert!(file.resolves("mail.local.dev"));
        assert!(!file.resolves("mail.other.dev"));
    }
}
