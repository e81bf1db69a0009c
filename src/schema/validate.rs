//! Composable semantic validation over the parsed configuration.
//!
//! Rules accumulate [ValidationIssue]s instead of failing fast, so one
//! malformed user does not mask an unrelated domain problem. Each issue
//! carries the document path (`users[3].email`) and the rule name.

use std::collections::BTreeSet;
use std::fmt;

use crate::environment::Environment;
use crate::{Error, Result};

use super::{parse_size, Domain, GlobalConfig, ServicesFile, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Document path, e.g. `users[3].email`.
    pub path: String,
    /// Rule name, e.g. `email_format`.
    pub rule: &'static str,
    pub message: String,
}

impl ValidationIssue {
    pub fn new<P: Into<String>, M: Into<String>>(path: P, rule: &'static str, message: M) -> Self {
        Self {
            path: path.into(),
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.rule, self.message)
    }
}

/// A view over every document taking part in cross-document validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigSet<'a> {
    pub global: Option<&'a GlobalConfig>,
    pub users: &'a [User],
    pub domains: &'a [Domain],
    pub services: Option<&'a ServicesFile>,
    pub environments: &'a [Environment],
}

type Rule = fn(&ConfigSet, &mut Vec<ValidationIssue>);

const RULES: &[Rule] = &[
    unique_usernames,
    username_format,
    email_format,
    user_domains_exist,
    quota_format,
    fqdn_format,
    mx_targets_resolve,
    port_ranges,
    env_name_format,
];

/// Runs every rule; returns `CONFIG_VALIDATE` carrying all issues found.
pub fn validate_set(set: &ConfigSet) -> Result<()> {
    let mut issues = Vec::new();
    for rule in RULES {
        rule(set, &mut issues);
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::ConfigValidate(issues))
    }
}

fn unique_usernames(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    let mut seen = BTreeSet::new();
    for (i, user) in set.users.iter().enumerate() {
        if !seen.insert(user.username.as_str()) {
            issues.push(ValidationIssue::new(
                format!("users[{}].username", i),
                "unique_usernames",
                format!("duplicate username {}", user.username),
            ));
        }
    }
}

fn username_format(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    for (i, user) in set.users.iter().enumerate() {
        if !is_dns_label(&user.username) || user.username.chars().any(|c| c.is_ascii_uppercase()) {
            issues.push(ValidationIssue::new(
                format!("users[{}].username", i),
                "username_format",
                "usernames must be lowercase DNS-label-safe",
            ));
        }
    }
}

fn email_format(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    for (i, user) in set.users.iter().enumerate() {
        if !is_email(&user.email) {
            issues.push(ValidationIssue::new(
                format!("users[{}].email", i),
                "email_format",
                format!("not a valid address: {}", user.email),
            ));
        }
    }
    if let Some(global) = set.global {
        if !is_email(&global.system.admin_email) {
            issues.push(ValidationIssue::new(
                "system.admin_email",
                "email_format",
                format!("not a valid address: {}", global.system.admin_email),
            ));
        }
    }
    for (i, env) in set.environments.iter().enumerate() {
        if !is_email(&env.admin_email) {
            issues.push(ValidationIssue::new(
                format!("environments[{}].admin_email", i),
                "email_format",
                format!("not a valid address: {}", env.admin_email),
            ));
        }
    }
}

fn user_domains_exist(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    let known: BTreeSet<&str> = set.domains.iter().map(|d| d.name.as_str()).collect();
    for (i, user) in set.users.iter().enumerate() {
        if user.domains.is_empty() {
            issues.push(ValidationIssue::new(
                format!("users[{}].domains", i),
                "user_domains_exist",
                "at least one domain is required",
            ));
        }
        for (j, domain) in user.domains.iter().enumerate() {
            if !known.contains(domain.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("users[{}].domains[{}]", i, j),
                    "user_domains_exist",
                    format!("unknown domain {}", domain),
                ));
            }
        }
    }
}

fn quota_format(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    for (i, user) in set.users.iter().enumerate() {
        if parse_size(&user.mailbox_quota).is_none() {
            issues.push(ValidationIssue::new(
                format!("users[{}].mailbox_quota", i),
                "quota_format",
                format!("not a size: {}", user.mailbox_quota),
            ));
        }
    }
}

fn fqdn_format(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    for (i, domain) in set.domains.iter().enumerate() {
        if !is_fqdn(&domain.name) {
            issues.push(ValidationIssue::new(
                format!("domains[{}].name", i),
                "fqdn_format",
                format!("not a FQDN: {}", domain.name),
            ));
        }
    }
    if let Some(global) = set.global {
        if !is_fqdn(&global.system.domain) {
            issues.push(ValidationIssue::new(
                "system.domain",
                "fqdn_format",
                format!("not a FQDN: {}", global.system.domain),
            ));
        }
    }
}

fn mx_targets_resolve(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    for (i, domain) in set.domains.iter().enumerate() {
        for (j, target) in domain.mx_records.iter().enumerate() {
            if domain.external_mx.contains(target) {
                continue;
            }
            let resolves = set
                .domains
                .iter()
                .any(|d| d.a_records.keys().any(|short| d.fqdn_of(short) == *target));
            if !resolves {
                issues.push(ValidationIssue::new(
                    format!("domains[{}].mx_records[{}]", i, j),
                    "mx_targets_resolve",
                    format!(
                        "{} has no A record in any domain and is not marked external",
                        target
                    ),
                ));
            }
        }
    }
}

fn port_ranges(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    if let Some(services) = set.services {
        for (name, service) in &services.services {
            for (j, spec) in service.ports.iter().enumerate() {
                if spec.port == 0 {
                    issues.push(ValidationIssue::new(
                        format!("services.{}.ports[{}]", name, j),
                        "port_ranges",
                        "container port must be non-zero",
                    ));
                }
            }
        }
    }
    for (i, env) in set.environments.iter().enumerate() {
        for (container, mappings) in &env.port_mappings {
            let mut bound = BTreeSet::new();
            for (j, mapping) in mappings.iter().enumerate() {
                if mapping.host_port == 0 || mapping.container_port == 0 {
                    issues.push(ValidationIssue::new(
                        format!("environments[{}].port_mappings.{}[{}]", i, container, j),
                        "port_ranges",
                        "ports must be non-zero",
                    ));
                }
                if !bound.insert((mapping.host_port, mapping.protocol)) {
                    issues.push(ValidationIssue::new(
                        format!("environments[{}].port_mappings.{}[{}]", i, container, j),
                        "port_ranges",
                        format!("host port {} mapped twice", mapping.host_port),
                    ));
                }
            }
        }
    }
}

fn env_name_format(set: &ConfigSet, issues: &mut Vec<ValidationIssue>) {
    let mut seen = BTreeSet::new();
    for (i, env) in set.environments.iter().enumerate() {
        if !is_env_name(&env.name) {
            issues.push(ValidationIssue::new(
                format!("environments[{}].name", i),
                "env_name_format",
                "names match [a-z][a-z0-9-]*",
            ));
        }
        if !seen.insert(env.name.as_str()) {
            issues.push(ValidationIssue::new(
                format!("environments[{}].name", i),
                "env_name_format",
                format!("duplicate environment {}", env.name),
            ));
        }
    }
}

/// `[a-z][a-z0-9-]*`, no leading/trailing hyphen beyond the first-char rule.
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// A single DNS label: 1-63 chars, alphanumeric or hyphen, no edge hyphens.
pub fn is_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// At least two dot-separated DNS labels.
pub fn is_fqdn(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    let labels: Vec<&str> = name.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| is_dns_label(l))
}

/// `local@fqdn` with a non-empty, space-free local part.
pub fn is_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains(char::is_whitespace)
        && !local.contains('@')
        && is_fqdn(domain)
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::{is_email, is_env_name, is_fqdn, validate_set, ConfigSet};
    use crate::schema::{Domain, User};
    use crate::Error;

    #[test]
    fn test_formats() {
        assert!(is_fqdn("local.dev"));
        assert!(is_fqdn("mail.local.dev"));
        assert!(!is_fqdn("localhost"));
        assert!(!is_fqdn("-bad.dev"));
        assert!(is_email("admin@local.dev"));
        assert!(!is_email("admin"));
        assert!(!is_email("a b@local.dev"));
        assert!(is_env_name("testing"));
        assert!(is_env_name("dev-2"));
        assert!(!is_env_name("2dev"));
        assert!(!is_env_name("Dev"));
    }

    #[test]
    fn test_issues_accumulate() {
        let users = vec![
            User {
                username: "Admin".to_string(),
                email: "broken".to_string(),
                domains: vec!["missing.dev".to_string()],
                ..Default::default()
            },
            User {
                username: "admin".to_string(),
                email: "admin@local.dev".to_string(),
                domains: vec!["local.dev".to_string()],
                ..Default::default()
            },
        ];
        let domains = vec![Domain::new("local.dev")];
        let set = ConfigSet {
            users: &users,
            domains: &domains,
            ..Default::default()
        };
        let err = validate_set(&set).unwrap_err();
        match err {
            Error::ConfigValidate(issues) => {
                let rules: Vec<&str> = issues.iter().map(|i| i.rule).collect();
                assert!(rules.contains(&"username_format"));
                assert!(rules.contains(&"email_format"));
                assert!(rules.contains(&"user_domains_exist"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_mx_external_marker() {
        let mut domain = Domain::new("local.dev");
        domain.mx_records.push("mx.example.org".to_string());
        let domains = vec![domain.clone()];
        let set = ConfigSet {
            domains: &domains,
            ..Default::default()
        };
        assert!(validate_set(&set).is_err());

        domain.external_mx.insert("mx.example.org".to_string());
        let domains = vec![domain];
        let set = ConfigSet {
            domains: &domains,
            ..Default::default()
        };
        validate_set(&set).unwrap();
    }
}
