//! Typed configuration records and their validation rules.
//!
//! Each record parses strictly from YAML, emits canonical YAML (stable key
//! order, two-space indent, LF endings, trailing newline) and validates
//! through the composable rule list in [validate].

mod domain;
mod global;
mod secrets;
mod service;
mod user;
pub mod validate;

pub use domain::{CertificateMode, Domain, DomainsFile};
pub use global::{GlobalConfig, HttpSection, MailSection, SystemSection};
pub use secrets::{AcmeSecrets, Secret, SecretBundle, UserSecrets};
pub use service::{PortSpec, Protocol, ServiceConfig, ServicesFile};
pub use user::{User, UsersFile};

pub(crate) fn default_true() -> bool {
    true
}

/// Parses a human-readable size such as `512M` or `1G` into bytes.
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) if pos > 0 => input.split_at(pos),
        None => (input, ""),
        Some(_) => return None,
    };
    let value: u64 = digits.parse().ok()?;
    let factor = match unit.trim() {
        "" | "B" => 1,
        "K" | "KiB" => 1024,
        "M" | "MiB" => 1024 * 1024,
        "G" | "GiB" => 1024 * 1024 * 1024,
        "T" | "TiB" => 1024u64.pow(4),
        _ => return None,
    };
    value.checked_mul(factor)
}

#[cfg(test)]
mod test {
    use super::parse_size;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("10KiB"), Some(10240));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("G1"), None);
        assert_eq!(parse_size("1X"), None);
    }
}
