use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A container port a service declares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

/// Per-service configuration: container binding, SSL, declared ports and
/// opaque service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Which managed container runs this service (`apache`, `mail`, `dns`).
    pub container_ref: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Suppress automatic reloads after projection changes.
    #[serde(default)]
    pub skip_reload: bool,
    /// Graceful reload command executed inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_command: Option<Vec<String>>,
    /// Zone validation command, `dns` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_check_command: Option<Vec<String>>,
    /// Self-test command executed inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<Vec<String>>,
    /// Opaque settings forwarded as container environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceConfig {
    pub fn new<S: Into<String>>(container_ref: S) -> Self {
        Self {
            container_ref: container_ref.into(),
            ssl: false,
            ports: vec![],
            skip_reload: false,
            reload_command: None,
            zone_check_command: None,
            test_command: None,
            settings: BTreeMap::new(),
        }
    }

    /// The graceful reload command, falling back to the container default.
    pub fn reload_command_or_default(&self) -> Vec<String> {
        if let Some(command) = &self.reload_command {
            return command.clone();
        }
        let default: &[&str] = match self.container_ref.as_str() {
            "apache" => &["apachectl", "-k", "graceful"],
            "mail" => &["postfix", "reload"],
            "dns" => &["rndc", "reload"],
            _ => &["true"],
        };
        default.iter().map(|s| s.to_string()).collect()
    }
}

/// The `services/services.yaml` document, keyed by service name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl ServicesFile {
    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// The service bound to a given container.
    pub fn by_container(&self, container: &str) -> Option<&ServiceConfig> {
        self.services
            .values()
            .find(|s| s.container_ref == container)
    }

    /// The shipped fleet: HTTP, combined mail and authoritative DNS.
    pub fn default_fleet() -> Self {
        let mut services = BTreeMap::new();

        let mut apache = ServiceConfig::new("apache");
        apache.ssl = true;
        apache.ports = vec![PortSpec::tcp(80), PortSpec::tcp(443)];
        services.insert("apache".to_string(), apache);

        let mut mail = ServiceConfig::new("mail");
        mail.ssl = true;
        mail.ports = vec![
            PortSpec::tcp(25),
            PortSpec::tcp(110),
            PortSpec::tcp(143),
            PortSpec::tcp(587),
            PortSpec::tcp(993),
            PortSpec::tcp(995),
        ];
        services.insert("mail".to_string(), mail);

        let mut dns = ServiceConfig::new("dns");
        dns.ports = vec![PortSpec::tcp(53), PortSpec::udp(53)];
        services.insert("dns".to_string(), dns);

        Self { services }
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::ServicesFile;

    #[test]
    fn test_default_fleet_roundtrip() {
        let fleet = ServicesFile::default_fleet();
        let emitted = serde_yaml::to_string(&fleet).unwrap();
        let parsed: ServicesFile = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(parsed, fleet);
        assert_eq!(serde_yaml::to_string(&parsed).unwrap(), emitted);
    }

    #[test]
    fn test_reload_command_defaults() {
        let fleet = ServicesFile::default_fleet();
        assert_eq!(
            fleet.get("apache").unwrap().reload_command_or_default(),
            vec!["apachectl", "-k", "graceful"]
        );
        assert_eq!(
            fleet.get("dns").unwrap().reload_command_or_default(),
            vec!["rndc", "reload"]
        );
    }
}
