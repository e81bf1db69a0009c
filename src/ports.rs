//! Environment-scoped host port resolution and conflict probing.
//!
//! Precedence: explicit mapping in the environment record, then the default
//! table bundled with the service definitions, then automatic allocation in
//! a per-environment range. Both DNS defaults (53 and 5353) are suggestions
//! only; `port_mappings` is authoritative.

use std::net::{Ipv4Addr, TcpListener, UdpSocket};

use log::warn;

use crate::{
    environment::Environment,
    runtime::Runtime,
    schema::{Protocol, ServiceConfig},
    Error, Result,
};

/// A fully resolved host binding for one container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

impl ResolvedPort {
    /// Renders the binding the way the runtime expects it
    /// (`8180:80` or `8553:53/udp`).
    pub fn publish_arg(&self) -> String {
        match self.protocol {
            Protocol::Tcp => format!("{}:{}", self.host_port, self.container_port),
            Protocol::Udp => format!("{}:{}/udp", self.host_port, self.container_port),
        }
    }
}

/// Suggested host ports per (container, container port).
const DEFAULT_HOST_PORTS: &[(&str, u16, u16)] = &[
    ("apache", 80, 8080),
    ("apache", 443, 8443),
    ("mail", 25, 2525),
    ("mail", 110, 2110),
    ("mail", 143, 2143),
    ("mail", 587, 2587),
    ("mail", 993, 2993),
    ("mail", 995, 2995),
    ("dns", 53, 5353),
];

/// Automatic allocation range for an environment.
fn auto_range(environment: &str) -> (u16, u16) {
    match environment {
        "development" => (8000, 8099),
        "testing" => (8100, 8999),
        "staging" => (9000, 9099),
        _ => (10000, 10999),
    }
}

/// Resolves every declared port of a service for an environment.
pub fn resolve_ports(
    environment: &Environment,
    container: &str,
    service: &ServiceConfig,
) -> Result<Vec<ResolvedPort>> {
    let mut resolved: Vec<ResolvedPort> = Vec::new();

    for spec in &service.ports {
        let explicit = environment.host_port(container, spec.port, spec.protocol);
        let suggested = DEFAULT_HOST_PORTS
            .iter()
            .find(|(c, port, _)| *c == container && *port == spec.port)
            .map(|(_, _, host)| *host);

        let host_port = match explicit.or(suggested) {
            Some(port) => port,
            None => allocate(environment, spec.port, &resolved)?,
        };

        if resolved
            .iter()
            .any(|p| p.host_port == host_port && p.protocol == spec.protocol)
            && explicit.is_none()
        {
            // suggested port collides inside this service; fall through to
            // the automatic range
            let host_port = allocate(environment, spec.port, &resolved)?;
            resolved.push(ResolvedPort {
                container_port: spec.port,
                host_port,
                protocol: spec.protocol,
            });
            continue;
        }

        resolved.push(ResolvedPort {
            container_port: spec.port,
            host_port,
            protocol: spec.protocol,
        });
    }

    Ok(resolved)
}

fn allocate(environment: &Environment, container_port: u16, taken: &[ResolvedPort]) -> Result<u16> {
    let (start, end) = auto_range(&environment.name);
    let span = end - start + 1;
    let preferred = start + container_port % span;
    let mut candidate = preferred;
    loop {
        if !taken.iter().any(|p| p.host_port == candidate) {
            return Ok(candidate);
        }
        candidate = if candidate == end { start } else { candidate + 1 };
        if candidate == preferred {
            return Err(Error::PortConflict {
                port: container_port,
                container: environment.name.clone(),
                holder: None,
            });
        }
    }
}

/// Whether a host port is currently free.
pub fn port_is_free(port: u16, protocol: Protocol) -> bool {
    match protocol {
        Protocol::Tcp => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
        Protocol::Udp => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok(),
    }
}

/// Probes every intended host port before a container start.
///
/// A bound port held by another environment's managed container yields
/// `PORT_CONFLICT`; a port held by an unrelated process is fatal unless
/// `force` is set.
pub fn check_conflicts(
    runtime: &Runtime,
    environment: &Environment,
    container: &str,
    ports: &[ResolvedPort],
    force: bool,
) -> Result<()> {
    let mut listing: Option<Vec<crate::runtime::PsEntry>> = None;
    for port in ports {
        if port_is_free(port.host_port, port.protocol) {
            continue;
        }
        if listing.is_none() {
            listing = Some(runtime.ps()?);
        }
        let entries = listing.as_deref().unwrap_or(&[]);
        let holder = entries
            .iter()
            .find(|e| e.host_ports().contains(&port.host_port));
        let own_name = format!("net-servers-{}-{}", container, environment.name);
        match holder {
            // the replaced incarnation of this very container may still hold
            // its ports; the supervisor stops it before running
            Some(entry) if entry.name == own_name => {}
            Some(entry) if entry.name.starts_with("net-servers-") => {
                return Err(Error::PortConflict {
                    port: port.host_port,
                    container: container.to_string(),
                    holder: Some(entry.name.clone()),
                });
            }
            _ if force => {
                warn!(
                    "{}: host port {} is bound by an unrelated process, starting anyway",
                    container, port.host_port
                );
            }
            _ => {
                return Err(Error::PortConflict {
                    port: port.host_port,
                    container: container.to_string(),
                    holder: None,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use test_log::test;

    use super::{check_conflicts, port_is_free, resolve_ports, ResolvedPort};
    use crate::{
        environment::{Environment, PortMapping},
        runtime::Runtime,
        schema::{Protocol, ServicesFile},
        Error,
    };

    fn testing_env() -> Environment {
        Environment::new("testing", "/tmp/testing", "test.dev", "admin@test.dev")
    }

    #[test]
    fn test_explicit_mapping_wins() {
        let mut env = testing_env();
        env.port_mappings.insert(
            "apache".to_string(),
            vec![PortMapping {
                container_port: 80,
                host_port: 8180,
                protocol: Protocol::Tcp,
            }],
        );
        let services = ServicesFile::default_fleet();
        let ports = resolve_ports(&env, "apache", services.get("apache").unwrap()).unwrap();
        let http = ports.iter().find(|p| p.container_port == 80).unwrap();
        assert_eq!(http.host_port, 8180);
        // 443 falls back to the suggested default
        let https = ports.iter().find(|p| p.container_port == 443).unwrap();
        assert_eq!(https.host_port, 8443);
    }

    #[test]
    fn test_dns_suggestion() {
        let env = testing_env();
        let services = ServicesFile::default_fleet();
        let ports = resolve_ports(&env, "dns", services.get("dns").unwrap()).unwrap();
        assert!(ports.iter().all(|p| p.host_port == 5353));
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_publish_arg() {
        let port = ResolvedPort {
            container_port: 53,
            host_port: 5353,
            protocol: Protocol::Udp,
        };
        assert_eq!(port.publish_arg(), "5353:53/udp");
    }

    #[test]
    fn test_bound_port_is_detected() {
        // grab an ephemeral port and keep it bound
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port, Protocol::Tcp));

        let env = testing_env();
        let ports = [ResolvedPort {
            container_port: 80,
            host_port: port,
            protocol: Protocol::Tcp,
        }];
        // `true` produces an empty ps listing: the holder is unrelated
        let runtime = Runtime::with_program("/bin/true");
        let err = check_conflicts(&runtime, &env, "apache", &ports, false).unwrap_err();
        assert!(matches!(err, Error::PortConflict { holder: None, .. }));
        // force lets an unrelated holder pass
        check_conflicts(&runtime, &env, "apache", &ports, true).unwrap();
    }
}
