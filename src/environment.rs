//! Named, isolated deployment environments.
//!
//! The environment list and the current-environment pointer persist in
//! `config/environments.yaml`. A personal overlay
//! (`config/environments.local.yaml`), when present, fully replaces the
//! committed file for this process, so developers can point environments at
//! private base paths without editing what is checked in.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    events::{CoreEvent, EventBus},
    paths::Paths,
    schema::validate::{validate_set, ConfigSet},
    schema::{CertificateMode, Protocol},
    store::write_atomic,
    Error, Result,
};

/// Environment variable overriding the current environment for one process.
pub const CURRENT_ENV_VAR: &str = "NET_SERVERS_ENV";

/// A host-port binding for one container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// A named, isolated tree of configuration and state under one base path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    /// Unique name matching `[a-z][a-z0-9-]*`.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absolute, or resolved against the process working directory at first
    /// load and then frozen.
    pub base_path: PathBuf,
    pub domain: String,
    pub admin_email: String,
    #[serde(default = "crate::schema::default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_used: Option<OffsetDateTime>,
    #[serde(default)]
    pub certificate_mode: CertificateMode,
    /// Authoritative container-port to host-port bindings, per container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_mappings: BTreeMap<String, Vec<PortMapping>>,
}

impl Environment {
    pub fn new<N, P, D, A>(name: N, base_path: P, domain: D, admin_email: A) -> Self
    where
        N: Into<String>,
        P: Into<PathBuf>,
        D: Into<String>,
        A: Into<String>,
    {
        Self {
            name: name.into(),
            description: String::new(),
            base_path: base_path.into(),
            domain: domain.into(),
            admin_email: admin_email.into(),
            enabled: true,
            tags: vec![],
            created_at: OffsetDateTime::now_utc(),
            last_used: None,
            certificate_mode: CertificateMode::SelfSigned,
            port_mappings: BTreeMap::new(),
        }
    }

    /// The explicit host port for a container port, if mapped.
    pub fn host_port(&self, container: &str, port: u16, protocol: Protocol) -> Option<u16> {
        self.port_mappings.get(container).and_then(|mappings| {
            mappings
                .iter()
                .find(|m| m.container_port == port && m.protocol == protocol)
                .map(|m| m.host_port)
        })
    }
}

/// The `environments.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_environment: Option<String>,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

/// Registry of environments sharing one process.
pub struct EnvironmentManager {
    config_dir: PathBuf,
    source: PathBuf,
    file: EnvironmentsFile,
}

impl EnvironmentManager {
    pub const FILE: &str = "environments.yaml";
    pub const OVERLAY_FILE: &str = "environments.local.yaml";

    /// Loads the environment registry rooted at `root` (the directory
    /// containing `config/`). The overlay file wins when present.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let config_dir = root.as_ref().join(Paths::CONFIG_DIR);
        let overlay = config_dir.join(Self::OVERLAY_FILE);
        let main = config_dir.join(Self::FILE);
        let source = if overlay.is_file() { overlay } else { main };

        let text = fs::read_to_string(&source).map_err(|e| Error::io(&source, e))?;
        let file: EnvironmentsFile =
            serde_yaml::from_str(&text).map_err(|source_err| Error::ConfigParse {
                file: source.clone(),
                source: source_err,
            })?;

        let manager = Self {
            config_dir,
            source,
            file,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Creates a fresh registry with a single `development` environment
    /// rooted at `root`.
    pub fn init<P: AsRef<Path>>(root: P, force: bool) -> Result<Self> {
        let root = root.as_ref();
        let config_dir = root.join(Paths::CONFIG_DIR);
        let main = config_dir.join(Self::FILE);
        if main.exists() && !force {
            return Err(Error::io(
                &main,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "already initialized"),
            ));
        }

        let development = Environment::new("development", root, "local.dev", "admin@local.dev");
        let file = EnvironmentsFile {
            current_environment: Some("development".to_string()),
            environments: vec![development],
        };
        let manager = Self {
            config_dir,
            source: main,
            file,
        };
        manager.save()?;
        info!("initialized environment registry at {:?}", manager.source);
        Ok(manager)
    }

    /// Whether the loaded registry came from the personal overlay.
    pub fn is_overlay(&self) -> bool {
        self.source.file_name().map(|n| n.to_string_lossy().into_owned())
            == Some(Self::OVERLAY_FILE.to_string())
    }

    pub fn list(&self) -> &[Environment] {
        &self.file.environments
    }

    pub fn get(&self, name: &str) -> Result<&Environment> {
        self.file
            .environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::EnvNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Environment> {
        self.file
            .environments
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::EnvNotFound(name.to_string()))
    }

    /// The effective current environment name. `NET_SERVERS_ENV` overrides
    /// the persisted pointer for this process only.
    pub fn current_name(&self) -> Option<String> {
        if let Ok(name) = env::var(CURRENT_ENV_VAR) {
            if !name.is_empty() {
                return Some(name);
            }
        }
        self.file.current_environment.clone()
    }

    pub fn current(&self) -> Result<&Environment> {
        let name = self
            .current_name()
            .ok_or_else(|| Error::EnvNotFound("<none>".to_string()))?;
        let environment = self.get(&name)?;
        if !environment.enabled {
            return Err(Error::EnvNotEnabled(name));
        }
        Ok(environment)
    }

    pub fn info(&self, name: &str) -> Result<&Environment> {
        self.get(name)
    }

    pub fn add(&mut self, environment: Environment) -> Result<()> {
        let mut candidate = self.file.environments.clone();
        candidate.push(environment);
        validate_set(&ConfigSet {
            environments: &candidate,
            ..Default::default()
        })?;
        Self::check_base_paths(&candidate)?;
        self.file.environments = candidate;
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let environment = self.get(name)?;
        if self.current_name().as_deref() == Some(name) {
            return Err(Error::EnvCurrentRemove(name.to_string()));
        }
        let enabled_others = self
            .file
            .environments
            .iter()
            .filter(|e| e.enabled && e.name != name)
            .count();
        if environment.enabled && enabled_others == 0 {
            return Err(Error::EnvLastRemaining(name.to_string()));
        }
        self.file.environments.retain(|e| e.name != name);
        self.save()
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.get_mut(name)?.enabled = true;
        self.save()
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        if self.current_name().as_deref() == Some(name) {
            return Err(Error::EnvCurrentRemove(name.to_string()));
        }
        self.get_mut(name)?.enabled = false;
        self.save()
    }

    /// Makes `name` the current environment and stamps its `last_used`.
    ///
    /// The caller owns cache invalidation and path re-derivation; see
    /// [crate::context::CoreContext::switch].
    pub fn switch(&mut self, name: &str, events: Option<&EventBus>) -> Result<&Environment> {
        {
            let environment = self.get(name)?;
            if !environment.enabled {
                return Err(Error::EnvNotEnabled(name.to_string()));
            }
        }
        self.file.current_environment = Some(name.to_string());
        self.get_mut(name)?.last_used = Some(OffsetDateTime::now_utc());
        self.save()?;
        info!("switched to environment {}", name);
        if let Some(events) = events {
            events.publish(CoreEvent::EnvironmentSwitched {
                name: name.to_string(),
            });
        }
        self.get(name)
    }

    /// Validates the registry invariants: name format and uniqueness, an
    /// enabled current environment, distinct absolute base paths.
    pub fn validate(&self) -> Result<()> {
        validate_set(&ConfigSet {
            environments: &self.file.environments,
            ..Default::default()
        })?;
        if let Some(name) = &self.file.current_environment {
            let current = self.get(name)?;
            if !current.enabled {
                return Err(Error::EnvNotEnabled(name.clone()));
            }
        }
        Self::check_base_paths(&self.file.environments)
    }

    fn check_base_paths(environments: &[Environment]) -> Result<()> {
        let mut resolved: Vec<(&str, PathBuf)> = Vec::new();
        for environment in environments.iter().filter(|e| e.enabled) {
            let base = Paths::from_base(&environment.base_path)?.base().to_owned();
            if let Some((other, _)) = resolved.iter().find(|(_, b)| *b == base) {
                return Err(Error::PathConflict {
                    base,
                    environments: (other.to_string(), environment.name.clone()),
                });
            }
            resolved.push((&environment.name, base));
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let body = serde_yaml::to_string(&self.file).map_err(|source| Error::ConfigParse {
            file: self.source.clone(),
            source,
        })?;
        fs::create_dir_all(&self.config_dir).map_err(|e| Error::io(&self.config_dir, e))?;
        write_atomic(&self.source, body.as_bytes(), 0o644)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use test_log::test;

    use super::{Environment, EnvironmentManager};
    use crate::{test::TestDir, Error};

    fn manager(testdir: &TestDir) -> EnvironmentManager {
        let mut mgr = EnvironmentManager::init(testdir.path(), false).unwrap();
        let mut testing = Environment::new(
            "testing",
            testdir.path().join("testing"),
            "test.dev",
            "admin@test.dev",
        );
        testing.tags.push("ephemeral".to_string());
        mgr.add(testing).unwrap();
        mgr
    }

    #[test]
    fn test_init_and_reload() {
        let testdir = TestDir::new();
        let mgr = manager(&testdir);
        assert_eq!(mgr.list().len(), 2);

        let reloaded = EnvironmentManager::load(testdir.path()).unwrap();
        assert_eq!(reloaded.list(), mgr.list());
        assert_eq!(reloaded.current_name().as_deref(), Some("development"));
    }

    #[test]
    fn test_init_refuses_to_clobber() {
        let testdir = TestDir::new();
        manager(&testdir);
        assert!(EnvironmentManager::init(testdir.path(), false).is_err());
        let mgr = EnvironmentManager::init(testdir.path(), true).unwrap();
        assert_eq!(mgr.list().len(), 1);
    }

    #[test]
    fn test_switch() {
        let testdir = TestDir::new();
        let mut mgr = manager(&testdir);
        mgr.switch("testing", None).unwrap();
        assert_eq!(mgr.current().unwrap().name, "testing");
        assert!(mgr.get("testing").unwrap().last_used.is_some());

        assert!(matches!(
            mgr.switch("missing", None),
            Err(Error::EnvNotFound(_))
        ));

        mgr.switch("development", None).unwrap();
        mgr.disable("testing").unwrap();
        assert!(matches!(
            mgr.switch("testing", None),
            Err(Error::EnvNotEnabled(_))
        ));
    }

    #[test]
    fn test_remove_guards() {
        let testdir = TestDir::new();
        let mut mgr = manager(&testdir);
        assert!(matches!(
            mgr.remove("development"),
            Err(Error::EnvCurrentRemove(_))
        ));
        mgr.remove("testing").unwrap();
        assert!(matches!(mgr.get("testing"), Err(Error::EnvNotFound(_))));
        // development is now the last enabled environment and also current
        assert!(mgr.remove("development").is_err());
    }

    #[test]
    fn test_disable_current_refused() {
        let testdir = TestDir::new();
        let mut mgr = manager(&testdir);
        assert!(matches!(
            mgr.disable("development"),
            Err(Error::EnvCurrentRemove(_))
        ));
    }

    #[test]
    fn test_base_path_conflict() {
        let testdir = TestDir::new();
        let mut mgr = manager(&testdir);
        let clone = Environment::new(
            "staging",
            testdir.path().join("testing"),
            "stage.dev",
            "admin@stage.dev",
        );
        assert!(matches!(
            mgr.add(clone),
            Err(Error::PathConflict { .. })
        ));
    }

    #[test]
    fn test_overlay_replaces_committed_file() {
        let testdir = TestDir::new();
        let mgr = manager(&testdir);
        drop(mgr);

        let overlay = testdir
            .path()
            .join("config")
            .join(EnvironmentManager::OVERLAY_FILE);
        let private = Environment::new(
            "private",
            testdir.path().join("private"),
            "me.dev",
            "me@me.dev",
        );
        let file = super::EnvironmentsFile {
            current_environment: Some("private".to_string()),
            environments: vec![private],
        };
        fs::write(&overlay, serde_yaml::to_string(&file).unwrap()).unwrap();

        let mgr = EnvironmentManager::load(testdir.path()).unwrap();
        assert!(mgr.is_overlay());
        assert_eq!(mgr.list().len(), 1);
        assert_eq!(mgr.current().unwrap().name, "private");
    }
}
