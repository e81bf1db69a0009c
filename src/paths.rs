//! Canonical on-disk layout of an environment.
//!
//! Every component derives its file locations from [Paths]; nothing else in
//! the crate hard-codes a path under the environment base.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{environment::Environment, Error, Result};

/// Environment variable overriding base path resolution.
pub const BASE_ENV_VAR: &str = "NET_SERVERS_BASE";

/// Resolved paths of a single environment.
///
/// A relative `base_path` is resolved against the process working directory
/// the moment the environment is first loaded, then frozen; later `chdir`
/// calls do not move the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub(crate) const CONFIG_DIR: &str = "config";
    pub(crate) const STATE_DIR: &str = "state";
    pub(crate) const LOGS_DIR: &str = "logs";
    pub(crate) const CODE_DIR: &str = "code";

    /// Resolves the paths of an environment.
    ///
    /// `NET_SERVERS_BASE` overrides the environment's `base_path` entirely.
    pub fn resolve(environment: &Environment) -> Result<Self> {
        let declared = match env::var_os(BASE_ENV_VAR) {
            Some(base) => PathBuf::from(base),
            None => environment.base_path.clone(),
        };
        Self::from_base(declared)
    }

    /// Builds paths from an explicit base directory.
    pub fn from_base<P: Into<PathBuf>>(base: P) -> Result<Self> {
        let declared: PathBuf = base.into();
        let base = if declared.is_absolute() {
            declared
        } else {
            env::current_dir()
                .map_err(|e| Error::io(&declared, e))?
                .join(&declared)
        };
        if !base.is_absolute() {
            return Err(Error::PathNotAbsolute(base));
        }
        Ok(Self { base })
    }

    /// Returns the frozen absolute base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base.join(Self::CONFIG_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.join(Self::STATE_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join(Self::LOGS_DIR)
    }

    pub fn code_dir(&self) -> PathBuf {
        self.base.join(Self::CODE_DIR)
    }

    pub fn global_file(&self) -> PathBuf {
        self.config_dir().join("global.yaml")
    }

    pub fn users_file(&self) -> PathBuf {
        self.config_dir().join("users.yaml")
    }

    pub fn domains_file(&self) -> PathBuf {
        self.config_dir().join("domains.yaml")
    }

    pub fn environments_file(&self) -> PathBuf {
        self.config_dir().join("environments.yaml")
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.config_dir().join("secrets.yaml")
    }

    pub fn services_file(&self) -> PathBuf {
        self.config_dir().join("services").join("services.yaml")
    }

    pub fn certificates_dir(&self) -> PathBuf {
        self.state_dir().join("certificates")
    }

    /// Certificate triple directory for one domain.
    pub fn certificate_dir(&self, domain: &str) -> PathBuf {
        self.certificates_dir().join(domain)
    }

    pub fn mail_dir(&self) -> PathBuf {
        self.state_dir().join("mail")
    }

    pub fn apache_auth_dir(&self) -> PathBuf {
        self.state_dir().join("apache").join("auth")
    }

    pub fn dns_zones_dir(&self) -> PathBuf {
        self.state_dir().join("dns").join("zones")
    }

    /// Creates the directory skeleton of the environment.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.config_dir().join("services"),
            self.certificates_dir(),
            self.mail_dir(),
            self.apache_auth_dir(),
            self.dns_zones_dir(),
            self.logs_dir(),
            self.code_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(())
    }
}
