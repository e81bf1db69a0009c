//! net-servers is a declarative control plane for a small fleet of
//! containerized network services (HTTP, mail and authoritative DNS).
//!
//! Users, domains, DNS zones, TLS certificates and deployment environments
//! are described in YAML documents under `<base>/config/`; the core keeps
//! those declarations continuously materialized into the runtime state each
//! service consumes (virtual mailbox maps, htdigest files, zone files,
//! certificate files, container environment variables and port bindings),
//! reloading running containers gracefully when their inputs change.

pub mod cert;
pub mod container;
pub mod context;
pub mod environment;
pub mod events;
pub mod paths;
pub mod ports;
pub mod reload;
pub mod runtime;
pub mod schema;
pub mod store;
pub mod sync;
pub mod watcher;

pub use cert::{CertificateInfo, CertificateManager};
pub use container::{ContainerSpec, ContainerSupervisor};
pub use context::CoreContext;
pub use environment::{Environment, EnvironmentManager, PortMapping};
pub use events::{CoreEvent, EventBus};
pub use paths::Paths;
pub use runtime::Runtime;
pub use schema::{
    CertificateMode, Domain, GlobalConfig, Protocol, SecretBundle, ServiceConfig, User,
};
pub use store::ConfigStore;
pub use watcher::{Channel, Watcher};

use std::path::PathBuf;
use std::time::Duration;

use schema::validate::ValidationIssue;

pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the configuration management core.
///
/// Every variant maps to a stable kind tag ([Error::kind]) and a CLI exit
/// code ([Error::exit_code]). Secret material never appears in messages.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Malformed YAML in {}: {source}", .file.display())]
    ConfigParse {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Configuration is invalid:\n{}", format_issues(.0))]
    ConfigValidate(Vec<ValidationIssue>),
    #[error("Transient I/O error on {}: {source}", .path.display())]
    IoTransient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    IoFatal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Some Mutex/RwLock are poisoned")]
    PoisonError,

    #[error("Environment not found: {0}")]
    EnvNotFound(String),
    #[error("Environment is not enabled: {0}")]
    EnvNotEnabled(String),
    #[error("Refusing to remove the last enabled environment: {0}")]
    EnvLastRemaining(String),
    #[error("Environment {0} is the current environment; switch away first")]
    EnvCurrentRemove(String),

    #[error("Base path does not resolve to an absolute path: {}", .0.display())]
    PathNotAbsolute(PathBuf),
    #[error("Environments {} and {} resolve to the same base path {}", .environments.0, .environments.1, .base.display())]
    PathConflict {
        base: PathBuf,
        environments: (String, String),
    },
    #[error("Host port {port} for container {container} is already bound{}", holder_hint(.holder))]
    PortConflict {
        port: u16,
        container: String,
        holder: Option<String>,
    },

    #[error("No container runtime available: {0}")]
    RuntimeUnavailable(String),
    #[error("Container runtime timed out after {timeout:?} during {operation}")]
    RuntimeTimeout {
        operation: String,
        timeout: Duration,
    },
    #[error("Container runtime failed during {operation}: {stderr}")]
    RuntimeError { operation: String, stderr: String },

    #[error("Certificate issuance failed for {domain}: {detail}")]
    CertIssueFailed { domain: String, detail: String },
    #[error("Certificate for {domain} has expired")]
    CertExpired { domain: String },
    #[error("Zone check failed for {zone}: {stderr}")]
    ZoneCheckFailed { zone: String, stderr: String },

    #[error("Reload of container {0} failed after retries")]
    ReloadFailed(String),
    #[error("Synchronizers {} and {} both claim output path {}", .synchronizers.0, .synchronizers.1, .path.display())]
    PlanConflict {
        path: PathBuf,
        synchronizers: (String, String),
    },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn holder_hint(holder: &Option<String>) -> String {
    match holder {
        Some(name) => format!(" by managed container {} (stop it or remap the port)", name),
        None => " by an unrelated process".to_string(),
    }
}

impl Error {
    /// Returns the stable kind tag of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigParse { .. } => "CONFIG_PARSE",
            Error::ConfigValidate(_) => "CONFIG_VALIDATE",
            Error::IoTransient { .. } => "IO_TRANSIENT",
            Error::IoFatal { .. } | Error::PoisonError => "IO_FATAL",
            Error::EnvNotFound(_) => "ENV_NOT_FOUND",
            Error::EnvNotEnabled(_) => "ENV_NOT_ENABLED",
            Error::EnvLastRemaining(_) => "ENV_LAST_REMAINING",
            Error::EnvCurrentRemove(_) => "ENV_CURRENT_REMOVE",
            Error::PathNotAbsolute(_) => "PATH_NOT_ABSOLUTE",
            Error::PathConflict { .. } => "PATH_CONFLICT",
            Error::PortConflict { .. } => "PORT_CONFLICT",
            Error::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            Error::RuntimeTimeout { .. } => "RUNTIME_TIMEOUT",
            Error::RuntimeError { .. } => "RUNTIME_ERROR",
            Error::CertIssueFailed { .. } => "CERT_ISSUE_FAILED",
            Error::CertExpired { .. } => "CERT_EXPIRED",
            Error::ZoneCheckFailed { .. } => "ZONE_CHECK_FAILED",
            Error::ReloadFailed(_) => "RELOAD_FAILED",
            Error::PlanConflict { .. } => "PLAN_CONFLICT",
        }
    }

    /// Returns the CLI exit code for this error.
    ///
    /// 2 validation, 3 not-found, 4 conflict, 5 runtime, 6 external service.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigParse { .. } | Error::ConfigValidate(_) | Error::PathNotAbsolute(_) => 2,
            Error::EnvNotFound(_) => 3,
            Error::EnvNotEnabled(_)
            | Error::EnvLastRemaining(_)
            | Error::EnvCurrentRemove(_)
            | Error::PathConflict { .. }
            | Error::PortConflict { .. }
            | Error::PlanConflict { .. } => 4,
            Error::IoTransient { .. }
            | Error::IoFatal { .. }
            | Error::PoisonError
            | Error::RuntimeUnavailable(_)
            | Error::RuntimeTimeout { .. }
            | Error::RuntimeError { .. }
            | Error::ReloadFailed(_) => 5,
            Error::CertIssueFailed { .. }
            | Error::CertExpired { .. }
            | Error::ZoneCheckFailed { .. } => 6,
        }
    }

    /// Classifies an I/O error as transient or fatal for the given path.
    pub(crate) fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let path = path.into();
        match source.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                Error::IoTransient { path, source }
            }
            _ => Error::IoFatal { path, source },
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::PoisonError
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::path::Path;

    use tempfile::TempDir;

    use crate::{
        context::CoreContext,
        environment::Environment,
        schema::{Domain, User},
        store::Document,
        Result,
    };

    #[derive(Debug)]
    pub struct TestDir(TempDir);

    impl AsRef<Path> for TestDir {
        fn as_ref(&self) -> &Path {
            self.0.path()
        }
    }

    impl TestDir {
        pub fn new() -> Self {
            let dir = TempDir::with_prefix("net-servers-").unwrap();
            println!("test data: {:?}", dir.path());
            Self(dir)
        }

        pub fn path(&self) -> &Path {
            self.0.path()
        }

        /// Builds an enabled environment rooted at a subdirectory.
        pub fn environment(&self, name: &str) -> Environment {
            Environment::new(name, self.path().join(name), "local.dev", "admin@local.dev")
        }

        /// Opens a context on a fresh environment with defaults initialized.
        pub fn context(&self, name: &str) -> Result<CoreContext> {
            let ctx = CoreContext::new(self.environment(name))?;
            ctx.store().initialize_defaults()?;
            Ok(ctx)
        }
    }

    pub fn sample_user(username: &str, domain: &str) -> User {
        User {
            username: username.to_string(),
            email: format!("{}@{}", username, domain),
            domains: vec![domain.to_string()],
            ..Default::default()
        }
    }

    pub fn sample_domain(name: &str) -> Domain {
        let mut domain = Domain::new(name);
        domain
            .a_records
            .insert("mail".to_string(), "10.0.0.25".parse().unwrap());
        domain
            .a_records
            .insert("www".to_string(), "10.0.0.80".parse().unwrap());
        domain.mx_records.push(format!("mail.{}", name));
        domain
    }

    /// Saves a document, bypassing cross-document validation.
    pub fn save_doc<D: Document>(ctx: &CoreContext, doc: &D) -> Result<()> {
        ctx.store().save(doc)
    }
}
