//! Container supervision: composing runtime arguments from typed
//! configuration and driving the fleet.
//!
//! Image tags are `<container>:<environment>`, container names
//! `net-servers-<container>-<environment>`. Volumes mount the environment's
//! config (read-only), state and logs (read-write) and optionally the source
//! tree. Batch operations isolate failures: one container's error does not
//! short-circuit the rest.

use std::{collections::BTreeMap, path::PathBuf};

use log::{info, warn};

use crate::{
    context::CoreContext,
    ports::{check_conflicts, resolve_ports, ResolvedPort},
    reload::ReloadCoordinator,
    runtime::{PsEntry, Runtime, RELOAD_TIMEOUT},
    schema::validate::ValidationIssue,
    schema::ServiceConfig,
    Error, Result,
};

/// In-container mount points.
const CONFIG_MOUNT: &str = "/srv/config";
const STATE_MOUNT: &str = "/srv/state";
const LOGS_MOUNT: &str = "/srv/logs";
const CODE_MOUNT: &str = "/srv/code";

/// A fully composed invocation for one managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub service: String,
    pub container_ref: String,
    pub image_tag: String,
    pub container_name: String,
    pub ports: Vec<ResolvedPort>,
    /// `(host path, guest path, read_only)`
    pub volumes: Vec<(PathBuf, String, bool)>,
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Everything after the `run` verb.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
        ];
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.publish_arg());
        }
        for (host, guest, read_only) in &self.volumes {
            args.push("-v".to_string());
            let suffix = if *read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", host.display(), guest, suffix));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image_tag.clone());
        args
    }
}

/// Result of a batch operation with per-container failure isolation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<(String, Result<()>)>,
}

impl BatchReport {
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    pub fn first_error(&self) -> Option<&Error> {
        self.results.iter().find_map(|(_, r)| r.as_ref().err())
    }

    /// Collapses the batch into the first failure, for exit-status
    /// aggregation.
    pub fn into_first_error(self) -> Result<()> {
        for (_, result) in self.results {
            result?;
        }
        Ok(())
    }
}

/// Drives the external runtime for the managed fleet.
pub struct ContainerSupervisor {
    runtime: Runtime,
    reloads: Option<ReloadCoordinator>,
}

impl ContainerSupervisor {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            reloads: None,
        }
    }

    /// Wires the reload coordinator so explicit `start`/`stop` clear a
    /// `Failed` reload state.
    pub fn with_reloads(mut self, reloads: ReloadCoordinator) -> Self {
        self.reloads = Some(reloads);
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn service<'a>(
        &self,
        services: &'a crate::schema::ServicesFile,
        name: &str,
    ) -> Result<&'a ServiceConfig> {
        services.get(name).ok_or_else(|| {
            Error::ConfigValidate(vec![ValidationIssue::new(
                format!("services.{}", name),
                "service_exists",
                "no such service",
            )])
        })
    }

    /// Composes the full invocation for one service.
    pub fn spec(&self, ctx: &CoreContext, service_name: &str) -> Result<ContainerSpec> {
        let config = ctx.config()?;
        let environment = ctx.environment();
        let service = self.service(&config.services, service_name)?;
        let container = service.container_ref.clone();

        let ports = resolve_ports(environment, &container, service)?;

        let mut volumes = vec![
            (ctx.paths().config_dir(), CONFIG_MOUNT.to_string(), true),
            (ctx.paths().state_dir(), STATE_MOUNT.to_string(), false),
            (ctx.paths().logs_dir(), LOGS_MOUNT.to_string(), false),
        ];
        let code_dir = ctx.paths().code_dir();
        if code_dir.is_dir() {
            // source is writable everywhere but production
            let read_only = environment.name == "production";
            volumes.push((code_dir, CODE_MOUNT.to_string(), read_only));
        }

        let mut env = BTreeMap::new();
        env.insert("ENVIRONMENT".to_string(), environment.name.clone());
        env.insert("SERVER_DOMAIN".to_string(), environment.domain.clone());
        env.insert("ADMIN_EMAIL".to_string(), environment.admin_email.clone());
        env.insert("TZ".to_string(), config.global.system.timezone.clone());

        let cert_dir = ctx.paths().certificate_dir(&environment.domain);
        let ssl_ready = service.ssl && cert_dir.join("cert.pem").is_file();
        env.insert("SSL_ENABLED".to_string(), render_bool(ssl_ready));
        if ssl_ready {
            let guest_certs = format!("{}/certificates/{}", STATE_MOUNT, environment.domain);
            env.insert(
                "SSL_CERT_FILE".to_string(),
                format!("{}/cert.pem", guest_certs),
            );
            env.insert(
                "SSL_KEY_FILE".to_string(),
                format!("{}/privkey.pem", guest_certs),
            );
            env.insert(
                "SSL_CHAIN_FILE".to_string(),
                format!("{}/fullchain.pem", guest_certs),
            );
        }

        for (key, value) in &service.settings {
            if let Some(rendered) = render_setting(value) {
                env.insert(key.to_ascii_uppercase(), rendered);
            } else {
                warn!(
                    "{}: setting {} is not a scalar, not exported",
                    service_name, key
                );
            }
        }

        Ok(ContainerSpec {
            service: service_name.to_string(),
            image_tag: format!("{}:{}", container, environment.name),
            container_name: format!("net-servers-{}-{}", container, environment.name),
            container_ref: container,
            ports,
            volumes,
            env,
        })
    }

    /// Builds a service's image. Idempotent; `rebuild` passes the no-cache
    /// hint.
    pub fn build(&self, ctx: &CoreContext, service_name: &str, rebuild: bool) -> Result<()> {
        let spec = self.spec(ctx, service_name)?;
        let context_dir = ctx.paths().code_dir().join(&spec.container_ref);
        info!("{}: building {}", service_name, spec.image_tag);
        self.runtime.build(&spec.image_tag, &context_dir, rebuild)
    }

    /// Starts a service's container, probing every intended host port first.
    /// The probe happens before any runtime mutation.
    pub fn run(&self, ctx: &CoreContext, service_name: &str, force_port: bool) -> Result<()> {
        let spec = self.spec(ctx, service_name)?;
        check_conflicts(
            &self.runtime,
            ctx.environment(),
            &spec.container_ref,
            &spec.ports,
            force_port,
        )?;

        if self.runtime.container_exists(&spec.container_name)? {
            info!("{}: replacing existing container", spec.container_name);
            self.runtime.rm(&spec.container_name)?;
        }
        self.runtime.run(&spec.run_args())?;
        info!("{}: started", spec.container_name);
        if let Some(reloads) = &self.reloads {
            reloads.clear(&spec.container_name);
        }
        Ok(())
    }

    pub fn stop(&self, ctx: &CoreContext, service_name: &str) -> Result<()> {
        let spec = self.spec(ctx, service_name)?;
        self.runtime.stop(&spec.container_name)?;
        if let Some(reloads) = &self.reloads {
            reloads.clear(&spec.container_name);
        }
        Ok(())
    }

    pub fn remove(&self, ctx: &CoreContext, service_name: &str) -> Result<()> {
        let spec = self.spec(ctx, service_name)?;
        self.runtime.rm(&spec.container_name)
    }

    pub fn logs(&self, ctx: &CoreContext, service_name: &str) -> Result<String> {
        let spec = self.spec(ctx, service_name)?;
        self.runtime.logs(&spec.container_name)
    }

    /// Runs the service's self-test command inside its container.
    pub fn test(&self, ctx: &CoreContext, service_name: &str) -> Result<String> {
        let config = ctx.config()?;
        let service = self.service(&config.services, service_name)?;
        let spec = self.spec(ctx, service_name)?;
        let command = service
            .test_command
            .clone()
            .unwrap_or_else(|| vec!["true".to_string()]);
        self.runtime
            .exec(&spec.container_name, &command, RELOAD_TIMEOUT)
    }

    /// Containers of this environment known to the runtime.
    pub fn list(&self, ctx: &CoreContext) -> Result<Vec<PsEntry>> {
        let suffix = format!("-{}", ctx.environment().name);
        Ok(self
            .runtime
            .ps()?
            .into_iter()
            .filter(|e| e.name.starts_with("net-servers-") && e.name.ends_with(&suffix))
            .collect())
    }

    fn for_each_service<F>(&self, ctx: &CoreContext, op: F) -> Result<BatchReport>
    where
        F: Fn(&str) -> Result<()>,
    {
        let services = ctx.config()?.services;
        let mut report = BatchReport::default();
        for name in services.services.keys() {
            let result = op(name);
            if let Err(e) = &result {
                warn!("{}: {}", name, e);
            }
            report.results.push((name.clone(), result));
        }
        Ok(report)
    }

    pub fn build_all(&self, ctx: &CoreContext, rebuild: bool) -> Result<BatchReport> {
        self.for_each_service(ctx, |name| self.build(ctx, name, rebuild))
    }

    pub fn start_all(&self, ctx: &CoreContext, force_port: bool) -> Result<BatchReport> {
        self.for_each_service(ctx, |name| self.run(ctx, name, force_port))
    }

    pub fn stop_all(&self, ctx: &CoreContext) -> Result<BatchReport> {
        self.for_each_service(ctx, |name| self.stop(ctx, name))
    }

    pub fn remove_all(&self, ctx: &CoreContext) -> Result<BatchReport> {
        self.for_each_service(ctx, |name| self.remove(ctx, name))
    }

    /// Stops and removes every managed container of the environment.
    pub fn clean_all(&self, ctx: &CoreContext) -> Result<BatchReport> {
        self.for_each_service(ctx, |name| {
            self.stop(ctx, name).ok();
            self.remove(ctx, name)
        })
    }
}

fn render_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

/// Renders a scalar service setting for the container environment.
fn render_setting(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Bool(b) => Some(render_bool(*b)),
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::ContainerSupervisor;
    use crate::{runtime::Runtime, test::TestDir};

    fn supervisor() -> ContainerSupervisor {
        ContainerSupervisor::new(Runtime::with_program("/bin/true"))
    }

    #[test]
    fn test_spec_composition() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let spec = supervisor().spec(&ctx, "apache").unwrap();

        assert_eq!(spec.image_tag, "apache:dev");
        assert_eq!(spec.container_name, "net-servers-apache-dev");
        assert_eq!(spec.env.get("SSL_ENABLED").unwrap(), "false");
        assert_eq!(spec.env.get("SERVER_DOMAIN").unwrap(), "local.dev");
        assert_eq!(spec.env.get("ENVIRONMENT").unwrap(), "dev");

        let args = spec.run_args();
        assert_eq!(args[0], "-d");
        assert!(args.contains(&"net-servers-apache-dev".to_string()));
        assert_eq!(args.last().unwrap(), "apache:dev");
        // config is mounted read-only
        assert!(args
            .iter()
            .any(|a| a.ends_with(&format!("{}:ro", super::CONFIG_MOUNT))));
    }

    #[test]
    fn test_ssl_env_when_certificate_present() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();

        let mut domain = crate::test::sample_domain("local.dev");
        domain.certificate_mode = crate::schema::CertificateMode::SelfSigned;
        crate::cert::CertificateManager::new()
            .ensure(&ctx, &domain, false)
            .unwrap();

        let spec = supervisor().spec(&ctx, "apache").unwrap();
        assert_eq!(spec.env.get("SSL_ENABLED").unwrap(), "true");
        assert_eq!(
            spec.env.get("SSL_CERT_FILE").unwrap(),
            "/srv/state/certificates/local.dev/cert.pem"
        );
    }

    #[test]
    fn test_unknown_service() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        assert!(supervisor().spec(&ctx, "nope").is_err());
    }

    #[test]
    fn test_batch_isolates_failures() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        // a runtime that fails every invocation
        let supervisor = ContainerSupervisor::new(Runtime::with_program("/bin/false"));
        let report = supervisor.stop_all(&ctx).unwrap();
        // all three services were attempted despite every one failing
        assert_eq!(report.results.len(), 3);
        assert!(!report.is_ok());
        assert!(report.first_error().is_some());
    }
}
