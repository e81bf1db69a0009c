//! Certificate lifecycle: self-signed issuance, ACME orders through an
//! external client, renewal windows and issuance notifications.
//!
//! Each domain's material lives under `state/certificates/<domain>/` as the
//! triple `cert.pem`, `privkey.pem`, `fullchain.pem` plus a
//! `certificate.yaml` record describing it. Issuance is announced on the
//! event bus; subscribers (mail, http) reconcile on receipt.

use std::{
    fs,
    path::PathBuf,
    process::Command,
    thread::sleep,
    time::Duration,
};

use log::{info, warn};
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{
    context::CoreContext,
    events::CoreEvent,
    schema::{CertificateMode, Domain, SecretBundle},
    store::write_atomic,
    Error, Result,
};

const VALIDITY: time::Duration = time::Duration::days(365);
const RENEWAL_WINDOW: time::Duration = time::Duration::days(30);

const PRIVKEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

/// The persisted certificate record (`certificate.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificateInfo {
    pub domain: String,
    pub mode: CertificateMode,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    /// Hex SHA-256 over the issued `cert.pem`.
    pub fingerprint_sha256: String,
}

impl CertificateInfo {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() > self.not_after
    }

    /// Within the renewal window or already expired.
    pub fn needs_renewal(&self) -> bool {
        OffsetDateTime::now_utc() + RENEWAL_WINDOW > self.not_after
    }
}

#[derive(Debug, Clone)]
struct BackoffConfig {
    base: Duration,
    cap: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

/// Issues and renews certificates for managed domains.
pub struct CertificateManager {
    acme_command: Vec<String>,
    backoff: BackoffConfig,
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateManager {
    pub fn new() -> Self {
        Self {
            acme_command: vec!["acme.sh".to_string()],
            backoff: BackoffConfig::default(),
        }
    }

    /// Overrides the external ACME client invocation.
    pub fn with_acme_command(mut self, command: Vec<String>) -> Self {
        self.acme_command = command;
        self
    }

    #[cfg(test)]
    fn with_fast_backoff(mut self) -> Self {
        self.backoff = BackoffConfig {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: 0.2,
            max_attempts: 3,
        };
        self
    }

    /// Ensures certificate material for every enabled domain whose mode
    /// requests one. Issues and renews as needed; aggregates per-domain
    /// failures after attempting every domain.
    pub fn ensure_all(&self, ctx: &CoreContext, force: bool) -> Result<Vec<CertificateInfo>> {
        let domains = ctx.config()?.domains;
        let mut issued = Vec::new();
        let mut first_error = None;
        for domain in domains.enabled() {
            match self.ensure(ctx, domain, force) {
                Ok(Some(info)) => issued.push(info),
                Ok(None) => {}
                Err(e) => {
                    warn!("{}: certificate provisioning failed: {}", domain.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(issued),
        }
    }

    /// Ensures one domain's certificate, issuing when missing, the mode
    /// changed, the renewal window opened, or `force` is set.
    pub fn ensure(
        &self,
        ctx: &CoreContext,
        domain: &Domain,
        force: bool,
    ) -> Result<Option<CertificateInfo>> {
        if domain.certificate_mode == CertificateMode::None {
            return Ok(None);
        }

        if !force {
            if let Ok(existing) = self.info(ctx, &domain.name) {
                if existing.mode == domain.certificate_mode && !existing.needs_renewal() {
                    return Ok(Some(existing));
                }
            }
        }

        let info = match domain.certificate_mode {
            CertificateMode::SelfSigned => self.issue_self_signed(ctx, domain)?,
            CertificateMode::Acme => self.issue_acme(ctx, domain)?,
            CertificateMode::None => unreachable!(),
        };

        info!(
            "{}: certificate issued ({}), expires {}",
            domain.name,
            info.mode.as_str(),
            info.not_after
        );
        ctx.events().publish(CoreEvent::CertificateIssued {
            domain: domain.name.clone(),
        });
        Ok(Some(info))
    }

    /// Reads the persisted record of a domain's certificate.
    pub fn info(&self, ctx: &CoreContext, domain: &str) -> Result<CertificateInfo> {
        let path = record_path(ctx, domain);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        serde_yaml::from_str(&text).map_err(|source| Error::ConfigParse { file: path, source })
    }

    /// Lists every provisioned certificate of the environment.
    pub fn list(&self, ctx: &CoreContext) -> Result<Vec<CertificateInfo>> {
        let dir = ctx.paths().certificates_dir();
        let mut infos = Vec::new();
        if !dir.is_dir() {
            return Ok(infos);
        }
        let mut names: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        names.sort();
        for name in names {
            if let Ok(info) = self.info(ctx, &name) {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    fn issue_self_signed(&self, ctx: &CoreContext, domain: &Domain) -> Result<CertificateInfo> {
        let mut sans = vec![domain.name.clone()];
        for short in domain.a_records.keys() {
            let fqdn = domain.fqdn_of(short);
            if !sans.contains(&fqdn) {
                sans.push(fqdn);
            }
        }

        let issue = |e: rcgen::Error| Error::CertIssueFailed {
            domain: domain.name.clone(),
            detail: e.to_string(),
        };

        let mut params = CertificateParams::new(sans).map_err(issue)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.name.clone());
        params.distinguished_name = dn;
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + VALIDITY;
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(issue)?;
        let certificate = params.self_signed(&key).map_err(issue)?;

        let cert_pem = certificate.pem();
        let key_pem = key.serialize_pem();
        // a self-signed chain is the certificate itself
        self.install(
            ctx,
            &domain.name,
            CertificateMode::SelfSigned,
            &cert_pem,
            &key_pem,
            &cert_pem,
            not_before,
            not_after,
        )
    }

    /// Drives the external ACME client with exponential backoff
    /// (base 5 s, cap 5 min, jitter ±20%).
    fn issue_acme(&self, ctx: &CoreContext, domain: &Domain) -> Result<CertificateInfo> {
        let dir = ctx.paths().certificate_dir(&domain.name);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let cert = dir.join("cert.pem");
        let key = dir.join("privkey.pem");
        let fullchain = dir.join("fullchain.pem");

        let secrets = ctx.config()?.secrets;
        let account_key = self.ensure_account_key(ctx, &secrets)?;

        let mut last_problem = String::new();
        for attempt in 0..self.backoff.max_attempts {
            if attempt > 0 {
                sleep(self.backoff_delay(attempt - 1));
            }

            let (program, base_args) = self
                .acme_command
                .split_first()
                .ok_or_else(|| Error::CertIssueFailed {
                    domain: domain.name.clone(),
                    detail: "empty ACME client command".to_string(),
                })?;
            let mut command = Command::new(program);
            command
                .args(base_args)
                .arg("--issue")
                .arg("--domain")
                .arg(&domain.name)
                .arg("--cert-file")
                .arg(&cert)
                .arg("--key-file")
                .arg(&key)
                .arg("--fullchain-file")
                .arg(&fullchain)
                .arg("--accountkey-file")
                .arg(&account_key);
            if let Some(acme) = &secrets.acme {
                if let Some(directory) = &acme.directory {
                    command.arg("--server").arg(directory);
                }
            }

            match command.output() {
                Ok(output) if output.status.success() => {
                    let not_before = OffsetDateTime::now_utc();
                    // the client reports exact validity; 90 days is the
                    // conservative floor used for the renewal schedule
                    let not_after = not_before + time::Duration::days(90);
                    let cert_pem =
                        fs::read_to_string(&cert).map_err(|e| Error::io(&cert, e))?;
                    let key_pem = fs::read_to_string(&key).map_err(|e| Error::io(&key, e))?;
                    let chain_pem = fs::read_to_string(&fullchain)
                        .map_err(|e| Error::io(&fullchain, e))?;
                    return self.install(
                        ctx,
                        &domain.name,
                        CertificateMode::Acme,
                        &cert_pem,
                        &key_pem,
                        &chain_pem,
                        not_before,
                        not_after,
                    );
                }
                Ok(output) => {
                    last_problem = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    warn!(
                        "{}: ACME attempt {} failed: {}",
                        domain.name,
                        attempt + 1,
                        last_problem
                    );
                }
                Err(e) => {
                    last_problem = e.to_string();
                    warn!(
                        "{}: ACME client could not be started: {}",
                        domain.name, last_problem
                    );
                }
            }
        }

        Err(Error::CertIssueFailed {
            domain: domain.name.clone(),
            detail: last_problem,
        })
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self
            .backoff
            .base
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.backoff.cap);
        let jitter = 1.0 + self.backoff.jitter * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        exp.mul_f64(jitter.max(0.0))
    }

    /// Generates and stores the ACME account key on first use; the key
    /// material lives in the secret bundle.
    fn ensure_account_key(&self, ctx: &CoreContext, secrets: &SecretBundle) -> Result<PathBuf> {
        let path = ctx.paths().certificates_dir().join(".acme-account.key");
        let pem = match secrets.acme.as_ref().and_then(|a| a.account_key.as_ref()) {
            Some(key) => key.expose().to_string(),
            None => {
                let key = KeyPair::generate().map_err(|e| Error::CertIssueFailed {
                    domain: "<account>".to_string(),
                    detail: e.to_string(),
                })?;
                let pem = key.serialize_pem();
                let stored = pem.clone();
                ctx.store().update::<SecretBundle, _>(move |bundle| {
                    bundle.acme.get_or_insert_with(Default::default).account_key =
                        Some(stored.into());
                    Ok(())
                })?;
                pem
            }
        };
        write_atomic(&path, pem.as_bytes(), PRIVKEY_MODE)?;
        Ok(path)
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &self,
        ctx: &CoreContext,
        domain: &str,
        mode: CertificateMode,
        cert_pem: &str,
        key_pem: &str,
        chain_pem: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<CertificateInfo> {
        let dir = ctx.paths().certificate_dir(domain);
        write_atomic(&dir.join("cert.pem"), cert_pem.as_bytes(), CERT_MODE)?;
        write_atomic(&dir.join("privkey.pem"), key_pem.as_bytes(), PRIVKEY_MODE)?;
        write_atomic(&dir.join("fullchain.pem"), chain_pem.as_bytes(), CERT_MODE)?;

        let info = CertificateInfo {
            domain: domain.to_string(),
            mode,
            not_before,
            not_after,
            fingerprint_sha256: fingerprint(cert_pem.as_bytes()),
        };
        let record = serde_yaml::to_string(&info).map_err(|source| Error::ConfigParse {
            file: record_path(ctx, domain),
            source,
        })?;
        write_atomic(&record_path(ctx, domain), record.as_bytes(), CERT_MODE)?;
        Ok(info)
    }

    /// Removes a domain's certificate material. Only explicit commands call
    /// this; renewal never deletes.
    pub fn delete(&self, ctx: &CoreContext, domain: &str) -> Result<()> {
        let dir = ctx.paths().certificate_dir(domain);
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(())
    }
}

fn record_path(ctx: &CoreContext, domain: &str) -> PathBuf {
    ctx.paths().certificate_dir(domain).join("certificate.yaml")
}

fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    faster_hex::hex_string(digest.as_slice())
}

#[cfg(test)]
mod test {
    use std::{fs, os::unix::fs::PermissionsExt};

    use test_log::test;

    use super::CertificateManager;
    use crate::{
        events::CoreEvent,
        schema::{CertificateMode, DomainsFile},
        test::{sample_domain, save_doc, TestDir},
        Error,
    };

    #[test]
    fn test_self_signed_issuance() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let rx = ctx.events().subscribe();

        let mut domain = sample_domain("local.dev");
        domain.certificate_mode = CertificateMode::SelfSigned;
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![domain.clone()],
            },
        )
        .unwrap();

        let manager = CertificateManager::new();
        let info = manager.ensure(&ctx, &domain, false).unwrap().unwrap();

        let dir = ctx.paths().certificate_dir("local.dev");
        for name in ["cert.pem", "privkey.pem", "fullchain.pem"] {
            assert!(dir.join(name).is_file(), "{} missing", name);
        }
        assert_eq!(
            fs::read(dir.join("cert.pem")).unwrap(),
            fs::read(dir.join("fullchain.pem")).unwrap()
        );
        let key_mode = fs::metadata(dir.join("privkey.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        assert!(info.not_after - info.not_before >= time::Duration::days(364));
        assert_eq!(info.fingerprint_sha256.len(), 64);
        assert!(!info.needs_renewal());

        assert_eq!(
            rx.recv().unwrap(),
            CoreEvent::CertificateIssued {
                domain: "local.dev".to_string()
            }
        );
    }

    #[test]
    fn test_ensure_is_stable_until_renewal_window() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut domain = sample_domain("local.dev");
        domain.certificate_mode = CertificateMode::SelfSigned;

        let manager = CertificateManager::new();
        let first = manager.ensure(&ctx, &domain, false).unwrap().unwrap();
        let second = manager.ensure(&ctx, &domain, false).unwrap().unwrap();
        assert_eq!(first.fingerprint_sha256, second.fingerprint_sha256);

        let forced = manager.ensure(&ctx, &domain, true).unwrap().unwrap();
        assert_ne!(first.fingerprint_sha256, forced.fingerprint_sha256);
    }

    #[test]
    fn test_mode_none_writes_nothing() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let domain = sample_domain("local.dev");
        let manager = CertificateManager::new();
        assert!(manager.ensure(&ctx, &domain, false).unwrap().is_none());
        assert!(!ctx.paths().certificate_dir("local.dev").exists());
    }

    #[test]
    fn test_acme_failure_surfaces_problem() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut domain = sample_domain("local.dev");
        domain.certificate_mode = CertificateMode::Acme;

        let manager = CertificateManager::new()
            .with_acme_command(vec!["/bin/false".to_string()])
            .with_fast_backoff();
        let err = manager.ensure(&ctx, &domain, false).unwrap_err();
        assert!(matches!(err, Error::CertIssueFailed { .. }));
    }

    #[test]
    fn test_list() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let manager = CertificateManager::new();
        assert!(manager.list(&ctx).unwrap().is_empty());

        let mut domain = sample_domain("local.dev");
        domain.certificate_mode = CertificateMode::SelfSigned;
        manager.ensure(&ctx, &domain, false).unwrap();
        let listed = manager.list(&ctx).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].domain, "local.dev");
    }
}
