//! HTTP digest authentication projection.
//!
//! Users are projected into one htdigest file per realm under
//! `<state>/apache/auth/`. Each line is
//! `<user>:<realm>:MD5(user:realm:password)`; users without a password in
//! the secret bundle are omitted with a warning.

use log::warn;
use md5::{Digest, Md5};

use super::{Plan, Synchronizer};
use crate::{context::CoreContext, watcher::Channel, Result};

pub struct HttpAuthSynchronizer;

impl HttpAuthSynchronizer {
    /// The digest hash of one user entry.
    pub fn digest(user: &str, realm: &str, password: &str) -> String {
        let hash = Md5::digest(format!("{}:{}:{}", user, realm, password).as_bytes());
        faster_hex::hex_string(hash.as_slice())
    }
}

impl Synchronizer for HttpAuthSynchronizer {
    fn name(&self) -> &'static str {
        "http-auth"
    }

    fn channels(&self) -> &'static [Channel] {
        &[Channel::Users, Channel::Secrets, Channel::Global]
    }

    fn reload_target(&self) -> Option<&'static str> {
        Some("apache")
    }

    fn wants_certificates(&self) -> bool {
        true
    }

    fn plan(&self, ctx: &CoreContext) -> Result<Plan> {
        let config = ctx.config()?;
        let realm = &config.global.http.auth_realm;

        let mut users: Vec<_> = config.users.enabled().collect();
        users.sort_unstable_by(|a, b| a.username.cmp(&b.username));

        let mut htdigest = String::new();
        for user in users {
            // plaintext secret, or a pre-computed digest on the record
            let hash = match config.secrets.password(&user.username) {
                Some(password) => Self::digest(&user.username, realm, password.expose()),
                None => {
                    let key = format!("digest-{}", realm);
                    match user.password_hashes.get(&key) {
                        Some(hash) => hash.clone(),
                        None => {
                            warn!(
                                "{}: no digest secret, omitted from realm {:?}",
                                user.username, realm
                            );
                            continue;
                        }
                    }
                }
            };
            htdigest.push_str(&format!("{}:{}:{}\n", user.username, realm, hash));
        }

        let mut plan = Plan::new();
        plan.file(
            ctx.paths()
                .apache_auth_dir()
                .join(format!("{}.htdigest", realm)),
            htdigest,
            0o644,
        );
        plan.prune_under(ctx.paths().apache_auth_dir(), false);
        Ok(plan)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use md5::{Digest, Md5};
    use test_log::test;

    use super::HttpAuthSynchronizer;
    use crate::{
        schema::{DomainsFile, SecretBundle, UsersFile},
        sync::{apply_plan, Synchronizer},
        test::{sample_domain, sample_user, save_doc, TestDir},
    };

    #[test]
    fn test_digest_value() {
        let digest = HttpAuthSynchronizer::digest("admin", "WebDAV Secure Area", "s3cret");
        assert_eq!(digest.len(), 32);
        assert_eq!(
            digest,
            format!(
                "{:x}",
                Md5::digest("admin:WebDAV Secure Area:s3cret".as_bytes())
            )
        );
    }

    #[test]
    fn test_htdigest_projection() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![sample_domain("local.dev")],
            },
        )
        .unwrap();
        save_doc(
            &ctx,
            &UsersFile {
                users: vec![sample_user("admin", "local.dev")],
            },
        )
        .unwrap();
        let mut secrets = SecretBundle::default();
        secrets.set_password("admin", "s3cret".into());
        save_doc(&ctx, &secrets).unwrap();

        let sync = HttpAuthSynchronizer;
        let plan = sync.plan(&ctx).unwrap();
        let report = apply_plan(&ctx, &sync, &plan, false);
        assert!(report.is_ok(), "{:?}", report.errors);

        let file = ctx
            .paths()
            .apache_auth_dir()
            .join("WebDAV Secure Area.htdigest");
        let content = fs::read_to_string(&file).unwrap();
        let expected = format!(
            "admin:WebDAV Secure Area:{}\n",
            HttpAuthSynchronizer::digest("admin", "WebDAV Secure Area", "s3cret")
        );
        assert_eq!(content, expected);
    }

    #[test]
    fn test_user_without_secret_is_omitted() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![sample_domain("local.dev")],
            },
        )
        .unwrap();
        save_doc(
            &ctx,
            &UsersFile {
                users: vec![sample_user("admin", "local.dev")],
            },
        )
        .unwrap();

        let sync = HttpAuthSynchronizer;
        let plan = sync.plan(&ctx).unwrap();
        let report = apply_plan(&ctx, &sync, &plan, false);
        assert!(report.is_ok());
        let content = fs::read_to_string(
            ctx.paths()
                .apache_auth_dir()
                .join("WebDAV Secure Area.htdigest"),
        )
        .unwrap();
        assert_eq!(content, "");
    }
}
