//! Mail projection: postfix lookup tables and the dovecot passwd-file.
//!
//! Outputs under `<state>/mail/`:
//! - `virtual_domains`, `virtual_mailboxes`, `virtual_aliases` lookup tables
//! - `dovecot-users` (mode 0640)
//! - `vhosts/<domain>/<user>/` mailbox trees owned by the vmail uid/gid

use std::path::PathBuf;

use log::warn;

use super::{Plan, ReloadRequest, Synchronizer};
use crate::{context::CoreContext, watcher::Channel, Result};

/// In-container mount point of the state tree.
const STATE_MOUNT: &str = "/srv/state";

pub struct MailSynchronizer;

impl Synchronizer for MailSynchronizer {
    fn name(&self) -> &'static str {
        "mail"
    }

    fn channels(&self) -> &'static [Channel] {
        &[
            Channel::Users,
            Channel::Domains,
            Channel::Secrets,
            Channel::Global,
        ]
    }

    fn reload_target(&self) -> Option<&'static str> {
        Some("mail")
    }

    fn wants_certificates(&self) -> bool {
        true
    }

    fn plan(&self, ctx: &CoreContext) -> Result<Plan> {
        let config = ctx.config()?;
        let mail_dir = ctx.paths().mail_dir();
        let vhosts = mail_dir.join("vhosts");

        let mut domain_names: Vec<&str> = config
            .domains
            .enabled()
            .map(|d| d.name.as_str())
            .collect();
        domain_names.sort_unstable();

        let mut users: Vec<_> = config.users.enabled().collect();
        users.sort_unstable_by(|a, b| a.username.cmp(&b.username));

        let mut plan = Plan::new();

        // virtual_domains: one per line with an OK token for lookup tables
        let mut virtual_domains = String::new();
        for name in &domain_names {
            virtual_domains.push_str(name);
            virtual_domains.push_str(" OK\n");
        }
        plan.file(mail_dir.join("virtual_domains"), virtual_domains, 0o644);

        // virtual_mailboxes and the mailbox directory tree
        let mut virtual_mailboxes = String::new();
        let owner = (config.global.mail.vmail_uid, config.global.mail.vmail_gid);
        for user in &users {
            for domain in &user.domains {
                if !domain_names.contains(&domain.as_str()) {
                    continue;
                }
                virtual_mailboxes.push_str(&format!(
                    "{}@{} {}\n",
                    user.username,
                    domain,
                    user.mailbox_path(domain)
                ));
                plan.dir(vhosts.join(domain).join(&user.username), Some(owner));
            }
        }
        plan.file(mail_dir.join("virtual_mailboxes"), virtual_mailboxes, 0o644);

        // explicit aliases plus the postmaster fallback to the first admin
        let mut virtual_aliases = String::new();
        for domain in config.domains.enabled() {
            for (alias, destination) in &domain.mail_aliases {
                virtual_aliases.push_str(&format!("{}@{} {}\n", alias, domain.name, destination));
            }
            if !domain.mail_aliases.contains_key("postmaster") {
                let admin = users
                    .iter()
                    .find(|u| u.is_admin() && u.domains.contains(&domain.name));
                if let Some(admin) = admin {
                    virtual_aliases.push_str(&format!(
                        "postmaster@{} {}@{}\n",
                        domain.name, admin.username, domain.name
                    ));
                }
            }
        }
        plan.file(mail_dir.join("virtual_aliases"), virtual_aliases, 0o644);

        // dovecot passwd-file
        let mut dovecot_users = String::new();
        for user in &users {
            // plaintext from the secret bundle, or a pre-computed hash
            let entry = match config.secrets.password(&user.username) {
                Some(password) => Some((
                    config
                        .secrets
                        .scheme(&user.username, &config.global.mail.password_scheme)
                        .to_string(),
                    password.expose().to_string(),
                )),
                None => ["sha512-crypt", "plain"].iter().find_map(|scheme| {
                    user.password_hashes
                        .get(*scheme)
                        .map(|hash| (scheme.to_ascii_uppercase(), hash.clone()))
                }),
            };
            let Some((scheme, credential)) = entry else {
                warn!(
                    "{}: no password in the secret bundle or hash on the record, omitted from dovecot-users",
                    user.username
                );
                continue;
            };
            for domain in &user.domains {
                if !domain_names.contains(&domain.as_str()) {
                    continue;
                }
                dovecot_users.push_str(&format!(
                    "{}@{}:{{{}}}{}:{}:{}::{}/mail/vhosts/{}/{}\n",
                    user.username,
                    domain,
                    scheme,
                    credential,
                    owner.0,
                    owner.1,
                    STATE_MOUNT,
                    domain,
                    user.username
                ));
            }
        }
        plan.file(mail_dir.join("dovecot-users"), dovecot_users, 0o640);

        plan.prune_under(&mail_dir, false);
        plan.prune_under(&vhosts, true);
        Ok(plan)
    }

    /// Alias-only changes rebuild the lookup table; anything touching the
    /// user list asks for a full service reload.
    fn reload(&self, ctx: &CoreContext, changed: &[PathBuf]) -> Result<Option<ReloadRequest>> {
        if changed.is_empty() {
            return Ok(None);
        }
        let services = ctx.config()?.services;
        let Some(service) = services.by_container("mail") else {
            return Ok(None);
        };
        if service.skip_reload {
            return Ok(None);
        }

        let aliases_only = changed
            .iter()
            .all(|p| p.file_name().map(|n| n == "virtual_aliases").unwrap_or(false));
        let command = if aliases_only {
            vec![
                "postmap".to_string(),
                format!("{}/mail/virtual_aliases", STATE_MOUNT),
            ]
        } else {
            service.reload_command_or_default()
        };
        Ok(Some(ReloadRequest {
            container: "mail".to_string(),
            command,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use test_log::test;

    use super::MailSynchronizer;
    use crate::{
        schema::{DomainsFile, SecretBundle, User, UsersFile},
        sync::Synchronizer,
        test::{sample_domain, sample_user, save_doc, TestDir},
    };

    fn seeded(testdir: &TestDir) -> crate::context::CoreContext {
        let ctx = testdir.context("dev").unwrap();
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![sample_domain("local.dev")],
            },
        )
        .unwrap();
        let mut admin = sample_user("admin", "local.dev");
        admin.roles.insert(User::ROLE_ADMIN.to_string());
        save_doc(&ctx, &UsersFile { users: vec![admin] }).unwrap();
        let mut secrets = SecretBundle::default();
        secrets.set_password("admin", "s3cret".into());
        save_doc(&ctx, &secrets).unwrap();
        ctx
    }

    fn apply(ctx: &crate::context::CoreContext) -> crate::sync::SyncReport {
        let sync = MailSynchronizer;
        let plan = sync.plan(ctx).unwrap();
        crate::sync::apply_plan(ctx, &sync, &plan, false)
    }

    #[test]
    fn test_projections() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        let report = apply(&ctx);
        assert!(report.is_ok(), "{:?}", report.errors);

        let mail = ctx.paths().mail_dir();
        assert_eq!(
            fs::read_to_string(mail.join("virtual_domains")).unwrap(),
            "local.dev OK\n"
        );
        assert_eq!(
            fs::read_to_string(mail.join("virtual_mailboxes")).unwrap(),
            "admin@local.dev local.dev/admin/\n"
        );
        assert!(fs::read_to_string(mail.join("dovecot-users"))
            .unwrap()
            .contains("admin@local.dev:{PLAIN}s3cret"));
        assert_eq!(
            fs::read_to_string(mail.join("virtual_aliases")).unwrap(),
            "postmaster@local.dev admin@local.dev\n"
        );
        assert!(mail.join("vhosts/local.dev/admin").is_dir());
    }

    #[test]
    fn test_dovecot_users_mode() {
        use std::os::unix::fs::PermissionsExt;

        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        apply(&ctx);
        let mode = fs::metadata(ctx.paths().mail_dir().join("dovecot-users"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_user_without_password_is_omitted() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        save_doc(&ctx, &SecretBundle::default()).unwrap();
        apply(&ctx);
        assert_eq!(
            fs::read_to_string(ctx.paths().mail_dir().join("dovecot-users")).unwrap(),
            ""
        );
    }

    #[test]
    fn test_domain_rename_moves_mailboxes() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        apply(&ctx);
        let vhosts = ctx.paths().mail_dir().join("vhosts");
        fs::write(vhosts.join("local.dev/admin/stored-mail"), "keep me").unwrap();

        // rename the domain and move the users over
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![sample_domain("dev.local")],
            },
        )
        .unwrap();
        let mut admin = sample_user("admin", "dev.local");
        admin.roles.insert(User::ROLE_ADMIN.to_string());
        save_doc(&ctx, &UsersFile { users: vec![admin] }).unwrap();

        let report = apply(&ctx);
        assert!(report.is_ok(), "{:?}", report.errors);

        // moved, not duplicated
        assert!(!vhosts.join("local.dev").exists());
        assert_eq!(
            fs::read_to_string(vhosts.join("dev.local/admin/stored-mail")).unwrap(),
            "keep me"
        );
        let mailboxes =
            fs::read_to_string(ctx.paths().mail_dir().join("virtual_mailboxes")).unwrap();
        assert_eq!(mailboxes, "admin@dev.local dev.local/admin/\n");
    }

    #[test]
    fn test_alias_only_change_requests_table_rebuild() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        let sync = MailSynchronizer;

        let full = sync
            .reload(
                &ctx,
                &[ctx.paths().mail_dir().join("virtual_mailboxes")],
            )
            .unwrap()
            .unwrap();
        assert_eq!(full.command, vec!["postfix", "reload"]);

        let tables = sync
            .reload(&ctx, &[ctx.paths().mail_dir().join("virtual_aliases")])
            .unwrap()
            .unwrap();
        assert_eq!(tables.command[0], "postmap");
    }
}
