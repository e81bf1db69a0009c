use std::{io::Write, sync::mpsc::sync_channel};

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use log::info;
use net_servers::{
    schema::{CertificateMode, Domain, User},
    sync::DiffAction,
    watcher::{Watcher, WatcherOptions},
};
use serde_json::json;
use tabwriter::TabWriter;

use crate::{
    logger::style_bool,
    output::emit,
    utils::{engine, open_context},
};

pub fn init() -> Result<()> {
    let ctx = open_context()?;
    ctx.store().initialize_defaults()?;
    info!("configuration initialized under {:?}", ctx.paths().base());
    Ok(())
}

pub fn validate(json: bool) -> Result<()> {
    let ctx = open_context()?;
    ctx.config()?.validate()?;
    emit(json, &json!({ "valid": true }), || {
        println!("configuration is valid");
    })
}

pub fn sync(args: &ArgMatches, json: bool) -> Result<()> {
    let ctx = open_context()?;
    let engine = engine();

    if args.get_flag("dry-run") {
        let diffs = engine.dry_run(&ctx)?;
        if json {
            let value = diffs
                .iter()
                .map(|(name, entries)| {
                    json!({
                        "synchronizer": name,
                        "entries": entries
                            .iter()
                            .map(|e| json!({
                                "path": e.path,
                                "action": format!("{:?}", e.action).to_lowercase(),
                            }))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }
        for (name, entries) in diffs {
            for entry in entries {
                let marker = match entry.action {
                    DiffAction::Create => "+",
                    DiffAction::Update => "~",
                    DiffAction::Remove => "-",
                    DiffAction::Unchanged => continue,
                };
                println!("{} {} {}", marker, name, entry.path.display());
            }
        }
        return Ok(());
    }

    let reports = engine.reconcile_all(&ctx)?;
    if json {
        let value = reports
            .iter()
            .map(|r| {
                json!({
                    "synchronizer": r.synchronizer,
                    "written": r.written,
                    "removed": r.removed,
                    "unchanged": r.unchanged,
                    "reload_requested": r.reload_requested,
                    "errors": r.errors
                        .iter()
                        .map(|(path, message)| json!({ "path": path, "message": message }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    let failures: usize = reports.iter().map(|r| r.errors.len()).sum();
    if failures > 0 {
        return Err(anyhow!("{} file(s) failed to synchronize", failures));
    }
    Ok(())
}

pub fn watch() -> Result<()> {
    let ctx = open_context()?;
    let engine = engine();
    let watcher = Watcher::start(ctx.paths().config_dir(), WatcherOptions::default())?;

    let (stop_tx, stop_rx) = sync_channel(1);
    ctrlc::set_handler(move || {
        stop_tx.try_send(()).ok();
    })?;

    info!(
        "watching {} (Ctrl-C to stop)",
        ctx.paths().config_dir().display()
    );
    // settle once before waiting for edits
    engine.reconcile_all(&ctx)?;
    engine.run(&ctx, &watcher, stop_rx)?;
    engine.reloads().close();
    watcher.close()?;
    Ok(())
}

pub fn user_add(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let username = args.get_one::<String>("USERNAME").unwrap();

    let mut user = User {
        username: username.clone(),
        email: args.get_one::<String>("email").unwrap().clone(),
        domains: args
            .get_many::<String>("domain")
            .unwrap()
            .cloned()
            .collect(),
        mailbox_quota: args.get_one::<String>("quota").unwrap().clone(),
        ..Default::default()
    };
    if args.get_flag("admin") {
        user.roles.insert(User::ROLE_ADMIN.to_string());
    }

    let mut users = ctx.store().load_or_default::<net_servers::schema::UsersFile>()?
        .as_ref()
        .clone();
    users.users.push(user);

    let mut tx = ctx.store().transaction();
    tx.stage_users(users);
    if let Some(password) = args.get_one::<String>("password") {
        let mut secrets = ctx
            .store()
            .load_or_default::<net_servers::SecretBundle>()?
            .as_ref()
            .clone();
        secrets.set_password(username, password.as_str().into());
        tx.stage_secrets(secrets);
    }
    tx.commit()?;
    info!("user {} added", username);
    Ok(())
}

pub fn user_list(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let users = ctx.config()?.users;
    emit(
        json,
        &users
            .users
            .iter()
            .map(|u| serde_json::to_value(u).unwrap_or_default())
            .collect::<Vec<_>>(),
        || {
            let mut formatter = TabWriter::new(std::io::stderr());
            writeln!(&mut formatter, "USERNAME\tEMAIL\tDOMAINS\tENABLED\tADMIN").ok();
            for user in &users.users {
                writeln!(
                    &mut formatter,
                    "{}\t{}\t{}\t{}\t{}",
                    user.username,
                    user.email,
                    user.domains.join(","),
                    style_bool(user.enabled),
                    style_bool(user.is_admin()),
                )
                .ok();
            }
            formatter.flush().ok();
        },
    )
}

pub fn user_delete(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let username = args.get_one::<String>("USERNAME").unwrap();

    let mut users = ctx
        .store()
        .load_or_default::<net_servers::schema::UsersFile>()?
        .as_ref()
        .clone();
    let before = users.users.len();
    users.users.retain(|u| u.username != *username);
    if users.users.len() == before {
        return Err(anyhow!("no such user: {}", username));
    }

    let mut secrets = ctx
        .store()
        .load_or_default::<net_servers::SecretBundle>()?
        .as_ref()
        .clone();
    secrets.users.remove(username);

    let mut tx = ctx.store().transaction();
    tx.stage_users(users).stage_secrets(secrets);
    tx.commit()?;
    info!("user {} deleted", username);
    Ok(())
}

pub fn domain_add(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let name = args.get_one::<String>("NAME").unwrap();

    let mut domain = Domain::new(name.clone());
    // the environment's certificate policy seeds new domains
    domain.certificate_mode = match args.get_one::<String>("certificate-mode") {
        Some(mode) => match mode.as_str() {
            "self_signed" => CertificateMode::SelfSigned,
            "acme" => CertificateMode::Acme,
            _ => CertificateMode::None,
        },
        None => ctx.environment().certificate_mode,
    };
    if let Some(mx) = args.get_many::<String>("mx") {
        domain.mx_records = mx.cloned().collect();
    }
    if let Some(records) = args.get_many::<String>("a-record") {
        for record in records {
            let (short, address) = record
                .split_once('=')
                .ok_or_else(|| anyhow!("--a-record expects name=ipv4, got {:?}", record))?;
            domain.a_records.insert(short.to_string(), address.parse()?);
        }
    }

    let mut domains = ctx
        .store()
        .load_or_default::<net_servers::schema::DomainsFile>()?
        .as_ref()
        .clone();
    domains.domains.push(domain);
    let mut tx = ctx.store().transaction();
    tx.stage_domains(domains);
    tx.commit()?;
    info!("domain {} added", name);
    Ok(())
}

pub fn domain_list(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let domains = ctx.config()?.domains;
    emit(
        json,
        &domains
            .domains
            .iter()
            .map(|d| serde_json::to_value(d).unwrap_or_default())
            .collect::<Vec<_>>(),
        || {
            let mut formatter = TabWriter::new(std::io::stderr());
            writeln!(&mut formatter, "NAME\tENABLED\tCERT\tMX\tA-RECORDS").ok();
            for domain in &domains.domains {
                writeln!(
                    &mut formatter,
                    "{}\t{}\t{}\t{}\t{}",
                    domain.name,
                    style_bool(domain.enabled),
                    domain.certificate_mode.as_str(),
                    domain.mx_records.join(","),
                    domain.a_records.len(),
                )
                .ok();
            }
            formatter.flush().ok();
        },
    )
}
