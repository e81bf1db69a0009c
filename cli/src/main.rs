use std::process::exit;

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use log::error;
use nix::sys::stat::{umask, Mode};

mod actions;
mod cli;
mod logger;
mod output;
mod utils;

fn main() -> Result<()> {
    // group-readable projections, nothing world-writable
    umask(Mode::S_IWGRP | Mode::S_IWOTH);

    // source .env file, ignore errors
    if std::fs::exists(".env")? {
        dotenvy::dotenv()?;
    }

    let cli = cli::build_cli();
    let version_string = cli.render_version();
    let args = cli.get_matches();

    if !args.get_flag("quiet") {
        logger::init()?;
    }

    // per-invocation overrides for the core's environment variables
    if let Some(env) = args.get_one::<String>("env") {
        std::env::set_var(net_servers::environment::CURRENT_ENV_VAR, env);
    }
    if let Some(base) = args.get_one::<String>("base") {
        std::env::set_var(net_servers::paths::BASE_ENV_VAR, base);
    }

    let json = args.get_flag("json");
    let Some(subcommand) = args.subcommand() else {
        return Ok(());
    };

    let result = match subcommand {
        ("version", _) => {
            println!("{}", version_string);
            Ok(())
        }
        ("environments", args) => dispatch_environments(args, json),
        ("container", args) => dispatch_container(args, json),
        ("config", args) => dispatch_config(args, json),
        ("certificates", args) => dispatch_certificates(args, json),
        (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
    };

    if let Err(err) = result {
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&output::error_json(&err))?
            );
        } else {
            error!("{:?}", err);
        }
        exit(output::exit_code_of(&err));
    }
    Ok(())
}

fn dispatch_environments(args: &ArgMatches, json: bool) -> Result<()> {
    match args.subcommand().unwrap() {
        ("list", _) => actions::environments::list(json),
        ("current", _) => actions::environments::current(json),
        ("add", args) => actions::environments::add(args),
        ("remove", args) => actions::environments::remove(args),
        ("enable", args) => actions::environments::enable(args),
        ("disable", args) => actions::environments::disable(args),
        ("switch", args) => actions::environments::switch(args),
        ("info", args) => actions::environments::info(args, json),
        ("init", args) => actions::environments::init(args),
        ("validate", _) => actions::environments::validate(json),
        (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
    }
}

fn dispatch_container(args: &ArgMatches, json: bool) -> Result<()> {
    match args.subcommand().unwrap() {
        ("build", args) => actions::container::build(args),
        ("run", args) => actions::container::run(args),
        ("stop", args) => actions::container::stop(args),
        ("remove", args) => actions::container::remove(args),
        ("logs", args) => actions::container::logs(args),
        ("list", _) => actions::container::list(json),
        ("test", args) => actions::container::test(args),
        ("build-all", args) => actions::container::build_all(args, json),
        ("start-all", args) => actions::container::start_all(args, json),
        ("stop-all", _) => actions::container::stop_all(json),
        ("remove-all", _) => actions::container::remove_all(json),
        ("clean-all", _) => actions::container::clean_all(json),
        (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
    }
}

fn dispatch_config(args: &ArgMatches, json: bool) -> Result<()> {
    match args.subcommand().unwrap() {
        ("init", _) => actions::config::init(),
        ("validate", _) => actions::config::validate(json),
        ("sync", args) => actions::config::sync(args, json),
        ("watch", _) => actions::config::watch(),
        ("user", args) => match args.subcommand().unwrap() {
            ("add", args) => actions::config::user_add(args),
            ("list", _) => actions::config::user_list(json),
            ("delete", args) => actions::config::user_delete(args),
            (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
        },
        ("domain", args) => match args.subcommand().unwrap() {
            ("add", args) => actions::config::domain_add(args),
            ("list", _) => actions::config::domain_list(json),
            (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
        },
        (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
    }
}

fn dispatch_certificates(args: &ArgMatches, json: bool) -> Result<()> {
    match args.subcommand().unwrap() {
        ("list", _) => actions::certificates::list(json),
        ("info", args) => actions::certificates::info(args, json),
        ("provision-self-signed", args) => actions::certificates::provision_self_signed(args),
        ("provision-acme", args) => actions::certificates::provision_acme(args),
        (cmd, _) => Err(anyhow!("unknown command: `{}`.", cmd)),
    }
}
