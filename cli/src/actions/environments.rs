use std::io::Write;

use anyhow::{bail, Result};
use clap::ArgMatches;
use console::user_attended;
use dialoguer::Confirm;
use net_servers::environment::{Environment, EnvironmentManager};
use serde_json::json;
use tabwriter::TabWriter;

use crate::{logger::style_bool, output::emit, utils::open_manager};

fn env_json(environment: &Environment) -> serde_json::Value {
    serde_json::to_value(environment).unwrap_or_default()
}

pub fn list(json: bool) -> Result<()> {
    let manager = open_manager()?;
    let current = manager.current_name();

    emit(
        json,
        &manager.list().iter().map(env_json).collect::<Vec<_>>(),
        || {
            let mut formatter = TabWriter::new(std::io::stderr());
            writeln!(&mut formatter, "NAME\tCURRENT\tENABLED\tDOMAIN\tBASE").ok();
            for environment in manager.list() {
                writeln!(
                    &mut formatter,
                    "{}\t{}\t{}\t{}\t{}",
                    environment.name,
                    style_bool(current.as_deref() == Some(environment.name.as_str())),
                    style_bool(environment.enabled),
                    environment.domain,
                    environment.base_path.display(),
                )
                .ok();
            }
            formatter.flush().ok();
        },
    )
}

pub fn current(json: bool) -> Result<()> {
    let manager = open_manager()?;
    let environment = manager.current()?;
    emit(json, &env_json(environment), || {
        println!("{}", environment.name);
    })
}

pub fn info(args: &ArgMatches, json: bool) -> Result<()> {
    let manager = open_manager()?;
    let name = args.get_one::<String>("NAME").unwrap();
    let environment = manager.info(name)?;
    emit(json, &env_json(environment), || {
        println!("name:        {}", environment.name);
        println!("description: {}", environment.description);
        println!("base path:   {}", environment.base_path.display());
        println!("domain:      {}", environment.domain);
        println!("admin email: {}", environment.admin_email);
        println!("enabled:     {}", environment.enabled);
        println!("cert mode:   {}", environment.certificate_mode.as_str());
        println!("created at:  {}", environment.created_at);
        match &environment.last_used {
            Some(at) => println!("last used:   {}", at),
            None => println!("last used:   never"),
        }
        if !environment.tags.is_empty() {
            println!("tags:        {}", environment.tags.join(", "));
        }
    })
}

pub fn add(args: &ArgMatches) -> Result<()> {
    let mut manager = open_manager()?;
    let name = args.get_one::<String>("NAME").unwrap();
    let mut environment = Environment::new(
        name,
        args.get_one::<String>("base-path").unwrap(),
        args.get_one::<String>("domain").unwrap(),
        args.get_one::<String>("admin-email").unwrap(),
    );
    if let Some(description) = args.get_one::<String>("description") {
        environment.description = description.clone();
    }
    if let Some(tags) = args.get_many::<String>("tag") {
        environment.tags = tags.cloned().collect();
    }
    manager.add(environment)?;
    Ok(())
}

pub fn remove(args: &ArgMatches) -> Result<()> {
    let mut manager = open_manager()?;
    let name = args.get_one::<String>("NAME").unwrap();
    if !args.get_flag("yes") && user_attended() {
        let confirmed = Confirm::new()
            .with_prompt(format!("Remove environment {}?", name))
            .default(false)
            .interact()?;
        if !confirmed {
            bail!("aborted");
        }
    }
    manager.remove(name)?;
    Ok(())
}

pub fn enable(args: &ArgMatches) -> Result<()> {
    let mut manager = open_manager()?;
    manager.enable(args.get_one::<String>("NAME").unwrap())?;
    Ok(())
}

pub fn disable(args: &ArgMatches) -> Result<()> {
    let mut manager = open_manager()?;
    manager.disable(args.get_one::<String>("NAME").unwrap())?;
    Ok(())
}

pub fn switch(args: &ArgMatches) -> Result<()> {
    let mut manager = open_manager()?;
    let name = args.get_one::<String>("NAME").unwrap();
    let environment = manager.switch(name, None)?;
    // derive paths and the directory skeleton for the new environment
    net_servers::context::CoreContext::new(environment.clone())?;
    Ok(())
}

pub fn init(args: &ArgMatches) -> Result<()> {
    let root = match std::env::var_os("NET_SERVERS_BASE") {
        Some(base) => std::path::PathBuf::from(base),
        None => std::env::current_dir()?,
    };
    EnvironmentManager::init(&root, args.get_flag("force"))?;
    Ok(())
}

pub fn validate(json: bool) -> Result<()> {
    let manager = open_manager()?;
    manager.validate()?;
    emit(json, &json!({ "valid": true }), || {
        println!("environment registry is valid");
    })
}
