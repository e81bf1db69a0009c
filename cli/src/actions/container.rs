use std::io::Write;

use anyhow::Result;
use clap::ArgMatches;
use net_servers::{container::ContainerSupervisor, runtime::Runtime};
use serde_json::json;
use tabwriter::TabWriter;

use crate::{
    output::emit,
    utils::{create_spinner, open_context},
};

fn supervisor() -> Result<ContainerSupervisor> {
    Ok(ContainerSupervisor::new(Runtime::detect()?))
}

pub fn build(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let service = args.get_one::<String>("SERVICE").unwrap();
    let spinner = create_spinner("Building image ...", 200);
    supervisor()?.build(&ctx, service, args.get_flag("rebuild"))?;
    spinner.finish_with_message("Done.");
    Ok(())
}

pub fn run(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let service = args.get_one::<String>("SERVICE").unwrap();
    supervisor()?.run(&ctx, service, args.get_flag("force-port"))?;
    Ok(())
}

pub fn stop(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let spinner = create_spinner("Stopping container ...", 200);
    supervisor()?.stop(&ctx, args.get_one::<String>("SERVICE").unwrap())?;
    spinner.finish_with_message("Done.");
    Ok(())
}

pub fn remove(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    supervisor()?.remove(&ctx, args.get_one::<String>("SERVICE").unwrap())?;
    Ok(())
}

pub fn logs(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let output = supervisor()?.logs(&ctx, args.get_one::<String>("SERVICE").unwrap())?;
    print!("{}", output);
    Ok(())
}

pub fn list(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let containers = supervisor()?.list(&ctx)?;
    emit(
        json,
        &containers
            .iter()
            .map(|c| json!({ "name": c.name, "ports": c.ports }))
            .collect::<Vec<_>>(),
        || {
            let mut formatter = TabWriter::new(std::io::stderr());
            writeln!(&mut formatter, "NAME\tPORTS").ok();
            for container in &containers {
                writeln!(&mut formatter, "{}\t{}", container.name, container.ports).ok();
            }
            formatter.flush().ok();
        },
    )
}

pub fn test(args: &ArgMatches) -> Result<()> {
    let ctx = open_context()?;
    let output = supervisor()?.test(&ctx, args.get_one::<String>("SERVICE").unwrap())?;
    print!("{}", output);
    Ok(())
}

fn finish_batch(report: net_servers::container::BatchReport, json: bool) -> Result<()> {
    if json {
        let value = report
            .results
            .iter()
            .map(|(name, result)| {
                json!({
                    "service": name,
                    "ok": result.is_ok(),
                    "error": result.as_ref().err().map(|e| e.to_string()),
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    report.into_first_error()?;
    Ok(())
}

pub fn build_all(args: &ArgMatches, json: bool) -> Result<()> {
    let ctx = open_context()?;
    let report = supervisor()?.build_all(&ctx, args.get_flag("rebuild"))?;
    finish_batch(report, json)
}

pub fn start_all(args: &ArgMatches, json: bool) -> Result<()> {
    let ctx = open_context()?;
    let report = supervisor()?.start_all(&ctx, args.get_flag("force-port"))?;
    finish_batch(report, json)
}

pub fn stop_all(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let report = supervisor()?.stop_all(&ctx)?;
    finish_batch(report, json)
}

pub fn remove_all(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let report = supervisor()?.remove_all(&ctx)?;
    finish_batch(report, json)
}

pub fn clean_all(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let report = supervisor()?.clean_all(&ctx)?;
    finish_batch(report, json)
}
