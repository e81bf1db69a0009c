use std::io::Write;

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use net_servers::{
    cert::CertificateManager,
    schema::{CertificateMode, Domain},
};
use tabwriter::TabWriter;

use crate::{output::emit, utils::open_context};

pub fn list(json: bool) -> Result<()> {
    let ctx = open_context()?;
    let certificates = CertificateManager::new().list(&ctx)?;
    emit(json, &certificates, || {
        let mut formatter = TabWriter::new(std::io::stderr());
        writeln!(&mut formatter, "DOMAIN\tMODE\tNOT AFTER\tFINGERPRINT").ok();
        for certificate in &certificates {
            writeln!(
                &mut formatter,
                "{}\t{}\t{}\t{}",
                certificate.domain,
                certificate.mode.as_str(),
                certificate.not_after,
                &certificate.fingerprint_sha256[..16.min(certificate.fingerprint_sha256.len())],
            )
            .ok();
        }
        formatter.flush().ok();
    })
}

pub fn info(args: &ArgMatches, json: bool) -> Result<()> {
    let ctx = open_context()?;
    let domain = args.get_one::<String>("DOMAIN").unwrap();
    let certificate = CertificateManager::new().info(&ctx, domain)?;
    emit(json, &certificate, || {
        println!("domain:      {}", certificate.domain);
        println!("mode:        {}", certificate.mode.as_str());
        println!("not before:  {}", certificate.not_before);
        println!("not after:   {}", certificate.not_after);
        println!("fingerprint: {}", certificate.fingerprint_sha256);
        println!("expired:     {}", certificate.is_expired());
        println!("renew soon:  {}", certificate.needs_renewal());
    })
}

fn provision(args: &ArgMatches, mode: CertificateMode) -> Result<()> {
    let ctx = open_context()?;
    let name = args.get_one::<String>("DOMAIN").unwrap();
    let domains = ctx.config()?.domains;
    let mut domain: Domain = domains
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("no such domain: {}", name))?;
    domain.certificate_mode = mode;
    CertificateManager::new().ensure(&ctx, &domain, args.get_flag("force"))?;
    Ok(())
}

pub fn provision_self_signed(args: &ArgMatches) -> Result<()> {
    provision(args, CertificateMode::SelfSigned)
}

pub fn provision_acme(args: &ArgMatches) -> Result<()> {
    provision(args, CertificateMode::Acme)
}
