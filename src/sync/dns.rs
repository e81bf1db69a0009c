//! Authoritative DNS zone projection.
//!
//! For each enabled domain a forward zone (and optionally a reverse zone)
//! is emitted under `<state>/dns/zones/`. SOA serials are monotonic and
//! date-prefixed: `max(previous_serial + 1, YYYYMMDD01)`, with the serial
//! left untouched when the zone body is unchanged. Candidate zones are
//! validated with the runtime's zone-check command before installation.

use std::{fs, io::Write, path::Path, process::Command};

use log::warn;
use tempfile::NamedTempFile;
use time::OffsetDateTime;

use super::{Plan, PlanEntry, Synchronizer};
use crate::{
    context::CoreContext,
    schema::{Domain, GlobalConfig},
    watcher::Channel,
    Error, Result,
};

const DEFAULT_ZONE_CHECK: &str = "named-checkzone";

pub struct DnsSynchronizer;

impl Synchronizer for DnsSynchronizer {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn channels(&self) -> &'static [Channel] {
        &[Channel::Domains, Channel::Global]
    }

    fn reload_target(&self) -> Option<&'static str> {
        Some("dns")
    }

    fn plan(&self, ctx: &CoreContext) -> Result<Plan> {
        let config = ctx.config()?;
        let zones_dir = ctx.paths().dns_zones_dir();
        let today = serial_base(OffsetDateTime::now_utc());

        let mut domains: Vec<&Domain> = config.domains.enabled().collect();
        domains.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let mut plan = Plan::new();
        for domain in domains {
            let forward_path = zones_dir.join(format!("db.{}.zone", domain.name));
            let forward = zone_with_serial(&forward_path, today, |serial| {
                render_forward_zone(domain, &config.global, serial)
            });
            plan.file(forward_path, forward, 0o644);

            if domain.reverse_zone {
                let reverse_path = zones_dir.join(format!("db.{}.rev", domain.name));
                let reverse = zone_with_serial(&reverse_path, today, |serial| {
                    render_reverse_zone(domain, &config.global, serial)
                });
                plan.file(reverse_path, reverse, 0o644);
            }
        }
        plan.prune_under(&zones_dir, false);
        Ok(plan)
    }

    /// Zone-check gate: the candidate content is written to a temp file and
    /// checked before install; a failing check aborts the apply with the
    /// validator's stderr.
    fn verify(&self, ctx: &CoreContext, entry: &PlanEntry) -> Result<()> {
        let PlanEntry::File { path, content, .. } = entry else {
            return Ok(());
        };
        let Some(zone) = zone_name_of(path) else {
            return Ok(());
        };

        let services = ctx.config()?.services;
        let command = services
            .by_container("dns")
            .and_then(|s| s.zone_check_command.clone())
            .unwrap_or_else(|| vec![DEFAULT_ZONE_CHECK.to_string()]);
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        if which::which(program).is_err() {
            warn!("{}: zone-check command {:?} not found, skipping", zone, program);
            return Ok(());
        }

        let mut candidate =
            NamedTempFile::new().map_err(|e| Error::io(path, e))?;
        candidate
            .write_all(content)
            .map_err(|e| Error::io(path, e))?;

        let output = Command::new(program)
            .args(args)
            .arg(&zone)
            .arg(candidate.path())
            .output()
            .map_err(|e| Error::io(path, e))?;
        if !output.status.success() {
            return Err(Error::ZoneCheckFailed {
                zone,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Extracts the zone name from `db.<name>.zone` / `db.<name>.rev`.
fn zone_name_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".zone")
        .or_else(|| name.strip_suffix(".rev"))?;
    stem.strip_prefix("db.").map(|s| s.to_string())
}

/// `YYYYMMDD01` for the given instant.
fn serial_base(now: OffsetDateTime) -> u32 {
    let date = now.date();
    date.year() as u32 * 1_000_000 + date.month() as u32 * 10_000 + date.day() as u32 * 100 + 1
}

/// Renders a zone, reusing the previous serial when the body is unchanged
/// so repeated reconciles stay idempotent, and bumping monotonically when
/// anything else changed.
fn zone_with_serial<F>(path: &Path, today: u32, render: F) -> String
where
    F: Fn(u32) -> String,
{
    let previous = fs::read_to_string(path).ok();
    if let Some(previous_text) = &previous {
        if let Some(previous_serial) = parse_serial(previous_text) {
            if render(previous_serial) == *previous_text {
                return render(previous_serial);
            }
            return render(previous_serial.wrapping_add(1).max(today));
        }
    }
    render(today)
}

/// Finds the `<serial> ; serial` line of an emitted zone.
fn parse_serial(zone: &str) -> Option<u32> {
    zone.lines()
        .find(|line| line.trim_end().ends_with("; serial"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|token| token.parse().ok())
}

fn render_soa(name: &str, admin_email: &str, serial: u32) -> String {
    // admin@local.dev becomes admin.local.dev. in the SOA RNAME
    let rname = admin_email.replacen('@', ".", 1);
    format!(
        "@ IN SOA ns1.{}. {}. (\n\
         {} ; serial\n\
         3600 ; refresh\n\
         900 ; retry\n\
         1209600 ; expire\n\
         300 ; minimum\n\
         )\n",
        name, rname, serial
    )
}

fn render_forward_zone(domain: &Domain, global: &GlobalConfig, serial: u32) -> String {
    let mut zone = format!("$ORIGIN {}.\n$TTL 3600\n", domain.name);
    zone.push_str(&render_soa(
        &domain.name,
        &global.system.admin_email,
        serial,
    ));
    zone.push_str(&format!("@ IN NS ns1.{}.\n", domain.name));

    for (i, target) in domain.mx_records.iter().enumerate() {
        zone.push_str(&format!("@ IN MX {} {}.\n", (i + 1) * 10, target));
    }

    // synthesize the NS host when the records do not carry one
    if !domain.a_records.contains_key("ns1") {
        let address = domain
            .a_records
            .values()
            .next()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        zone.push_str(&format!("ns1 IN A {}\n", address));
    }
    for (short, address) in &domain.a_records {
        zone.push_str(&format!("{} IN A {}\n", short, address));
    }
    zone
}

fn render_reverse_zone(domain: &Domain, global: &GlobalConfig, serial: u32) -> String {
    let Some(first) = domain.a_records.values().next() else {
        return render_soa(&domain.name, &global.system.admin_email, serial);
    };
    let octets = first.octets();
    let origin = format!("{}.{}.{}.in-addr.arpa", octets[2], octets[1], octets[0]);

    let mut zone = format!("$ORIGIN {}.\n$TTL 3600\n", origin);
    zone.push_str(&render_soa(
        &domain.name,
        &global.system.admin_email,
        serial,
    ));
    zone.push_str(&format!("@ IN NS ns1.{}.\n", domain.name));
    for (short, address) in &domain.a_records {
        let o = address.octets();
        if o[0] == octets[0] && o[1] == octets[1] && o[2] == octets[2] {
            zone.push_str(&format!("{} IN PTR {}.\n", o[3], domain.fqdn_of(short)));
        }
    }
    zone
}

#[cfg(test)]
mod test {
    use std::fs;

    use test_log::test;
    use time::macros::datetime;

    use super::{parse_serial, serial_base, DnsSynchronizer};
    use crate::{
        schema::{DomainsFile, ServiceConfig, ServicesFile},
        sync::{apply_plan, Synchronizer},
        test::{sample_domain, save_doc, TestDir},
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
        ctx
    }

    #[test]
    fn test_serial_base() {
        assert_eq!(serial_base(datetime!(2026-08-01 12:00 UTC)), 2026080101);
    }

    #[test]
    fn test_forward_zone_content() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        let sync = DnsSynchronizer;
        let plan = sync.plan(&ctx).unwrap();
        let report = apply_plan(&ctx, &sync, &plan, false);
        assert!(report.is_ok(), "{:?}", report.errors);

        let zone = fs::read_to_string(
            ctx.paths().dns_zones_dir().join("db.local.dev.zone"),
        )
        .unwrap();
        assert!(zone.starts_with("$ORIGIN local.dev.\n"));
        assert!(zone.contains("IN SOA ns1.local.dev. admin.local.dev."));
        assert!(zone.contains("@ IN MX 10 mail.local.dev.\n"));
        assert!(zone.contains("mail IN A 10.0.0.25\n"));
        assert!(zone.contains("www IN A 10.0.0.80\n"));
        assert!(parse_serial(&zone).is_some());
    }

    #[test]
    fn test_serial_is_stable_then_monotonic() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);
        let sync = DnsSynchronizer;

        apply_plan(&ctx, &sync, &sync.plan(&ctx).unwrap(), false);
        let path = ctx.paths().dns_zones_dir().join("db.local.dev.zone");
        let first = parse_serial(&fs::read_to_string(&path).unwrap()).unwrap();

        // unchanged config: identical zone, identical serial, no write
        let report = apply_plan(&ctx, &sync, &sync.plan(&ctx).unwrap(), false);
        assert!(!report.changed());
        let second = parse_serial(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(first, second);

        // a record change bumps the serial monotonically
        let mut domain = sample_domain("local.dev");
        domain
            .a_records
            .insert("ftp".to_string(), "10.0.0.21".parse().unwrap());
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![domain],
            },
        )
        .unwrap();
        apply_plan(&ctx, &sync, &sync.plan(&ctx).unwrap(), false);
        let third = parse_serial(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_failing_zone_check_aborts_install() {
        let testdir = TestDir::new();
        let ctx = seeded(&testdir);

        let mut services = ServicesFile::default_fleet();
        let dns: &mut ServiceConfig = services.services.get_mut("dns").unwrap();
        dns.zone_check_command = Some(vec!["/bin/false".to_string()]);
        save_doc(&ctx, &services).unwrap();

        let sync = DnsSynchronizer;
        let report = apply_plan(&ctx, &sync, &sync.plan(&ctx).unwrap(), false);
        assert!(!report.is_ok());
        assert!(!ctx
            .paths()
            .dns_zones_dir()
            .join("db.local.dev.zone")
            .exists());
    }

    #[test]
    fn test_reverse_zone() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut domain = sample_domain("local.dev");
        domain.reverse_zone = true;
        save_doc(
            &ctx,
            &DomainsFile {
                domains: vec![domain],
            },
        )
        .unwrap();

        let sync = DnsSynchronizer;
        let report = apply_plan(&ctx, &sync, &sync.plan(&ctx).unwrap(), false);
        assert!(report.is_ok(), "{:?}", report.errors);
        let reverse = fs::read_to_string(
            ctx.paths().dns_zones_dir().join("db.local.dev.rev"),
        )
        .unwrap();
        assert!(reverse.starts_with("$ORIGIN 0.0.10.in-addr.arpa.\n"));
        assert!(reverse.contains("25 IN PTR mail.local.dev.\n"));
        assert!(reverse.contains("80 IN PTR www.local.dev.\n"));
    }
}
