//! Synchronizer framework: registry, reconciliation, dry-run and reloads.
//!
//! A synchronizer declares its input channels and produces a [Plan] — the
//! exact bytes and modes of every file it owns. The framework drives the
//! filesystem to the plan with the smallest set of writes, prunes orphans
//! inside each projection directory, aggregates per-file errors and asks the
//! reload coordinator for graceful reloads when outputs changed.

pub mod dns;
pub mod http_auth;
pub mod mail;

pub use dns::DnsSynchronizer;
pub use http_auth::HttpAuthSynchronizer;
pub use mail::MailSynchronizer;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{Receiver, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use nix::unistd::{chown, geteuid, Gid, Uid};

use crate::{
    cert::CertificateManager,
    context::CoreContext,
    events::CoreEvent,
    reload::ReloadCoordinator,
    runtime::Runtime,
    store::write_atomic,
    watcher::{Channel, Watcher},
    Error, Result,
};

/// One target of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEntry {
    /// A file with its exact intended bytes and mode.
    File {
        path: PathBuf,
        content: Vec<u8>,
        mode: u32,
    },
    /// A directory that must exist, optionally owned by uid/gid.
    Dir {
        path: PathBuf,
        owner: Option<(u32, u32)>,
    },
}

impl PlanEntry {
    pub fn path(&self) -> &Path {
        match self {
            PlanEntry::File { path, .. } | PlanEntry::Dir { path, .. } => path,
        }
    }
}

/// A projection directory whose unplanned contents are pruned on apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRoot {
    pub root: PathBuf,
    /// Also reconcile subdirectories (mailbox trees): planned directories
    /// are created, orphans with a same-named planned sibling are moved,
    /// empty leftovers are removed.
    pub dirs: bool,
}

/// The complete intended state of one synchronizer's projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    entries: Vec<PlanEntry>,
    prune: Vec<PruneRoot>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file<P: Into<PathBuf>, C: Into<Vec<u8>>>(&mut self, path: P, content: C, mode: u32) {
        self.entries.push(PlanEntry::File {
            path: path.into(),
            content: content.into(),
            mode,
        });
    }

    pub fn dir<P: Into<PathBuf>>(&mut self, path: P, owner: Option<(u32, u32)>) {
        self.entries.push(PlanEntry::Dir {
            path: path.into(),
            owner,
        });
    }

    pub fn prune_under<P: Into<PathBuf>>(&mut self, root: P, dirs: bool) {
        self.prune.push(PruneRoot {
            root: root.into(),
            dirs,
        });
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    fn claimed_files(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().filter_map(|e| match e {
            PlanEntry::File { path, .. } => Some(path.as_path()),
            PlanEntry::Dir { .. } => None,
        })
    }

    fn claimed_dirs(&self) -> BTreeSet<&Path> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                PlanEntry::Dir { path, .. } => Some(path.as_path()),
                PlanEntry::File { .. } => None,
            })
            .collect()
    }
}

/// A graceful reload asked of the coordinator after an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub container: String,
    pub command: Vec<String>,
}

/// A unit translating validated configuration into one service's on-disk
/// artifacts.
pub trait Synchronizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Channels whose dispatch triggers this synchronizer.
    fn channels(&self) -> &'static [Channel];

    /// The container this synchronizer reloads, if any.
    fn reload_target(&self) -> Option<&'static str> {
        None
    }

    /// Whether this synchronizer's outputs reference certificate material.
    fn wants_certificates(&self) -> bool {
        false
    }

    fn plan(&self, ctx: &CoreContext) -> Result<Plan>;

    /// Gate invoked for each changed file before it is installed. An error
    /// aborts the whole apply of this synchronizer.
    fn verify(&self, _ctx: &CoreContext, _entry: &PlanEntry) -> Result<()> {
        Ok(())
    }

    /// Maps the set of changed paths to a reload request.
    fn reload(&self, ctx: &CoreContext, changed: &[PathBuf]) -> Result<Option<ReloadRequest>> {
        let Some(target) = self.reload_target() else {
            return Ok(None);
        };
        if changed.is_empty() {
            return Ok(None);
        }
        let services = ctx.config()?.services;
        let Some(service) = services.by_container(target) else {
            return Ok(None);
        };
        if service.skip_reload {
            debug!("{}: reload skipped by configuration", target);
            return Ok(None);
        }
        Ok(Some(ReloadRequest {
            container: target.to_string(),
            command: service.reload_command_or_default(),
        }))
    }
}

/// Result of one synchronizer's reconcile, with per-file errors aggregated.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synchronizer: &'static str,
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub unchanged: usize,
    pub errors: Vec<(PathBuf, String)>,
    pub reload_requested: bool,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        !self.written.is_empty() || !self.removed.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every path whose content changed in this reconcile.
    pub fn changed_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.written.clone();
        paths.extend(self.removed.iter().cloned());
        paths
    }
}

/// One line of a dry-run diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub action: DiffAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    Create,
    Update,
    Unchanged,
    Remove,
}

/// Registry of synchronizers keyed by name.
#[derive(Default)]
pub struct Registry {
    synchronizers: Vec<Arc<dyn Synchronizer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shipped set: mail, HTTP auth and DNS.
    pub fn with_default_fleet() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MailSynchronizer));
        registry.register(Arc::new(HttpAuthSynchronizer));
        registry.register(Arc::new(DnsSynchronizer));
        registry
    }

    pub fn register(&mut self, synchronizer: Arc<dyn Synchronizer>) {
        self.synchronizers.push(synchronizer);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Synchronizer>> {
        self.synchronizers.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Synchronizer>> {
        self.synchronizers.iter()
    }

    pub fn for_channel(&self, channel: Channel) -> Vec<&Arc<dyn Synchronizer>> {
        self.synchronizers
            .iter()
            .filter(|s| s.channels().contains(&channel))
            .collect()
    }
}

/// Composes the registry, the certificate manager and the reload
/// coordinator into one reconciliation entry point.
pub struct SyncEngine {
    registry: Registry,
    certificates: CertificateManager,
    reloads: ReloadCoordinator,
}

impl SyncEngine {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            registry: Registry::with_default_fleet(),
            certificates: CertificateManager::new(),
            reloads: ReloadCoordinator::new(runtime),
        }
    }

    pub fn with_parts(
        registry: Registry,
        certificates: CertificateManager,
        reloads: ReloadCoordinator,
    ) -> Self {
        Self {
            registry,
            certificates,
            reloads,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    pub fn reloads(&self) -> &ReloadCoordinator {
        &self.reloads
    }

    /// Reconciles every registered synchronizer.
    pub fn reconcile_all(&self, ctx: &CoreContext) -> Result<Vec<SyncReport>> {
        let selected: Vec<&Arc<dyn Synchronizer>> = self.registry.iter().collect();
        self.reconcile_selected(ctx, &selected)
    }

    /// Reconciles the synchronizers subscribed to a channel.
    pub fn reconcile_channel(&self, ctx: &CoreContext, channel: Channel) -> Result<Vec<SyncReport>> {
        let selected = self.registry.for_channel(channel);
        if selected.is_empty() {
            return Ok(vec![]);
        }
        self.reconcile_selected(ctx, &selected)
    }

    fn reconcile_selected(
        &self,
        ctx: &CoreContext,
        selected: &[&Arc<dyn Synchronizer>],
    ) -> Result<Vec<SyncReport>> {
        // certificates are applied before anything referencing them
        if selected.iter().any(|s| s.wants_certificates()) {
            if let Err(e) = self.certificates.ensure_all(ctx, false) {
                warn!("certificate provisioning incomplete: {}", e);
            }
        }

        let plans: Vec<(&Arc<dyn Synchronizer>, Plan)> = {
            let mut plans = Vec::new();
            for sync in selected {
                plans.push((*sync, sync.plan(ctx)?));
            }
            plans
        };
        check_plan_conflicts(&plans)?;

        // one worker per synchronizer in flight
        let mut reports = thread::scope(|scope| {
            let handles: Vec<_> = plans
                .iter()
                .map(|(sync, plan)| {
                    scope.spawn(move || apply_plan(ctx, sync.as_ref(), plan, false))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_default())
                .collect::<Vec<SyncReport>>()
        });

        for ((sync, _), report) in plans.iter().zip(reports.iter_mut()) {
            if !report.changed() || !report.is_ok() {
                continue;
            }
            match sync.reload(ctx, &report.changed_paths()) {
                Ok(Some(request)) => {
                    report.reload_requested = self
                        .reloads
                        .request(&request.container, request.command)
                        .unwrap_or(false);
                }
                Ok(None) => {}
                Err(e) => warn!("{}: reload resolution failed: {}", sync.name(), e),
            }
        }

        for report in &reports {
            if report.changed() {
                info!(
                    "{}: {} written, {} removed, {} unchanged",
                    report.synchronizer,
                    report.written.len(),
                    report.removed.len(),
                    report.unchanged
                );
            }
        }
        Ok(reports)
    }

    /// Computes every plan diff without touching disk.
    pub fn dry_run(&self, ctx: &CoreContext) -> Result<Vec<(&'static str, Vec<DiffEntry>)>> {
        let mut diffs = Vec::new();
        let mut plans = Vec::new();
        for sync in self.registry.iter() {
            plans.push((sync, sync.plan(ctx)?));
        }
        check_plan_conflicts(&plans)?;
        for (sync, plan) in &plans {
            diffs.push((sync.name(), diff_plan(plan)));
        }
        Ok(diffs)
    }

    /// The watcher dispatch loop. Returns when `stop` fires; pending
    /// debounced events are drained first.
    pub fn run(&self, ctx: &CoreContext, watcher: &Watcher, stop: Receiver<()>) -> Result<()> {
        let cert_events = ctx.events().subscribe();
        loop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
                Err(TryRecvError::Empty) => {}
            }

            if let Some(channel) = watcher.poll(Duration::from_millis(200)) {
                if channel == Channel::Environments {
                    debug!("environment registry changed; not dispatched to synchronizers");
                    continue;
                }
                ctx.store().invalidate();
                match self.reconcile_channel(ctx, channel) {
                    Ok(reports) => {
                        for report in reports.iter().filter(|r| !r.is_ok()) {
                            for (path, message) in &report.errors {
                                warn!(
                                    "{}: {} failed: {}",
                                    report.synchronizer,
                                    path.display(),
                                    message
                                );
                            }
                        }
                    }
                    Err(e) => warn!("{}: reconcile failed: {}", channel, e),
                }
            }

            // certificate renewals reconcile their dependents
            while let Ok(event) = cert_events.try_recv() {
                if let CoreEvent::CertificateIssued { domain } = event {
                    debug!("{}: certificate issued, reconciling dependents", domain);
                    let dependents: Vec<&Arc<dyn Synchronizer>> = self
                        .registry
                        .iter()
                        .filter(|s| s.wants_certificates())
                        .collect();
                    if let Err(e) = self.reconcile_selected(ctx, &dependents) {
                        warn!("certificate follow-up reconcile failed: {}", e);
                    }
                }
            }
        }
    }
}

fn check_plan_conflicts(plans: &[(&Arc<dyn Synchronizer>, Plan)]) -> Result<()> {
    let mut claims: BTreeMap<&Path, &'static str> = BTreeMap::new();
    for (sync, plan) in plans {
        for path in plan.claimed_files() {
            if let Some(other) = claims.insert(path, sync.name()) {
                if other != sync.name() {
                    return Err(Error::PlanConflict {
                        path: path.to_owned(),
                        synchronizers: (other.to_string(), sync.name().to_string()),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Drives the filesystem to `plan`. Identical files are skipped so a
/// repeated apply makes no modifications; per-file failures are aggregated.
pub(crate) fn apply_plan(
    ctx: &CoreContext,
    sync: &dyn Synchronizer,
    plan: &Plan,
    dry: bool,
) -> SyncReport {
    let mut report = SyncReport {
        synchronizer: sync.name(),
        ..Default::default()
    };

    // prune first: orphaned mailbox directories must be moved to their
    // planned location before the plan materializes it as an empty tree
    for root in &plan.prune {
        prune_root(plan, root, dry, &mut report);
    }

    for entry in &plan.entries {
        match entry {
            PlanEntry::Dir { path, owner } => {
                if dry {
                    continue;
                }
                if let Err(e) = ensure_dir(path, *owner) {
                    report.errors.push((path.clone(), e.to_string()));
                }
            }
            PlanEntry::File {
                path,
                content,
                mode,
            } => {
                let current = fs::read(path).ok();
                if current.as_deref() == Some(content.as_slice()) {
                    report.unchanged += 1;
                    continue;
                }
                if dry {
                    report.written.push(path.clone());
                    continue;
                }
                if let Err(e) = sync.verify(ctx, entry) {
                    // a failed verification aborts this synchronizer's apply
                    report.errors.push((path.clone(), e.to_string()));
                    return report;
                }
                match write_atomic(path, content, *mode) {
                    Ok(()) => report.written.push(path.clone()),
                    Err(e) => report.errors.push((path.clone(), e.to_string())),
                }
            }
        }
    }

    report
}

fn ensure_dir(path: &Path, owner: Option<(u32, u32)>) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
    if let Some((uid, gid)) = owner {
        if geteuid().is_root() {
            chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|e| Error::io(path, std::io::Error::from(e)))?;
        } else {
            debug!(
                "{}: not root, leaving ownership as-is (wanted {}:{})",
                path.display(),
                uid,
                gid
            );
        }
    }
    Ok(())
}

fn prune_root(plan: &Plan, root: &PruneRoot, dry: bool, report: &mut SyncReport) {
    let claimed: BTreeSet<&Path> = plan.claimed_files().collect();
    let entries = match fs::read_dir(&root.root) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            if root.dirs {
                prune_dir_tree(plan, &path, dry, report);
            }
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(".lock") || name.ends_with(".bak") {
            continue;
        }
        if !claimed.contains(path.as_path()) {
            if dry {
                report.removed.push(path);
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => report.errors.push((path, e.to_string())),
            }
        }
    }
}

/// Reconciles a two-level directory tree (`<group>/<leaf>/`) against the
/// plan's directory claims: an orphaned leaf with a planned sibling of the
/// same name is moved rather than duplicated; empty leftovers are removed.
fn prune_dir_tree(plan: &Plan, group: &Path, dry: bool, report: &mut SyncReport) {
    let planned = plan.claimed_dirs();
    let group_active = planned.iter().any(|p| p.starts_with(group));

    let leaves: Vec<PathBuf> = fs::read_dir(group)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();

    for leaf in leaves {
        if planned.contains(leaf.as_path()) {
            continue;
        }
        let Some(leaf_name) = leaf.file_name() else {
            continue;
        };
        // a planned leaf of the same name under another group: a rename
        let new_home = planned
            .iter()
            .find(|p| p.file_name() == Some(leaf_name) && !p.starts_with(group));
        match new_home {
            Some(target) if !target.exists() => {
                if dry {
                    report.removed.push(leaf.clone());
                    continue;
                }
                let result = target
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs::rename(&leaf, target));
                match result {
                    Ok(()) => {
                        debug!("moved {} -> {}", leaf.display(), target.display());
                        report.removed.push(leaf.clone());
                    }
                    Err(e) => report.errors.push((leaf.clone(), e.to_string())),
                }
            }
            _ => {
                if dry {
                    continue;
                }
                // only empty leftovers are removed; data is never discarded
                if fs::remove_dir(&leaf).is_ok() {
                    report.removed.push(leaf.clone());
                } else {
                    warn!(
                        "{}: orphaned mailbox directory is not empty, keeping it",
                        leaf.display()
                    );
                }
            }
        }
    }

    if !group_active && !dry {
        fs::remove_dir(group).ok();
    }
}

fn diff_plan(plan: &Plan) -> Vec<DiffEntry> {
    let mut diff = Vec::new();
    for entry in &plan.entries {
        if let PlanEntry::File {
            path,
            content,
            mode: _,
        } = entry
        {
            let action = match fs::read(path) {
                Ok(existing) if existing == *content => DiffAction::Unchanged,
                Ok(_) => DiffAction::Update,
                Err(_) => DiffAction::Create,
            };
            diff.push(DiffEntry {
                path: path.clone(),
                action,
            });
        }
    }
    let claimed: BTreeSet<&Path> = plan.claimed_files().collect();
    for root in &plan.prune {
        if let Ok(entries) = fs::read_dir(&root.root) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_file() && !claimed.contains(path.as_path()) {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with('.') || name.ends_with(".lock") || name.ends_with(".bak") {
                        continue;
                    }
                    diff.push(DiffEntry {
                        path,
                        action: DiffAction::Remove,
                    });
                }
            }
        }
    }
    diff
}

#[cfg(test)]
mod test {
    use std::{fs, sync::Arc};

    use test_log::test;

    use super::{Plan, Registry, Synchronizer, SyncEngine};
    use crate::{
        cert::CertificateManager,
        context::CoreContext,
        reload::ReloadCoordinator,
        runtime::Runtime,
        test::TestDir,
        watcher::Channel,
        Error, Result,
    };

    struct FixedSync {
        name: &'static str,
        path: &'static str,
        content: &'static str,
    }

    impl Synchronizer for FixedSync {
        fn name(&self) -> &'static str {
            self.name
        }

        fn channels(&self) -> &'static [Channel] {
            &[Channel::Users]
        }

        fn plan(&self, ctx: &CoreContext) -> Result<Plan> {
            let mut plan = Plan::new();
            plan.file(
                ctx.paths().state_dir().join(self.path),
                self.content.as_bytes().to_vec(),
                0o644,
            );
            plan.prune_under(ctx.paths().state_dir(), false);
            Ok(plan)
        }
    }

    fn engine(parts: Registry) -> SyncEngine {
        SyncEngine::with_parts(
            parts,
            CertificateManager::new(),
            ReloadCoordinator::new(Runtime::with_program("/bin/true")),
        )
    }

    #[test]
    fn test_apply_is_idempotent() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut registry = Registry::new();
        registry.register(Arc::new(FixedSync {
            name: "fixed",
            path: "output.txt",
            content: "hello\n",
        }));
        let engine = engine(registry);

        let first = engine.reconcile_all(&ctx).unwrap();
        assert_eq!(first[0].written.len(), 1);
        let target = ctx.paths().state_dir().join("output.txt");
        let mtime = fs::metadata(&target).unwrap().modified().unwrap();

        let second = engine.reconcile_all(&ctx).unwrap();
        assert!(!second[0].changed());
        assert_eq!(second[0].unchanged, 1);
        assert_eq!(fs::metadata(&target).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_prune_removes_orphans() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let orphan = ctx.paths().state_dir().join("stale.txt");
        fs::write(&orphan, "old").unwrap();

        let mut registry = Registry::new();
        registry.register(Arc::new(FixedSync {
            name: "fixed",
            path: "output.txt",
            content: "hello\n",
        }));
        let engine = engine(registry);
        let reports = engine.reconcile_all(&ctx).unwrap();
        assert!(reports[0].removed.contains(&orphan));
        assert!(!orphan.exists());
    }

    #[test]
    fn test_plan_conflict_detected() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut registry = Registry::new();
        registry.register(Arc::new(FixedSync {
            name: "first",
            path: "same.txt",
            content: "a",
        }));
        registry.register(Arc::new(FixedSync {
            name: "second",
            path: "same.txt",
            content: "b",
        }));
        let engine = engine(registry);
        assert!(matches!(
            engine.reconcile_all(&ctx),
            Err(Error::PlanConflict { .. })
        ));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let mut registry = Registry::new();
        registry.register(Arc::new(FixedSync {
            name: "fixed",
            path: "output.txt",
            content: "hello\n",
        }));
        let engine = engine(registry);
        let diffs = engine.dry_run(&ctx).unwrap();
        assert_eq!(diffs[0].1.len(), 1);
        assert!(!ctx.paths().state_dir().join("output.txt").exists());
    }
}
