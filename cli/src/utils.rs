use std::{sync::LazyLock, time::Duration};

use anyhow::{Context, Result};
use log::warn;
use net_servers::{
    context::CoreContext, environment::EnvironmentManager, runtime::Runtime, sync::SyncEngine,
};

/// Opens the environment registry rooted at the working directory (or
/// `NET_SERVERS_BASE`).
pub fn open_manager() -> Result<EnvironmentManager> {
    let root = match std::env::var_os("NET_SERVERS_BASE") {
        Some(base) => std::path::PathBuf::from(base),
        None => std::env::current_dir()?,
    };
    EnvironmentManager::load(&root)
        .with_context(|| "No environment registry found; run `net-servers environments init`")
}

/// Opens a core context on the current environment.
pub fn open_context() -> Result<CoreContext> {
    let manager = open_manager()?;
    Ok(CoreContext::open(&manager)?)
}

/// Builds the sync engine. When no container runtime is on the PATH,
/// reloads degrade to no-ops with a warning; file projections still work.
pub fn engine() -> SyncEngine {
    let runtime = Runtime::detect().unwrap_or_else(|e| {
        warn!("{}; reload requests will be no-ops", e);
        Runtime::with_program("true")
    });
    SyncEngine::new(runtime)
}

static SPINNER_STYLE: LazyLock<indicatif::ProgressStyle> = LazyLock::new(|| {
    indicatif::ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠸⠴⠦⠇ ")
        .template("{spinner:.green} {wide_msg}")
        .unwrap()
});

pub fn create_spinner(msg: &'static str, tick_rate: u64) -> indicatif::ProgressBar {
    let spinner = indicatif::ProgressBar::new_spinner().with_style(SPINNER_STYLE.clone());
    spinner.set_message(msg);
    spinner.enable_steady_tick(Duration::from_millis(tick_rate));
    spinner
}
