//! Per-container reload serialization.
//!
//! At most one graceful reload executes per container; requests arriving
//! during an in-flight reload collapse into a single follow-up. Failed
//! reloads retry on a 1 s / 4 s / 16 s ladder before the container enters
//! `Failed`, which suppresses further automatic reloads until an explicit
//! `start`/`stop` clears it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    runtime::{Runtime, RELOAD_TIMEOUT},
    Result,
};

/// The reload state of one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadState {
    #[default]
    Idle,
    Reloading,
    Failed,
}

impl ReloadState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_reloading(&self) -> bool {
        matches!(self, Self::Reloading)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

#[derive(Default)]
struct Entry {
    state: ReloadState,
    pending: Option<Vec<String>>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    runtime: Runtime,
    containers: Mutex<HashMap<String, Entry>>,
    retry_delays: Vec<Duration>,
    shutdown: AtomicBool,
}

/// Serializes graceful reloads per container.
#[derive(Clone)]
pub struct ReloadCoordinator {
    inner: Arc<Inner>,
}

impl ReloadCoordinator {
    const RETRY_DELAYS: [Duration; 3] = [
        Duration::from_secs(1),
        Duration::from_secs(4),
        Duration::from_secs(16),
    ];

    pub fn new(runtime: Runtime) -> Self {
        Self::with_retry_delays(runtime, Self::RETRY_DELAYS.to_vec())
    }

    /// Tests shorten the ladder; semantics are unchanged.
    pub fn with_retry_delays(runtime: Runtime, retry_delays: Vec<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                containers: Mutex::new(HashMap::new()),
                retry_delays,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self, container: &str) -> ReloadState {
        self.inner
            .containers
            .lock()
            .expect("reload coordinator poisoned")
            .get(container)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Requests a graceful reload. Returns whether the request was accepted;
    /// a `Failed` container suppresses automatic requests until cleared.
    pub fn request(&self, container: &str, command: Vec<String>) -> Result<bool> {
        let mut containers = self.inner.containers.lock()?;
        let entry = containers.entry(container.to_string()).or_default();
        match entry.state {
            ReloadState::Failed => {
                warn!(
                    "{}: reload suppressed, container is in failed state",
                    container
                );
                Ok(false)
            }
            ReloadState::Reloading => {
                debug!("{}: reload queued behind in-flight reload", container);
                entry.pending = Some(command);
                Ok(true)
            }
            ReloadState::Idle => {
                entry.state = ReloadState::Reloading;
                let inner = self.inner.clone();
                let name = container.to_string();
                entry.worker = Some(thread::spawn(move || worker(inner, name, command)));
                Ok(true)
            }
        }
    }

    /// Clears a `Failed` container back to `Idle`. Called on explicit user
    /// `start`/`stop`.
    pub fn clear(&self, container: &str) {
        if let Ok(mut containers) = self.inner.containers.lock() {
            if let Some(entry) = containers.get_mut(container) {
                if entry.state.is_failed() {
                    entry.state = ReloadState::Idle;
                }
            }
        }
    }

    /// Waits until the container leaves `Reloading`, up to `timeout`.
    pub fn wait_idle(&self, container: &str, timeout: Duration) -> ReloadState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state(container);
            if !state.is_reloading() || Instant::now() >= deadline {
                return state;
            }
            sleep(Duration::from_millis(10));
        }
    }

    /// Stops retry ladders and joins worker threads.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> = {
            let mut containers = match self.inner.containers.lock() {
                Ok(c) => c,
                Err(_) => return,
            };
            containers
                .values_mut()
                .filter_map(|e| e.worker.take())
                .collect()
        };
        for worker in workers {
            worker.join().ok();
        }
    }
}

fn worker(inner: Arc<Inner>, container: String, mut command: Vec<String>) {
    loop {
        let succeeded = attempt_with_retries(&inner, &container, &command);
        let mut containers = match inner.containers.lock() {
            Ok(c) => c,
            Err(_) => return,
        };
        let Some(entry) = containers.get_mut(&container) else {
            return;
        };
        if inner.shutdown.load(Ordering::SeqCst) {
            entry.state = ReloadState::Idle;
            entry.pending = None;
            return;
        }
        if !succeeded {
            entry.state = ReloadState::Failed;
            entry.pending = None;
            error!("{}: reload failed after retries", container);
            return;
        }
        match entry.pending.take() {
            // collapse: one follow-up covers every queued request
            Some(next) => command = next,
            None => {
                entry.state = ReloadState::Idle;
                return;
            }
        }
    }
}

fn attempt_with_retries(inner: &Inner, container: &str, command: &[String]) -> bool {
    for delay in std::iter::once(None).chain(inner.retry_delays.iter().map(Some)) {
        if let Some(delay) = delay {
            if inner.shutdown.load(Ordering::SeqCst) {
                return true;
            }
            sleep(*delay);
        }
        match inner.runtime.exec(container, command, RELOAD_TIMEOUT) {
            Ok(_) => {
                debug!("{}: graceful reload done", container);
                return true;
            }
            Err(e) => warn!("{}: reload attempt failed: {}", container, e),
        }
    }
    false
}
