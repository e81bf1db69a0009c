//! Configuration directory watcher.
//!
//! Raw inotify events are resolved to a fixed set of logical [Channel]s and
//! debounced per channel, so an editor burst on one file produces a single
//! event. Consumers pull from a bounded queue; closing the watcher drains
//! pending debounced events, then exits.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError},
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

use inotify::{EventMask, Inotify, WatchMask};
use log::{debug, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

/// A logical group of related configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Users,
    Domains,
    Global,
    Services,
    Secrets,
    Environments,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Users,
        Channel::Domains,
        Channel::Global,
        Channel::Services,
        Channel::Secrets,
        Channel::Environments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Users => "users",
            Channel::Domains => "domains",
            Channel::Global => "global",
            Channel::Services => "services",
            Channel::Secrets => "secrets",
            Channel::Environments => "environments",
        }
    }

    /// Maps a file name inside the config tree to its channel. Lock files,
    /// backups and temp files map to none.
    pub fn of_file_name(name: &str) -> Option<Channel> {
        match name {
            "users.yaml" => Some(Channel::Users),
            "domains.yaml" => Some(Channel::Domains),
            "global.yaml" => Some(Channel::Global),
            "services.yaml" => Some(Channel::Services),
            "secrets.yaml" => Some(Channel::Secrets),
            "environments.yaml" | "environments.local.yaml" => Some(Channel::Environments),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Coalescing window per channel.
    pub debounce: Duration,
    /// Bound of the outgoing event queue.
    pub queue_depth: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            queue_depth: 64,
        }
    }
}

/// Watches a config directory and yields debounced [Channel] events.
pub struct Watcher {
    events: Receiver<Channel>,
    stop: SyncSender<()>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Watcher {
    /// Starts watching `config_dir` recursively.
    pub fn start<P: AsRef<Path>>(config_dir: P, options: WatcherOptions) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_owned();
        let (event_tx, event_rx) = sync_channel(options.queue_depth);
        let (stop_tx, stop_rx) = sync_channel(1);

        let inotify = Inotify::init().map_err(|e| Error::io(&config_dir, e))?;
        let mask = WatchMask::CLOSE_WRITE
            | WatchMask::CREATE
            | WatchMask::DELETE
            | WatchMask::MOVED_TO
            | WatchMask::MOVED_FROM;
        for entry in WalkDir::new(&config_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            inotify
                .watches()
                .add(entry.path(), mask)
                .map_err(|e| Error::io(entry.path(), e))?;
        }

        let thread = thread::spawn(move || watch_loop(inotify, options, event_tx, stop_rx));

        Ok(Self {
            events: event_rx,
            stop: stop_tx,
            thread: Some(thread),
        })
    }

    /// The debounced event queue.
    pub fn events(&self) -> &Receiver<Channel> {
        &self.events
    }

    /// Waits up to `timeout` for the next event.
    pub fn poll(&self, timeout: Duration) -> Option<Channel> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Stops the watcher. Pending debounced events are flushed into the
    /// queue first; everything not yet consumed is returned.
    pub fn close(mut self) -> Result<Vec<Channel>> {
        self.stop.try_send(()).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| Error::PoisonError)??;
        }
        Ok(self.events.try_iter().collect())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.try_send(()).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

fn watch_loop(
    mut inotify: Inotify,
    options: WatcherOptions,
    events: SyncSender<Channel>,
    stop: Receiver<()>,
) -> Result<()> {
    let mut buffer = [0u8; 4096];
    let mut pending: HashMap<Channel, Instant> = HashMap::new();
    let tick = (options.debounce / 4).clamp(Duration::from_millis(10), Duration::from_millis(100));

    loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                // drain: flush everything still within its window
                let mut channels: Vec<Channel> = pending.drain().map(|(c, _)| c).collect();
                channels.sort();
                for channel in channels {
                    events.try_send(channel).ok();
                }
                return Ok(());
            }
            Err(TryRecvError::Empty) => {}
        }

        sleep(tick);

        match inotify.read_events(&mut buffer) {
            Ok(batch) => {
                for event in batch {
                    let Some(name) = event.name.and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if event.mask.contains(EventMask::ISDIR) {
                        continue;
                    }
                    if let Some(channel) = Channel::of_file_name(name) {
                        debug!("{}: raw change observed ({})", channel, name);
                        pending.insert(channel, Instant::now());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("inotify read failed: {}", e);
                return Err(Error::io("<inotify>", e));
            }
        }

        let now = Instant::now();
        let mut due: Vec<Channel> = pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= options.debounce)
            .map(|(c, _)| *c)
            .collect();
        due.sort();
        for channel in due {
            pending.remove(&channel);
            debug!("{}: dispatching", channel);
            // blocking send: backpressure when the consumer lags
            if events.send(channel).is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{fs, thread::sleep, time::Duration};

    use test_log::test;

    use super::{Channel, Watcher, WatcherOptions};
    use crate::test::TestDir;

    fn options() -> WatcherOptions {
        WatcherOptions {
            debounce: Duration::from_millis(100),
            queue_depth: 16,
        }
    }

    #[test]
    fn test_channel_mapping() {
        assert_eq!(Channel::of_file_name("users.yaml"), Some(Channel::Users));
        assert_eq!(
            Channel::of_file_name("environments.local.yaml"),
            Some(Channel::Environments)
        );
        assert_eq!(Channel::of_file_name("users.yaml.lock"), None);
        assert_eq!(Channel::of_file_name(".tmpXyZ12"), None);
    }

    #[test]
    fn test_burst_debounces_to_single_dispatch() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let watcher = Watcher::start(ctx.paths().config_dir(), options()).unwrap();

        let users = ctx.paths().users_file();
        for i in 0..5 {
            fs::write(&users, format!("users: [] # {}\n", i)).unwrap();
            sleep(Duration::from_millis(5));
        }

        assert_eq!(watcher.poll(Duration::from_secs(2)), Some(Channel::Users));
        assert_eq!(watcher.poll(Duration::from_millis(300)), None);
        watcher.close().unwrap();
    }

    #[test]
    fn test_channels_are_independent() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let watcher = Watcher::start(ctx.paths().config_dir(), options()).unwrap();

        fs::write(ctx.paths().users_file(), "users: []\n").unwrap();
        fs::write(ctx.paths().domains_file(), "domains: []\n").unwrap();

        let mut seen = vec![
            watcher.poll(Duration::from_secs(2)).unwrap(),
            watcher.poll(Duration::from_secs(2)).unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![Channel::Users, Channel::Domains]);
        watcher.close().unwrap();
    }

    #[test]
    fn test_close_drains_pending() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let watcher = Watcher::start(
            ctx.paths().config_dir(),
            WatcherOptions {
                debounce: Duration::from_secs(30),
                queue_depth: 16,
            },
        )
        .unwrap();

        fs::write(ctx.paths().users_file(), "users: []\n").unwrap();
        // give the watch loop a tick to observe the raw event
        sleep(Duration::from_millis(300));

        let drained = watcher.close().unwrap();
        assert_eq!(drained, vec![Channel::Users]);
    }
}
