//! In-process event bus.
//!
//! Certificate issuance, environment switches and watcher dispatches are
//! announced here instead of through direct handles, so the certificate
//! manager and the synchronizers never reference each other.

use std::sync::{
    mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
    Arc, Mutex,
};

use log::warn;

use crate::watcher::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    ConfigChanged(Channel),
    CertificateIssued { domain: String },
    EnvironmentSwitched { name: String },
}

const SUBSCRIBER_DEPTH: usize = 64;

/// Broadcasts [CoreEvent]s to bounded per-subscriber queues.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<SyncSender<CoreEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber; events published afterwards are delivered to
    /// the returned receiver until it is dropped.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_DEPTH);
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(tx);
        rx
    }

    pub fn publish(&self, event: CoreEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("event subscriber queue full, dropping {:?}", event);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::{CoreEvent, EventBus};

    #[test]
    fn test_publish_subscribe() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(CoreEvent::CertificateIssued {
            domain: "local.dev".to_string(),
        });
        assert_eq!(
            rx.recv().unwrap(),
            CoreEvent::CertificateIssued {
                domain: "local.dev".to_string()
            }
        );
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(CoreEvent::EnvironmentSwitched {
            name: "testing".to_string(),
        });
        let rx = bus.subscribe();
        bus.publish(CoreEvent::EnvironmentSwitched {
            name: "staging".to_string(),
        });
        assert_eq!(
            rx.recv().unwrap(),
            CoreEvent::EnvironmentSwitched {
                name: "staging".to_string()
            }
        );
    }
}
