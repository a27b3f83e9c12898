//! The server-side view of who is caching what: subscriber queues, the
//! file-to-interested-clients index, and the cleanup path run when a
//! client's subscription ends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::queue::NotificationQueue;
use crate::rpc::message::Notification;

/// Registry of connected clients and their cached-file interests.
///
/// Each map has its own mutex and no lock is ever held while taking
/// another, except that fan-out reads `file_interest` before
/// `subscribers`; `subscribers` is always taken last. Cross-map updates
/// such as `cleanup_client` take the maps one at a time and accept the
/// interim inconsistency: a notification pushed to a vanished client
/// lands in a queue whose shutdown flag is already set and is dropped
/// there.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    /// client id to its notification queue.
    subscribers: Mutex<HashMap<String, Arc<NotificationQueue>>>,
    /// path to the set of client ids caching it.
    file_interest: Mutex<HashMap<String, HashSet<String>>>,
    /// path to the set of client ids currently in an open session,
    /// maintained for the diagnostics view.
    open_interest: Mutex<HashMap<String, HashSet<String>>>,
    /// currently-connected client ids.
    clients_db: Mutex<HashSet<String>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client seen at first contact.
    pub fn register_client(&self, client_id: &str) {
        let mut clients = self.clients_db.lock();
        if clients.insert(client_id.to_owned()) {
            info!("Client {client_id} connected");
        } else {
            debug!("Client {client_id} is already registered");
        }
    }

    /// Record that a client is caching a path.
    pub fn register_interest(&self, path: &str, client_id: &str) {
        let mut interest = self.file_interest.lock();
        interest
            .entry(path.to_owned())
            .or_default()
            .insert(client_id.to_owned());
    }

    /// Record that a client holds a path open.
    pub fn register_open(&self, path: &str, client_id: &str) {
        let mut open = self.open_interest.lock();
        open.entry(path.to_owned())
            .or_default()
            .insert(client_id.to_owned());
    }

    /// Record that a client finished its open session on a path.
    pub fn finish_open(&self, path: &str, client_id: &str) {
        let mut open = self.open_interest.lock();
        if let Some(clients) = open.get_mut(path) {
            clients.remove(client_id);
            if clients.is_empty() {
                open.remove(path);
            }
        }
    }

    /// Move the interest entries of `old_path` under `new_path`.
    pub fn rekey_path(&self, old_path: &str, new_path: &str, initiator: &str) {
        {
            let mut interest = self.file_interest.lock();
            if let Some(clients) = interest.remove(old_path) {
                interest.insert(new_path.to_owned(), clients);
            } else {
                interest
                    .entry(new_path.to_owned())
                    .or_default()
                    .insert(initiator.to_owned());
            }
        }
        {
            let mut open = self.open_interest.lock();
            if let Some(clients) = open.remove(old_path) {
                open.insert(new_path.to_owned(), clients);
            }
        }
    }

    /// Forget a removed path entirely.
    pub fn drop_path(&self, path: &str) {
        self.file_interest.lock().remove(path);
        self.open_interest.lock().remove(path);
    }

    /// Whether any client has registered interest in the path.
    #[must_use]
    pub fn has_interest(&self, path: &str) -> bool {
        self.file_interest.lock().contains_key(path)
    }

    /// Create and register the notification queue for a subscribing
    /// client, shutting down any stale queue left from an earlier
    /// subscription under the same id.
    pub fn subscribe(&self, client_id: &str) -> Arc<NotificationQueue> {
        let queue = Arc::new(NotificationQueue::new());
        let mut subscribers = self.subscribers.lock();
        if let Some(stale) = subscribers.insert(client_id.to_owned(), Arc::clone(&queue)) {
            debug!("Replacing a stale subscription queue for {client_id}");
            stale.cancel();
        }
        queue
    }

    /// Whether a client currently has a registered subscription queue.
    #[must_use]
    pub fn has_subscriber(&self, client_id: &str) -> bool {
        self.subscribers.lock().contains_key(client_id)
    }

    /// Push a notification to every client interested in `path`, except
    /// the initiator.
    pub fn fan_out(&self, path: &str, initiator: &str, notification: &Notification) {
        let interested: Vec<String> = {
            let interest = self.file_interest.lock();
            match interest.get(path) {
                Some(clients) => clients.iter().cloned().collect(),
                None => return,
            }
        };

        let subscribers = self.subscribers.lock();
        for client in &interested {
            if client == initiator {
                continue;
            }
            if let Some(queue) = subscribers.get(client) {
                debug!(
                    "Fan-out {:?} of {path} to {client}",
                    notification.kind
                );
                queue.push(notification.clone());
            } else {
                debug!("Client {client} is interested in {path} but not subscribed");
            }
        }
    }

    /// Erase every trace of a disconnected client.
    ///
    /// Runs when its subscription stream ends, whatever the cause.
    pub fn cleanup_client(&self, client_id: &str) {
        info!("Cleaning up client {client_id}");
        {
            let mut clients = self.clients_db.lock();
            clients.remove(client_id);
        }
        {
            let mut interest = self.file_interest.lock();
            interest.retain(|_, clients| {
                clients.remove(client_id);
                !clients.is_empty()
            });
        }
        {
            let mut open = self.open_interest.lock();
            open.retain(|_, clients| {
                clients.remove(client_id);
                !clients.is_empty()
            });
        }
        {
            let mut subscribers = self.subscribers.lock();
            if let Some(queue) = subscribers.remove(client_id) {
                queue.cancel();
            }
        }
    }

    /// Snapshot for the diagnostics RPC: connected clients and the
    /// paths currently held open.
    #[must_use]
    pub fn status_snapshot(&self) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
        let mut connected: Vec<String> = self.clients_db.lock().iter().cloned().collect();
        connected.sort();

        let open = self.open_interest.lock();
        let open_files = open
            .iter()
            .map(|(path, clients)| {
                let mut ids: Vec<String> = clients.iter().cloned().collect();
                ids.sort();
                (path.clone(), ids)
            })
            .collect();
        (connected, open_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::NotificationKind;

    fn update_for(path: &str) -> Notification {
        Notification {
            kind: NotificationKind::Update,
            path: path.to_owned(),
            new_path: None,
            timestamp: 7,
        }
    }

    #[tokio::test]
    async fn test_fan_out_skips_initiator() {
        let registry = SubscriberRegistry::new();
        registry.register_interest("/f", "alice");
        registry.register_interest("/f", "bob");
        let alice_queue = registry.subscribe("alice");
        let bob_queue = registry.subscribe("bob");

        registry.fan_out("/f", "alice", &update_for("/f"));

        assert!(alice_queue.is_empty());
        assert_eq!(bob_queue.pop().await.expect("entry").path, "/f");
    }

    #[test]
    fn test_fan_out_without_interest_is_noop() {
        let registry = SubscriberRegistry::new();
        let queue = registry.subscribe("alice");
        registry.fan_out("/unknown", "bob", &update_for("/unknown"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rekey_moves_interest() {
        let registry = SubscriberRegistry::new();
        registry.register_interest("/old", "alice");
        registry.rekey_path("/old", "/new", "alice");
        assert!(!registry.has_interest("/old"));
        assert!(registry.has_interest("/new"));
    }

    #[test]
    fn test_rekey_unknown_path_registers_initiator() {
        let registry = SubscriberRegistry::new();
        registry.rekey_path("/old", "/new", "alice");
        assert!(registry.has_interest("/new"));
    }

    #[test]
    fn test_cleanup_client_erases_everything() {
        let registry = SubscriberRegistry::new();
        registry.register_client("alice");
        registry.register_interest("/only-alice", "alice");
        registry.register_interest("/shared", "alice");
        registry.register_interest("/shared", "bob");
        registry.register_open("/only-alice", "alice");
        let queue = registry.subscribe("alice");

        registry.cleanup_client("alice");

        assert!(queue.is_shutdown());
        assert!(!registry.has_interest("/only-alice"));
        assert!(registry.has_interest("/shared"));
        let (connected, open_files) = registry.status_snapshot();
        assert!(connected.is_empty());
        assert!(open_files.is_empty());
    }

    #[test]
    fn test_resubscribe_cancels_stale_queue() {
        let registry = SubscriberRegistry::new();
        let stale = registry.subscribe("alice");
        let fresh = registry.subscribe("alice");
        assert!(stale.is_shutdown());
        assert!(!fresh.is_shutdown());
    }

    #[test]
    fn test_finish_open_prunes_empty_sets() {
        let registry = SubscriberRegistry::new();
        registry.register_open("/f", "alice");
        registry.finish_open("/f", "alice");
        let (_, open_files) = registry.status_snapshot();
        assert!(open_files.is_empty());
    }
}
