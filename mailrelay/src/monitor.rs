//! Process-wide registry of live connections and listeners, feeding
//! the admin `status` command and its push notifications.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub struct Monitor {
    next_token: AtomicU64,
    connections: Mutex<BTreeMap<u64, String>>,
    listeners: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<smol::channel::Sender<String>>>,
}

/// Unregisters the connection when dropped.
pub struct ConnectionToken {
    monitor: Arc<Monitor>,
    token: u64,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        if let Ok(mut conns) = self.monitor.connections.lock() {
            conns.remove(&self.token);
        }
    }
}

impl Monitor {
    pub fn new() -> Arc<Monitor> {
        Arc::new(Monitor {
            next_token: AtomicU64::new(1),
            connections: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn add_listener(self: &Arc<Monitor>, description: String) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(description);
        }
    }

    pub fn add_connection(self: &Arc<Monitor>, description: String) -> ConnectionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut conns) = self.connections.lock() {
            conns.insert(token, description);
        }
        ConnectionToken {
            monitor: self.clone(),
            token,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Multi-line snapshot for the admin `status` command.
    pub fn report(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(listeners) = self.listeners.lock() {
            for l in listeners.iter() {
                out.push(format!("LISTEN: {}", l));
            }
        }
        if let Ok(conns) = self.connections.lock() {
            for (token, c) in conns.iter() {
                out.push(format!("IN: #{} {}", token, c));
            }
        }
        if out.is_empty() {
            out.push("none".to_owned());
        }
        out
    }

    /// Subscribes an admin connection to push events.
    pub fn subscribe(&self) -> smol::channel::Receiver<String> {
        let (tx, rx) = smol::channel::unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Fans an event line out to every subscriber, dropping the gone
    /// ones.
    pub fn push_event(&self, event: &str) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.try_send(event.to_owned()).is_ok());
        }
    }
}
