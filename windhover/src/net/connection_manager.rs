// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tracks live connections and closes them during shutdown.
//!
//! The live count is published through a [`tokio::sync::watch`] channel so
//! [`walk_and_close_all`] can await "everything stopped" without polling and
//! without missed-wakeup races.
//!
//! [`walk_and_close_all`]: ConnectionManager::walk_and_close_all

use super::connection::Connection;
use std::{collections::HashMap,
          sync::{Arc, Mutex,
                 atomic::{AtomicU64, Ordering}},
          time::Duration};
use tokio::sync::watch;

/// Registry of live connections. One per loop.
pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    live_tx: watch::Sender<usize>,
    live_rx: watch::Receiver<usize>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        let (live_tx, live_rx) = watch::channel(0);
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            live_tx,
            live_rx,
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, connection: &Arc<Connection>) {
        let mut connections = self.lock();
        connections.insert(connection.id(), Arc::clone(connection));
        let _ = self.live_tx.send(connections.len());
    }

    /// Exactly-once per connection (guaranteed by the caller): removes the
    /// stopped connection and publishes the new live count.
    pub(crate) fn on_connection_stopped(&self, id: u64) {
        let mut connections = self.lock();
        connections.remove(&id);
        let _ = self.live_tx.send(connections.len());
    }

    /// Connections currently tracked.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Requests cooperative close of every live connection and waits for all
    /// of them to finish stopping. Returns `true` iff everything closed
    /// within `timeout`.
    pub async fn walk_and_close_all(&self, timeout: Duration) -> bool {
        let snapshot: Vec<Arc<Connection>> = self.lock().values().cloned().collect();
        for connection in &snapshot {
            connection.close();
        }

        let mut live_rx = self.live_rx.clone();
        matches!(
            tokio::time::timeout(timeout, live_rx.wait_for(|live| *live == 0)).await,
            Ok(Ok(_))
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
        self.connections
            .lock()
            .expect("connection map mutex poisoned")
    }
}
