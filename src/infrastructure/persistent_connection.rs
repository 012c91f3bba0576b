// Copyright 2025 Cowboy AI, LLC.

//! Self-healing broker connection
//!
//! [`PersistentConnection`] owns the one physical connection shared by every
//! publish, bind and unbind call. Connecting is serialized so concurrent
//! callers never open duplicate connections, and any disruptive signal from
//! the broker triggers a new connect attempt until the connection is disposed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::transport::{BrokerChannel, BrokerConnection, BrokerConnector, TransportError};
use crate::retry::RetryPolicy;

/// Errors raised when a channel cannot be provided
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No connection could be established
    #[error("No broker connection available")]
    Unavailable,

    /// The connection has been disposed
    #[error("Connection has been disposed")]
    Disposed,

    /// The open connection refused to create a channel
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ConnectionInner {
    connector: Arc<dyn BrokerConnector>,
    retry: RetryPolicy,
    connect_lock: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    disposed: AtomicBool,
    connect_attempts: AtomicU32,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

/// Shared broker connection with retry and automatic reconnection
///
/// Clones share the same physical connection.
#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("connected", &self.is_connected())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PersistentConnection {
    /// Create a manager; no connection is opened until first needed
    pub fn new(connector: Arc<dyn BrokerConnector>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                connector,
                retry,
                connect_lock: tokio::sync::Mutex::new(()),
                connection: RwLock::new(None),
                disposed: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
                watcher: Mutex::new(None),
            }),
        }
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check that a connection exists, is open and has not been disposed
    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && self.current().is_some_and(|connection| connection.is_open())
    }

    /// Check whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Physical connect attempts made so far
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Establish the connection if it is not already open
    ///
    /// Returns false once the retry policy is exhausted, on a non-transient
    /// failure, or after disposal. Never panics.
    pub async fn try_connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }

        let _guard = self.inner.connect_lock.lock().await;
        if self.is_disposed() {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        info!("Connecting to message broker");
        let result = self
            .inner
            .retry
            .execute("Broker connect", |attempt| {
                let connector = Arc::clone(&self.inner.connector);
                self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
                debug!(attempt, "Opening broker connection");
                async move { connector.connect().await }
            })
            .await;

        match result {
            Ok(connection) => {
                if self.is_disposed() {
                    let _ = connection.close().await;
                    return false;
                }
                self.spawn_watcher(&connection);
                let stale = {
                    let mut current = self
                        .inner
                        .connection
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    let stale = current
                        .take()
                        .filter(|old| !same_connection(old, &connection));
                    *current = Some(connection);
                    stale
                };
                if let Some(replaced) = stale {
                    debug!("Closing replaced broker connection");
                    if let Err(e) = replaced.close().await {
                        warn!(error = %e, "Failed to close replaced broker connection");
                    }
                }
                info!("Broker connection established");
                true
            }
            Err(failure) => {
                error!(
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Broker connection could not be established"
                );
                false
            }
        }
    }

    fn spawn_watcher(&self, connection: &Arc<dyn BrokerConnection>) {
        let mut signals = connection.signals();
        let watched = Arc::downgrade(connection);
        let inner: Weak<ConnectionInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed broker connection signals");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(inner) = inner.upgrade() else { break };
                if inner.disposed.load(Ordering::SeqCst) {
                    break;
                }

                warn!(?signal, "Broker connection disrupted, trying to reconnect");
                let manager = PersistentConnection { inner };
                manager.try_connect().await;

                let still_watched = watched
                    .upgrade()
                    .is_some_and(|connection| connection.is_open());
                if !still_watched {
                    break;
                }
            }
        });

        let previous = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        // The previous watcher ends on its own once its connection is gone.
        drop(previous);
    }

    /// Open a logical channel on the shared connection, connecting first if needed
    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        if !self.is_connected() && !self.try_connect().await {
            warn!("No broker connection is available to create a channel");
            return Err(ConnectionError::Unavailable);
        }

        let connection = self.current().ok_or(ConnectionError::Unavailable)?;
        Ok(connection.create_channel().await?)
    }

    /// Close the connection and stop reconnecting; idempotent
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(watcher) = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }

        let connection = self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
        info!("Broker connection disposed");
    }
}

fn same_connection(a: &Arc<dyn BrokerConnection>, b: &Arc<dyn BrokerConnection>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
