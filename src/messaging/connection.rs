//! # Broker Connection Manager
//!
//! Exclusive owner of one broker channel. Callers borrow the channel per operation
//! through [`ConnectionManager::acquire`] and never cache it across calls.
//!
//! ## Reconnection
//!
//! Every channel installed by the manager gets a new *generation* number. A caller that
//! hit a connection error passes the generation it was using to
//! [`ConnectionManager::reconnect`]; when several callers report the same broken
//! generation concurrently, the first one reconnects and the rest receive the channel it
//! opened. Reconnection retries with a fixed delay until it succeeds or
//! [`ConnectionManager::shutdown`] is called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::transport::{BrokerChannel, BrokerConnector};
use crate::error::{BrokerError, BrokerResult};

/// A borrowed channel plus the generation it belongs to
#[derive(Debug, Clone)]
pub struct ChannelLease {
    pub channel: Arc<dyn BrokerChannel>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct ConnectionState {
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
}

/// Owns the broker channel and serializes every change to it
#[derive(Debug)]
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<ConnectionState>,
    reconnect_lock: Mutex<()>,
    reconnect_delay: Duration,
    shutdown_tx: watch::Sender<bool>,
    reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, reconnect_delay: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            state: Mutex::new(ConnectionState::default()),
            reconnect_lock: Mutex::new(()),
            reconnect_delay,
            shutdown_tx,
            reconnects: AtomicU64::new(0),
        }
    }

    /// Return the live channel, opening one if there is none
    ///
    /// A single connection attempt is made; persistent failure is the caller's cue to
    /// call [`reconnect`](Self::reconnect) or give up.
    pub async fn acquire(&self) -> BrokerResult<ChannelLease> {
        if self.is_shutdown() {
            return Err(BrokerError::Shutdown);
        }

        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.as_ref().filter(|c| c.is_connected()) {
            return Ok(ChannelLease {
                channel: Arc::clone(channel),
                generation: state.generation,
            });
        }

        if let Some(stale) = state.channel.take() {
            let _ = stale.close().await;
        }
        let channel = self.connector.connect().await?;
        Ok(self.install(&mut state, channel))
    }

    /// Replace the channel of `observed_generation` with a fresh one
    ///
    /// Returns immediately with the current channel if another caller already replaced
    /// that generation. Otherwise retries every `reconnect_delay` until a connection is
    /// established or the manager is shut down. Only one caller runs the retry loop at a
    /// time, and the channel state is locked per attempt, so [`acquire`](Self::acquire)
    /// keeps failing fast during an outage instead of waiting for the loop.
    pub async fn reconnect(&self, observed_generation: u64) -> BrokerResult<ChannelLease> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(BrokerError::Shutdown);
        }

        let _reconnecting = self.reconnect_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            if let Some(lease) = replaced_lease(&state, observed_generation) {
                debug!(
                    observed_generation = observed_generation,
                    current_generation = lease.generation,
                    "Reconnect already performed by another caller"
                );
                return Ok(lease);
            }
            if let Some(old) = state.channel.take() {
                if let Err(e) = old.close().await {
                    debug!(error = %e, "Ignoring error while closing broken channel");
                }
            }
        }

        let mut attempt: u64 = 0;
        loop {
            if *shutdown_rx.borrow() {
                return Err(BrokerError::Shutdown);
            }
            attempt += 1;

            let connected = self.connector.connect().await;
            let mut state = self.state.lock().await;
            if let Some(lease) = replaced_lease(&state, observed_generation) {
                // An acquire() got through while this attempt was in flight
                if let Ok(extra) = connected {
                    let _ = extra.close().await;
                }
                return Ok(lease);
            }
            match connected {
                Ok(channel) => {
                    if self.is_shutdown() {
                        let _ = channel.close().await;
                        return Err(BrokerError::Shutdown);
                    }
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    let lease = self.install(&mut state, channel);
                    info!(
                        provider = self.connector.provider_name(),
                        generation = lease.generation,
                        attempts = attempt,
                        "Broker connection re-established"
                    );
                    return Ok(lease);
                }
                Err(e) => {
                    warn!(
                        provider = self.connector.provider_name(),
                        attempt = attempt,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnect attempt failed"
                    );
                }
            }
            drop(state);

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Drop the channel of `generation` if it is still installed, so the next `acquire`
    /// opens a fresh one
    pub async fn invalidate(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        if let Some(channel) = state.channel.take() {
            let _ = channel.close().await;
        }
    }

    fn install(&self, state: &mut ConnectionState, channel: Arc<dyn BrokerChannel>) -> ChannelLease {
        state.generation += 1;
        state.channel = Some(Arc::clone(&channel));
        ChannelLease {
            channel,
            generation: state.generation,
        }
    }

    /// Generation of the installed channel; 0 before the first connection
    pub async fn current_generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .channel
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Successful reconnects so far
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` on shutdown
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn provider_name(&self) -> &'static str {
        self.connector.provider_name()
    }

    /// Close the current channel; the next `acquire` opens a new one
    pub async fn close(&self) -> BrokerResult<()> {
        let channel = self.state.lock().await.channel.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Cancel any in-flight reconnect, refuse further acquisitions and close the channel
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.shutdown_tx.send_replace(true);
        self.close().await
    }
}

/// The installed channel, if it is live and newer than `observed_generation`
fn replaced_lease(state: &ConnectionState, observed_generation: u64) -> Option<ChannelLease> {
    if state.generation <= observed_generation {
        return None;
    }
    state
        .channel
        .as_ref()
        .filter(|c| c.is_connected())
        .map(|channel| ChannelLease {
            channel: Arc::clone(channel),
            generation: state.generation,
        })
}
