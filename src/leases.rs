//! Bounded-TTL server-side reservations, refreshed by the client.
//!
//! Scanners are the main customer: every `next` call renews the scanner's
//! lease, and an expired lease closes the cursor behind the absent client.
//! A background task wakes periodically and fires the expiry callback of
//! every lease past its deadline. The lease map mutex serializes renewals
//! against expiry, so a renewal either lands before removal or observes
//! `LeaseExpired`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::errinput;

/// Fired exactly once when a lease expires. Not fired on cancel.
pub type LeaseListener = Box<dyn FnOnce() + Send>;

struct Lease {
    deadline: Instant,
    listener: LeaseListener,
}

pub struct Leases {
    leases: Mutex<HashMap<u64, Lease>>,
    ttl: Duration,
    shutdown_tx: broadcast::Sender<()>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl Leases {
    /// Creates the manager and starts the expiry checker, which wakes
    /// every `check_period`.
    pub fn start(ttl: Duration, check_period: Duration) -> Arc<Self> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let leases = Arc::new(Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
            shutdown_tx,
            checker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&leases);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(leases) = weak.upgrade() else { break };
                        leases.expire_due(Instant::now());
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        *leases.checker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        leases
    }

    /// Registers a lease. The id must be fresh.
    pub fn create(&self, id: u64, listener: LeaseListener) -> Result<()> {
        let mut leases = self.leases.lock()?;
        if leases.contains_key(&id) {
            return errinput!("lease {id} already exists");
        }
        leases.insert(
            id,
            Lease {
                deadline: Instant::now() + self.ttl,
                listener,
            },
        );
        Ok(())
    }

    /// Pushes the deadline out by one TTL. `LeaseExpired` when the lease
    /// is gone.
    pub fn renew(&self, id: u64) -> Result<()> {
        let mut leases = self.leases.lock()?;
        match leases.get_mut(&id) {
            Some(lease) => {
                lease.deadline = Instant::now() + self.ttl;
                Ok(())
            }
            None => Err(Error::LeaseExpired(id)),
        }
    }

    /// Drops a lease without firing its listener. Returns whether it
    /// existed.
    pub fn cancel(&self, id: u64) -> bool {
        self.leases
            .lock()
            .map(|mut leases| leases.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Fires and removes every lease whose deadline has passed. Listeners
    /// run outside the map lock.
    fn expire_due(&self, now: Instant) {
        let expired: Vec<(u64, LeaseListener)> = {
            let Ok(mut leases) = self.leases.lock() else {
                return;
            };
            let due: Vec<u64> = leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            due.into_iter()
                .filter_map(|id| leases.remove(&id).map(|lease| (id, lease.listener)))
                .collect()
        };
        for (id, listener) in expired {
            tracing::info!(lease = id, "lease expired");
            listener();
        }
    }

    /// Expires everything immediately, firing listeners. Used on stop.
    pub fn expire_all(&self) {
        let expired: Vec<(u64, LeaseListener)> = {
            let Ok(mut leases) = self.leases.lock() else {
                return;
            };
            leases
                .drain()
                .map(|(id, lease)| (id, lease.listener))
                .collect()
        };
        for (id, listener) in expired {
            tracing::info!(lease = id, "lease expired at shutdown");
            listener();
        }
    }

    /// Stops the expiry checker.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
        let handle = {
            let mut checker = self.checker.lock().unwrap_or_else(|e| e.into_inner());
            checker.take()
        };
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }
}
