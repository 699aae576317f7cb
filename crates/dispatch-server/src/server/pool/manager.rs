//! Pool of worker handles keyed by backend address.
//!
//! [`WorkerPool::reconcile`] brings the pool in line with a registration
//! snapshot. Entries are tagged [`WorkerEntry::Active`] while their handle
//! runs and [`WorkerEntry::Retired`] once it has stopped, so a backend that
//! died can be picked up again when it re-registers, and one that could not be
//! dialed is retried with backoff.
//!
//! The entry map sits behind a single lock that is never held across an
//! `.await`.

use super::{
    backoff::BackoffPolicy,
    worker::{HandleConfig, HandleState, RetireReason, Retirement, WorkerHandle},
};
use crate::server::{
    config::ServerConfig, queue::RequestQueue, registration::Registered, transport::Connector,
};
use core::{fmt, time::Duration};
use futures::FutureExt;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub handle: HandleConfig,
    pub dial_backoff: BackoffPolicy,
    /// Consecutive dial failures before a backend is left alone until it
    /// registers again.
    pub max_dial_attempts: u32,
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handle: HandleConfig::default(),
            dial_backoff: BackoffPolicy::default(),
            max_dial_attempts: 5,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handle: HandleConfig {
                health_check_freq: config.health_check_freq,
                health_check_timeout: config.health_check_timeout,
            },
            dial_backoff: BackoffPolicy::new(config.dial_backoff_first, config.dial_backoff_max),
            max_dial_attempts: config.max_dial_attempts,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// What the pool knows about one backend address.
#[derive(Debug)]
pub enum WorkerEntry {
    Active {
        stop: CancellationToken,
        task: JoinHandle<Retirement>,
        state: watch::Receiver<HandleState>,
        /// Registration the handle was started for.
        generation: usize,
        dial_failures: u32,
    },
    Retired {
        reason: RetireReason,
        generation: usize,
        dial_failures: u32,
        /// When a dial-failed backend may be dialed again. `None` means only a
        /// new registration brings it back.
        retry_at: Option<Instant>,
    },
}

/// Snapshot of a [`WorkerEntry`] for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    Active(HandleState),
    Retired(RetireReason),
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(state) => write!(f, "active ({state})"),
            Self::Retired(reason) => write!(f, "retired ({reason})"),
        }
    }
}

impl WorkerEntry {
    fn state(&self) -> EntryState {
        match self {
            Self::Active { state, .. } => EntryState::Active(*state.borrow()),
            Self::Retired { reason, .. } => EntryState::Retired(reason.clone()),
        }
    }

    const fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Handles started by this pass.
    pub spawned: usize,
    /// Handles found finished by this pass.
    pub retired: usize,
    /// Handles running after this pass.
    pub active: usize,
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawned {}, retired {}, active {}",
            self.spawned, self.retired, self.active
        )
    }
}

pub struct WorkerPool<C: Connector> {
    connector: Arc<C>,
    queue: RequestQueue,
    config: PoolConfig,
    entries: Mutex<HashMap<String, WorkerEntry>>,
    closed: AtomicBool,
}

impl<C: Connector> WorkerPool<C> {
    pub fn new(connector: Arc<C>, queue: RequestQueue, config: PoolConfig) -> Self {
        Self {
            connector,
            queue,
            config,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts handles for new or returning backends in `snapshot`.
    ///
    /// Finished handles are swept into [`WorkerEntry::Retired`] first. Then,
    /// for each registered address:
    ///
    /// - unknown: start a handle;
    /// - active: leave it;
    /// - retired, registered again since its handle was started: start a
    ///   fresh handle;
    /// - retired after a dial failure and past its backoff: redial;
    /// - otherwise: leave it.
    ///
    /// Reconciling the same snapshot twice starts nothing the second time.
    pub fn reconcile(&self, snapshot: &[Registered]) -> ReconcileSummary {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if self.closed.load(Ordering::Acquire) {
            return ReconcileSummary::default();
        }

        let mut summary = ReconcileSummary {
            retired: self.sweep_locked(&mut entries, now),
            ..ReconcileSummary::default()
        };

        for Registered {
            address,
            generation,
        } in snapshot
        {
            let dial_failures = match entries.get_mut(address) {
                None => 0,
                // A registration made while the handle runs is only acted on
                // once the handle retires.
                Some(WorkerEntry::Active { .. }) => continue,
                Some(WorkerEntry::Retired {
                    generation: retired_at,
                    ..
                }) if *generation > *retired_at => {
                    tracing::info!("Backend {address} registered again, replacing retired handle");
                    0
                }
                Some(WorkerEntry::Retired {
                    retry_at: Some(at),
                    dial_failures,
                    ..
                }) if *at <= now => {
                    tracing::info!("Redialing {address} (attempt {})", *dial_failures + 1);
                    *dial_failures
                }
                Some(WorkerEntry::Retired { .. }) => continue,
            };

            let entry = self.spawn_handle(address, *generation, dial_failures);
            entries.insert(address.clone(), entry);
            summary.spawned += 1;
        }

        summary.active = entries.values().filter(|entry| entry.is_active()).count();
        summary
    }

    /// Moves handles that have finished into [`WorkerEntry::Retired`].
    /// Returns how many were moved.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, Instant::now())
    }

    fn sweep_locked(&self, entries: &mut HashMap<String, WorkerEntry>, now: Instant) -> usize {
        let mut retired = 0;

        for (address, entry) in entries.iter_mut() {
            let WorkerEntry::Active {
                task,
                generation,
                dial_failures,
                ..
            } = entry
            else {
                continue;
            };
            if !task.is_finished() {
                continue;
            }
            let Some(joined) = task.now_or_never() else {
                continue;
            };

            let generation = *generation;
            let reason = reason_from_join(joined);
            let (dial_failures, retry_at) = if reason.is_dial_failure() {
                let failures = *dial_failures + 1;
                if failures < self.config.max_dial_attempts {
                    let delay = self.config.dial_backoff.next(failures - 1);
                    tracing::info!("Will redial {address} in {delay:?}");
                    (failures, Some(now + delay))
                } else {
                    tracing::warn!(
                        "Giving up on {address} after {failures} dial attempts until it registers again"
                    );
                    (failures, None)
                }
            } else {
                (0, None)
            };

            *entry = WorkerEntry::Retired {
                reason,
                generation,
                dial_failures,
                retry_at,
            };
            retired += 1;
        }

        retired
    }

    fn spawn_handle(&self, address: &str, generation: usize, dial_failures: u32) -> WorkerEntry {
        let stop = CancellationToken::new();
        let handle = WorkerHandle::new(
            address,
            generation,
            Arc::clone(&self.connector),
            self.queue.clone(),
            self.config.handle,
            stop.clone(),
        );
        let state = handle.subscribe();

        tracing::info!("Starting handle for {address}");
        let span = tracing::info_span!("worker_handle", address = %address, generation);
        let task = tokio::spawn(handle.run().instrument(span));

        WorkerEntry::Active {
            stop,
            task,
            state,
            generation,
            dial_failures,
        }
    }

    /// Signals the handle for `address` to stop. Returns `false` if there is
    /// no running handle for it.
    pub fn stop(&self, address: &str) -> bool {
        match self.entries.lock().get(address) {
            Some(WorkerEntry::Active { stop, .. }) => {
                stop.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stops every handle and waits, up to the shutdown timeout each, for
    /// them to requeue what they hold. Handles that overrun are aborted.
    /// Later reconciliations do nothing.
    pub async fn shutdown(&self) {
        let running = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::Release);

            let addresses: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_active())
                .map(|(address, _)| address.clone())
                .collect();

            let mut running = Vec::with_capacity(addresses.len());
            for address in addresses {
                if let Some(WorkerEntry::Active {
                    stop,
                    task,
                    generation,
                    ..
                }) = entries.remove(&address)
                {
                    stop.cancel();
                    running.push((address, generation, task));
                }
            }
            running
        };

        tracing::info!("Stopping {} worker handles", running.len());
        let shutdown_timeout = self.config.shutdown_timeout;

        let stopped = futures::future::join_all(running.into_iter().map(
            |(address, generation, mut task)| async move {
                let reason = match timeout(shutdown_timeout, &mut task).await {
                    Ok(joined) => reason_from_join(joined),
                    Err(_) => {
                        tracing::warn!("Handle for {address} did not stop in time, aborting");
                        task.abort();
                        RetireReason::Aborted("shutdown timed out".into())
                    }
                };
                let entry = WorkerEntry::Retired {
                    reason,
                    generation,
                    dial_failures: 0,
                    retry_at: None,
                };
                (address, entry)
            },
        ))
        .await;

        self.entries.lock().extend(stopped);
        tracing::info!("Worker pool shutdown complete");
    }

    pub fn state(&self, address: &str) -> Option<EntryState> {
        self.entries.lock().get(address).map(WorkerEntry::state)
    }

    /// Watches the running handle for `address`, if there is one.
    pub fn subscribe(&self, address: &str) -> Option<watch::Receiver<HandleState>> {
        match self.entries.lock().get(address) {
            Some(WorkerEntry::Active { state, .. }) => Some(state.clone()),
            _ => None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One line listing every entry and its state, sorted by address.
    pub fn report(&self) -> String {
        let entries = self.entries.lock();
        let mut lines: Vec<String> = entries
            .iter()
            .map(|(address, entry)| format!("{address}: {}", entry.state()))
            .collect();
        lines.sort();
        format!("Pool: [{}]", lines.join(", "))
    }
}

fn reason_from_join(joined: Result<Retirement, JoinError>) -> RetireReason {
    match joined {
        Ok(retirement) => retirement.reason,
        Err(err) => RetireReason::Aborted(err.to_string()),
    }
}

impl<C: Connector> fmt::Debug for WorkerPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("entries", &self.len())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::service::WorkerService, server::transport::local::LocalConnector};

    fn registered(address: &str, generation: usize) -> Registered {
        Registered {
            address: address.into(),
            generation,
        }
    }

    fn pool(connector: &Arc<LocalConnector>) -> WorkerPool<LocalConnector> {
        WorkerPool::new(
            Arc::clone(connector),
            RequestQueue::new(8, None),
            PoolConfig {
                dial_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4)),
                max_dial_attempts: 3,
                ..PoolConfig::default()
            },
        )
    }

    /// Lets spawned handles run until `address` has retired.
    async fn until_retired(pool: &WorkerPool<LocalConnector>, address: &str) -> RetireReason {
        loop {
            pool.sweep();
            if let Some(EntryState::Retired(reason)) = pool.state(address) {
                return reason;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let connector = Arc::new(LocalConnector::new());
        connector.insert("a", WorkerService::new());
        connector.insert("b", WorkerService::new());
        let pool = pool(&connector);
        let snapshot = [registered("a", 0), registered("b", 1)];

        let first = pool.reconcile(&snapshot);
        let second = pool.reconcile(&snapshot);

        assert_eq!(first.spawned, 2);
        assert_eq!(second.spawned, 0);
        assert_eq!(second.active, 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_handle_stays_retired_until_reregistered() {
        let connector = Arc::new(LocalConnector::new());
        connector.insert("a", WorkerService::new());
        let pool = pool(&connector);

        pool.reconcile(&[registered("a", 0)]);
        assert!(pool.stop("a"));
        assert_eq!(until_retired(&pool, "a").await, RetireReason::Stopped);
        assert!(!pool.stop("a"));

        assert_eq!(pool.reconcile(&[registered("a", 0)]).spawned, 0);
        assert_eq!(pool.reconcile(&[registered("a", 3)]).spawned, 1);
        assert!(matches!(pool.state("a"), Some(EntryState::Active(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn registration_while_active_revives_the_handle_once_it_retires() {
        let connector = Arc::new(LocalConnector::new());
        connector.insert("a", WorkerService::new());
        let pool = pool(&connector);

        pool.reconcile(&[registered("a", 0)]);
        assert_eq!(pool.reconcile(&[registered("a", 1)]).spawned, 0);

        assert!(pool.stop("a"));
        until_retired(&pool, "a").await;
        assert_eq!(pool.reconcile(&[registered("a", 1)]).spawned, 1);
        assert_eq!(pool.reconcile(&[registered("a", 1)]).spawned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_failures_are_retried_with_backoff_then_abandoned() {
        let connector = Arc::new(LocalConnector::new());
        let pool = pool(&connector);
        let snapshot = [registered("gone", 0)];

        // First failure: retry after 1s.
        pool.reconcile(&snapshot);
        assert!(until_retired(&pool, "gone").await.is_dial_failure());
        assert_eq!(pool.reconcile(&snapshot).spawned, 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.reconcile(&snapshot).spawned, 1);

        // Second failure: retry after 2s.
        until_retired(&pool, "gone").await;
        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert_eq!(pool.reconcile(&snapshot).spawned, 0);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(pool.reconcile(&snapshot).spawned, 1);

        // Third failure reaches the limit.
        until_retired(&pool, "gone").await;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(pool.reconcile(&snapshot).spawned, 0);

        // A fresh registration starts over.
        connector.insert("gone", WorkerService::new());
        assert_eq!(pool.reconcile(&[registered("gone", 1)]).spawned, 1);
        let mut state = pool.subscribe("gone").unwrap();
        state.wait_for(|s| *s == HandleState::Idle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_handle_and_blocks_reconcile() {
        let connector = Arc::new(LocalConnector::new());
        connector.insert("a", WorkerService::new());
        connector.insert("b", WorkerService::new());
        let pool = pool(&connector);

        pool.reconcile(&[registered("a", 0), registered("b", 1)]);
        pool.shutdown().await;

        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.state("a"), Some(EntryState::Retired(RetireReason::Stopped)));
        assert_eq!(pool.reconcile(&[registered("c", 2)]), ReconcileSummary::default());
        assert!(pool.report().contains("b: retired (stopped)"));
    }
}
