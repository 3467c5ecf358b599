//! Outbox relay: drains committed facts to the event bus.
//!
//! The relay is the only mutator of outbox record state. It polls the store
//! for publishable records, publishes each to the bus with the record id as
//! the dedup key, then marks it published in a separate idempotent update.
//! A crash between publish and mark means the record is published again on
//! resume; consumers dedupe on the id, so delivery is **at-least-once**.
//!
//! Failures back off per the configured policy; a record that exhausts its
//! retries is dead-lettered for operator inspection, never dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use coopledger_events::EventBus;

use crate::retry::RetryPolicy;
use crate::store::{OutboxStore, OutboxStoreError};

/// Relay worker configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum records claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls when the outbox is empty.
    pub poll_interval: Duration,
    /// Claim lease duration; an expired lease is reclaimable by any worker.
    pub lease_duration: Duration,
    /// Backoff policy for publish failures.
    pub retry: RetryPolicy,
    /// Worker name for logging and lease ownership.
    pub name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            name: "outbox-relay".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub published: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running relay worker.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Current relay statistics.
    pub fn stats(&self) -> RelayStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Background relay draining an outbox store to an event bus.
pub struct OutboxRelay<S, B> {
    store: S,
    bus: B,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: OutboxStore + Send + Sync + 'static,
    B: EventBus + Send + Sync + 'static,
{
    pub fn new(store: S, bus: B, config: RelayConfig) -> Self {
        Self { store, bus, config }
    }

    /// Claim and publish one batch synchronously.
    ///
    /// Returns the number of records confirmed published. Used by the worker
    /// loop and directly by tests.
    pub fn drain_once(&self) -> Result<usize, OutboxStoreError> {
        let lease = ChronoDuration::from_std(self.config.lease_duration).unwrap_or_default();
        let batch = self
            .store
            .claim_batch(&self.config.name, self.config.batch_size, lease)?;

        let mut published = 0;
        let mut failed_partitions: HashSet<String> = HashSet::new();
        for record in batch {
            // A failed record blocks the rest of its partition for this
            // batch; the claim selection re-establishes order on retry.
            if let Some(key) = record.partition_key.as_deref() {
                if failed_partitions.contains(key) {
                    debug!(
                        relay = %self.config.name,
                        record_id = %record.id,
                        partition = key,
                        "skipped behind a failed record in its partition"
                    );
                    continue;
                }
            }

            match self.bus.publish(&record.topic, record.to_envelope()) {
                Ok(()) => {
                    // Separate idempotent update: if we crash before this,
                    // the record is re-published and deduped downstream.
                    self.store.mark_published(record.id)?;
                    published += 1;
                    debug!(
                        relay = %self.config.name,
                        record_id = %record.id,
                        topic = %record.topic,
                        "outbox record published"
                    );
                }
                Err(e) => {
                    if let Some(key) = record.partition_key.clone() {
                        failed_partitions.insert(key);
                    }
                    let state =
                        self.store
                            .record_failure(record.id, &format!("{e:?}"), &self.config.retry)?;
                    if state.is_dead_lettered() {
                        warn!(
                            relay = %self.config.name,
                            record_id = %record.id,
                            topic = %record.topic,
                            error = ?e,
                            "outbox record dead-lettered"
                        );
                    } else {
                        debug!(
                            relay = %self.config.name,
                            record_id = %record.id,
                            error = ?e,
                            "publish failed, will retry with backoff"
                        );
                    }
                }
            }
        }

        Ok(published)
    }

    /// Purge published records older than the configured retention window.
    ///
    /// Scheduled by operators (not the poll loop): retention is an explicit
    /// decision, never an implicit expiry.
    pub fn purge_published(
        &self,
        retention: &crate::retention::RetentionConfig,
    ) -> Result<usize, OutboxStoreError> {
        let window = ChronoDuration::from_std(retention.published_outbox).unwrap_or_default();
        let purged = self.store.purge_published(window)?;
        if purged > 0 {
            info!(relay = %self.config.name, purged, "published outbox records purged");
        }
        Ok(purged)
    }

    /// Spawn the relay in a background thread.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let stats_clone = stats.clone();

        let name = self.config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || relay_loop(self, shutdown_rx, stats_clone))
            .expect("failed to spawn outbox relay thread");

        RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn relay_loop<S, B>(
    relay: OutboxRelay<S, B>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RelayStats>>,
) where
    S: OutboxStore + Send + Sync + 'static,
    B: EventBus + Send + Sync + 'static,
{
    info!(relay = %relay.config.name, "outbox relay started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match relay.drain_once() {
            Ok(published) => {
                {
                    let mut s = stats.lock().unwrap();
                    s.batches += 1;
                    s.published += published as u64;
                    s.uptime_secs = start_time.elapsed().as_secs();
                    if let Ok(dls) = relay.store.dead_letters(usize::MAX) {
                        s.dead_lettered = dls.len() as u64;
                    }
                }
                if published == 0 {
                    thread::sleep(relay.config.poll_interval);
                }
            }
            Err(e) => {
                error!(relay = %relay.config.name, error = ?e, "relay poll failed");
                {
                    let mut s = stats.lock().unwrap();
                    s.failed += 1;
                }
                thread::sleep(relay.config.poll_interval);
            }
        }
    }

    info!(relay = %relay.config.name, "outbox relay stopped");
}
