//! State projection: the workflow snapshot fold and named read models.
//!
//! The workflow snapshot is produced by the pure [`fold`]. Secondary read
//! models implement [`Projection`] and are cached per `(name, instance)` by
//! the [`Projector`]. Reads are read-your-writes: a cache entry is caught up
//! to the latest committed event before it is returned. Live subscriptions
//! keep entries warm as events commit, either in-process or through the
//! [`ProjectionWorker`] following the store's global feed.

mod snapshot;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub use snapshot::{TaskRecord, WorkflowSnapshot, fold};
pub(crate) use snapshot::is_open_wait;

use crate::error::{Error, Result};
use crate::event::WorkflowEvent;
use crate::log::EventLog;
use crate::store::{EventStore, ProjectionStore, SnapshotStore};
use crate::workflow::WorkflowRef;

/// A named read model derived from an instance's events.
///
/// `apply_event` must be deterministic: projections are caches that can be
/// discarded and rebuilt from the log at any time.
///
/// # Example
///
/// ```
/// use eventflow::{Projection, WorkflowEvent};
///
/// struct FailureCount;
///
/// impl Projection for FailureCount {
///     const NAME: &'static str = "failure_count";
///     type State = u32;
///
///     fn apply_event(&self, event: &WorkflowEvent, state: u32) -> u32 {
///         if event.event_type() == "task.failed" { state + 1 } else { state }
///     }
/// }
/// ```
pub trait Projection: Send + Sync + 'static {
    /// Projection identifier, unique per projector.
    const NAME: &'static str;

    /// The read model. `Default` is the state before any event.
    type State: Clone + Default + Send + Sync + 'static;

    fn apply_event(&self, event: &WorkflowEvent, state: Self::State) -> Self::State;
}

type AnyState = Box<dyn Any + Send + Sync>;

trait ErasedProjection: Send + Sync {
    fn initial(&self) -> AnyState;
    fn apply(&self, event: &WorkflowEvent, state: &mut AnyState) -> Result<()>;
}

struct Erased<P>(P);

impl<P: Projection> ErasedProjection for Erased<P> {
    fn initial(&self) -> AnyState {
        Box::new(P::State::default())
    }

    fn apply(&self, event: &WorkflowEvent, state: &mut AnyState) -> Result<()> {
        let state = state
            .downcast_mut::<P::State>()
            .ok_or_else(|| Error::UnknownProjection(P::NAME.to_owned()))?;
        let prior = std::mem::take(state);
        *state = self.0.apply_event(event, prior);
        Ok(())
    }
}

struct CacheEntry {
    watermark: u64,
    state: AnyState,
}

type CacheKey = (&'static str, WorkflowRef);

/// Folds snapshots and caches named projections.
pub struct Projector<S> {
    log: EventLog<S>,
    projections: HashMap<&'static str, Arc<dyn ErasedProjection>>,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    live: RwLock<HashSet<&'static str>>,
}

impl<S> Projector<S>
where
    S: EventStore + SnapshotStore,
{
    pub fn new(log: EventLog<S>) -> Self {
        Self {
            log,
            projections: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
            live: RwLock::new(HashSet::new()),
        }
    }

    pub fn log(&self) -> &EventLog<S> {
        &self.log
    }

    /// Register a projection. Names must be unique.
    pub fn register<P: Projection>(&mut self, projection: P) -> Result<()> {
        if self.projections.contains_key(P::NAME) {
            return Err(Error::DuplicateProjection(P::NAME.to_owned()));
        }
        self.projections
            .insert(P::NAME, Arc::new(Erased(projection)));
        Ok(())
    }

    /// Names of all registered projections.
    pub fn projection_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.projections.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Current workflow snapshot: latest stored snapshot plus newer events.
    pub async fn current(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        let seed = match self.log.load_snapshot::<WorkflowSnapshot>(workflow).await? {
            Some((watermark, snapshot))
                if snapshot.sequence == watermark && snapshot.workflow() == *workflow =>
            {
                snapshot
            }
            Some((watermark, _)) => {
                warn!(workflow = %workflow, watermark, "Ignoring mismatched snapshot");
                WorkflowSnapshot::empty(workflow)
            }
            None => WorkflowSnapshot::empty(workflow),
        };
        let events = self.log.read(workflow, seed.sequence + 1, None).await?;
        fold(&events, seed)
    }

    /// Snapshot folded from the first event, ignoring stored snapshots.
    pub async fn replay(&self, workflow: &WorkflowRef) -> Result<WorkflowSnapshot> {
        let events = self.log.history(workflow).await?;
        fold(&events, WorkflowSnapshot::empty(workflow))
    }

    /// Read projection `P` for `workflow`, caught up to the latest event.
    pub async fn read<P: Projection>(&self, workflow: &WorkflowRef) -> Result<P::State> {
        let projection = self.projection(P::NAME)?;
        loop {
            let watermark = self.cached_watermark(P::NAME, workflow)?.unwrap_or(0);
            let events = self.log.read(workflow, watermark + 1, None).await?;

            let mut cache = self.lock_cache()?;
            let entry = cache
                .entry((P::NAME, workflow.clone()))
                .or_insert_with(|| CacheEntry {
                    watermark: 0,
                    state: projection.initial(),
                });

            // Another reader may have moved the entry while we were reading,
            // or it was invalidated. Retry from its current watermark.
            if entry.watermark + 1 < events.first().map_or(1, |e| e.sequence) {
                continue;
            }
            for event in events.iter() {
                if event.sequence <= entry.watermark {
                    continue;
                }
                projection.apply(event, &mut entry.state)?;
                entry.watermark = event.sequence;
            }

            return entry
                .state
                .downcast_ref::<P::State>()
                .cloned()
                .ok_or_else(|| Error::UnknownProjection(P::NAME.to_owned()));
        }
    }

    /// Keep `name` updated as events commit.
    pub fn subscribe(&self, name: &str) -> Result<()> {
        let (&name, _) = self
            .projections
            .get_key_value(name)
            .ok_or_else(|| Error::UnknownProjection(name.to_owned()))?;
        self.live
            .write()
            .map_err(|_| Error::LockPoisoned("projector subscriptions"))?
            .insert(name);
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        self.live
            .write()
            .map_err(|_| Error::LockPoisoned("projector subscriptions"))?
            .remove(name);
        Ok(())
    }

    /// Drop the cache entry for `(name, workflow)`; the next read rebuilds it.
    pub fn invalidate(&self, name: &str, workflow: &WorkflowRef) -> Result<()> {
        let mut cache = self.lock_cache()?;
        cache.retain(|(entry_name, entry_workflow), _| {
            !(*entry_name == name && entry_workflow == workflow)
        });
        Ok(())
    }

    /// Drop every cached projection of `workflow`.
    pub fn invalidate_workflow(&self, workflow: &WorkflowRef) -> Result<()> {
        self.lock_cache()?.retain(|(_, w), _| w != workflow);
        Ok(())
    }

    /// Watermark of the cached entry, if one exists.
    pub fn cached_watermark(&self, name: &str, workflow: &WorkflowRef) -> Result<Option<u64>> {
        let cache = self.lock_cache()?;
        Ok(cache
            .iter()
            .find(|((n, w), _)| *n == name && w == workflow)
            .map(|(_, entry)| entry.watermark))
    }

    /// Incrementally apply freshly committed events to live projections.
    ///
    /// Entries that are not exactly one event behind are left alone; the
    /// next read catches them up from the log.
    pub fn on_committed(&self, events: &[WorkflowEvent]) -> Result<()> {
        let live: Vec<&'static str> = self
            .live
            .read()
            .map_err(|_| Error::LockPoisoned("projector subscriptions"))?
            .iter()
            .copied()
            .collect();
        if live.is_empty() || events.is_empty() {
            return Ok(());
        }

        let mut cache = self.lock_cache()?;
        for name in live {
            let Some(projection) = self.projections.get(name) else {
                continue;
            };
            for event in events {
                let key = (name, event.workflow());
                if event.sequence == 1 && !cache.contains_key(&key) {
                    cache.insert(
                        key.clone(),
                        CacheEntry {
                            watermark: 0,
                            state: projection.initial(),
                        },
                    );
                }
                let Some(entry) = cache.get_mut(&key) else {
                    continue;
                };
                if entry.watermark + 1 == event.sequence {
                    projection.apply(event, &mut entry.state)?;
                    entry.watermark = event.sequence;
                    debug!(projection = name, workflow = %key.1, sequence = event.sequence, "Projection advanced");
                }
            }
        }
        Ok(())
    }

    fn projection(&self, name: &str) -> Result<Arc<dyn ErasedProjection>> {
        self.projections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProjection(name.to_owned()))
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.cache
            .lock()
            .map_err(|_| Error::LockPoisoned("projector cache"))
    }
}

/// Configuration for projection workers.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// How often to poll for new events.
    pub poll_interval: Duration,
    /// Maximum number of events to fetch per batch.
    pub batch_size: u32,
    /// Base delay for retry backoff after projection failures.
    pub error_backoff_base: Duration,
    /// Maximum delay for retry backoff after projection failures.
    pub error_backoff_max: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            error_backoff_base: Duration::from_millis(200),
            error_backoff_max: Duration::from_secs(5),
        }
    }
}

impl ProjectionConfig {
    fn error_backoff_duration(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        let delay = self.error_backoff_base.saturating_mul(multiplier);
        delay.min(self.error_backoff_max)
    }
}

/// Worker that feeds live projections from the store's global event feed.
///
/// Picks up events committed by other processes sharing the store. Its
/// position is checkpointed under `checkpoint` in the [`ProjectionStore`].
pub struct ProjectionWorker<S> {
    projector: Arc<Projector<S>>,
    config: ProjectionConfig,
    checkpoint: String,
    worker_id: String,
}

impl<S> ProjectionWorker<S>
where
    S: EventStore + SnapshotStore + ProjectionStore,
{
    pub fn new(
        projector: Arc<Projector<S>>,
        config: ProjectionConfig,
        checkpoint: impl Into<String>,
        worker_id: String,
    ) -> Self {
        Self {
            projector,
            config,
            checkpoint: checkpoint.into(),
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        info!(
            worker_id = %self.worker_id,
            checkpoint = %self.checkpoint,
            "Projection worker started"
        );

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.process_batch().await {
                        Ok(_) => {
                            failures = 0;
                        }
                        Err(err) => {
                            failures = failures.saturating_add(1);
                            let backoff = self.config.error_backoff_duration(failures);
                            info!(
                                worker_id = %self.worker_id,
                                checkpoint = %self.checkpoint,
                                failures,
                                backoff_ms = backoff.as_millis() as u64,
                                "Projection error, backing off"
                            );
                            tracing::error!(error = %err, "Projection batch failed");
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            checkpoint = %self.checkpoint,
            "Projection worker shutting down"
        );
        Ok(())
    }

    /// Apply one batch from the feed. Returns the number of events consumed.
    pub async fn process_batch(&self) -> Result<usize> {
        let store = self.projector.log().store();
        let position = store.load_projection_position(&self.checkpoint).await?;
        let events = store
            .fetch_events_since(position, self.config.batch_size)
            .await?;

        for stored in &events {
            self.projector
                .on_committed(std::slice::from_ref(&stored.event))?;
            store
                .store_projection_position(&self.checkpoint, stored.global_sequence)
                .await?;
        }

        if let Some(last) = events.last() {
            debug!(
                checkpoint = %self.checkpoint,
                global_sequence = last.global_sequence,
                "Projection feed advanced"
            );
        }
        Ok(events.len())
    }
}
