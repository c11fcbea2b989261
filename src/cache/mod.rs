//! Cache of remote image cells with blocking and budgeted loading.
//!
//! Every cell entry moves through `Absent -> Enqueued -> Loading -> Valid`. A valid entry can be
//! invalidated to `Stale`, which keeps serving the old samples until a re-request loads new ones.
//! A failed fetch returns the entry to `Absent`, or to `Stale` if it held data before.
//!
//! Budgeted requests never wait: they queue a background fetch and return whatever is resident,
//! marked as not valid. Blocking requests fetch on the calling thread, or wait for the fetch of
//! the same cell that is already in flight.

mod queue;
#[cfg(test)]
mod tests;

use crate::config::CacheConfig;
use crate::downloader::Downloader;
use crate::error::{CacheError, Result};
use crate::metadata::DatasetMetadata;
use crate::model::{CellKey, LoadingStrategy};
use crate::source::{CellRequest, CellSource};
use derive_more::Debug;
use fxhash::FxHashMap;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use queue::FetchQueue;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellState {
    Absent,
    Enqueued,
    Loading,
    Valid,
    Stale,
}

/// Read-only view of a cell's samples at the time of the request.
#[derive(Clone, Debug)]
pub struct CellSnapshot {
    pub key: CellKey,
    /// First voxel of the cell.
    pub min: [u64; 3],
    pub dims: [u32; 3],
    /// Number of completed loads of this cell, `0` for the placeholder.
    pub version: u64,
    pub valid: bool,
    #[debug(skip)]
    data: Arc<[u16]>,
}
impl CellSnapshot {
    /// Samples with x varying fastest.
    pub fn data(&self) -> &[u16] { &self.data }
    pub fn get(&self, offset: usize) -> u16 { self.data[offset] }
    pub fn same_buffer(&self, other: &CellSnapshot) -> bool { Arc::ptr_eq(&self.data, &other.data) }
}

struct EntryState {
    state: CellState,
    data: Arc<[u16]>,
    version: u64,
    /// Completed loads, successful or not.
    attempts: u64,
    last_error: Option<String>,
}

pub(crate) struct CellEntry {
    request: CellRequest,
    priority: u32,
    state: Mutex<EntryState>,
    changed: Condvar,
}
impl CellEntry {
    fn new(request: CellRequest, priority: u32) -> Self {
        let placeholder: Arc<[u16]> = vec![0u16; request.num_samples()].into();
        CellEntry {
            request,
            priority,
            state: Mutex::new(EntryState {
                state: CellState::Absent,
                data: placeholder,
                version: 0,
                attempts: 0,
                last_error: None,
            }),
            changed: Condvar::new(),
        }
    }
    fn snapshot(&self, st: &EntryState) -> CellSnapshot {
        CellSnapshot {
            key: self.request.key,
            min: self.request.min,
            dims: self.request.dims,
            version: st.version,
            valid: st.state == CellState::Valid,
            data: st.data.clone(),
        }
    }
}

struct Resident {
    entry: Arc<CellEntry>,
    last_used: u64,
}

/// Resident entries with least recently used eviction.
struct Entries {
    map: FxHashMap<CellKey, Resident>,
    lru: BTreeMap<u64, CellKey>,
    tick: u64,
    capacity: usize,
}
impl Entries {
    fn touch(&mut self, key: CellKey) -> Option<Arc<CellEntry>> {
        self.tick += 1;
        let resident = self.map.get_mut(&key)?;
        self.lru.remove(&resident.last_used);
        resident.last_used = self.tick;
        self.lru.insert(self.tick, key);
        Some(resident.entry.clone())
    }
    fn insert(&mut self, key: CellKey, entry: Arc<CellEntry>) -> usize {
        self.tick += 1;
        self.lru.insert(self.tick, key);
        self.map.insert(
            key,
            Resident {
                entry,
                last_used: self.tick,
            },
        );

        let mut evicted = 0;
        while self.map.len() > self.capacity {
            let Some((_, oldest)) = self.lru.pop_first() else {
                break;
            };
            self.map.remove(&oldest);
            evicted += 1;
        }
        evicted
    }
    fn peek(&self, key: &CellKey) -> Option<Arc<CellEntry>> { self.map.get(key).map(|r| r.entry.clone()) }
    fn is_resident(&self, entry: &Arc<CellEntry>) -> bool {
        self.map
            .get(&entry.request.key)
            .is_some_and(|r| Arc::ptr_eq(&r.entry, entry))
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    discarded: AtomicU64,
}
impl Counters {
    fn inc(counter: &AtomicU64) { counter.fetch_add(1, Ordering::Relaxed); }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub requests: u64,
    /// Requests answered with valid data without any loading.
    pub hits: u64,
    /// Successful loads.
    pub fetches: u64,
    pub failures: u64,
    pub evictions: u64,
    /// Loads that completed after their cell had been evicted.
    pub discarded: u64,
    pub resident: usize,
    pub pending_jobs: usize,
}

pub type InvalidationListener = Arc<dyn Fn(CellKey) + Send + Sync>;

/// State shared between the cache handle and its fetch workers.
pub(crate) struct CacheShared {
    metadata: Arc<DatasetMetadata>,
    source: Arc<dyn CellSource>,
    entries: Mutex<Entries>,
    pub(crate) queue: Mutex<FetchQueue>,
    pub(crate) queue_available: Condvar,
    pub(crate) shutdown: AtomicBool,
    listener: RwLock<Option<InvalidationListener>>,
    counters: Counters,
    blocking_timeout: Option<Duration>,
}
impl CacheShared {
    fn entry(&self, key: CellKey) -> Result<Arc<CellEntry>> {
        if let Some(entry) = self.entries.lock().touch(key) {
            return Ok(entry);
        }

        let request = self.metadata.cell_request(key)?;
        let priority = self.metadata.priority(key.id)?;

        let mut entries = self.entries.lock();
        // somebody else might have created it in the meantime
        if let Some(entry) = entries.touch(key) {
            return Ok(entry);
        }
        let entry = Arc::new(CellEntry::new(request, priority));
        let evicted = entries.insert(key, entry.clone());
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Ok(entry)
    }

    fn enqueue(&self, entry: &Arc<CellEntry>, priority: u32) {
        let mut queue = self.queue.lock();
        if queue.push(entry.request.key, priority) {
            self.queue_available.notify_one();
        }
    }

    fn get_budgeted(&self, entry: &Arc<CellEntry>, priority: u32) -> CellSnapshot {
        let mut st = entry.state.lock();
        match st.state {
            CellState::Valid => {
                Counters::inc(&self.counters.hits);
                return entry.snapshot(&st);
            }
            CellState::Loading => return entry.snapshot(&st),
            CellState::Absent | CellState::Stale => st.state = CellState::Enqueued,
            CellState::Enqueued => {}
        }
        let snapshot = entry.snapshot(&st);
        drop(st);

        self.enqueue(entry, priority);
        snapshot
    }

    fn get_blocking(&self, entry: &Arc<CellEntry>) -> Result<CellSnapshot> {
        let deadline = self.blocking_timeout.map(|t| Instant::now() + t);
        let mut st = entry.state.lock();
        if st.state == CellState::Valid {
            Counters::inc(&self.counters.hits);
        }
        match st.state {
            CellState::Valid => Ok(entry.snapshot(&st)),
            CellState::Loading => {
                // wait for the load in flight and share its outcome
                let attempt = st.attempts;
                let version = st.version;
                while st.attempts == attempt {
                    match deadline {
                        Some(deadline) => {
                            if entry.changed.wait_until(&mut st, deadline).timed_out() && st.attempts == attempt {
                                return Err(CacheError::Timeout(entry.request.key));
                            }
                        }
                        None => entry.changed.wait(&mut st),
                    }
                }
                if st.version > version {
                    Ok(entry.snapshot(&st))
                } else {
                    Err(CacheError::FetchFailed {
                        key: entry.request.key,
                        reason: st.last_error.clone().unwrap_or_default(),
                    })
                }
            }
            CellState::Absent | CellState::Stale | CellState::Enqueued => {
                // a queued job for this cell finds it no longer enqueued and skips it
                let was_enqueued = st.state == CellState::Enqueued;
                st.state = CellState::Loading;
                drop(st);
                let result = self.fetch(entry);
                self.complete(entry, result, was_enqueued)
            }
        }
    }

    /// Runs a job taken from the queue by a fetch worker.
    pub(crate) fn run_job(&self, key: CellKey) {
        let Some(entry) = self.entries.lock().peek(&key) else {
            debug!("Dropping job for evicted cell {}", key);
            return;
        };
        {
            let mut st = entry.state.lock();
            if st.state != CellState::Enqueued {
                // already loaded by a blocking request
                return;
            }
            st.state = CellState::Loading;
        }
        let result = self.fetch(&entry);
        if let Err(e) = self.complete(&entry, result, false) {
            warn!("{}", e);
        }
    }

    fn fetch(&self, entry: &CellEntry) -> std::result::Result<Arc<[u16]>, String> {
        let request = &entry.request;
        let samples = catch_unwind(AssertUnwindSafe(|| self.source.fetch(request)))
            .map_err(|_| "cell source panicked".to_string())??;

        if samples.len() != request.num_samples() {
            return Err(format!(
                "expected {} samples for {:?} voxels but got {}",
                request.num_samples(),
                request.dims,
                samples.len()
            ));
        }
        Ok(samples.into())
    }

    /// Publishes the result of a load. With `requeue`, a failure puts the cell back in the queue
    /// for the budgeted request that had been waiting for it.
    fn complete(
        &self,
        entry: &Arc<CellEntry>,
        result: std::result::Result<Arc<[u16]>, String>,
        requeue: bool,
    ) -> Result<CellSnapshot> {
        let key = entry.request.key;
        let outcome = {
            let mut st = entry.state.lock();
            st.attempts += 1;
            let outcome = match result {
                Ok(data) => {
                    st.data = data;
                    st.state = CellState::Valid;
                    st.version += 1;
                    st.last_error = None;
                    Ok(entry.snapshot(&st))
                }
                Err(reason) => {
                    st.state = if requeue {
                        CellState::Enqueued
                    } else if st.version > 0 {
                        CellState::Stale
                    } else {
                        CellState::Absent
                    };
                    st.last_error = Some(reason.clone());
                    Err(CacheError::FetchFailed { key, reason })
                }
            };
            entry.changed.notify_all();
            outcome
        };

        match &outcome {
            Ok(_) => {
                Counters::inc(&self.counters.fetches);
                if self.entries.lock().is_resident(entry) {
                    debug!("Loaded cell {}", key);
                    let listener = self.listener.read().clone();
                    if let Some(listener) = listener {
                        listener(key);
                    }
                } else {
                    debug!("Discarding cell {} loaded after eviction", key);
                    Counters::inc(&self.counters.discarded);
                }
            }
            Err(_) => {
                Counters::inc(&self.counters.failures);
                if requeue {
                    self.enqueue(entry, entry.priority);
                }
            }
        }
        outcome
    }
}

/// Cache of cell contents keyed by timepoint, setup, level and cell index.
pub struct CellCache {
    shared: Arc<CacheShared>,
    downloader: Downloader,
}
impl CellCache {
    pub fn new(metadata: Arc<DatasetMetadata>, source: Arc<dyn CellSource>, config: &CacheConfig) -> Self {
        let shared = Arc::new(CacheShared {
            metadata,
            source,
            entries: Mutex::new(Entries {
                map: FxHashMap::default(),
                lru: BTreeMap::new(),
                tick: 0,
                capacity: config.max_resident_cells.max(1),
            }),
            queue: Mutex::new(FetchQueue::new()),
            queue_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            listener: RwLock::new(None),
            counters: Counters::default(),
            blocking_timeout: config.blocking_timeout(),
        });
        let num_threads = config.num_fetcher_threads.max(1);
        info!(
            "Starting cell cache with {} fetch threads for at most {} cells",
            num_threads, config.max_resident_cells
        );
        let downloader = Downloader::spawn(shared.clone(), num_threads);

        CellCache { shared, downloader }
    }

    pub fn metadata(&self) -> &Arc<DatasetMetadata> { &self.shared.metadata }

    pub fn get(&self, key: CellKey, strategy: LoadingStrategy) -> Result<CellSnapshot> {
        self.request(key, strategy, None)
    }

    /// Like `get`, with a fetch priority other than the level's default. A budgeted request for a
    /// cell that is already queued moves the job up if `priority` is higher.
    pub fn get_with_priority(&self, key: CellKey, strategy: LoadingStrategy, priority: u32) -> Result<CellSnapshot> {
        self.request(key, strategy, Some(priority))
    }

    fn request(&self, key: CellKey, strategy: LoadingStrategy, priority: Option<u32>) -> Result<CellSnapshot> {
        Counters::inc(&self.shared.counters.requests);
        let entry = self.shared.entry(key)?;
        match strategy {
            LoadingStrategy::Budgeted => {
                let priority = priority.unwrap_or(entry.priority);
                Ok(self.shared.get_budgeted(&entry, priority))
            }
            LoadingStrategy::Blocking => self.shared.get_blocking(&entry),
        }
    }

    /// Marks a loaded cell as outdated. It keeps serving its samples until a re-request reloads it.
    pub fn invalidate(&self, key: CellKey) -> bool {
        let Some(entry) = self.shared.entries.lock().touch(key) else {
            return false;
        };
        let mut st = entry.state.lock();
        if st.state == CellState::Valid {
            st.state = CellState::Stale;
            true
        } else {
            false
        }
    }

    pub fn invalidate_all(&self) -> usize {
        let entries: Vec<Arc<CellEntry>> = self
            .shared
            .entries
            .lock()
            .map
            .values()
            .map(|r| r.entry.clone())
            .collect();

        entries
            .iter()
            .filter(|entry| {
                let mut st = entry.state.lock();
                let valid = st.state == CellState::Valid;
                if valid {
                    st.state = CellState::Stale;
                }
                valid
            })
            .count()
    }

    /// Called whenever a resident cell becomes valid, e.g. to trigger a repaint.
    pub fn set_invalidation_listener(&self, listener: impl Fn(CellKey) + Send + Sync + 'static) {
        *self.shared.listener.write() = Some(Arc::new(listener));
    }

    pub fn state(&self, key: CellKey) -> Option<CellState> {
        let entries = self.shared.entries.lock();
        entries.map.get(&key).map(|r| r.entry.state.lock().state)
    }

    /// Reason of the last failed fetch of a resident cell.
    pub fn last_error(&self, key: CellKey) -> Option<String> {
        let entries = self.shared.entries.lock();
        entries.map.get(&key).and_then(|r| r.entry.state.lock().last_error.clone())
    }

    pub fn len(&self) -> usize { self.shared.entries.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        CacheStats {
            requests: c.requests.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            resident: self.len(),
            pending_jobs: self.shared.queue.lock().len(),
        }
    }
}
impl Drop for CellCache {
    fn drop(&mut self) { self.downloader.shutdown(&self.shared); }
}
