use super::*;
use crate::metadata::tests::sample;
use crate::model::ViewLevelId;
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc;
use std::thread;

fn config(num_fetcher_threads: usize, max_resident_cells: usize) -> CacheConfig {
    CacheConfig {
        num_fetcher_threads,
        max_resident_cells,
        blocking_timeout_ms: None,
    }
}

fn fill(request: &CellRequest) -> Vec<u16> { vec![request.key.cell_index as u16 + 1; request.num_samples()] }

fn l0(cell_index: u64) -> CellKey { ViewLevelId::new(0, 0, 0).cell(cell_index) }

fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct CountingSource {
    fetches: AtomicUsize,
    delay: Option<Duration>,
}
impl CountingSource {
    fn count(&self) -> usize { self.fetches.load(Ordering::SeqCst) }
}
impl CellSource for CountingSource {
    fn fetch(&self, request: &CellRequest) -> std::result::Result<Vec<u16>, String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(fill(request))
    }
}

/// Holds fetches of one cell until opened and reports when such a fetch has started.
struct GatedSource {
    gated: CellKey,
    open: Mutex<bool>,
    opened: Condvar,
    started: Mutex<mpsc::Sender<()>>,
    order: Mutex<Vec<CellKey>>,
    failing: Mutex<Vec<CellKey>>,
}
impl GatedSource {
    fn new(gated: CellKey) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let source = GatedSource {
            gated,
            open: Mutex::new(false),
            opened: Condvar::new(),
            started: Mutex::new(tx),
            order: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
        };
        (Arc::new(source), rx)
    }
    fn release(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
    fn fail(&self, key: CellKey) { self.failing.lock().push(key); }
    fn recover(&self) { self.failing.lock().clear(); }
    fn calls(&self) -> usize { self.order.lock().len() }
}
impl CellSource for GatedSource {
    fn fetch(&self, request: &CellRequest) -> std::result::Result<Vec<u16>, String> {
        self.order.lock().push(request.key);
        if request.key == self.gated {
            let _ = self.started.lock().send(());
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        if self.failing.lock().contains(&request.key) {
            return Err(format!("cell {} unavailable", request.key));
        }
        Ok(fill(request))
    }
}

fn cache(source: Arc<dyn CellSource>, config: &CacheConfig) -> CellCache {
    CellCache::new(Arc::new(sample()), source, config)
}

#[test]
fn blocking_get_loads_once() {
    let source = Arc::new(CountingSource::default());
    let cache = cache(source.clone(), &config(2, 100));

    let first = cache.get(l0(11), LoadingStrategy::Blocking).unwrap();
    assert!(first.valid);
    assert_eq!(first.version, 1);
    assert_eq!(first.min, [8, 4, 2]);
    assert_eq!(first.dims, [2, 4, 2]);
    assert!(first.data().iter().all(|v| *v == 12));

    let second = cache.get(l0(11), LoadingStrategy::Blocking).unwrap();
    assert!(second.same_buffer(&first));
    assert_eq!(source.count(), 1);
    assert_eq!(cache.state(l0(11)), Some(CellState::Valid));

    let stats = cache.stats();
    assert_eq!((stats.requests, stats.hits, stats.fetches), (2, 1, 1));
}

#[test]
fn budgeted_get_returns_placeholder_and_loads_in_background() {
    let source = Arc::new(CountingSource {
        delay: Some(Duration::from_secs(1)),
        ..Default::default()
    });
    let cache = cache(source.clone(), &config(2, 100));

    let start = Instant::now();
    let placeholder = cache.get(l0(0), LoadingStrategy::Budgeted).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(!placeholder.valid);
    assert_eq!(placeholder.version, 0);
    assert_eq!(placeholder.data().len(), 32);
    assert!(placeholder.data().iter().all(|v| *v == 0));

    eventually(|| cache.state(l0(0)) == Some(CellState::Valid));
    let loaded = cache.get(l0(0), LoadingStrategy::Budgeted).unwrap();
    assert!(loaded.valid);
    assert_eq!(loaded.get(0), 1);
    assert_eq!(source.count(), 1);
}

#[test]
fn concurrent_budgeted_requests_fetch_once() {
    let source = Arc::new(CountingSource {
        delay: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let cache = cache(source.clone(), &config(4, 100));

    thread::scope(|s| {
        for _ in 0..100 {
            s.spawn(|| cache.get(l0(5), LoadingStrategy::Budgeted).unwrap());
        }
    });
    let loaded = cache.get(l0(5), LoadingStrategy::Blocking).unwrap();
    assert!(loaded.valid);
    assert_eq!(source.count(), 1);
}

#[test]
fn finer_levels_are_fetched_first() {
    let blocker = ViewLevelId::new(1, 0, 0).cell(0);
    let (source, started) = GatedSource::new(blocker);
    let cache = cache(source.clone(), &config(1, 100));

    // occupy the only worker
    cache.get(blocker, LoadingStrategy::Budgeted).unwrap();
    started.recv().unwrap();

    let keys: Vec<CellKey> = [2, 1, 0].iter().map(|level| ViewLevelId::new(0, 0, *level).cell(0)).collect();
    for key in &keys {
        cache.get(*key, LoadingStrategy::Budgeted).unwrap();
    }
    assert_eq!(cache.stats().pending_jobs, 3);
    source.release();

    eventually(|| keys.iter().all(|key| cache.state(*key) == Some(CellState::Valid)));
    let order = source.order.lock().clone();
    assert_eq!(order, vec![blocker, keys[2], keys[1], keys[0]]);
}

#[test]
fn explicit_priority_overrides_level_priority() {
    let blocker = ViewLevelId::new(1, 0, 0).cell(0);
    let (source, started) = GatedSource::new(blocker);
    let cache = cache(source.clone(), &config(1, 100));

    cache.get(blocker, LoadingStrategy::Budgeted).unwrap();
    started.recv().unwrap();

    let coarse = ViewLevelId::new(0, 0, 2).cell(0);
    cache.get(l0(0), LoadingStrategy::Budgeted).unwrap();
    cache.get(coarse, LoadingStrategy::Budgeted).unwrap();
    // moves the queued job up
    cache.get_with_priority(coarse, LoadingStrategy::Budgeted, 10).unwrap();
    assert_eq!(cache.stats().pending_jobs, 2);
    source.release();

    eventually(|| cache.state(l0(0)) == Some(CellState::Valid));
    assert_eq!(source.order.lock().clone(), vec![blocker, coarse, l0(0)]);
}

#[test]
fn failed_refetch_keeps_stale_data() {
    let fail = Arc::new(AtomicBool::new(false));
    let source = {
        let fail = fail.clone();
        move |request: &CellRequest| -> std::result::Result<Vec<u16>, String> {
            if fail.load(Ordering::SeqCst) {
                Err("server unavailable".to_string())
            } else {
                Ok(fill(request))
            }
        }
    };
    let cache = cache(Arc::new(source), &config(1, 100));

    let loaded = cache.get(l0(3), LoadingStrategy::Blocking).unwrap();
    assert!(cache.invalidate(l0(3)));
    assert!(!cache.invalidate(l0(3)));
    assert_eq!(cache.state(l0(3)), Some(CellState::Stale));

    fail.store(true, Ordering::SeqCst);
    let err = cache.get(l0(3), LoadingStrategy::Blocking).unwrap_err();
    assert_eq!(
        err,
        CacheError::FetchFailed {
            key: l0(3),
            reason: "server unavailable".to_string()
        }
    );
    assert_eq!(cache.state(l0(3)), Some(CellState::Stale));
    assert_eq!(cache.last_error(l0(3)).as_deref(), Some("server unavailable"));

    let stale = cache.get(l0(3), LoadingStrategy::Budgeted).unwrap();
    assert!(!stale.valid);
    assert_eq!(stale.version, 1);
    assert!(stale.same_buffer(&loaded));

    fail.store(false, Ordering::SeqCst);
    eventually(|| {
        cache
            .get(l0(3), LoadingStrategy::Blocking)
            .is_ok_and(|s| s.valid && s.version == 2)
    });
    assert_eq!(cache.last_error(l0(3)), None);
}

#[test]
fn blocking_failure_leaves_cell_absent() {
    let source = |_: &CellRequest| -> std::result::Result<Vec<u16>, String> { Err("404 Not Found".to_string()) };
    let cache = cache(Arc::new(source), &config(1, 100));

    match cache.get(l0(0), LoadingStrategy::Blocking) {
        Err(CacheError::FetchFailed { key, reason }) => {
            assert_eq!(key, l0(0));
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(cache.state(l0(0)), Some(CellState::Absent));
    assert_eq!(cache.stats().failures, 1);
}

#[test]
fn wrong_sample_count_is_a_fetch_failure() {
    let source = |_: &CellRequest| -> std::result::Result<Vec<u16>, String> { Ok(vec![7; 3]) };
    let cache = cache(Arc::new(source), &config(1, 100));

    let err = cache.get(l0(0), LoadingStrategy::Blocking).unwrap_err();
    assert!(matches!(err, CacheError::FetchFailed { reason, .. } if reason.contains("expected 32 samples")));
}

#[test]
fn panicking_source_is_a_fetch_failure() {
    let source = |request: &CellRequest| -> std::result::Result<Vec<u16>, String> {
        if request.key.cell_index == 0 {
            panic!("decoder bug");
        }
        Ok(fill(request))
    };
    let cache = cache(Arc::new(source), &config(1, 100));

    assert!(matches!(
        cache.get(l0(0), LoadingStrategy::Blocking),
        Err(CacheError::FetchFailed { .. })
    ));
    assert!(cache.get(l0(1), LoadingStrategy::Blocking).unwrap().valid);

    // the worker survives a panicking job
    cache.get(l0(0), LoadingStrategy::Budgeted).unwrap();
    cache.get(l0(2), LoadingStrategy::Budgeted).unwrap();
    eventually(|| cache.state(l0(2)) == Some(CellState::Valid));
}

#[test]
fn unknown_cells_are_rejected() {
    let source = Arc::new(CountingSource::default());
    let cache = cache(source.clone(), &config(1, 100));

    let out_of_grid = cache.get(l0(12), LoadingStrategy::Blocking);
    assert_eq!(out_of_grid.unwrap_err(), CacheError::UnknownKey(ViewLevelId::new(0, 0, 0)));
    let missing = ViewLevelId::new(1, 0, 1);
    assert_eq!(
        cache.get(missing.cell(0), LoadingStrategy::Budgeted).unwrap_err(),
        CacheError::UnknownKey(missing)
    );
    assert_eq!(source.count(), 0);
    assert!(cache.is_empty());
}

#[test]
fn listener_hears_about_loaded_cells() {
    let source = Arc::new(CountingSource::default());
    let cache = cache(source, &config(2, 100));
    let loaded = Arc::new(Mutex::new(Vec::new()));
    {
        let loaded = loaded.clone();
        cache.set_invalidation_listener(move |key| loaded.lock().push(key));
    }

    cache.get(l0(4), LoadingStrategy::Budgeted).unwrap();
    eventually(|| !loaded.lock().is_empty());
    assert_eq!(*loaded.lock(), vec![l0(4)]);
}

#[test]
fn least_recently_used_cells_are_evicted() {
    let source = Arc::new(CountingSource::default());
    let cache = cache(source.clone(), &config(1, 2));

    cache.get(l0(0), LoadingStrategy::Blocking).unwrap();
    cache.get(l0(1), LoadingStrategy::Blocking).unwrap();
    cache.get(l0(0), LoadingStrategy::Blocking).unwrap();
    cache.get(l0(2), LoadingStrategy::Blocking).unwrap();

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.state(l0(1)), None);
    assert_eq!(cache.state(l0(0)), Some(CellState::Valid));
    assert_eq!(cache.stats().evictions, 1);

    cache.get(l0(1), LoadingStrategy::Blocking).unwrap();
    assert_eq!(source.count(), 4);
}

#[test]
fn loads_finishing_after_eviction_are_discarded() {
    let (source, started) = GatedSource::new(l0(0));
    let cache = cache(source.clone(), &config(1, 1));

    thread::scope(|s| {
        let loading = s.spawn(|| cache.get(l0(0), LoadingStrategy::Blocking));
        started.recv().unwrap();
        cache.get(l0(1), LoadingStrategy::Blocking).unwrap();
        assert_eq!(cache.state(l0(0)), None);

        source.release();
        // the waiting caller still gets its data
        assert!(loading.join().unwrap().unwrap().valid);
    });
    let stats = cache.stats();
    assert_eq!((stats.discarded, stats.resident), (1, 1));
}

#[test]
fn blocking_wait_can_time_out() {
    let (source, started) = GatedSource::new(l0(0));
    let cache = cache(
        source.clone(),
        &CacheConfig {
            blocking_timeout_ms: Some(50),
            ..config(1, 100)
        },
    );

    thread::scope(|s| {
        let loading = s.spawn(|| cache.get(l0(0), LoadingStrategy::Blocking));
        started.recv().unwrap();

        assert_eq!(cache.get(l0(0), LoadingStrategy::Blocking).unwrap_err(), CacheError::Timeout(l0(0)));
        source.release();
        assert!(loading.join().unwrap().is_ok());
    });
    assert!(cache.get(l0(0), LoadingStrategy::Blocking).unwrap().valid);
}

#[test]
fn invalidate_all_marks_valid_cells_stale() {
    let source = Arc::new(CountingSource::default());
    let cache = cache(source.clone(), &config(1, 100));
    for i in 0..3 {
        cache.get(l0(i), LoadingStrategy::Blocking).unwrap();
    }

    assert_eq!(cache.invalidate_all(), 3);
    assert_eq!(cache.invalidate_all(), 0);
    assert!(!cache.invalidate(l0(9)));

    let reloaded = cache.get(l0(1), LoadingStrategy::Blocking).unwrap();
    assert_eq!(reloaded.version, 2);
    assert_eq!(source.count(), 4);
}

/// Starts a worker load of the gated cell and a blocking request that waits for it.
fn wait_for_worker_load(
    cache: &CellCache,
    source: &GatedSource,
    started: &mpsc::Receiver<()>,
) -> Result<CellSnapshot> {
    cache.get(source.gated, LoadingStrategy::Budgeted).unwrap();
    started.recv().unwrap();
    assert_eq!(cache.state(source.gated), Some(CellState::Loading));

    thread::scope(|s| {
        let waiting = s.spawn(|| cache.get(source.gated, LoadingStrategy::Blocking));
        eventually(|| cache.stats().requests == 2);
        thread::sleep(Duration::from_millis(50));
        source.release();
        waiting.join().unwrap()
    })
}

#[test]
fn blocking_get_shares_load_in_flight() {
    let (source, started) = GatedSource::new(l0(0));
    let cache = cache(source.clone(), &config(1, 100));

    let shared = wait_for_worker_load(&cache, &source, &started).unwrap();
    assert!(shared.valid);
    assert_eq!(shared.version, 1);
    let again = cache.get(l0(0), LoadingStrategy::Blocking).unwrap();
    assert!(again.same_buffer(&shared));
    assert_eq!(source.calls(), 1);
}

#[test]
fn blocking_get_fails_with_the_load_in_flight() {
    let (source, started) = GatedSource::new(l0(0));
    source.fail(l0(0));
    let cache = cache(source.clone(), &config(1, 100));

    let err = wait_for_worker_load(&cache, &source, &started).unwrap_err();
    assert_eq!(
        err,
        CacheError::FetchFailed {
            key: l0(0),
            reason: format!("cell {} unavailable", l0(0))
        }
    );
    assert_eq!(source.calls(), 1);
    assert_eq!(cache.state(l0(0)), Some(CellState::Absent));
}

#[test]
fn failed_blocking_takeover_keeps_cell_queued() {
    let blocker = ViewLevelId::new(1, 0, 0).cell(0);
    let (source, started) = GatedSource::new(blocker);
    let cache = cache(source.clone(), &config(1, 100));

    cache.get(blocker, LoadingStrategy::Budgeted).unwrap();
    started.recv().unwrap();

    cache.get(l0(0), LoadingStrategy::Budgeted).unwrap();
    assert_eq!(cache.state(l0(0)), Some(CellState::Enqueued));

    source.fail(l0(0));
    assert!(matches!(
        cache.get(l0(0), LoadingStrategy::Blocking),
        Err(CacheError::FetchFailed { .. })
    ));
    assert_eq!(cache.state(l0(0)), Some(CellState::Enqueued));
    assert_eq!(cache.stats().pending_jobs, 1);

    source.recover();
    source.release();
    eventually(|| cache.state(l0(0)) == Some(CellState::Valid));
    assert_eq!(source.order.lock().clone(), vec![blocker, l0(0), l0(0)]);
}

#[test]
fn failed_background_loads_keep_previous_state() {
    let fail = Arc::new(AtomicBool::new(false));
    let source = {
        let fail = fail.clone();
        move |request: &CellRequest| -> std::result::Result<Vec<u16>, String> {
            if fail.load(Ordering::SeqCst) {
                Err("server unavailable".to_string())
            } else {
                Ok(fill(request))
            }
        }
    };
    let cache = cache(Arc::new(source), &config(1, 100));

    let loaded = cache.get(l0(3), LoadingStrategy::Blocking).unwrap();
    cache.invalidate(l0(3));
    fail.store(true, Ordering::SeqCst);

    cache.get(l0(3), LoadingStrategy::Budgeted).unwrap();
    eventually(|| cache.state(l0(3)) == Some(CellState::Stale) && cache.last_error(l0(3)).is_some());
    let stale = cache.get(l0(3), LoadingStrategy::Budgeted).unwrap();
    assert!(!stale.valid);
    assert_eq!(stale.version, 1);
    assert!(stale.same_buffer(&loaded));

    cache.get(l0(4), LoadingStrategy::Budgeted).unwrap();
    eventually(|| cache.state(l0(4)) == Some(CellState::Absent) && cache.last_error(l0(4)).is_some());
    assert_eq!(cache.get(l0(4), LoadingStrategy::Budgeted).unwrap().version, 0);
}
