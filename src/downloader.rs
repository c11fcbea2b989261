use crate::cache::CacheShared;
use log::{debug, error};
use std::{
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
};

/// Pool of fetch workers that drain the cache's job queue, highest priority first.
pub(crate) struct Downloader {
    workers: Vec<JoinHandle<()>>,
}
impl Downloader {
    pub fn spawn(shared: Arc<CacheShared>, num_threads: usize) -> Downloader {
        let workers = (0..num_threads)
            .filter_map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("cell-fetcher-{}", i))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| error!("Could not start fetch thread {}: {}", i, e))
                    .ok()
            })
            .collect();

        Downloader { workers }
    }

    /// Stops all workers after their current job. Jobs still queued are dropped.
    pub fn shutdown(&mut self, shared: &CacheShared) {
        {
            let _queue = shared.queue.lock();
            shared.shutdown.store(true, Ordering::Release);
            shared.queue_available.notify_all();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Fetch thread panicked");
            }
        }
    }
}

fn worker_loop(shared: &CacheShared) {
    loop {
        let key = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    debug!("Fetch thread {:?} stopping", thread::current().name());
                    return;
                }
                match queue.pop() {
                    Some(key) => break key,
                    None => shared.queue_available.wait(&mut queue),
                }
            }
        };
        shared.run_job(key);
    }
}
