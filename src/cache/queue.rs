use crate::model::CellKey;
use fxhash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Job {
    priority: u32,
    seq: u64,
    key: CellKey,
}
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}
impl Eq for Job {}
impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Job {
    // higher priority first, then first enqueued first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending fetch jobs, at most one per cell.
///
/// Re-prioritized jobs are pushed again and the outdated heap entries are skipped when they
/// surface, so every operation stays logarithmic in the number of jobs.
#[derive(Default)]
pub(crate) struct FetchQueue {
    heap: BinaryHeap<Job>,
    pending: FxHashMap<CellKey, (u32, u64)>,
    next_seq: u64,
}
impl FetchQueue {
    pub fn new() -> Self { Self::default() }

    /// Queues a job for `key` unless one is already pending. A pending job is moved up if the
    /// new priority is higher. Returns whether the queue changed.
    pub fn push(&mut self, key: CellKey, priority: u32) -> bool {
        if let Some((pending_priority, _)) = self.pending.get(&key) {
            if *pending_priority >= priority {
                return false;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(key, (priority, seq));
        self.heap.push(Job { priority, seq, key });
        true
    }

    pub fn pop(&mut self) -> Option<CellKey> {
        while let Some(job) = self.heap.pop() {
            if self.pending.get(&job.key) == Some(&(job.priority, job.seq)) {
                self.pending.remove(&job.key);
                return Some(job.key);
            }
        }
        None
    }

    pub fn len(&self) -> usize { self.pending.len() }
}
