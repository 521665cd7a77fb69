use std::collections::VecDeque;

use stepwright_core_types::TaskId;

use crate::model::Priority;

#[derive(Clone, Debug)]
pub struct Job {
    pub id: TaskId,
    pub priority: Priority,
    pub seq: u64,
}

impl Job {
    pub fn new(id: TaskId, priority: Priority, seq: u64) -> Self {
        Self { id, priority, seq }
    }
}

/// Per-tenant ready queue: strict priority bands, FIFO inside a band.
#[derive(Debug, Default)]
pub struct PriorityLane {
    queues: [VecDeque<Job>; 3],
}

impl PriorityLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.queues[job.priority.index()].push_back(job);
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Job> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|job| &job.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Jobs in the order they would be popped.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.queues.iter().flat_map(|q| q.iter())
    }

    pub fn len_by_priority(&self) -> [usize; 3] {
        let mut lengths = [0usize; 3];
        for (idx, queue) in self.queues.iter().enumerate() {
            lengths[idx] = queue.len();
        }
        lengths
    }
}
