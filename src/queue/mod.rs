//! Work queue
//!
//! The queue is the server-side ledger of outstanding jobs. Jobs are never handed
//! out exclusively: `get_next()` rotates the front job to the back and returns it,
//! so a job whose worker disappears is simply served again to the next requester.
//! Jobs leave the queue only when a result is accepted or an operator removes them.
//!
//! # Structure
//!
//! - `jobs`: id → job, for O(1) lookup and removal
//! - `ring`: round-robin order of ids; ids removed from `jobs` are dropped from the
//!   ring lazily when they reach the front

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One addressable unit of work bound to a pipeline version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Image set number (1-based)
    pub id: u64,

    /// sha1 of the pipeline blob this job must be executed against
    pub pipeline_hash: String,
}

impl Job {
    pub fn new(id: u64, pipeline_hash: impl Into<String>) -> Self {
        Self {
            id,
            pipeline_hash: pipeline_hash.into(),
        }
    }
}

/// Round-robin ledger of outstanding jobs
#[derive(Debug, Default)]
pub struct WorkQueue {
    jobs: HashMap<u64, Job>,
    ring: VecDeque<u64>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue with one job per image set in `1..=num_items`
    pub fn for_items(num_items: u64, pipeline_hash: &str) -> Self {
        let mut queue = Self::new();
        for id in 1..=num_items {
            queue.jobs.insert(id, Job::new(id, pipeline_hash));
            queue.ring.push_back(id);
        }
        queue
    }

    /// Build a queue from an explicit job list, rejecting duplicate ids
    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Result<Self, BrokerError> {
        let mut queue = Self::new();
        for job in jobs {
            queue.enqueue(job)?;
        }
        Ok(queue)
    }

    /// Append a job. Only used while the queue is being built.
    pub fn enqueue(&mut self, job: Job) -> Result<(), BrokerError> {
        if self.jobs.contains_key(&job.id) {
            return Err(BrokerError::DuplicateJob(job.id));
        }
        self.ring.push_back(job.id);
        self.jobs.insert(job.id, job);
        Ok(())
    }

    /// Return the front job and rotate it to the back, without removing it
    pub fn get_next(&mut self) -> Option<Job> {
        while let Some(id) = self.ring.pop_front() {
            if let Some(job) = self.jobs.get(&id) {
                self.ring.push_back(id);
                return Some(job.clone());
            }
        }
        None
    }

    pub fn lookup(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Result<Job, BrokerError> {
        let job = self.jobs.remove(&id).ok_or(BrokerError::JobNotFound(id))?;

        // Keep the ring from accumulating stale ids once most work is done
        if self.ring.len() > 2 * self.jobs.len() + 16 {
            let jobs = &self.jobs;
            self.ring.retain(|id| jobs.contains_key(id));
        }

        Ok(job)
    }

    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.ring.clear();
    }

    /// Outstanding jobs in round-robin order
    pub fn jobs(&self) -> Vec<Job> {
        self.ring
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }
}
