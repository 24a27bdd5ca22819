// src/drm/missing.rs

//! Jobs a status command has stopped reporting.
//!
//! Batch schedulers purge finished jobs from `bjobs`, and `sacct` or `qacct`
//! can lag behind a job that already left the queue. A job absent for
//! `limit` consecutive polls is given up on and settled as failed instead of
//! being waited for forever.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::drm::JobHandle;
use crate::drm::usage::ResourceUsage;

pub const DEFAULT_MISSING_POLL_LIMIT: u32 = 20;

#[derive(Debug)]
pub struct MissingJobs {
    limit: u32,
    counts: Mutex<HashMap<JobHandle, u32>>,
}

impl MissingJobs {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one more poll without news of `job`. Once the limit is reached
    /// the job is forgotten and its usage for the failed attempt returned.
    pub fn absent(&self, job: &str, source: &str) -> Option<ResourceUsage> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let polls = {
            let n = counts.entry(job.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if polls < self.limit {
            return None;
        }
        counts.remove(job);
        warn!(job_id = job, polls, source, "job no longer reported; settling it as failed");
        Some(ResourceUsage::failed(format!(
            "no record from {source} after {polls} polls"
        )))
    }

    /// `job` was reported again, or has been settled.
    pub fn seen(&self, job: &str) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job);
    }
}

impl Default for MissingJobs {
    fn default() -> Self {
        Self::new(DEFAULT_MISSING_POLL_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_consecutive_absences() {
        let missing = MissingJobs::new(3);
        assert!(missing.absent("7", "bjobs").is_none());
        assert!(missing.absent("7", "bjobs").is_none());
        let usage = missing.absent("7", "bjobs").unwrap();
        assert!(!usage.succeeded());
        assert_eq!(usage.status_reason.as_deref(), Some("no record from bjobs after 3 polls"));

        // The count starts over once the job has been given up on.
        assert!(missing.absent("7", "bjobs").is_none());
    }

    #[test]
    fn sighting_resets_the_count() {
        let missing = MissingJobs::new(2);
        assert!(missing.absent("1", "sacct").is_none());
        missing.seen("1");
        assert!(missing.absent("1", "sacct").is_none());
        assert!(missing.absent("1", "sacct").is_some());
        assert_eq!(MissingJobs::new(0).limit(), 1);
    }
}
