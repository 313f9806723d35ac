//! Recording planner.
//!
//! Keeps the job set across planning cycles: merges matched schedule
//! entries into jobs, purges finished ones, runs concurrency admission and
//! hands out the jobs that should be dispatched now.

use crate::concurrency::admit_by_priority;
use crate::jobs::{JobStatus, RecordingJob, ShowCandidate};
use crate::keywords::KeywordMatcher;
use chrono::{DateTime, Duration, Utc};
use stream_capture_config::Config;
use tracing::{debug, warn};

/// Planning parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerSettings {
    /// Maximum number of overlapping captures
    pub ceiling: usize,
    /// How far ahead of its start a job is dispatched
    pub horizon: Duration,
    /// Added to every schedule time
    pub time_offset: Duration,
}

impl PlannerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ceiling: config.planner.concurrent_captures,
            horizon: Duration::hours(config.schedule.hours_in_future),
            time_offset: Duration::hours(config.schedule.time_offset_hours),
        }
    }
}

/// Counts from merging one schedule fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
    pub ignored: usize,
}

/// Job set owned by the orchestrator.
#[derive(Debug)]
pub struct RecordingPlanner {
    settings: PlannerSettings,
    /// Jobs in priority order after each `plan`
    jobs: Vec<RecordingJob>,
}

impl RecordingPlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self {
            settings,
            jobs: Vec::new(),
        }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Merge schedule entries into the job set.
    ///
    /// Entries that match no rule are ignored. A show seen again updates
    /// its job and adds the channel to the candidate set.
    pub fn ingest(&mut self, shows: &[ShowCandidate], matcher: &dyn KeywordMatcher) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for show in shows {
            let Some(matched) = matcher.find_match(&show.name) else {
                summary.ignored += 1;
                continue;
            };

            let key = RecordingJob::key_for(&show.name, &show.time);
            match self.jobs.iter_mut().find(|j| j.key == key) {
                Some(job) => {
                    if job.update_from_show(show, &matched, self.settings.time_offset) {
                        summary.updated += 1;
                    } else {
                        warn!(show = %show.name, time = %show.time, "Unparsable schedule times");
                        summary.ignored += 1;
                    }
                }
                None => match RecordingJob::from_show(show, &matched, self.settings.time_offset) {
                    Some(job) => {
                        debug!(show = %job.description, keyword = %job.keyword, "New job");
                        self.jobs.push(job);
                        summary.created += 1;
                    }
                    None => {
                        warn!(show = %show.name, time = %show.time, "Unparsable schedule times");
                        summary.ignored += 1;
                    }
                },
            }
        }

        summary
    }

    /// Run one planning pass and return the jobs to dispatch now.
    ///
    /// 1. Purge jobs whose end is in the past.
    /// 2. Order by priority, then start.
    /// 3. Admit: jobs already dispatched and still running hold their
    ///    slots; the rest are admitted most important first. Rejected
    ///    jobs are flagged `too_many` and kept for the next cycle.
    /// 4. Return admitted jobs that are not dispatched or finished, start
    ///    within the horizon and have not ended.
    pub fn plan(&mut self, now: DateTime<Utc>) -> Vec<RecordingJob> {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.end >= now);
        if self.jobs.len() != before {
            debug!(purged = before - self.jobs.len(), "Purged past jobs");
        }

        self.jobs
            .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.start.cmp(&b.start)));

        let holds_slot = |job: &RecordingJob| job.flags.dispatched && !job.flags.is_finished();
        let committed: Vec<_> = self
            .jobs
            .iter()
            .filter(|j| holds_slot(*j))
            .map(|j| (j.start, j.end))
            .collect();
        let pending: Vec<usize> = (0..self.jobs.len())
            .filter(|&i| !self.jobs[i].flags.dispatched && !self.jobs[i].flags.is_finished())
            .collect();
        let spans: Vec<_> = pending
            .iter()
            .map(|&i| (self.jobs[i].start, self.jobs[i].end))
            .collect();

        let admitted = admit_by_priority(&committed, &spans, self.settings.ceiling);
        for (&i, ok) in pending.iter().zip(&admitted) {
            let job = &mut self.jobs[i];
            if !ok && !job.flags.too_many {
                debug!(show = %job.description, start = %job.start, "Rejected: too many overlapping captures");
            }
            job.flags.too_many = !ok;
        }

        let horizon_end = now + self.settings.horizon;
        self.jobs
            .iter()
            .filter(|job| {
                !job.flags.too_many
                    && !job.flags.dispatched
                    && !job.flags.is_finished()
                    && job.start <= horizon_end
                    && job.end > now
            })
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> &[RecordingJob] {
        &self.jobs
    }

    pub fn job(&self, id: &str) -> Option<&RecordingJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn mark_dispatched(&mut self, id: &str) -> bool {
        self.update(id, |job| {
            job.flags.dispatched = true;
            job.flags.queued = false;
        })
    }

    /// Record how a dispatched job ended.
    pub fn mark_finished(&mut self, id: &str, status: JobStatus) -> bool {
        self.update(id, |job| match status {
            JobStatus::Completed => job.flags.completed = true,
            JobStatus::Partial => job.flags.partial = true,
            JobStatus::Cancelled => job.flags.cancelled = true,
        })
    }

    /// Cancel a job that has not been dispatched yet.
    pub fn mark_cancelled(&mut self, id: &str) -> bool {
        self.update(id, |job| {
            job.flags.cancelled = true;
            job.flags.queued = false;
        })
    }

    fn update(&mut self, id: &str, f: impl FnOnce(&mut RecordingJob)) -> bool {
        match self.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }
}
