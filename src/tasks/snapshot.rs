//! Job lifecycle state machine and poll-to-poll snapshot diffing

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TaskKind;
use crate::upstream::UpstreamTask;

/// Lifecycle state of an upstream job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    /// Disappeared before a terminal state was observed
    Unknown,
}

impl JobState {
    /// Map the upstream's numeric tache state
    pub fn from_upstream(state: i64) -> Self {
        match state {
            0 => JobState::Pending,
            // running, canceling, failing, waiting/before retry
            1 | 3 | 6 | 8 | 9 => JobState::Running,
            2 => JobState::Done,
            // canceled, errored, failed
            4 | 5 | 7 => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Unknown)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Done | JobState::Failed | JobState::Unknown => 2,
        }
    }

    /// Validate a transition observed between two polls
    pub fn transition(self, next: JobState) -> Transition {
        if self == next {
            return Transition::Unchanged;
        }
        if self.is_terminal() || next.rank() < self.rank() {
            return Transition::Rejected;
        }
        if self == JobState::Pending && next.is_terminal() {
            // finished between two polls without being seen running
            return Transition::Skipped;
        }
        Transition::Advanced
    }
}

/// Outcome of [`JobState::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Advanced,
    /// Legal but skipped an intermediate state; tolerated
    Skipped,
    /// Backwards or out of a terminal state; the old state is kept
    Rejected,
}

/// A tracked job
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub task: UpstreamTask,
    pub state: JobState,
    /// Consecutive polls in which the job was absent
    pub missing_polls: u32,
}

/// A job that reached `done` in the latest poll
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub kind: TaskKind,
    pub task: UpstreamTask,
}

/// Most recently observed upstream jobs, keyed by kind and job id
#[derive(Debug, Default)]
pub struct TaskSnapshot {
    jobs: HashMap<(TaskKind, String), TrackedJob>,
}

/// Absent polls after which a terminal entry is evicted
const EVICT_AFTER: u32 = 2;

impl TaskSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// State of a tracked job, if present
    pub fn state(&self, kind: TaskKind, id: &str) -> Option<JobState> {
        self.jobs.get(&(kind, id.to_string())).map(|j| j.state)
    }

    /// Fold one successful poll of `kind` into the snapshot.
    ///
    /// Returns the jobs that became `done` in this poll. Failed jobs are
    /// tracked but never returned.
    pub fn observe(&mut self, kind: TaskKind, tasks: Vec<UpstreamTask>) -> Vec<Completion> {
        let mut completions = Vec::new();
        let mut seen = std::collections::HashSet::with_capacity(tasks.len());

        for task in tasks {
            let key = (kind, task.id.clone());
            seen.insert(task.id.clone());
            let observed = JobState::from_upstream(task.state);

            match self.jobs.get_mut(&key) {
                None => {
                    if observed == JobState::Done {
                        completions.push(Completion {
                            kind,
                            task: task.clone(),
                        });
                    }
                    self.jobs.insert(
                        key,
                        TrackedJob {
                            task,
                            state: observed,
                            missing_polls: 0,
                        },
                    );
                }
                Some(job) => {
                    job.missing_polls = 0;
                    match job.state.transition(observed) {
                        Transition::Unchanged => {}
                        Transition::Rejected => {
                            tracing::debug!(
                                job_id = %task.id,
                                from = ?job.state,
                                to = ?observed,
                                "ignoring out-of-order job state"
                            );
                        }
                        t @ (Transition::Advanced | Transition::Skipped) => {
                            if t == Transition::Skipped {
                                tracing::debug!(job_id = %task.id, to = ?observed, "job skipped running state");
                            }
                            if observed == JobState::Done {
                                completions.push(Completion {
                                    kind,
                                    task: task.clone(),
                                });
                            } else if observed == JobState::Failed {
                                tracing::debug!(job_id = %task.id, error = %task.error, "job failed, no event emitted");
                            }
                            job.state = observed;
                            job.task = task;
                        }
                    }
                }
            }
        }

        self.jobs.retain(|(k, id), job| {
            if *k != kind || seen.contains(id) {
                return true;
            }
            if !job.state.is_terminal() {
                tracing::debug!(job_id = %id, "job vanished before finishing");
                job.state = JobState::Unknown;
            }
            job.missing_polls += 1;
            job.missing_polls < EVICT_AFTER
        });

        completions
    }
}
