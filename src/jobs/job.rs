use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::process::Child;

/// Coordinator-assigned job identifier.
pub type JobId = u64;

pub const JOB_FILE: &str = "job.yaml";
pub const DEVICE_FILE: &str = "device.yaml";
pub const ENV_DUT_FILE: &str = "env.dut.yaml";
pub const OUT_FILE: &str = "out";
pub const ERR_FILE: &str = "err";
pub const LOGS_DIR: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Ended,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Starting => write!(f, "starting"),
            JobState::Running => write!(f, "running"),
            JobState::Ended => write!(f, "ended"),
        }
    }
}

/// One job and, while it runs, the worker process backing it.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub work_dir: PathBuf,
    /// Set once, when the job ends. `None` for cancelled or synthesized jobs.
    pub exit_status: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    child: Option<Child>,
}

impl Job {
    pub fn new(id: JobId, work_dir: PathBuf) -> Self {
        Self {
            id,
            state: JobState::Starting,
            work_dir,
            exit_status: None,
            started_at: Utc::now(),
            ended_at: None,
            child: None,
        }
    }

    /// Placeholder for an id the agent never ran, so replies stay well-formed.
    pub fn synthesized(id: JobId, work_dir: PathBuf) -> Self {
        let mut job = Self::new(id, work_dir);
        job.mark_ended(None);
        job
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, JobState::Starting | JobState::Running)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status as reported on the wire.
    pub fn reported_status(&self) -> i32 {
        self.exit_status.unwrap_or(0)
    }

    pub(crate) fn attach(&mut self, child: Child) {
        self.child = Some(child);
        self.state = JobState::Running;
    }

    pub(crate) fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub(crate) fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub(crate) fn mark_ended(&mut self, exit_status: Option<i32>) {
        self.child = None;
        if self.state == JobState::Ended {
            return;
        }
        self.state = JobState::Ended;
        self.exit_status = exit_status;
        self.ended_at = Some(Utc::now());
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn err_path(&self) -> PathBuf {
        self.path(ERR_FILE)
    }
}
