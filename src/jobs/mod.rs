//! Local job supervision.
//!
//! - [`job`]: a single job and its lifecycle (`Starting → Running → Ended`)
//! - [`registry`]: id → job map owned by the agent loop
//! - [`env`]: derivation of the worker environment
//! - [`manager`]: start / cancel / reap of worker processes
//!
//! Every job lives in `<work_root>/<id>/`:
//!
//! | file | contents |
//! |---|---|
//! | `job.yaml` | job definition, verbatim |
//! | `device.yaml` | device definition, verbatim (may be empty) |
//! | `env.dut.yaml` | optional extra environment payload |
//! | `out`, `err` | worker stdout / stderr |
//! | `logs/` | worker output directory |
//!
//! Directories are left in place after the job ends.

pub mod env;
pub mod job;
pub mod manager;
pub mod registry;

pub use env::EnvSpec;
pub use job::{Job, JobId, JobState};
pub use manager::{FinishedJob, JobManager, SpawnError, WorkerCerts};
pub use registry::JobRegistry;
