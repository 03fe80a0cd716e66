use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::{JobConfig, TlsConfig};
use crate::jobs::env::{self, EnvSpec, EnvSpecError};
use crate::jobs::job::{
    Job, JobId, JobState, DEVICE_FILE, ENV_DUT_FILE, JOB_FILE, LOGS_DIR, OUT_FILE,
};
use crate::jobs::registry::JobRegistry;
use crate::protocol::message::StartRequest;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Bad environment for job: {0}")]
    Env(#[from] EnvSpecError),

    #[error("Cannot run worker {worker}: {source}")]
    Spawn {
        worker: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> SpawnError {
    let path = path.to_path_buf();
    move |source| SpawnError::Io {
        action,
        path,
        source,
    }
}

/// Longest error report sent for a finished job. Longer `err` files keep their tail.
pub const MAX_ERROR_REPORT_LEN: usize = 1024 * 1024;

/// Certificates handed to the worker so it can encrypt its log stream.
#[derive(Debug, Clone)]
pub struct WorkerCerts {
    pub coordinator_cert: PathBuf,
    pub agent_cert: PathBuf,
}

impl WorkerCerts {
    pub fn from_tls(tls: &TlsConfig) -> Option<Self> {
        if !tls.enabled {
            return None;
        }
        Some(Self {
            coordinator_cert: tls.ca_cert_path.clone()?,
            agent_cert: tls.cert_path.clone()?,
        })
    }
}

/// A job whose worker exited since the last reap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedJob {
    pub id: JobId,
    pub exit_status: i32,
    /// Contents of the job's error file, if it is not empty
    pub error: Option<String>,
}

/// Starts, cancels and reaps worker processes.
///
/// Each job gets its own directory under the work root holding the job and
/// device definitions plus the worker's captured stdout and stderr.
/// Spawn failures never escape: they are written to the job's error file
/// and the job is ended through the cancel path.
#[derive(Debug)]
pub struct JobManager {
    config: JobConfig,
    certs: Option<WorkerCerts>,
    registry: JobRegistry,
}

impl JobManager {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            certs: None,
            registry: JobRegistry::new(),
        }
    }

    pub fn with_certs(mut self, certs: Option<WorkerCerts>) -> Self {
        self.certs = certs;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.registry.state(id)
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.config.work_root.join(id.to_string())
    }

    /// Start the worker for a new job.
    pub async fn start(&mut self, request: &StartRequest) {
        let id = request.id;
        let mut job = Job::new(id, self.job_dir(id));
        tracing::info!(job_id = id, work_dir = %job.work_dir.display(), "Starting job");

        match self.launch(&job, request) {
            Ok(child) => {
                tracing::info!(job_id = id, pid = ?child.id(), "Job started");
                job.attach(child);
                self.registry.insert(job);
            }
            Err(e) => {
                tracing::error!(job_id = id, error = %e, "Job failed to start");
                record_failure(&job, &e);
                self.registry.insert(job);
                self.cancel(id).await;
            }
        }
    }

    fn launch(&self, job: &Job, request: &StartRequest) -> Result<Child, SpawnError> {
        fs::create_dir_all(&job.work_dir).map_err(io_error("create", &job.work_dir))?;

        write_file(&job.path(JOB_FILE), &request.job_definition)?;
        write_file(&job.path(DEVICE_FILE), &request.device_definition)?;
        if let Some(env_dut) = &request.env_dut {
            write_file(&job.path(ENV_DUT_FILE), env_dut)?;
        }

        let env = EnvSpec::parse(&request.env)?.apply(env::inherited());

        let out_path = job.path(OUT_FILE);
        let err_path = job.err_path();
        let stdout = File::create(&out_path).map_err(io_error("create", &out_path))?;
        let stderr = File::create(&err_path).map_err(io_error("create", &err_path))?;

        Command::new(&self.config.worker)
            .args(self.worker_args(job, request.env_dut.is_some()))
            .current_dir(&job.work_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                worker: self.config.worker.clone(),
                source,
            })
    }

    fn worker_args(&self, job: &Job, has_env_dut: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--target".into(),
            job.path(DEVICE_FILE).into(),
            job.path(JOB_FILE).into(),
            "--output-dir".into(),
            job.path(LOGS_DIR).into(),
            "--job-id".into(),
            job.id.to_string().into(),
            "--socket-addr".into(),
            self.config.log_socket.clone().into(),
        ];

        if let Some(certs) = &self.certs {
            args.push("--master-cert".into());
            args.push(certs.coordinator_cert.clone().into());
            args.push("--slave-cert".into());
            args.push(certs.agent_cert.clone().into());
        }

        if has_env_dut {
            args.push("--env-dut-path".into());
            args.push(job.path(ENV_DUT_FILE).into());
        }

        args
    }

    /// Stop a job's worker and mark the job ended.
    ///
    /// Sends SIGTERM and waits for the worker to exit; a worker still alive
    /// after the grace period is killed. This blocks the caller.
    pub async fn cancel(&mut self, id: JobId) {
        let grace = self.config.cancel_grace;
        let Some(job) = self.registry.get_mut(id) else {
            return;
        };
        if let Some(child) = job.take_child() {
            tracing::info!(job_id = id, "Cancelling job");
            terminate(id, child, grace).await;
        }
        job.mark_ended(None);
    }

    /// Record an already-ended job for an id this agent has no trace of.
    pub fn synthesize_ended(&mut self, id: JobId) {
        tracing::debug!(job_id = id, "Synthesizing ended job");
        self.registry.insert(Job::synthesized(id, self.job_dir(id)));
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.registry.remove(id)
    }

    /// Check every running worker without blocking and collect the ones that exited.
    pub fn reap_finished(&mut self) -> Vec<FinishedJob> {
        let mut finished: Vec<FinishedJob> = self
            .registry
            .running_mut()
            .filter_map(|job| {
                let status = job.child_mut()?.try_wait();
                check_exit(job, status)
            })
            .collect();

        finished.sort_by_key(|f| f.id);
        finished
    }
}

/// End `job` if polling its worker says it exited.
///
/// A worker that cannot be polled is killed and the job ends with status -1.
fn check_exit(job: &mut Job, status: io::Result<Option<ExitStatus>>) -> Option<FinishedJob> {
    let (exit_status, error) = match status {
        Ok(None) => return None,
        Ok(Some(status)) => (exit_code(status), read_errors(job)),
        Err(e) => {
            tracing::error!(
                job_id = job.id,
                error = %e,
                "Unable to check job status, giving up on it"
            );
            if let Some(mut child) = job.take_child() {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id = job.id, error = %e, "Failed to kill job");
                }
            }
            let mut report = format!("Unable to check worker status: {e}\n");
            if let Some(errors) = read_errors(job) {
                report.push_str(&errors);
            }
            (-1, Some(report))
        }
    };

    job.mark_ended(Some(exit_status));
    tracing::info!(job_id = job.id, exit_status, "Job finished");
    Some(FinishedJob {
        id: job.id,
        exit_status,
        error,
    })
}

fn write_file(path: &Path, contents: &str) -> Result<(), SpawnError> {
    fs::write(path, contents).map_err(io_error("write", path))
}

async fn terminate(id: JobId, mut child: Child, grace: Duration) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::warn!(job_id = id, pid, error = %e, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(job_id = id, exit_status = exit_code(status), "Job terminated");
        }
        Ok(Err(e)) => {
            tracing::warn!(job_id = id, error = %e, "Failed to wait for job");
        }
        Err(_) => {
            tracing::warn!(
                job_id = id,
                grace_ms = grace.as_millis() as u64,
                "Job ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::error!(job_id = id, error = %e, "Failed to kill job");
            }
        }
    }
}

/// Exit code, or the negated signal number when the worker was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

fn read_errors(job: &Job) -> Option<String> {
    let path = job.err_path();
    match read_tail(&path, MAX_ERROR_REPORT_LEN) {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(
                job_id = job.id,
                path = %path.display(),
                error = %e,
                "Unable to read job errors"
            );
            None
        }
    }
}

/// Last `limit` bytes of a file, starting on a character boundary.
fn read_tail(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let limit = limit as u64;
    let truncated = len > limit;
    if truncated {
        file.seek(SeekFrom::Start(len - limit))?;
    }

    let mut bytes = Vec::new();
    file.take(limit).read_to_end(&mut bytes)?;
    if truncated {
        // Skip UTF-8 continuation bytes left over from the cut
        let start = bytes
            .iter()
            .position(|b| b & 0xC0 != 0x80)
            .unwrap_or(bytes.len());
        bytes.drain(..start);
    }
    Ok(bytes)
}

/// Append a spawn failure and the current backtrace to the job's error file.
fn record_failure(job: &Job, error: &SpawnError) {
    let path = job.err_path();
    let mut report = format!("{error}\n");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        report.push_str(&format!("caused by: {cause}\n"));
        source = std::error::Error::source(cause);
    }
    report.push_str(&format!("{}\n", std::backtrace::Backtrace::force_capture()));

    let written = fs::create_dir_all(&job.work_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?
            .write_all(report.as_bytes())
    });
    if let Err(e) = written {
        tracing::error!(
            job_id = job.id,
            path = %path.display(),
            error = %e,
            "Unable to record job failure"
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn running_job(dir: &TempDir) -> Job {
        let mut job = Job::new(5, dir.path().to_path_buf());
        job.state = JobState::Running;
        job
    }

    #[test]
    fn live_worker_is_left_running() {
        let dir = TempDir::new().unwrap();
        let mut job = running_job(&dir);

        assert!(check_exit(&mut job, Ok(None)).is_none());
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn exited_worker_ends_job() {
        let dir = TempDir::new().unwrap();
        let mut job = running_job(&dir);
        fs::write(job.err_path(), "boom\n").unwrap();

        let finished = check_exit(&mut job, Ok(Some(ExitStatus::from_raw(3 << 8)))).unwrap();
        assert_eq!(finished.exit_status, 3);
        assert_eq!(finished.error.as_deref(), Some("boom\n"));
        assert_eq!(job.state, JobState::Ended);
        assert_eq!(job.exit_status, Some(3));
    }

    #[test]
    fn signalled_worker_reports_negated_signal() {
        let dir = TempDir::new().unwrap();
        let mut job = running_job(&dir);

        let finished = check_exit(&mut job, Ok(Some(ExitStatus::from_raw(9)))).unwrap();
        assert_eq!(finished.exit_status, -9);
        assert_eq!(finished.error, None);
    }

    #[test]
    fn unpollable_worker_ends_job_once() {
        let dir = TempDir::new().unwrap();
        let mut job = running_job(&dir);

        let finished = check_exit(&mut job, Err(io::Error::other("no such child"))).unwrap();
        assert_eq!(finished.id, 5);
        assert_eq!(finished.exit_status, -1);
        let error = finished.error.unwrap();
        assert!(error.contains("no such child"), "error: {error}");

        // Ended jobs are no longer polled by the reaper
        assert_eq!(job.state, JobState::Ended);
        assert!(!job.is_running());
        assert_eq!(job.reported_status(), -1);
    }

    #[test]
    fn read_tail_keeps_the_end_on_a_char_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("err");
        fs::write(&path, "\u{e9}xyz").unwrap();

        assert_eq!(read_tail(&path, 16).unwrap(), "\u{e9}xyz".as_bytes());
        // Cutting inside the two-byte character drops its remainder
        assert_eq!(read_tail(&path, 4).unwrap(), b"xyz");
        assert_eq!(read_tail(&path, 2).unwrap(), b"yz");
    }

    #[test]
    fn worker_certs_follow_tls_settings() {
        let mut tls = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/etc/lab/coordinator.pem")),
            cert_path: Some(PathBuf::from("/etc/lab/agent.pem")),
            key_path: Some(PathBuf::from("/etc/lab/agent.key")),
            server_name: None,
        };
        let certs = WorkerCerts::from_tls(&tls).unwrap();
        assert_eq!(certs.coordinator_cert, PathBuf::from("/etc/lab/coordinator.pem"));
        assert_eq!(certs.agent_cert, PathBuf::from("/etc/lab/agent.pem"));

        tls.enabled = false;
        assert!(WorkerCerts::from_tls(&tls).is_none());
    }
}
