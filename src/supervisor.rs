//! Job registry and lifecycle supervision

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::errors::{OverseerError, Result};
use crate::execution::LimitedCommand;
use crate::multibuffer::{MultiBuffer, Reader};
use crate::resources::ResourceLimits;

const UUID_SOURCE: &str = "/proc/sys/kernel/random/uuid";

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Started,
    Done,
    Stopped,
}

/// Snapshot of a job's state and exit code.
///
/// The exit code is `None` until the job reaches a terminal state; a job
/// killed by a signal records `128 + signo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub exit_code: Option<i32>,
}

// TODO: add option to set the environment variables of a job
struct Job {
    pid: Pid,
    status: JobStatus,
    stdout: Arc<MultiBuffer>,
    stderr: Arc<MultiBuffer>,
}

/// Owns every launched job: starts them under resource limits, tracks their
/// state machine and hands out replayable readers over their output.
///
/// All job state is guarded by a single mutex; none of the operations other
/// than [`Supervisor::start_job`] blocks on IO.
#[derive(Clone)]
pub struct Supervisor {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    limits: ResourceLimits,
    direct_spawn: bool,
}

impl Supervisor {
    /// Supervisor applying the fixed default limit profile to every job
    pub fn new() -> Self {
        Self::with_limits(ResourceLimits::default_profile())
    }

    /// Supervisor applying the given limits to every job
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            limits,
            direct_spawn: false,
        }
    }

    /// Spawns children directly instead of through the trampoline, so tests
    /// can exercise the registry and streaming without root and without
    /// re-entering the test harness via /proc/self/exe.
    #[cfg(test)]
    pub(crate) fn unconfined_for_testing() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            limits: ResourceLimits::default(),
            direct_spawn: true,
        }
    }

    /// Launch `command` with `args` under the supervisor's resource limits.
    ///
    /// Returns the new job's ID. Launch failures are reported synchronously
    /// and leave no trace in the registry.
    pub fn start_job(&self, command: &str, args: &[String]) -> Result<String> {
        let stdout = Arc::new(MultiBuffer::new());
        let stderr = Arc::new(MultiBuffer::new());
        let id = next_job_id()?;

        let mut child = self.spawn_child(command, args)?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("started job {id} (pid {pid}) running '{command}'");

        let out_pipe = child.stdout.take().expect("child stdout is piped");
        let err_pipe = child.stderr.take().expect("child stderr is piped");
        let out_pump = pump_output(out_pipe, Arc::clone(&stdout));
        let err_pump = pump_output(err_pipe, Arc::clone(&stderr));

        self.jobs.lock().unwrap().insert(
            id.clone(),
            Job {
                pid,
                status: JobStatus {
                    state: JobState::Started,
                    exit_code: None,
                },
                stdout: Arc::clone(&stdout),
                stderr: Arc::clone(&stderr),
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let waiter_id = id.clone();
        thread::spawn(move || {
            let wait_result = child.wait();

            // Drain what is left in the pipes before sealing the buffers,
            // then close, then commit the terminal state
            let _ = out_pump.join();
            let _ = err_pump.join();

            let exit_code = match &wait_result {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    let _ = stdout.close();
                    let _ = stderr.close();
                    status.code().or_else(|| status.signal().map(|s| 128 + s))
                }
                Err(e) => {
                    warn!("waiting for job {waiter_id} failed: {e}");
                    let _ = stdout.close_with_error(Some(std::io::Error::new(
                        e.kind(),
                        e.to_string(),
                    )));
                    let _ = stderr.close_with_error(Some(std::io::Error::new(
                        e.kind(),
                        e.to_string(),
                    )));
                    None
                }
            };

            let mut jobs = jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&waiter_id) {
                // A stop that won the race stays; never downgrade to Done
                if job.status.state != JobState::Stopped {
                    job.status.state = JobState::Done;
                }
                job.status.exit_code = exit_code;
            }
        });

        Ok(id)
    }

    /// Kill the job with the given ID.
    ///
    /// Fails with `UnknownJobId` for unknown IDs and `JobFinished` when the
    /// job already reached a terminal state.
    pub fn stop_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(OverseerError::UnknownJobId)?;

        if job.status.state != JobState::Started {
            return Err(OverseerError::JobFinished);
        }

        // The exit code is recorded by the waiter once the kill lands
        job.status = JobStatus {
            state: JobState::Stopped,
            exit_code: None,
        };
        debug!("stopping job {id} (pid {})", job.pid);

        kill(job.pid, Signal::SIGKILL)
            .map_err(|e| OverseerError::Syscall(format!("failed to kill job process: {e}")))
    }

    /// Snapshot the status of the job with the given ID
    pub fn job_status(&self, id: &str) -> Result<JobStatus> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .map(|job| job.status)
            .ok_or(OverseerError::UnknownJobId)
    }

    /// New reader over the job's captured standard output, starting at the
    /// first byte
    pub fn job_stdout(&self, id: &str) -> Result<Reader> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .map(|job| job.stdout.reader())
            .ok_or(OverseerError::UnknownJobId)
    }

    /// New reader over the job's captured standard error, starting at the
    /// first byte
    pub fn job_stderr(&self, id: &str) -> Result<Reader> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .map(|job| job.stderr.reader())
            .ok_or(OverseerError::UnknownJobId)
    }

    fn spawn_child(&self, command: &str, args: &[String]) -> Result<Child> {
        if self.direct_spawn {
            let child = Command::new(command)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            return Ok(child);
        }

        let mut cmd = LimitedCommand::new(&self.limits, command, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.start()
    }

    #[cfg(test)]
    pub(crate) fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a job identifier from the kernel's UUID source
fn next_job_id() -> Result<String> {
    let raw = fs::read_to_string(UUID_SOURCE)?;
    Ok(raw.trim().to_string())
}

/// Copy a child output pipe into a buffer until EOF
fn pump_output<R>(mut pipe: R, sink: Arc<MultiBuffer>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if sink.write(&chunk[..n]).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}
