//! Parent side of the trampoline: building and starting limited commands

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::process::{Child, Command, Stdio};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::errors::{OverseerError, Result};
use crate::execution::{env_vars, ERR_PIPE_FD};
use crate::resources::ResourceLimits;

/// A command that runs the requested program under resource limits.
///
/// The child is `/proc/self/exe` with the program and arguments appended and
/// the sentinel plus limit variables set on its environment; the re-executed
/// instance joins the limited cgroup and execs the program (see
/// [`crate::execution::reexec_guard`]).
pub struct LimitedCommand {
    inner: Command,
}

impl LimitedCommand {
    /// Build a trampoline command for the given program and arguments
    pub fn new(limits: &ResourceLimits, program: &str, args: &[String]) -> Self {
        let mut inner = Command::new("/proc/self/exe");
        inner.arg(program);
        inner.args(args);
        inner.env(env_vars::EXEC_ENV_VAR, env_vars::EXEC_ENV_VAR);
        for (name, value) in env_vars::limit_env_vars(limits) {
            inner.env(name, value);
        }

        Self { inner }
    }

    /// Configure the child's standard input
    pub fn stdin(&mut self, cfg: Stdio) -> &mut Self {
        self.inner.stdin(cfg);
        self
    }

    /// Configure the child's standard output
    pub fn stdout(&mut self, cfg: Stdio) -> &mut Self {
        self.inner.stdout(cfg);
        self
    }

    /// Configure the child's standard error
    pub fn stderr(&mut self, cfg: Stdio) -> &mut Self {
        self.inner.stderr(cfg);
        self
    }

    /// Spawn the trampoline and wait for it to either exec the requested
    /// program or report a setup failure.
    ///
    /// A signalling pipe rides into the child on fd 3. The parent closes its
    /// write end and drains the read end: EOF without data means the exec
    /// succeeded (the trampoline marks fd 3 close-on-exec); any bytes are the
    /// trampoline's error message.
    pub fn start(&mut self) -> Result<Child> {
        let (pipe_rd, pipe_wr) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| OverseerError::Syscall(format!("failed to create signalling pipe: {e}")))?;

        // Move the write end onto fd 3 after fork. dup2 clears close-on-exec
        // on the target, so fd 3 survives the re-exec while both original
        // pipe descriptors do not. Only async-signal-safe calls here.
        let write_fd = pipe_wr.as_raw_fd();
        unsafe {
            use std::os::unix::process::CommandExt;
            self.inner.pre_exec(move || {
                if write_fd == ERR_PIPE_FD {
                    let flags = libc::fcntl(ERR_PIPE_FD, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(ERR_PIPE_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(write_fd, ERR_PIPE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = self.inner.spawn()?;
        drop(pipe_wr);

        let mut message = Vec::new();
        File::from(pipe_rd).read_to_end(&mut message)?;

        if !message.is_empty() {
            // The trampoline reported failure and exited; reap it
            let _ = child.wait();
            return Err(OverseerError::Launch(
                String::from_utf8_lossy(&message).into_owned(),
            ));
        }

        Ok(child)
    }
}
