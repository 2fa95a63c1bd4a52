//! Child side of the trampoline: cgroup entry and exec of the requested
//! program

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::unistd::execv;

use crate::errors::{OverseerError, Result};
use crate::execution::{env_vars, ERR_PIPE_FD};
use crate::resources::cgroup;

/// Divert into the trampoline when this process was spawned by
/// [`crate::execution::LimitedCommand`].
///
/// Every binary that starts jobs must call this before doing anything else:
/// the re-executed child enters the same `main`, and only this check routes
/// it into cgroup setup and the exec of the requested program. When the
/// sentinel variable is absent the call returns immediately.
///
/// On the trampoline path this function never returns: it either replaces the
/// process image via exec or writes the failure to the signalling pipe on
/// fd 3 and exits non-zero.
pub fn reexec_guard() {
    if !env_vars::sentinel_present() {
        return;
    }

    // fd 3 is the write end of the parent's signalling pipe
    let mut err_pipe = unsafe { File::from_raw_fd(ERR_PIPE_FD) };

    match stage_and_exec() {
        Ok(never) => match never {},
        Err(e) => {
            let _ = write!(err_pipe, "{e}");
            let _ = err_pipe.flush();
            process::exit(1);
        }
    }
}

fn stage_and_exec() -> Result<Infallible> {
    // Capture the limits before scrubbing so the cgroup setup still sees
    // them; the requested program must inherit none of the variables
    let limits = env_vars::limits_from_env();
    env_vars::scrub();

    // TODO: drop privileges before exec

    cgroup::enter_limited_subtree(&limits)?;

    // argv[0] is /proc/self/exe; the requested program and its arguments
    // follow
    let args: Vec<String> = env::args().skip(1).collect();
    let program = args
        .first()
        .ok_or_else(|| OverseerError::Launch("no program to execute".to_string()))?;
    let resolved = lookup_path(program)?;

    mark_cloexec(ERR_PIPE_FD)?;

    let path = CString::new(resolved.as_os_str().as_bytes())
        .map_err(|_| OverseerError::Launch(format!("{program}: path contains a NUL byte")))?;
    let argv = args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| OverseerError::Launch("argument contains a NUL byte".to_string()))?;

    match execv(&path, &argv) {
        Ok(never) => match never {},
        Err(e) => Err(OverseerError::Syscall(format!(
            "failed to exec {}: {e}",
            resolved.display()
        ))),
    }
}

/// Resolve a program name the way a shell would: names containing a slash
/// are used as-is, anything else is searched for along `$PATH`.
pub(crate) fn lookup_path(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(OverseerError::Launch(format!(
            "{name}: not an executable file"
        )));
    }

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(OverseerError::Launch(format!(
        "{name}: executable file not found in PATH"
    )))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Mark the signalling pipe close-on-exec so a successful exec is observed by
/// the parent as EOF
fn mark_cloexec(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(OverseerError::Syscall(format!(
            "failed to read flags of fd {fd}: {}",
            std::io::Error::last_os_error()
        )));
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(OverseerError::Syscall(format!(
            "failed to set close-on-exec on fd {fd}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
