//! Error types for job supervision and launching

use std::io;
use thiserror::Error;

/// Result type for overseer operations
pub type Result<T> = std::result::Result<T, OverseerError>;

/// Errors that can occur while launching, supervising or streaming jobs
#[derive(Error, Debug)]
pub enum OverseerError {
    #[error("unknown job ID")]
    UnknownJobId,

    #[error("job was already finished")]
    JobFinished,

    #[error("write to closed buffer")]
    ClosedBuffer,

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("cgroup2 is not mounted")]
    CgroupNotMounted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("syscall error: {0}")]
    Syscall(String),
}
