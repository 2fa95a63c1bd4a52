//! The OVERSEER_* environment contract between parent and trampoline

use std::env;

use crate::resources::ResourceLimits;

pub(crate) const EXEC_ENV_VAR: &str = "OVERSEER_EXEC";
pub(crate) const CPU_MAX_ENV_VAR: &str = "OVERSEER_CPU_MAX";
pub(crate) const MEM_MAX_ENV_VAR: &str = "OVERSEER_MEM_MAX";
pub(crate) const IO_MAX_RBPS_ENV_VAR: &str = "OVERSEER_IO_MAX_RBPS";
pub(crate) const IO_MAX_WBPS_ENV_VAR: &str = "OVERSEER_IO_MAX_WBPS";

const ALL_ENV_VARS: [&str; 5] = [
    EXEC_ENV_VAR,
    CPU_MAX_ENV_VAR,
    MEM_MAX_ENV_VAR,
    IO_MAX_RBPS_ENV_VAR,
    IO_MAX_WBPS_ENV_VAR,
];

/// True when this process was spawned as a trampoline.
///
/// The sentinel must carry its own name as value; anything else is ignored.
pub(crate) fn sentinel_present() -> bool {
    env::var(EXEC_ENV_VAR).map(|v| v == EXEC_ENV_VAR).unwrap_or(false)
}

/// Encode the set limits as environment pairs for the child.
///
/// These are applied to the spawned command only; the parent's environment is
/// never touched.
pub(crate) fn limit_env_vars(limits: &ResourceLimits) -> Vec<(&'static str, String)> {
    let fields = [
        (CPU_MAX_ENV_VAR, &limits.cpu_max),
        (MEM_MAX_ENV_VAR, &limits.memory_max),
        (IO_MAX_RBPS_ENV_VAR, &limits.io_max_rbps),
        (IO_MAX_WBPS_ENV_VAR, &limits.io_max_wbps),
    ];

    fields
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
        .collect()
}

/// Read the limits back out of the trampoline's environment
pub(crate) fn limits_from_env() -> ResourceLimits {
    ResourceLimits {
        cpu_max: env::var(CPU_MAX_ENV_VAR).ok(),
        memory_max: env::var(MEM_MAX_ENV_VAR).ok(),
        io_max_rbps: env::var(IO_MAX_RBPS_ENV_VAR).ok(),
        io_max_wbps: env::var(IO_MAX_WBPS_ENV_VAR).ok(),
    }
}

/// Remove the sentinel and every limit variable so the requested program does
/// not inherit them
pub(crate) fn scrub() {
    for name in ALL_ENV_VARS {
        env::remove_var(name);
    }
}
