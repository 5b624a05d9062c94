//! OS-level resource limits applied to sandboxed children before any user
//! code loads (spec §4.6 point 3).
//!
//! Grounded in the teacher's `ProcessMicroVMProvider`
//! (`rtfs::runtime::microvm::providers::process`), generalized from ad hoc
//! policy checks on an `ExecutionContext` to real `setrlimit(2)` calls
//! applied via `pre_exec` before the child execs the interpreter.

use crate::config::SandboxSettings;

/// Apply `RLIMIT_AS` (memory), `RLIMIT_CPU`, `RLIMIT_NOFILE`, and
/// `RLIMIT_FSIZE` to the *calling* process. Intended to run inside
/// [`std::os::unix::process::CommandExt::pre_exec`], i.e. after `fork`
/// but before `exec`, so the limits apply to the child only and take
/// effect before any user code runs.
#[cfg(unix)]
pub fn apply_unix_limits(settings: &SandboxSettings) -> std::io::Result<()> {
    set_rlimit(libc::RLIMIT_AS, settings.memory_bytes)?;
    let cpu_secs = settings.cpu_ms.div_ceil(1000).max(1);
    set_rlimit(libc::RLIMIT_CPU, cpu_secs)?;
    if settings.max_procs == 0 {
        // Best-effort: not all platforms expose RLIMIT_NPROC (e.g. macOS
        // ships it but some containers mask it); ignore failures here,
        // matching the teacher's has-the-syscall-or-degrade-gracefully
        // posture for sandbox policy enforcement.
        let _ = set_rlimit(rlimit_nproc(), 1);
    }
    set_rlimit(libc::RLIMIT_NOFILE, max_fds(settings))?;
    set_rlimit(libc::RLIMIT_FSIZE, max_file_size(settings))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn rlimit_nproc() -> libc::c_int {
    libc::RLIMIT_NPROC
}

#[cfg(all(unix, not(target_os = "linux")))]
fn rlimit_nproc() -> libc::c_int {
    // RLIMIT_NPROC isn't part of POSIX; fall back to a limit that's always
    // present so the call still does *something* conservative.
    libc::RLIMIT_NOFILE
}

fn max_fds(settings: &SandboxSettings) -> u64 {
    // The config doesn't carry an explicit fd cap (spec §6 only lists
    // memory/cpu/wall/fs/net/procs); derive a small, fixed ceiling
    // independent of memory so minimal-memory sandboxes don't also starve
    // for descriptors.
    let _ = settings;
    64
}

fn max_file_size(settings: &SandboxSettings) -> u64 {
    // Disk write cap (spec §4.6 "limits"): no dedicated config field
    // either, so bound it by the memory cap as a conservative default.
    settings.memory_bytes
}

#[cfg(unix)]
fn set_rlimit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `resource` is one of the `RLIMIT_*` constants and `limit` is
    // a plain-old-data struct we just constructed; `setrlimit` only reads
    // from it.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
