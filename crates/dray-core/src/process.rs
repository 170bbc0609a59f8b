//! OS process helpers: liveness, signals, memory and shutdown markers.

use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Whether a process with `pid` exists.
///
/// A process we may not signal (`EPERM`) still exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether we can signal `pid`; the supervisor treats anything else as gone.
pub(crate) fn process_signalable(pid: u32) -> bool {
    send_signal(pid, 0).is_ok()
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), Error> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| Error::new(ErrorKind::Io, format!("invalid pid {pid}")))?;
    // SAFETY: plain kill(2) with a validated positive pid.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

/// Resident set size of the current process in MB.
pub fn current_memory_mb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system
        .process(pid)
        .map(|process| process.memory() / 1024 / 1024)
}

/// Marker a worker leaves behind when it exits to be replaced.
pub fn shutdown_marker_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("dray.{pid}.shutdown"))
}

pub(crate) fn write_shutdown_marker(dir: &Path, pid: u32) -> Result<PathBuf, Error> {
    std::fs::create_dir_all(dir)?;
    let path = shutdown_marker_path(dir, pid);
    std::fs::write(&path, b"")?;
    Ok(path)
}
