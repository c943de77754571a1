//! Process probes used by the worker daemon.

/// Current process id.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` exists.
///
/// Returns `None` where the platform offers no cheap probe; callers then fall
/// back to heartbeat freshness.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> Option<bool> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Some(false);
    };
    if pid <= 0 {
        return Some(false);
    }

    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return Some(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => Some(true),
        _ => Some(false),
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> Option<bool> {
    None
}

/// Resident set size of this process in bytes.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = u64::try_from(page_size).ok().filter(|size| *size > 0)?;
    Some(resident_pages * page_size)
}

/// Peak resident set size of this process in bytes.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn resident_memory_bytes() -> Option<u64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let usage = unsafe { usage.assume_init() };
    let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
    // macOS reports bytes, the BSDs report kilobytes.
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}

#[cfg(not(unix))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        assert_eq!(process_alive(current_pid()), Some(true));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pids_are_dead() {
        assert_eq!(process_alive(0), Some(false));
        assert_eq!(process_alive(u32::MAX), Some(false));
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(process_alive(pid), Some(false));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_reported() {
        let rss = resident_memory_bytes().unwrap();
        assert!(rss > 0);
    }
}
