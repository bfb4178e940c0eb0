use std::io;
use std::time::Duration;

/// Interval between idle-auditor ticks (`SIGALRM`), per §6.
pub const AUDIT_INTERVAL: Duration = Duration::from_secs(10);

/// Arms `ITIMER_REAL` to deliver `SIGALRM` once after `interval`, then every
/// `interval` thereafter. The signal itself is caught by the `signal-hook`
/// self-pipe registered with the readiness instance (see `crate::server`),
/// not by an installed signal handler here.
pub fn arm_periodic_sigalrm(interval: Duration) -> io::Result<()> {
    let micros = interval.as_micros();
    let it_value = libc::timeval {
        tv_sec: (micros / 1_000_000) as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    };
    let itimerval = libc::itimerval { it_interval: it_value, it_value };

    // SAFETY: `itimerval` is fully initialised and its address is the sole
    // output parameter `setitimer` writes through (the old-value argument is
    // null, so nothing else is touched).
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &itimerval, std::ptr::null_mut()) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arms_without_error() {
        // Harmless in a test process: fires SIGALRM, which is blocked
        // process-wide by the dispatcher's signal mask in normal operation.
        // Here we just assert the syscall succeeds, then disarm immediately.
        arm_periodic_sigalrm(Duration::from_secs(3600)).unwrap();
        let disarm = libc::itimerval {
            it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
            it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
        };
        let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &disarm, std::ptr::null_mut()) };
        assert_eq!(rc, 0);
    }
}
