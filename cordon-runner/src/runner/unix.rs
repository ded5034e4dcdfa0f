// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unix process plumbing: the child-side budget timer, wait-status
//! classification, and environment probes.

use super::internal_events::ExitKind;
use nix::sys::wait::WaitStatus;

/// Signal reserved for the budget timer. Nothing else in a child raises it,
/// so seeing it on termination is an unambiguous timeout.
pub(crate) const TIMEOUT_SIGNAL: i32 = libc::SIGPROF;

/// Environment marker set for re-exec'ed children on platforms that emulate
/// fork. The Unix fork path never sets it.
pub(crate) const RESUME_ENV: &str = "CORDON_RESUME_CHILD";

/// Arms the wall-clock budget in the child.
///
/// No handler is installed: the signal's default disposition terminates the
/// child, and the parent classifies the termination. The timer dies with the
/// process.
pub(crate) fn arm_timeout(seconds: f64) {
    let clamped = seconds.max(0.0);
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe {
                let mut sev: libc::sigevent = std::mem::zeroed();
                sev.sigev_notify = libc::SIGEV_SIGNAL;
                sev.sigev_signo = TIMEOUT_SIGNAL;
                let mut timer: libc::timer_t = std::mem::zeroed();
                if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) != 0 {
                    return;
                }
                let spec = libc::itimerspec {
                    it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                    it_value: libc::timespec {
                        tv_sec: clamped as libc::time_t,
                        tv_nsec: (clamped.fract() * 1e9) as libc::c_long,
                    },
                };
                libc::timer_settime(timer, 0, &spec, std::ptr::null_mut());
            }
        } else {
            // No POSIX timers here: fall back to the profiling interval
            // timer, which delivers the same signal.
            unsafe {
                let timer = libc::itimerval {
                    it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                    it_value: libc::timeval {
                        tv_sec: clamped as libc::time_t,
                        tv_usec: (clamped.fract() * 1e6) as libc::suseconds_t,
                    },
                };
                libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut());
            }
        }
    }
}

/// Maps a wait status to an exit kind. Stop/continue notifications are not
/// terminations and map to `None`.
pub(crate) fn classify_wait_status(status: WaitStatus) -> Option<ExitKind> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitKind::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitKind::Signaled(signal as i32)),
        _ => None,
    }
}

/// Returns true when the current process appears to be running under a
/// dynamic analyzer that makes forking expensive or unsafe.
pub(crate) fn running_under_analyzer() -> bool {
    std::env::var_os("LD_PRELOAD")
        .map(|preload| {
            let preload = preload.to_string_lossy();
            preload.contains("vgpreload") || preload.contains("valgrind")
        })
        .unwrap_or(false)
}

/// Returns true in a child that was resumed by re-exec rather than fork.
pub(crate) fn is_resumed_child() -> bool {
    std::env::var_os(RESUME_ENV).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{sys::wait::WaitStatus, unistd::Pid};

    #[test]
    fn wait_statuses_classify_to_exit_kinds() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            classify_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitKind::Exited(3))
        );
        assert_eq!(
            classify_wait_status(WaitStatus::Signaled(
                pid,
                nix::sys::signal::Signal::SIGSEGV,
                false
            )),
            Some(ExitKind::Signaled(libc::SIGSEGV))
        );
        assert_eq!(classify_wait_status(WaitStatus::StillAlive), None);
    }
}
