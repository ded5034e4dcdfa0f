// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker processes.
//!
//! The parent side of this module forks children and holds [`WorkerHandle`]s
//! to them; the child side runs exactly one test and leaves through `_exit`,
//! never returning into the scheduler. Assertion front-ends running inside a
//! child report through [`emit_assert`], [`emit_theory_failure`], and
//! [`abort_test`].

use super::{
    internal_events::{ExecutionContext, ExitKind, effective_timeout},
    unix,
};
use crate::{
    errors::SpawnError,
    events::{self, AssertRecord, ChildEvent, EventPipe, WireEvent, truncate_for_frame},
    test_list::{Suite, TestCase, TestLang},
};
use nix::{
    sys::{
        signal::{Signal, kill},
        wait::waitpid,
    },
    unistd::{self, ForkResult, Pid},
};
use std::{
    any::Any,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    panic,
    sync::Mutex,
};

/// Sentinel carried by the unwind that [`abort_test`] starts. The lifecycle
/// wrapper catches it; anything else unwinding out of a body is a stray
/// panic.
struct AbortUnwind;

/// Child-side emission context, installed right after fork. `None` in the
/// parent, which makes the emission API a no-op there.
static CHILD_CONTEXT: Mutex<Option<ChildContext>> = Mutex::new(None);

struct ChildContext {
    write_fd: OwnedFd,
    pid: u32,
}

fn emit(event: ChildEvent) {
    let guard = CHILD_CONTEXT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(cx) = guard.as_ref() {
        let wire = WireEvent {
            pid: cx.pid,
            event,
        };
        // Best-effort: if the pipe is gone the parent will classify the
        // child from its termination alone.
        let _ = events::write_frame(cx.write_fd.as_fd(), &wire);
    }
}

/// Reports one assertion outcome from inside a running test body.
pub fn emit_assert(mut record: AssertRecord) {
    truncate_for_frame(&mut record.message);
    truncate_for_frame(&mut record.file);
    emit(ChildEvent::Assert(record));
}

/// Reports a failed theory instantiation from inside a running test body.
pub fn emit_theory_failure(formatted_args: impl Into<String>) {
    let mut formatted_args = formatted_args.into();
    truncate_for_frame(&mut formatted_args);
    emit(ChildEvent::TheoryFailed { formatted_args });
}

/// Fails the test immediately.
///
/// Emits the abort event, then unwinds out of the test body; cleanup
/// fixtures still run before the child exits.
pub fn abort_test(reason: impl Into<String>) -> ! {
    let mut reason = reason.into();
    truncate_for_frame(&mut reason);
    emit(ChildEvent::TestAborted { reason });
    panic::panic_any(AbortUnwind);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test body panicked".to_owned()
    }
}

type WrapperFn = fn(&TestCase, &Suite);

/// Child-side entry wrappers, indexed by [`TestLang`].
static WRAPPERS: [WrapperFn; 2] = [native_wrap, ffi_wrap];

fn wrapper_for(lang: TestLang) -> WrapperFn {
    WRAPPERS[lang as usize]
}

fn native_wrap(test: &TestCase, suite: &Suite) {
    run_lifecycle(test, suite);
}

/// Same lifecycle as [`native_wrap`], plus a flush of any C stdio buffers
/// the foreign side of the body may still hold.
fn ffi_wrap(test: &TestCase, suite: &Suite) {
    run_lifecycle(test, suite);
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}

/// Drives one test through its child-side lifecycle: setup and init
/// fixtures, the body behind an unwind barrier, fini and teardown fixtures.
fn run_lifecycle(test: &TestCase, suite: &Suite) {
    if let Some(setup) = suite.params.setup {
        setup();
    }
    if let Some(init) = test.params.init {
        init();
    }
    emit(ChildEvent::TestStarted);

    let stopwatch = crate::time::stopwatch();
    match panic::catch_unwind(test.body) {
        Ok(()) => emit(ChildEvent::TestFinished {
            elapsed_s: stopwatch.elapsed_s(),
        }),
        Err(payload) => {
            if !payload.is::<AbortUnwind>() {
                // A stray panic counts as a fatal assertion failure.
                let mut message = panic_message(payload.as_ref());
                truncate_for_frame(&mut message);
                emit(ChildEvent::Assert(AssertRecord {
                    message: message.clone(),
                    file: String::new(),
                    line: 0,
                    passed: false,
                }));
                emit(ChildEvent::TestAborted { reason: message });
            }
        }
    }

    if let Some(fini) = test.params.fini {
        fini();
    }
    if let Some(teardown) = suite.params.teardown {
        teardown();
    }
    emit(ChildEvent::CleanupDone);
}

/// Parent-side handle to one running child.
#[derive(Debug)]
pub(crate) struct WorkerHandle<'list> {
    pub(crate) pid: Pid,
    pub(crate) ctx: ExecutionContext<'list>,
    /// Termination observed by the reaper but not yet handed to the state
    /// machine.
    pub(crate) pending_status: Option<ExitKind>,
    /// Set once `wait(2)` has reported the child gone.
    pub(crate) reaped: bool,
}

impl Drop for WorkerHandle<'_> {
    fn drop(&mut self) {
        // Only reached with a live child on abnormal unwinds out of the run
        // loop; normal termination handling reaps first.
        if !self.reaped {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Forks a worker for one test.
///
/// In the parent this returns the handle. The child runs the test, emits its
/// lifecycle events into the pipe's write end, and exits without returning.
pub(crate) fn spawn_worker<'list>(
    test: &'list TestCase,
    suite: &'list Suite,
    pipe: &EventPipe,
    no_early_exit: bool,
) -> Result<WorkerHandle<'list>, SpawnError> {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(WorkerHandle {
            pid: child,
            ctx: ExecutionContext::new(test, suite),
            pending_status: None,
            reaped: false,
        }),
        Ok(ForkResult::Child) => run_child(test, suite, pipe, no_early_exit),
        Err(errno) => Err(SpawnError::new(test.id.to_string(), errno.into())),
    }
}

fn run_child(test: &TestCase, suite: &Suite, pipe: &EventPipe, no_early_exit: bool) -> ! {
    // The read end belongs to the parent.
    unsafe {
        libc::close(pipe.reader.as_raw_fd());
    }
    let write_fd = match pipe.writer.try_clone() {
        Ok(fd) => fd,
        // Without the pipe there is nothing to report through; the parent
        // will see an abnormal exit.
        Err(_) => unsafe { libc::_exit(70) },
    };

    *CHILD_CONTEXT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ChildContext {
        write_fd,
        pid: std::process::id(),
    });

    panic::set_hook(Box::new(|info| {
        if info.payload().is::<AbortUnwind>() {
            return;
        }
        eprintln!("test worker panicked: {}", panic_message(info.payload()));
    }));

    emit(ChildEvent::SetupStarted);
    if let Some(budget) = effective_timeout(test, suite) {
        unix::arm_timeout(budget);
    }
    wrapper_for(test.lang)(test, suite);

    if no_early_exit {
        // The regular exit path runs process teardown, which analyzers want
        // to observe.
        std::process::exit(0);
    } else {
        unsafe { libc::_exit(0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Serializes tests that install the process-global emission context.
    static CONTEXT_LOCK: Mutex<()> = Mutex::new(());

    fn install_context(pipe: &EventPipe) {
        *CHILD_CONTEXT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ChildContext {
            write_fd: pipe.writer.try_clone().expect("writer duplicated"),
            pid: std::process::id(),
        });
    }

    fn uninstall_context() {
        *CHILD_CONTEXT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    fn drain(pipe: &EventPipe, count: usize) -> Vec<ChildEvent> {
        (0..count)
            .map(|_| {
                events::read_frame(pipe.reader.as_fd())
                    .expect("frame read")
                    .event
            })
            .collect()
    }

    #[test]
    fn passing_lifecycle_emits_ordered_events() {
        let _guard = CONTEXT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pipe = EventPipe::new().expect("pipe created");
        install_context(&pipe);

        let test = TestCase::new("s", "ok", || {});
        let suite = Suite::new("s");
        run_lifecycle(&test, &suite);
        uninstall_context();

        let observed = drain(&pipe, 3);
        assert!(matches!(observed[0], ChildEvent::TestStarted));
        assert!(matches!(observed[1], ChildEvent::TestFinished { .. }));
        assert!(matches!(observed[2], ChildEvent::CleanupDone));
    }

    #[test]
    fn stray_panic_becomes_a_fatal_assert_and_cleanup_still_runs() {
        let _guard = CONTEXT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pipe = EventPipe::new().expect("pipe created");
        install_context(&pipe);

        let test = TestCase::new("s", "panics", || panic!("boom"));
        let suite = Suite::new("s");
        run_lifecycle(&test, &suite);
        uninstall_context();

        let observed = drain(&pipe, 4);
        assert!(matches!(observed[0], ChildEvent::TestStarted));
        match &observed[1] {
            ChildEvent::Assert(record) => {
                assert!(!record.passed);
                assert_eq!(record.message, "boom");
            }
            other => panic!("expected a failed assert, got {other:?}"),
        }
        match &observed[2] {
            ChildEvent::TestAborted { reason } => assert_eq!(reason, "boom"),
            other => panic!("expected an abort, got {other:?}"),
        }
        assert!(matches!(observed[3], ChildEvent::CleanupDone));
    }

    #[test]
    fn emission_is_a_no_op_without_a_context() {
        let _guard = CONTEXT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Must not panic or block.
        emit_assert(AssertRecord {
            message: "ignored".to_owned(),
            file: "f.rs".to_owned(),
            line: 1,
            passed: true,
        });
        emit_theory_failure("(x = 1)");
    }
}
