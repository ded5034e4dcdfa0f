// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The runner loop.
//!
//! A resumable producer walks the ordered test sequence and forks one worker
//! per runnable test. Up to `jobs` workers are alive at once; the parent sits
//! in a single-threaded event loop whose only suspension point is reading the
//! shared event pipe. Terminations are observed with non-blocking `wait(2)`
//! sweeps and surfaced only once the pipe is drained, so a worker's own
//! events always reach the state machine before its termination does.

use super::{
    internal_events::{ExitKind, TerminationLog, resolve_termination},
    unix,
    worker::{self, WorkerHandle},
};
use crate::{
    config::TestRunnerOpts,
    errors::{EventPipeError, PatternParseError, TestRunnerExecuteError},
    events::{self, ChildEvent, EventPipe},
    reporter::{LogSink, ReportSink, TestEvent, TracingLogSink},
    stats::{StatEvent, StatsTree},
    test_list::{Suite, TestCase, TestId, TestList},
    time,
};
use chrono::{DateTime, Local};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::wait::{WaitPidFlag, waitpid},
};
use regex::Regex;
use std::{os::fd::AsFd, time::Duration};

/// Mutable run state threaded through the event loop: the statistics tree
/// and the sinks everything is delivered to.
struct RunContext<'run> {
    stats: StatsTree,
    reporters: &'run mut [Box<dyn ReportSink>],
    log: &'run mut dyn LogSink,
}

impl RunContext<'_> {
    fn report(&mut self, event: TestEvent) {
        for sink in self.reporters.iter_mut() {
            sink.report(&event);
        }
    }

    /// Folds one child event, real or synthesized, into statistics, report
    /// sinks, and the log sink.
    fn fold_child_event(&mut self, test_id: &TestId, event: &ChildEvent) {
        self.stats.push(test_id, StatEvent::Child(event));
        match event {
            ChildEvent::SetupStarted => {
                self.log.setup_started(test_id);
                self.report(TestEvent::SetupStarted {
                    test_id: test_id.clone(),
                });
            }
            ChildEvent::TestStarted => {
                self.log.test_started(test_id);
                self.report(TestEvent::TestStarted {
                    test_id: test_id.clone(),
                });
            }
            ChildEvent::Assert(record) => {
                self.log.assert(test_id, record);
                self.report(TestEvent::Assert {
                    test_id: test_id.clone(),
                    record: record.clone(),
                });
            }
            ChildEvent::TheoryFailed { formatted_args } => {
                self.log.theory_failed(test_id, formatted_args);
                self.report(TestEvent::TheoryFailed {
                    test_id: test_id.clone(),
                    formatted_args: formatted_args.clone(),
                });
            }
            ChildEvent::TestAborted { reason } => {
                self.log.test_aborted(test_id, reason);
                self.report(TestEvent::TestAborted {
                    test_id: test_id.clone(),
                    reason: reason.clone(),
                });
            }
            ChildEvent::TestFinished { elapsed_s } => {
                self.log.test_finished(test_id, *elapsed_s);
                self.report(TestEvent::TestFinished {
                    test_id: test_id.clone(),
                    elapsed_s: *elapsed_s,
                });
            }
            ChildEvent::CleanupDone => {
                self.log.cleanup_done(test_id);
                self.report(TestEvent::CleanupDone {
                    test_id: test_id.clone(),
                });
            }
        }
    }

    fn push_skip(&mut self, test_id: &TestId) {
        self.stats.push(test_id, StatEvent::Skipped);
        self.log.test_skipped(test_id);
        self.report(TestEvent::TestSkipped {
            test_id: test_id.clone(),
        });
    }

    fn push_crash(&mut self, test_id: &TestId) {
        self.stats.push(test_id, StatEvent::Crashed);
        self.report(TestEvent::TestCrashed {
            test_id: test_id.clone(),
        });
    }
}

/// Resumable producer over the test sequence.
///
/// Each resume consumes entries until it can fork a worker or the sequence
/// ends. Disabled and skipped tests are consumed here, with the skip folded
/// into statistics as they go by.
struct TestProducer<'list> {
    entries: Vec<(&'list Suite, &'list TestCase)>,
    next: usize,
}

impl<'list> TestProducer<'list> {
    fn new(list: &'list TestList) -> Self {
        Self {
            entries: list.iter().collect(),
            next: 0,
        }
    }

    fn next_worker(
        &mut self,
        pipe: &EventPipe,
        no_early_exit: bool,
        cx: &mut RunContext<'_>,
    ) -> Result<Option<WorkerHandle<'list>>, TestRunnerExecuteError> {
        while self.next < self.entries.len() {
            let (suite, test) = self.entries[self.next];
            self.next += 1;
            if suite.params.disabled || test.params.disabled || test.params.skip {
                cx.push_skip(&test.id);
                continue;
            }
            let handle = worker::spawn_worker(test, suite, pipe, no_early_exit)?;
            return Ok(Some(handle));
        }
        Ok(None)
    }
}

/// Runs every test in a list, each in its own forked worker process.
///
/// Most callers want [`run_all`]; this type exists for embedders that bring
/// their own log sink or want to inspect the options after the analyzer
/// policy ran.
pub struct TestRunner<'list> {
    list: &'list TestList,
    opts: TestRunnerOpts,
    advisories: Vec<String>,
    jobs: usize,
}

impl<'list> TestRunner<'list> {
    /// Creates a runner over `list`, applying the analyzer policy to the
    /// options.
    pub fn new(list: &'list TestList, mut opts: TestRunnerOpts) -> Self {
        let advisories = opts.apply_analyzer_policy(unix::running_under_analyzer());
        let jobs = opts.resolved_jobs().max(1);
        Self {
            list,
            opts,
            advisories,
            jobs,
        }
    }

    /// Executes the run, delivering log categories to `log`.
    pub fn execute(&mut self, log: &mut dyn LogSink) -> Result<RunReport, TestRunnerExecuteError> {
        let stopwatch = time::stopwatch();
        let no_early_exit = self.opts.no_early_exit();
        let jobs = self.jobs;
        let advisories = self.advisories.clone();
        let list = self.list;

        let mut cx = RunContext {
            stats: StatsTree::default(),
            reporters: self.opts.output_providers_mut(),
            log,
        };

        cx.log.run_started(list.test_count());
        cx.report(TestEvent::RunStarted {
            test_count: list.test_count(),
        });
        for message in advisories {
            tracing::warn!(%message, "analyzer advisory");
            cx.report(TestEvent::Advisory { message });
        }

        let pipe = EventPipe::new()?;
        let mut producer = TestProducer::new(list);
        let mut pool: Vec<Option<WorkerHandle<'list>>> = Vec::with_capacity(jobs);
        pool.resize_with(jobs, || None);
        let mut active = 0usize;

        for slot in 0..jobs {
            match producer.next_worker(&pipe, no_early_exit, &mut cx)? {
                Some(handle) => {
                    pool[slot] = Some(handle);
                    active += 1;
                }
                None => break,
            }
        }

        while active > 0 {
            let (slot, event) = next_event(&pipe, &mut pool)?;
            match event {
                SlotEvent::Child(child_event) => {
                    handle_child_event(&mut cx, &mut pool, slot, &child_event);
                }
                SlotEvent::Terminated(status) => {
                    let handle = pool[slot].take().expect("terminated slot is occupied");
                    active -= 1;
                    handle_termination(&mut cx, &handle, status);
                    if let Some(next) = producer.next_worker(&pipe, no_early_exit, &mut cx)? {
                        pool[slot] = Some(next);
                        active += 1;
                    }
                }
            }
        }

        drop(pool);
        drop(pipe);

        let RunContext { stats, reporters, log } = cx;
        let start_time = stopwatch.start_time();
        let elapsed = stopwatch.elapsed();
        let finished = TestEvent::RunFinished {
            stats: stats.run,
            start_time,
            elapsed,
        };
        for sink in reporters.iter_mut() {
            sink.report(&finished);
        }
        log.run_finished(&stats.run);

        Ok(RunReport {
            stats,
            start_time,
            elapsed,
        })
    }
}

fn handle_child_event(
    cx: &mut RunContext<'_>,
    pool: &mut [Option<WorkerHandle<'_>>],
    slot: usize,
    event: &ChildEvent,
) {
    let Some(handle) = pool[slot].as_mut() else {
        return;
    };
    match event {
        ChildEvent::TestStarted => handle.ctx.test_started = true,
        ChildEvent::TestAborted { .. } => handle.ctx.aborted = true,
        ChildEvent::TestFinished { .. } => handle.ctx.normal_finish = true,
        ChildEvent::CleanupDone => handle.ctx.cleaned_up = true,
        _ => {}
    }
    let test_id = handle.ctx.test.id.clone();
    cx.fold_child_event(&test_id, event);
}

fn handle_termination(cx: &mut RunContext<'_>, handle: &WorkerHandle<'_>, status: ExitKind) {
    let plan = resolve_termination(&handle.ctx, status, unix::TIMEOUT_SIGNAL);
    let test_id = handle.ctx.test.id.clone();

    if plan.timed_out {
        cx.stats.mark_timed_out(&test_id);
    }
    if let Some(signal) = plan.record_signal {
        cx.stats.record_signal(&test_id, signal);
    }
    if let Some(exit_code) = plan.record_exit_code {
        cx.stats.record_exit_code(&test_id, exit_code);
    }
    if plan.crash {
        cx.push_crash(&test_id);
    }
    if let Some(elapsed_s) = plan.synth_finish {
        cx.fold_child_event(&test_id, &ChildEvent::TestFinished { elapsed_s });
    }
    if plan.synth_cleanup {
        cx.fold_child_event(&test_id, &ChildEvent::CleanupDone);
    }

    match plan.log {
        TerminationLog::None => {}
        TerminationLog::TimedOut => cx.log.test_timed_out(&test_id),
        TerminationLog::Crashed => {
            let stats = cx.stats.test(&test_id).cloned().unwrap_or_default();
            cx.log.test_crashed(&test_id, &stats);
        }
        TerminationLog::OtherCrash => cx.log.other_crash(&test_id),
        TerminationLog::AbnormalExit => cx.log.abnormal_exit(&test_id),
    }
}

enum SlotEvent {
    Child(ChildEvent),
    Terminated(ExitKind),
}

/// The parent's single suspension point.
fn next_event(
    pipe: &EventPipe,
    pool: &mut [Option<WorkerHandle<'_>>],
) -> Result<(usize, SlotEvent), TestRunnerExecuteError> {
    loop {
        reap_exited(pool)?;

        if pipe_readable(pipe, PollTimeout::ZERO)? {
            let wire = events::read_frame(pipe.reader.as_fd())?;
            match slot_for_pid(pool, wire.pid) {
                Some(slot) => return Ok((slot, SlotEvent::Child(wire.event))),
                None => {
                    // Most likely a grandchild that inherited the write end.
                    tracing::warn!(pid = wire.pid, "event from an unknown process");
                    continue;
                }
            }
        }

        // The pipe is momentarily drained, so any reaped worker has had all
        // of its events delivered; its termination can go out now.
        if let Some(slot) = pool.iter().position(|handle| {
            handle
                .as_ref()
                .is_some_and(|handle| handle.pending_status.is_some())
        }) {
            let status = pool[slot]
                .as_mut()
                .expect("position() just found this slot")
                .pending_status
                .take()
                .expect("pending status just observed");
            return Ok((slot, SlotEvent::Terminated(status)));
        }

        // Idle: wait for data or the next reap tick.
        pipe_readable(pipe, PollTimeout::from(25u8))?;
    }
}

/// Non-blocking sweep over live workers, recording terminations.
fn reap_exited(pool: &mut [Option<WorkerHandle<'_>>]) -> Result<(), TestRunnerExecuteError> {
    for handle in pool.iter_mut().flatten() {
        if handle.reaped {
            continue;
        }
        match waitpid(handle.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                if let Some(kind) = unix::classify_wait_status(status) {
                    handle.reaped = true;
                    handle.pending_status = Some(kind);
                }
            }
            Err(errno) => {
                return Err(TestRunnerExecuteError::Wait {
                    error: errno.into(),
                });
            }
        }
    }
    Ok(())
}

fn slot_for_pid(pool: &[Option<WorkerHandle<'_>>], pid: u32) -> Option<usize> {
    pool.iter().position(|handle| {
        handle
            .as_ref()
            .is_some_and(|handle| handle.pid.as_raw() as u32 == pid)
    })
}

fn pipe_readable(pipe: &EventPipe, timeout: PollTimeout) -> Result<bool, EventPipeError> {
    let mut fds = [PollFd::new(pipe.reader.as_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                return Err(EventPipeError::Poll {
                    error: errno.into(),
                });
            }
        }
    }
}

/// Final status of a run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// Every test passed, or `always_succeed` was set.
    Success,
    /// At least one test failed.
    Failure,
    /// This process is a worker resumed by re-exec; it has nothing to
    /// summarize.
    Worker,
}

impl RunStatus {
    /// The conventional exit code for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::Worker => -1,
        }
    }
}

/// Everything a run recorded.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// The statistics tree.
    pub stats: StatsTree,
    /// When the run started.
    pub start_time: DateTime<Local>,
    /// How long the run took.
    pub elapsed: Duration,
}

impl RunReport {
    /// Returns true when any test failed.
    pub fn failed(&self) -> bool {
        !self.stats.run.is_success()
    }
}

/// The outcome of one full run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Everything the run recorded.
    pub report: RunReport,
    /// The summary status.
    pub status: RunStatus,
}

/// Builds the ordered test set from registered suites and tests.
///
/// On platforms that emulate fork by re-exec, a resumed child short-circuits
/// here and exits immediately; it has no tests to schedule.
pub fn initialize(
    suites: impl IntoIterator<Item = Suite>,
    tests: impl IntoIterator<Item = TestCase>,
) -> TestList {
    if unix::is_resumed_child() {
        std::process::exit(0);
    }
    TestList::build(suites, tests)
}

/// Applies the configured filter, runs every test, and summarizes.
pub fn run_all(
    list: &mut TestList,
    opts: TestRunnerOpts,
) -> Result<RunOutcome, TestRunnerExecuteError> {
    if unix::is_resumed_child() {
        // A worker process has no business summarizing the run.
        let stopwatch = time::stopwatch();
        return Ok(RunOutcome {
            report: RunReport {
                stats: StatsTree::default(),
                start_time: stopwatch.start_time(),
                elapsed: Duration::ZERO,
            },
            status: RunStatus::Worker,
        });
    }

    if let Some(pattern) = opts.pattern() {
        let regex = Regex::new(pattern).map_err(|error| PatternParseError::new(pattern, error))?;
        list.disable_unmatched(&regex);
    }

    let always_succeed = opts.always_succeed();
    let mut runner = TestRunner::new(list, opts);
    let report = runner.execute(&mut TracingLogSink)?;
    let status = if report.failed() && !always_succeed {
        RunStatus::Failure
    } else {
        RunStatus::Success
    };
    Ok(RunOutcome { report, status })
}

/// Releases the test set. Explicit counterpart to [`initialize`]; dropping
/// the list does the same thing.
pub fn finalize(list: TestList) {
    drop(list);
}
