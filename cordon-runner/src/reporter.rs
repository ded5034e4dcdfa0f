// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivering run events to report and log sinks.
//!
//! Report sinks receive every lifecycle event, including the ones the
//! scheduler synthesizes on recovery paths, so the same outcome may reach a
//! sink more than once. Log sinks are a fire-and-forget human-readable side
//! channel; the built-in [`TracingLogSink`] forwards to `tracing`.

use crate::{
    events::AssertRecord,
    stats::{RunStats, TestStats},
    test_list::TestId,
};
use chrono::{DateTime, Local};
use std::time::Duration;

/// A lifecycle event as delivered to report sinks.
#[derive(Clone, Debug)]
pub enum TestEvent {
    /// The run is about to start.
    RunStarted {
        /// Number of registered tests.
        test_count: usize,
    },
    /// A worker came alive for this test.
    SetupStarted {
        /// The test the worker is running.
        test_id: TestId,
    },
    /// The test body is about to run.
    TestStarted {
        /// The test.
        test_id: TestId,
    },
    /// One assertion outcome.
    Assert {
        /// The test.
        test_id: TestId,
        /// The assertion record.
        record: AssertRecord,
    },
    /// A theory instantiation failed.
    TheoryFailed {
        /// The test.
        test_id: TestId,
        /// The formatted arguments of the failing instantiation.
        formatted_args: String,
    },
    /// The test aborted fatally.
    TestAborted {
        /// The test.
        test_id: TestId,
        /// Why it aborted.
        reason: String,
    },
    /// The test body completed (possibly synthesized on recovery).
    TestFinished {
        /// The test.
        test_id: TestId,
        /// Wall-clock seconds the body took.
        elapsed_s: f64,
    },
    /// Teardown completed (possibly synthesized on recovery).
    CleanupDone {
        /// The test.
        test_id: TestId,
    },
    /// The worker terminated unexpectedly.
    TestCrashed {
        /// The test.
        test_id: TestId,
    },
    /// The test was consumed without being run.
    TestSkipped {
        /// The test.
        test_id: TestId,
    },
    /// An environment advisory, e.g. from the analyzer policy.
    Advisory {
        /// The advisory text.
        message: String,
    },
    /// The run completed.
    RunFinished {
        /// Global statistics.
        stats: RunStats,
        /// When the run started.
        start_time: DateTime<Local>,
        /// How long the run took.
        elapsed: Duration,
    },
}

/// A sink for rendered lifecycle events.
///
/// Sinks are best-effort: the runner ignores anything they do, and recovery
/// paths may deliver the same outcome twice, so implementations must be
/// idempotent per outcome.
pub trait ReportSink {
    /// Receives one event.
    fn report(&mut self, event: &TestEvent);
}

impl<F> ReportSink for F
where
    F: FnMut(&TestEvent),
{
    fn report(&mut self, event: &TestEvent) {
        self(event)
    }
}

/// The human-readable side channel, one method per category.
///
/// Every method has a no-op default so sinks implement only what they want.
pub trait LogSink {
    /// A worker came alive.
    fn setup_started(&mut self, _test_id: &TestId) {}
    /// A test body is about to run.
    fn test_started(&mut self, _test_id: &TestId) {}
    /// An assertion was reported.
    fn assert(&mut self, _test_id: &TestId, _record: &AssertRecord) {}
    /// A theory instantiation failed.
    fn theory_failed(&mut self, _test_id: &TestId, _formatted_args: &str) {}
    /// A test aborted fatally.
    fn test_aborted(&mut self, _test_id: &TestId, _reason: &str) {}
    /// A test body completed.
    fn test_finished(&mut self, _test_id: &TestId, _elapsed_s: f64) {}
    /// Teardown completed.
    fn cleanup_done(&mut self, _test_id: &TestId) {}
    /// A test exceeded its wall-clock budget.
    fn test_timed_out(&mut self, _test_id: &TestId) {}
    /// A test crashed.
    fn test_crashed(&mut self, _test_id: &TestId, _stats: &TestStats) {}
    /// A worker died outside the test body.
    fn other_crash(&mut self, _test_id: &TestId) {}
    /// A worker exited abnormally.
    fn abnormal_exit(&mut self, _test_id: &TestId) {}
    /// A test was skipped.
    fn test_skipped(&mut self, _test_id: &TestId) {}
    /// The run started.
    fn run_started(&mut self, _test_count: usize) {}
    /// The run finished.
    fn run_finished(&mut self, _stats: &RunStats) {}
}

/// A [`LogSink`] that forwards to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn setup_started(&mut self, test_id: &TestId) {
        tracing::debug!(test = %test_id, "worker started");
    }

    fn test_started(&mut self, test_id: &TestId) {
        tracing::debug!(test = %test_id, "test body started");
    }

    fn assert(&mut self, test_id: &TestId, record: &AssertRecord) {
        if record.passed {
            tracing::trace!(test = %test_id, message = %record.message, "assertion passed");
        } else {
            tracing::warn!(
                test = %test_id,
                message = %record.message,
                file = %record.file,
                line = record.line,
                "assertion failed"
            );
        }
    }

    fn theory_failed(&mut self, test_id: &TestId, formatted_args: &str) {
        tracing::warn!(test = %test_id, args = %formatted_args, "theory failed");
    }

    fn test_aborted(&mut self, test_id: &TestId, reason: &str) {
        tracing::warn!(test = %test_id, %reason, "test aborted");
    }

    fn test_finished(&mut self, test_id: &TestId, elapsed_s: f64) {
        tracing::debug!(test = %test_id, elapsed_s, "test body finished");
    }

    fn cleanup_done(&mut self, test_id: &TestId) {
        tracing::debug!(test = %test_id, "teardown finished");
    }

    fn test_timed_out(&mut self, test_id: &TestId) {
        tracing::warn!(test = %test_id, "test timed out");
    }

    fn test_crashed(&mut self, test_id: &TestId, stats: &TestStats) {
        tracing::error!(
            test = %test_id,
            signal = ?stats.signal,
            exit_code = ?stats.exit_code,
            "test crashed"
        );
    }

    fn other_crash(&mut self, test_id: &TestId) {
        tracing::error!(test = %test_id, "worker crashed outside the test body");
    }

    fn abnormal_exit(&mut self, test_id: &TestId) {
        tracing::warn!(test = %test_id, "worker exited abnormally");
    }

    fn test_skipped(&mut self, test_id: &TestId) {
        tracing::debug!(test = %test_id, "test skipped");
    }

    fn run_started(&mut self, test_count: usize) {
        tracing::info!(test_count, "run started");
    }

    fn run_finished(&mut self, stats: &RunStats) {
        tracing::info!(
            passed = stats.counters.tests_passed,
            failed = stats.counters.tests_failed,
            crashed = stats.counters.tests_crashed,
            skipped = stats.counters.tests_skipped,
            "run finished"
        );
    }
}
