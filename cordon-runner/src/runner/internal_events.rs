// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These mirror the wire events in [`crate::events`] but carry the parent's
//! bookkeeping: the per-worker lifecycle flags and the classification of a
//! terminated child.

use crate::test_list::{Suite, TestCase};

/// How a child process left the world, as reported by `wait(2)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ExitKind {
    /// Exited with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

/// Parent-side execution context for one worker slot.
///
/// The four flags encode how far through its lifecycle the child got, as
/// witnessed by the events that arrived before it terminated.
#[derive(Debug)]
pub(crate) struct ExecutionContext<'list> {
    pub(crate) test: &'list TestCase,
    pub(crate) suite: &'list Suite,
    /// `TestStarted` arrived.
    pub(crate) test_started: bool,
    /// `TestFinished` arrived.
    pub(crate) normal_finish: bool,
    /// `CleanupDone` arrived.
    pub(crate) cleaned_up: bool,
    /// `TestAborted` arrived.
    pub(crate) aborted: bool,
}

impl<'list> ExecutionContext<'list> {
    pub(crate) fn new(test: &'list TestCase, suite: &'list Suite) -> Self {
        Self {
            test,
            suite,
            test_started: false,
            normal_finish: false,
            cleaned_up: false,
            aborted: false,
        }
    }

    /// The wall-clock budget that applies to this test.
    pub(crate) fn effective_timeout(&self) -> Option<f64> {
        effective_timeout(self.test, self.suite)
    }
}

/// The wall-clock budget that applies to a test: its own, else the suite
/// default. Zero budgets mean none.
pub(crate) fn effective_timeout(test: &TestCase, suite: &Suite) -> Option<f64> {
    test.params
        .timeout_s
        .filter(|t| *t > 0.0)
        .or(suite.params.timeout_s.filter(|t| *t > 0.0))
}

/// Log category attached to a termination outcome.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum TerminationLog {
    /// Nothing noteworthy: the child finished its lifecycle on its own.
    #[default]
    None,
    /// The child overran its budget.
    TimedOut,
    /// The child crashed inside the test body.
    Crashed,
    /// The child died outside the test body.
    OtherCrash,
    /// The child exited at the wrong point in its lifecycle.
    AbnormalExit,
}

/// Recovery actions the scheduler takes after a worker terminates.
///
/// Produced by [`resolve_termination`]; pure data so the classification can
/// be tested without forking anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TerminationPlan {
    /// Mark the test timed out before folding the synthesized events.
    pub(crate) timed_out: bool,
    /// Record the terminating signal in the test's statistics.
    pub(crate) record_signal: Option<i32>,
    /// Record the exit code in the test's statistics.
    pub(crate) record_exit_code: Option<i32>,
    /// Fold a crash into statistics and sinks.
    pub(crate) crash: bool,
    /// Synthesize a `TestFinished` with this elapsed time.
    pub(crate) synth_finish: Option<f64>,
    /// Synthesize a `CleanupDone`.
    pub(crate) synth_cleanup: bool,
    /// What to tell the log sink.
    pub(crate) log: TerminationLog,
}

/// Classifies a terminated worker.
///
/// `timeout_signal` is the signal reserved for the child-side budget timer;
/// nothing else may raise it in a child.
pub(crate) fn resolve_termination(
    ctx: &ExecutionContext<'_>,
    status: ExitKind,
    timeout_signal: i32,
) -> TerminationPlan {
    let mut plan = TerminationPlan::default();
    match status {
        ExitKind::Signaled(signal) if signal == timeout_signal => {
            // Budget overrun. Completion is synthesized with the declared
            // budget as the elapsed time; not a crash.
            plan.timed_out = true;
            plan.synth_finish = Some(ctx.effective_timeout().unwrap_or(0.0));
            plan.synth_cleanup = true;
            plan.log = TerminationLog::TimedOut;
        }
        ExitKind::Signaled(signal) => {
            if ctx.normal_finish || !ctx.test_started {
                // Killed outside the body: either during teardown or before
                // the body ever ran.
                plan.log = TerminationLog::OtherCrash;
                if !ctx.test_started {
                    plan.crash = true;
                }
            } else {
                plan.record_signal = Some(signal);
                if ctx.test.params.expected_signal == Some(signal) {
                    plan.synth_finish = Some(0.0);
                    plan.synth_cleanup = true;
                } else {
                    plan.crash = true;
                    plan.log = TerminationLog::Crashed;
                }
            }
        }
        ExitKind::Exited(code) => {
            if ctx.aborted {
                // Fatal abort already reported; fill in whatever part of the
                // lifecycle the child skipped on its way out.
                if !ctx.normal_finish {
                    plan.synth_finish = Some(0.0);
                }
                if !ctx.cleaned_up {
                    plan.synth_cleanup = true;
                }
            } else if (ctx.normal_finish && !ctx.cleaned_up) || !ctx.test_started {
                // Exited during teardown, or during setup. The former is
                // reported without re-crashing a finished test.
                plan.log = TerminationLog::AbnormalExit;
                if !ctx.test_started {
                    plan.crash = true;
                }
            } else {
                plan.record_exit_code = Some(code);
                if !ctx.normal_finish {
                    // The body called an exit wrapper instead of returning.
                    if ctx.test.params.expected_exit == Some(code) {
                        plan.synth_finish = Some(0.0);
                        plan.synth_cleanup = true;
                    } else {
                        plan.crash = true;
                        plan.log = TerminationLog::AbnormalExit;
                    }
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_list::{Suite, SuiteParams, TestCase, TestParams};
    use test_case::test_case;

    const TIMEOUT_SIGNAL: i32 = 27;
    const SEGV: i32 = 11;

    fn body() {}

    fn fixtures(params: TestParams, suite_timeout: Option<f64>) -> (TestCase, Suite) {
        let test = TestCase::new("s", "t", body).with_params(params);
        let suite = Suite::new("s").with_params(SuiteParams {
            timeout_s: suite_timeout,
            ..SuiteParams::default()
        });
        (test, suite)
    }

    fn ctx_with_flags<'a>(
        test: &'a TestCase,
        suite: &'a Suite,
        started: bool,
        finished: bool,
        cleaned: bool,
        aborted: bool,
    ) -> ExecutionContext<'a> {
        let mut ctx = ExecutionContext::new(test, suite);
        ctx.test_started = started;
        ctx.normal_finish = finished;
        ctx.cleaned_up = cleaned;
        ctx.aborted = aborted;
        ctx
    }

    #[test]
    fn timeout_signal_means_timeout_not_crash() {
        let (test, suite) = fixtures(
            TestParams {
                timeout_s: Some(0.5),
                ..TestParams::default()
            },
            None,
        );
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(TIMEOUT_SIGNAL), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                timed_out: true,
                synth_finish: Some(0.5),
                synth_cleanup: true,
                log: TerminationLog::TimedOut,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn timeout_budget_falls_back_to_the_suite() {
        let (test, suite) = fixtures(TestParams::default(), Some(2.0));
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(TIMEOUT_SIGNAL), TIMEOUT_SIGNAL);
        assert_eq!(plan.synth_finish, Some(2.0));
    }

    #[test]
    fn expected_signal_is_a_success() {
        let (test, suite) = fixtures(
            TestParams {
                expected_signal: Some(SEGV),
                ..TestParams::default()
            },
            None,
        );
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                record_signal: Some(SEGV),
                synth_finish: Some(0.0),
                synth_cleanup: true,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn unexpected_signal_is_a_crash() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                record_signal: Some(SEGV),
                crash: true,
                log: TerminationLog::Crashed,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn signal_never_satisfies_an_exit_code_expectation() {
        let (test, suite) = fixtures(
            TestParams {
                expected_exit: Some(SEGV),
                ..TestParams::default()
            },
            None,
        );
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL);
        assert!(plan.crash, "a signaled child is the signal branch, full stop");
    }

    #[test]
    fn signal_after_normal_finish_is_another_kind_of_crash() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, true, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                log: TerminationLog::OtherCrash,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn signal_before_the_body_counts_against_the_test() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, false, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                crash: true,
                log: TerminationLog::OtherCrash,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn abort_followed_by_clean_exit_fills_the_missing_lifecycle() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, false, false, true);
        let plan = resolve_termination(&ctx, ExitKind::Exited(0), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                synth_finish: Some(0.0),
                synth_cleanup: true,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn abort_with_completed_cleanup_synthesizes_nothing_extra() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, false, true, true);
        let plan = resolve_termination(&ctx, ExitKind::Exited(0), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                synth_finish: Some(0.0),
                synth_cleanup: false,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn expected_exit_code_is_a_success() {
        let (test, suite) = fixtures(
            TestParams {
                expected_exit: Some(5),
                ..TestParams::default()
            },
            None,
        );
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(5), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                record_exit_code: Some(5),
                synth_finish: Some(0.0),
                synth_cleanup: true,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn unexpected_exit_code_is_a_crash() {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(7), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                record_exit_code: Some(7),
                crash: true,
                log: TerminationLog::AbnormalExit,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn mismatched_exit_code_expectation_is_still_a_crash() {
        let (test, suite) = fixtures(
            TestParams {
                expected_exit: Some(5),
                ..TestParams::default()
            },
            None,
        );
        let ctx = ctx_with_flags(&test, &suite, true, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(7), TIMEOUT_SIGNAL);
        assert!(plan.crash);
    }

    #[test]
    fn exit_during_teardown_reports_without_recrashing() {
        use pretty_assertions::assert_eq;
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, true, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(3), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                log: TerminationLog::AbnormalExit,
                ..TerminationPlan::default()
            }
        );
    }

    #[test]
    fn exit_before_the_body_is_a_crash() {
        use pretty_assertions::assert_eq;
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, false, false, false, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(0), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                crash: true,
                log: TerminationLog::AbnormalExit,
                ..TerminationPlan::default()
            }
        );
    }

    #[test_case(false, false, false => true ; "death before the body counts against the test")]
    #[test_case(true, false, false => true ; "death inside the body is a crash")]
    #[test_case(true, true, false => false ; "death during teardown does not recrash")]
    #[test_case(true, true, true => false ; "death after the full lifecycle does not recrash")]
    fn unexpected_signal_crash_flag(started: bool, finished: bool, cleaned: bool) -> bool {
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, started, finished, cleaned, false);
        resolve_termination(&ctx, ExitKind::Signaled(SEGV), TIMEOUT_SIGNAL).crash
    }

    #[test]
    fn fully_completed_lifecycle_needs_no_recovery() {
        use pretty_assertions::assert_eq;
        let (test, suite) = fixtures(TestParams::default(), None);
        let ctx = ctx_with_flags(&test, &suite, true, true, true, false);
        let plan = resolve_termination(&ctx, ExitKind::Exited(0), TIMEOUT_SIGNAL);
        assert_eq!(
            plan,
            TerminationPlan {
                record_exit_code: Some(0),
                ..TerminationPlan::default()
            }
        );
    }
}
