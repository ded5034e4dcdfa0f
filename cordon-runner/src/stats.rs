// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Statistics accumulated over a test run.
//!
//! Three nested accumulators: global, per-suite, per-test. All updates happen
//! on the parent's single event-loop thread, one event at a time, so no
//! locking is involved. Transitions are edge-triggered, which keeps every
//! additive counter equal across the three levels.

use crate::{
    events::{AssertRecord, ChildEvent},
    test_list::TestId,
};
use serde::Serialize;
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// Additive counters shared by the suite and run levels.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Counters {
    /// Tests whose body started.
    pub tests_run: usize,
    /// Tests that finished without failing.
    pub tests_passed: usize,
    /// Tests that failed for any reason (including crashes and timeouts).
    pub tests_failed: usize,
    /// Tests that crashed or terminated unexpectedly.
    pub tests_crashed: usize,
    /// Tests consumed without being run.
    pub tests_skipped: usize,
    /// Tests that exceeded their wall-clock budget.
    pub tests_timed_out: usize,
    /// Assertions that held.
    pub asserts_passed: usize,
    /// Assertions that failed.
    pub asserts_failed: usize,
}

impl Counters {
    fn accumulate(&mut self, other: &Counters) {
        self.tests_run += other.tests_run;
        self.tests_passed += other.tests_passed;
        self.tests_failed += other.tests_failed;
        self.tests_crashed += other.tests_crashed;
        self.tests_skipped += other.tests_skipped;
        self.tests_timed_out += other.tests_timed_out;
        self.asserts_passed += other.asserts_passed;
        self.asserts_failed += other.asserts_failed;
    }
}

/// Global statistics for a run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunStats {
    /// The additive counters.
    pub counters: Counters,
}

impl RunStats {
    /// Returns true if this run is considered a success: no test failed.
    ///
    /// Crashes and timeouts count as failures.
    pub fn is_success(&self) -> bool {
        self.counters.tests_failed == 0
    }
}

/// Per-suite statistics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SuiteStats {
    /// The additive counters, restricted to this suite's tests.
    pub counters: Counters,
}

/// Per-test statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TestStats {
    /// The body started.
    pub started: bool,
    /// The test finished without failing.
    pub passed: bool,
    /// The test failed for any reason.
    pub failed: bool,
    /// The test crashed or terminated unexpectedly.
    pub crashed: bool,
    /// The test was consumed without being run.
    pub skipped: bool,
    /// The test exceeded its wall-clock budget.
    pub timed_out: bool,
    /// Assertions that held.
    pub asserts_passed: usize,
    /// Assertions that failed.
    pub asserts_failed: usize,
    /// Wall-clock seconds the body took (the declared budget for timeouts).
    pub elapsed_s: f64,
    /// Exit code captured from the child, when it exited.
    pub exit_code: Option<i32>,
    /// Signal captured from the child, when it was signaled.
    pub signal: Option<i32>,
}

/// An event as seen by the statistics folder.
#[derive(Clone, Debug)]
pub(crate) enum StatEvent<'a> {
    /// A lifecycle event from (or synthesized on behalf of) a child.
    Child(&'a ChildEvent),
    /// The test crashed.
    Crashed,
    /// The test was skipped.
    Skipped,
}

/// The full statistics tree for one run.
#[derive(Clone, Debug, Default)]
pub struct StatsTree {
    /// Global counters.
    pub run: RunStats,
    /// Per-suite counters, keyed by suite name.
    pub suites: BTreeMap<SmolStr, SuiteStats>,
    /// Per-test statistics, keyed by identifier.
    pub tests: BTreeMap<TestId, TestStats>,
}

impl StatsTree {
    /// Folds one event into all three levels.
    pub(crate) fn push(&mut self, id: &TestId, event: StatEvent<'_>) {
        let run = &mut self.run.counters;
        let suite = &mut self.suites.entry(id.suite.clone()).or_default().counters;
        let test = self.tests.entry(id.clone()).or_default();

        match event {
            StatEvent::Child(ChildEvent::SetupStarted) => {}
            StatEvent::Child(ChildEvent::TestStarted) => {
                if !test.started {
                    test.started = true;
                    run.tests_run += 1;
                    suite.tests_run += 1;
                }
            }
            StatEvent::Child(ChildEvent::Assert(AssertRecord { passed, .. })) => {
                if *passed {
                    test.asserts_passed += 1;
                    run.asserts_passed += 1;
                    suite.asserts_passed += 1;
                } else {
                    test.asserts_failed += 1;
                    run.asserts_failed += 1;
                    suite.asserts_failed += 1;
                    mark_failed(run, suite, test);
                }
            }
            StatEvent::Child(ChildEvent::TheoryFailed { .. })
            | StatEvent::Child(ChildEvent::TestAborted { .. }) => {
                mark_failed(run, suite, test);
            }
            StatEvent::Child(ChildEvent::TestFinished { elapsed_s }) => {
                test.elapsed_s = *elapsed_s;
                if test.timed_out {
                    mark_failed(run, suite, test);
                } else if !test.failed && !test.passed {
                    test.passed = true;
                    run.tests_passed += 1;
                    suite.tests_passed += 1;
                }
            }
            StatEvent::Child(ChildEvent::CleanupDone) => {}
            StatEvent::Crashed => {
                if !test.crashed {
                    test.crashed = true;
                    run.tests_crashed += 1;
                    suite.tests_crashed += 1;
                }
                mark_failed(run, suite, test);
            }
            StatEvent::Skipped => {
                if !test.skipped {
                    test.skipped = true;
                    run.tests_skipped += 1;
                    suite.tests_skipped += 1;
                }
            }
        }
    }

    /// Marks a test as having exceeded its budget, ahead of the synthesized
    /// completion events.
    pub(crate) fn mark_timed_out(&mut self, id: &TestId) {
        let run = &mut self.run.counters;
        let suite = &mut self.suites.entry(id.suite.clone()).or_default().counters;
        let test = self.tests.entry(id.clone()).or_default();
        if !test.timed_out {
            test.timed_out = true;
            run.tests_timed_out += 1;
            suite.tests_timed_out += 1;
        }
    }

    /// Records the terminating signal of a signaled child.
    pub(crate) fn record_signal(&mut self, id: &TestId, signal: i32) {
        self.tests.entry(id.clone()).or_default().signal = Some(signal);
    }

    /// Records the exit code of an exited child.
    pub(crate) fn record_exit_code(&mut self, id: &TestId, exit_code: i32) {
        self.tests.entry(id.clone()).or_default().exit_code = Some(exit_code);
    }

    /// Per-test statistics for one test, if any event touched it.
    pub fn test(&self, id: &TestId) -> Option<&TestStats> {
        self.tests.get(id)
    }

    /// Per-suite statistics for one suite.
    pub fn suite(&self, name: &str) -> Option<&SuiteStats> {
        self.suites.get(name)
    }

    /// Checks that every additive counter agrees across the three levels.
    pub fn additivity_holds(&self) -> bool {
        let mut from_suites = Counters::default();
        for stats in self.suites.values() {
            from_suites.accumulate(&stats.counters);
        }

        let mut from_tests = Counters::default();
        for test in self.tests.values() {
            from_tests.accumulate(&Counters {
                tests_run: usize::from(test.started),
                tests_passed: usize::from(test.passed),
                tests_failed: usize::from(test.failed),
                tests_crashed: usize::from(test.crashed),
                tests_skipped: usize::from(test.skipped),
                tests_timed_out: usize::from(test.timed_out),
                asserts_passed: test.asserts_passed,
                asserts_failed: test.asserts_failed,
            });
        }

        from_suites == self.run.counters && from_tests == self.run.counters
    }
}

fn mark_failed(run: &mut Counters, suite: &mut Counters, test: &mut TestStats) {
    if !test.failed {
        test.failed = true;
        run.tests_failed += 1;
        suite.tests_failed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(suite: &str, name: &str) -> TestId {
        TestId::new(suite, name)
    }

    #[test]
    fn passing_lifecycle_counts_one_pass() {
        let mut tree = StatsTree::default();
        let t = id("s", "ok");
        tree.push(&t, StatEvent::Child(&ChildEvent::SetupStarted));
        tree.push(&t, StatEvent::Child(&ChildEvent::TestStarted));
        tree.push(&t, StatEvent::Child(&ChildEvent::TestFinished { elapsed_s: 0.1 }));
        tree.push(&t, StatEvent::Child(&ChildEvent::CleanupDone));

        assert_eq!(tree.run.counters.tests_run, 1);
        assert_eq!(tree.run.counters.tests_passed, 1);
        assert_eq!(tree.run.counters.tests_failed, 0);
        assert!(tree.run.is_success());
        assert!(tree.additivity_holds());
    }

    #[test]
    fn failed_assert_marks_failure_exactly_once() {
        let mut tree = StatsTree::default();
        let t = id("s", "bad");
        tree.push(&t, StatEvent::Child(&ChildEvent::TestStarted));
        let failing = ChildEvent::Assert(AssertRecord {
            message: "nope".to_owned(),
            file: "f.rs".to_owned(),
            line: 1,
            passed: false,
        });
        tree.push(&t, StatEvent::Child(&failing));
        tree.push(&t, StatEvent::Child(&failing));
        tree.push(
            &t,
            StatEvent::Child(&ChildEvent::TestAborted {
                reason: "fatal".to_owned(),
            }),
        );
        tree.push(&t, StatEvent::Child(&ChildEvent::TestFinished { elapsed_s: 0.0 }));

        assert_eq!(tree.run.counters.asserts_failed, 2);
        assert_eq!(tree.run.counters.tests_failed, 1, "failure counted once");
        assert_eq!(tree.run.counters.tests_passed, 0);
        assert!(tree.additivity_holds());
    }

    #[test]
    fn timeout_fails_instead_of_passing() {
        let mut tree = StatsTree::default();
        let t = id("s", "slow");
        tree.push(&t, StatEvent::Child(&ChildEvent::TestStarted));
        tree.mark_timed_out(&t);
        tree.push(&t, StatEvent::Child(&ChildEvent::TestFinished { elapsed_s: 0.5 }));
        tree.push(&t, StatEvent::Child(&ChildEvent::CleanupDone));

        let stats = tree.test(&t).expect("test touched");
        assert!(stats.timed_out);
        assert!(stats.failed);
        assert!(!stats.passed);
        assert_eq!(tree.run.counters.tests_timed_out, 1);
        assert_eq!(tree.run.counters.tests_failed, 1);
        assert!(tree.additivity_holds());
    }

    #[test]
    fn crash_counts_as_failure_too() {
        let mut tree = StatsTree::default();
        let t = id("s", "boom");
        tree.push(&t, StatEvent::Child(&ChildEvent::TestStarted));
        tree.push(&t, StatEvent::Crashed);

        assert_eq!(tree.run.counters.tests_crashed, 1);
        assert_eq!(tree.run.counters.tests_failed, 1);
        assert!(!tree.run.is_success());
        assert!(tree.additivity_holds());
    }

    #[test]
    fn additivity_across_suites() {
        let mut tree = StatsTree::default();
        for (suite, name, pass) in [("a", "x", true), ("a", "y", false), ("b", "z", true)] {
            let t = id(suite, name);
            tree.push(&t, StatEvent::Child(&ChildEvent::TestStarted));
            if !pass {
                tree.push(
                    &t,
                    StatEvent::Child(&ChildEvent::TestAborted {
                        reason: "fatal".to_owned(),
                    }),
                );
            }
            tree.push(&t, StatEvent::Child(&ChildEvent::TestFinished { elapsed_s: 0.0 }));
            tree.push(&t, StatEvent::Child(&ChildEvent::CleanupDone));
        }
        tree.push(&id("b", "skipped"), StatEvent::Skipped);

        assert_eq!(tree.run.counters.tests_run, 3);
        assert_eq!(tree.run.counters.tests_passed, 2);
        assert_eq!(tree.run.counters.tests_failed, 1);
        assert_eq!(tree.run.counters.tests_skipped, 1);
        assert_eq!(tree.suite("a").expect("suite a").counters.tests_failed, 1);
        assert_eq!(tree.suite("b").expect("suite b").counters.tests_passed, 1);
        assert!(tree.additivity_holds());
    }
}
