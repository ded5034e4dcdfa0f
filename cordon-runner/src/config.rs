// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner options and environment policy.

use crate::reporter::ReportSink;
use debug_ignore::DebugIgnore;
use std::num::NonZeroUsize;

/// Test runner options.
///
/// The option bag handed to [`run_all`](crate::run_all) or
/// [`TestRunner::new`](crate::TestRunner::new).
#[derive(Debug, Default)]
pub struct TestRunnerOpts {
    /// Number of tests to run simultaneously. Zero means the detected
    /// processor count.
    jobs: usize,
    /// Let workers leave through the regular exit path instead of `_exit`,
    /// so process teardown runs under analyzers. `None` until set.
    no_early_exit: Option<bool>,
    /// Report overall success regardless of test outcomes.
    always_succeed: bool,
    /// Tests whose identifier does not match are disabled.
    pattern: Option<String>,
    /// Report sinks receiving every lifecycle event.
    output_providers: DebugIgnore<Vec<Box<dyn ReportSink>>>,
}

impl TestRunnerOpts {
    /// Sets the number of simultaneous workers. Zero means the detected
    /// processor count.
    pub fn set_jobs(&mut self, jobs: usize) -> &mut Self {
        self.jobs = jobs;
        self
    }

    /// Sets whether workers exit through the regular exit path.
    pub fn set_no_early_exit(&mut self, no_early_exit: bool) -> &mut Self {
        self.no_early_exit = Some(no_early_exit);
        self
    }

    /// Sets whether the run reports success regardless of outcomes.
    pub fn set_always_succeed(&mut self, always_succeed: bool) -> &mut Self {
        self.always_succeed = always_succeed;
        self
    }

    /// Sets the test name filter pattern.
    pub fn set_pattern(&mut self, pattern: impl Into<String>) -> &mut Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Adds a report sink.
    pub fn add_output_provider(&mut self, sink: Box<dyn ReportSink>) -> &mut Self {
        self.output_providers.push(sink);
        self
    }

    /// The configured filter pattern, if any.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// Whether the run reports success regardless of outcomes.
    pub fn always_succeed(&self) -> bool {
        self.always_succeed
    }

    pub(crate) fn no_early_exit(&self) -> bool {
        self.no_early_exit.unwrap_or(false)
    }

    pub(crate) fn output_providers_mut(&mut self) -> &mut [Box<dyn ReportSink>] {
        &mut self.output_providers
    }

    /// The effective worker pool capacity.
    pub fn resolved_jobs(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }

    /// Rewrites the options for a run under a fork-hostile analyzer.
    ///
    /// Forces one worker at a time and the regular exit path. Returns
    /// advisory messages for settings the caller had pinned to conflicting
    /// values; an empty vec when not under an analyzer.
    pub(crate) fn apply_analyzer_policy(&mut self, under_analyzer: bool) -> Vec<String> {
        if !under_analyzer {
            return Vec::new();
        }

        let mut advisories = vec![
            "an analyzer was detected: running one worker at a time with regular process exits"
                .to_owned(),
        ];
        if self.no_early_exit == Some(false) {
            advisories.push(
                "no_early_exit was explicitly disabled under an analyzer; reports will not be accurate"
                    .to_owned(),
            );
        }
        if self.jobs > 1 {
            advisories.push(
                "the job count was explicitly set under an analyzer; reports might appear confusing"
                    .to_owned(),
            );
        }
        self.jobs = 1;
        self.no_early_exit = Some(true);
        advisories
    }
}
