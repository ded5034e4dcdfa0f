// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core runner logic for cordon.
//!
//! cordon executes each unit test in its own forked child process. The parent
//! stays single-threaded: a resumable producer forks up to `jobs` workers at a
//! time, and an event loop folds the lifecycle events the children send over a
//! shared pipe into per-test, per-suite, and global statistics.
//!
//! The main entry points are [`initialize`], [`run_all`], and [`finalize`];
//! finer-grained control is available through [`TestRunner`].

#[cfg(not(unix))]
compile_error!("cordon-runner drives fork(2)-isolated workers; only Unix platforms are supported");

pub mod config;
pub mod errors;
pub mod events;
pub mod reporter;
pub mod runner;
pub mod stats;
pub mod test_list;
mod time;

pub use config::TestRunnerOpts;
pub use runner::{
    RunOutcome, RunReport, RunStatus, TestRunner, abort_test, emit_assert, emit_theory_failure,
    finalize, initialize, run_all,
};
