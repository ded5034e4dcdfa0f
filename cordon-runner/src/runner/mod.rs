// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]: a resumable producer
//! forks one worker per runnable test, a bounded pool keeps up to `jobs` of
//! them alive, and a single-threaded event loop folds the lifecycle events
//! they send over the shared pipe.

mod imp;
mod internal_events;
mod unix;
mod worker;

pub use imp::*;
pub use worker::{abort_test, emit_assert, emit_theory_failure};
