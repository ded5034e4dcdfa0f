// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by cordon.

use thiserror::Error;

/// An error that occurred while compiling the user-supplied test name pattern.
#[derive(Debug, Error)]
#[error("failed to compile test name pattern `{pattern}`")]
pub struct PatternParseError {
    pattern: String,
    #[source]
    error: regex::Error,
}

impl PatternParseError {
    pub(crate) fn new(pattern: impl Into<String>, error: regex::Error) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }

    /// The pattern that failed to compile.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// An error on the event pipe between the workers and the runner.
///
/// All of these are internal-fatal: the runner cannot continue without a
/// working event pipe.
#[derive(Debug, Error)]
pub enum EventPipeError {
    /// The pipe could not be created at run start.
    #[error("failed to create the event pipe")]
    Create {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The read end reported end-of-file while a frame was expected.
    #[error("event pipe closed while a frame was expected")]
    Closed,

    /// A frame could not be written in one atomic write.
    #[error("short write on the event pipe ({written} of {expected} bytes)")]
    ShortWrite {
        /// Bytes actually written.
        written: usize,
        /// Bytes that made up the frame.
        expected: usize,
    },

    /// A frame would exceed the pipe atomicity bound.
    #[error("event frame of {len} bytes exceeds the atomic write bound")]
    Oversize {
        /// The encoded frame length.
        len: usize,
    },

    /// A frame header carried an impossible length.
    #[error("malformed frame length {len} on the event pipe")]
    MalformedFrame {
        /// The length read from the frame header.
        len: usize,
    },

    /// A record could not be encoded for the wire.
    #[error("failed to encode an event frame")]
    Encode {
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A frame body failed to decode.
    #[error("failed to decode an event frame")]
    Decode {
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// Polling the read end failed.
    #[error("failed to poll the event pipe")]
    Poll {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Reading from the pipe failed.
    #[error("failed to read from the event pipe")]
    Read {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Writing to the pipe failed.
    #[error("failed to write to the event pipe")]
    Write {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while forking a worker process.
#[derive(Debug, Error)]
#[error("failed to fork a worker for test `{test_id}`")]
pub struct SpawnError {
    test_id: String,
    #[source]
    error: std::io::Error,
}

impl SpawnError {
    pub(crate) fn new(test_id: impl Into<String>, error: std::io::Error) -> Self {
        Self {
            test_id: test_id.into(),
            error,
        }
    }
}

/// An error that occurred while executing a test run.
#[derive(Debug, Error)]
pub enum TestRunnerExecuteError {
    /// The configured test name pattern did not compile.
    #[error(transparent)]
    Pattern(#[from] PatternParseError),

    /// The event pipe failed.
    #[error(transparent)]
    EventPipe(#[from] EventPipeError),

    /// A worker could not be forked.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Waiting on a worker process failed.
    #[error("failed to wait on a worker process")]
    Wait {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}
