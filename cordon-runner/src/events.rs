// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle events ferried from child workers to the parent.
//!
//! All children share one pipe. Each record is framed as a 4-byte
//! little-endian length followed by a JSON body, and is written with a single
//! `write(2)` call. Frames are capped below the POSIX pipe atomicity bound,
//! so concurrent writers never interleave inside a frame; payload strings are
//! truncated at emit time to keep that cap.

use crate::errors::EventPipeError;
use serde::{Deserialize, Serialize};
use std::os::fd::{BorrowedFd, OwnedFd};

/// Largest frame body we will put on the wire. PIPE_BUF is at least 4096 on
/// every supported platform; the 4-byte header must fit under it too.
pub(crate) const MAX_FRAME_LEN: usize = 4092;

/// Cap applied to each payload string before framing. Leaves enough headroom
/// under [`MAX_FRAME_LEN`] for JSON escaping of the worst-case string.
const MAX_STRING_LEN: usize = 512;

/// A single assertion outcome reported from a child.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssertRecord {
    /// The assertion message.
    pub message: String,
    /// Source file of the assertion site.
    pub file: String,
    /// Source line of the assertion site.
    pub line: u32,
    /// Whether the assertion held.
    pub passed: bool,
}

/// A lifecycle event emitted by a child worker.
///
/// Within one child the sequence is: `SetupStarted` exactly once, then
/// `TestStarted` at most once, then any number of `Assert`/`TheoryFailed`,
/// an optional `TestAborted`, `TestFinished` iff the body ran to completion,
/// and `CleanupDone` iff teardown ran to completion. The parent tolerates any
/// prefix of that sequence being cut off by an abnormal termination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChildEvent {
    /// The child is alive; emitted before any fixture runs.
    SetupStarted,
    /// Fixtures finished; the test body is about to run.
    TestStarted,
    /// One assertion outcome.
    Assert(AssertRecord),
    /// A theory instantiation failed.
    TheoryFailed {
        /// The formatted arguments of the failing instantiation.
        formatted_args: String,
    },
    /// A fatal failure; the body is unwinding to its cleanup fixtures.
    TestAborted {
        /// Why the test aborted.
        reason: String,
    },
    /// The body ran to completion.
    TestFinished {
        /// Wall-clock seconds the body took.
        elapsed_s: f64,
    },
    /// Teardown ran to completion.
    CleanupDone,
}

/// A framed record as it travels over the pipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Process id of the originating child; the parent resolves it to a
    /// worker slot.
    pub pid: u32,
    /// The event itself.
    pub event: ChildEvent,
}

/// Truncates `s` in place to the per-string frame budget, respecting char
/// boundaries.
pub(crate) fn truncate_for_frame(s: &mut String) {
    if s.len() > MAX_STRING_LEN {
        let mut cut = MAX_STRING_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

/// The process-wide event pipe. Created by the parent before the first fork;
/// every child inherits the write end, the read end stays with the parent.
#[derive(Debug)]
pub(crate) struct EventPipe {
    pub(crate) reader: OwnedFd,
    pub(crate) writer: OwnedFd,
}

impl EventPipe {
    pub(crate) fn new() -> Result<Self, EventPipeError> {
        let (reader, writer) =
            nix::unistd::pipe().map_err(|errno| EventPipeError::Create { error: errno.into() })?;
        Ok(Self { reader, writer })
    }
}

/// Writes one frame with a single `write(2)`.
pub(crate) fn write_frame(fd: BorrowedFd<'_>, event: &WireEvent) -> Result<(), EventPipeError> {
    let body = serde_json::to_vec(event).map_err(|error| EventPipeError::Encode { error })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(EventPipeError::Oversize { len: body.len() });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    let written = loop {
        match nix::unistd::write(fd, &frame) {
            Ok(n) => break n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(EventPipeError::Write { error: errno.into() }),
        }
    };
    if written != frame.len() {
        return Err(EventPipeError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    Ok(())
}

/// Reads one frame. Blocks until the frame is complete; callers poll for
/// readability first, and frames arrive whole thanks to the atomicity cap.
pub(crate) fn read_frame(fd: BorrowedFd<'_>) -> Result<WireEvent, EventPipeError> {
    let mut header = [0u8; 4];
    read_exact(fd, &mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(EventPipeError::MalformedFrame { len });
    }
    let mut body = vec![0u8; len];
    read_exact(fd, &mut body)?;
    serde_json::from_slice(&body).map_err(|error| EventPipeError::Decode { error })
}

fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(), EventPipeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => return Err(EventPipeError::Closed),
            Ok(n) => filled += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(EventPipeError::Read { error: errno.into() }),
        }
    }
    Ok(())
}
