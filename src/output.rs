//! Default text output of a stack walk.
//!
//! A walk without an explicit [`FrameInspector`] formats one line per frame
//! and hands it to the [`TraceOutput`] registered with [`set_default_output`].
//! Lines are formatted into a fixed buffer, so no allocation happens even
//! when walking from inside a fault.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt::{self, Write};

use spin::Mutex;

use crate::{
    config::{DEFAULT_MAX_FRAMES, LINE_BUFFER_SIZE},
    stacktrace::{FrameInspector, Inspection, StackFrame},
};

/// Sink for formatted trace lines. Returning [`Inspection::Stop`] ends the walk.
pub type TraceOutput = fn(&str) -> Inspection;

#[derive(Clone, Copy)]
struct Registration {
    output: Option<TraceOutput>,
    max_frames: usize,
}

static DEFAULT_OUTPUT: Mutex<Registration> =
    Mutex::new(Registration { output: None, max_frames: DEFAULT_MAX_FRAMES });

/// Registers the sink and frame limit used by walks without an explicit
/// inspector, including the walk done by the exception hook. Returns the
/// previously registered sink.
///
/// Pass `None` to silence the default walk.
pub fn set_default_output(output: Option<TraceOutput>, max_frames: usize) -> Option<TraceOutput> {
    let mut registration = DEFAULT_OUTPUT.lock();
    let previous = registration.output;
    *registration = Registration { output, max_frames };
    previous
}

/// A [`TraceOutput`] that forwards every line to the `log` facade at error level.
pub fn log_output(line: &str) -> Inspection {
    log::error!("{line}");
    Inspection::Continue
}

/// Fixed capacity line buffer. Text that does not fit is dropped.
pub struct LineBuffer {
    bytes: [u8; LINE_BUFFER_SIZE],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self { bytes: [0; LINE_BUFFER_SIZE], len: 0 }
    }

    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_BUFFER_SIZE - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }

        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if take < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}

/// Formats `frame` as `#<index>: PC=<pc> SP=<sp> LR=<lr> FP=<fp> callerSP=<entry sp>`.
pub fn format_frame(line: &mut LineBuffer, index: usize, frame: &StackFrame, caller_sp_high: u32) {
    line.clear();
    // A truncated line is still worth emitting.
    let _ = write!(
        line,
        "#{index:02}: PC={:08x} SP={:08x} LR={:08x} FP={:08x} callerSP={:08x}",
        frame.pc,
        frame.sp,
        frame.lr,
        frame.fp,
        caller_sp_high.wrapping_add(4)
    );
}

/// Inspector that formats every frame and hands it to a [`TraceOutput`].
pub struct DefaultOutput {
    output: Option<TraceOutput>,
    line: LineBuffer,
}

impl DefaultOutput {
    pub const fn new(output: Option<TraceOutput>) -> Self {
        Self { output, line: LineBuffer::new() }
    }

    /// The registered sink and frame limit.
    ///
    /// Never blocks: if the registration is being updated, e.g. by the code
    /// that faulted, the walk is silent and uses [`DEFAULT_MAX_FRAMES`].
    pub fn registered() -> (Self, usize) {
        match DEFAULT_OUTPUT.try_lock() {
            Some(registration) => (Self::new(registration.output), registration.max_frames),
            None => (Self::new(None), DEFAULT_MAX_FRAMES),
        }
    }
}

impl FrameInspector for DefaultOutput {
    fn inspect(&mut self, index: usize, frame: &StackFrame, caller_sp_high: u32) -> Inspection {
        let Some(output) = self.output else {
            return Inspection::Continue;
        };

        format_frame(&mut self.line, index, frame, caller_sp_high);
        output(self.line.as_str())
    }
}
