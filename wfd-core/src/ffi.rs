//! C ABI for linking wfd-core as a static library from Android (NDK) or other C/C++ hosts.
//! The JNI layer forwards broadcast intents and listener callbacks as framed `Event`s,
//! menu actions as framed `UserCommand`s, and drains framed `Output`s after each call.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use tracing::warn;

use crate::core::{Output, Phase, SessionMachine};
use crate::event::{Event, UserCommand};
use crate::wire::{decode_frame, encode_frame, WIRE_VERSION};

/// Outputs held for the host before further input is refused. The host drains after each call.
const MAX_QUEUED_OUTPUTS: usize = 256;

struct FfiSession {
    machine: SessionMachine,
    outbox: VecDeque<Output>,
}

impl FfiSession {
    fn is_full(&self) -> bool {
        if self.outbox.len() >= MAX_QUEUED_OUTPUTS {
            warn!(queued = self.outbox.len(), "output queue full; input refused until drained");
            return true;
        }
        false
    }

    fn queue(&mut self, outputs: Vec<Output>) -> c_int {
        let n = outputs.len();
        self.outbox.extend(outputs);
        n as c_int
    }
}

/// Returns `WIRE_VERSION`. Hosts compare it with the version they were built against.
#[no_mangle]
pub extern "C" fn wfd_core_version() -> u8 {
    WIRE_VERSION
}

/// Create a new session. Returns opaque handle.
#[no_mangle]
pub extern "C" fn wfd_session_create() -> *mut c_void {
    let session = FfiSession {
        machine: SessionMachine::new(),
        outbox: VecDeque::new(),
    };
    Box::into_raw(Box::new(session)) as *mut c_void
}

/// Destroy session. No-op if h is null.
#[no_mangle]
pub extern "C" fn wfd_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut FfiSession) };
}

/// Begin the session (queues the channel initialize request). Returns outputs queued, or -1 if h
/// null or the output queue is full.
#[no_mangle]
pub extern "C" fn wfd_session_start(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let session = unsafe { &mut *(h as *mut FfiSession) };
    if session.is_full() {
        return -1;
    }
    let out = session.machine.start();
    session.queue(out)
}

/// Feed one framed `Event`. Returns outputs queued, or -1 on null pointer, bad frame, or a full
/// output queue (the event is not applied; drain and resend).
#[no_mangle]
pub extern "C" fn wfd_session_handle_event(h: *mut c_void, bytes: *const u8, len: usize) -> c_int {
    if h.is_null() || bytes.is_null() {
        return -1;
    }
    let session = unsafe { &mut *(h as *mut FfiSession) };
    if session.is_full() {
        return -1;
    }
    let frame = unsafe { slice::from_raw_parts(bytes, len) };
    let event: Event = match decode_frame(frame) {
        Ok((e, _)) => e,
        Err(e) => {
            warn!(error = %e, "bad event frame");
            return -1;
        }
    };
    let out = session.machine.handle_event(event);
    session.queue(out)
}

/// Feed one framed `UserCommand`. Returns outputs queued, or -1 on null pointer, bad frame, or a
/// full output queue.
#[no_mangle]
pub extern "C" fn wfd_session_handle_command(
    h: *mut c_void,
    bytes: *const u8,
    len: usize,
) -> c_int {
    if h.is_null() || bytes.is_null() {
        return -1;
    }
    let session = unsafe { &mut *(h as *mut FfiSession) };
    if session.is_full() {
        return -1;
    }
    let frame = unsafe { slice::from_raw_parts(bytes, len) };
    let command: UserCommand = match decode_frame(frame) {
        Ok((c, _)) => c,
        Err(e) => {
            warn!(error = %e, "bad command frame");
            return -1;
        }
    };
    let out = session.machine.handle_command(command);
    session.queue(out)
}

/// Pop the next queued `Output` as a frame into out_buf.
/// Returns bytes written, 0 if the queue is empty, -1 on error. If out_buf is too small
/// the output stays queued so the caller can retry with a larger buffer.
#[no_mangle]
pub extern "C" fn wfd_session_poll_output(
    h: *mut c_void,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let session = unsafe { &mut *(h as *mut FfiSession) };
    let Some(next) = session.outbox.front() else {
        return 0;
    };
    let frame = match encode_frame(next) {
        Ok(f) => f,
        Err(_) => return -1,
    };
    if frame.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(frame.as_ptr(), frame.len());
    }
    session.outbox.pop_front();
    frame.len() as c_int
}

/// Current phase: 0 Idle, 1 RadioOff, 2 RadioOn, 3 Discovering, 4 Connecting, 5 Connected,
/// 6 ChannelLost. Returns -1 if h null.
#[no_mangle]
pub extern "C" fn wfd_session_phase(h: *const c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let session = unsafe { &*(h as *const FfiSession) };
    match session.machine.phase() {
        Phase::Idle => 0,
        Phase::RadioOff => 1,
        Phase::RadioOn => 2,
        Phase::Discovering => 3,
        Phase::Connecting => 4,
        Phase::Connected => 5,
        Phase::ChannelLost => 6,
    }
}
