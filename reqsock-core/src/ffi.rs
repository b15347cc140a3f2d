//! C ABI for linking reqsock-core as a static library from C/C++ hosts that run their own I/O.
//! Messages cross the boundary as wire frames (see `wire`): 4-byte LE length + bincode frame list.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use crate::core::{Options, RequestCore, RequestError};
use crate::identity::PeerId;
use crate::protocol::PROTOCOL_VERSION;
use crate::state::{PeerLostPolicy, Verdict};
use crate::wire::{decode_frame, encode_frame};

/// Returned when the call is not allowed in the current request state.
pub const REQSOCK_ERR_STATE: c_int = -2;
/// Returned by send when no peer is connected.
pub const REQSOCK_ERR_NO_PEERS: c_int = -3;

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn reqsock_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create a new core instance. Non-zero flags enable relaxed mode, request correlation, and
/// the "keep waiting" policy for a lost peer. Returns opaque handle.
#[no_mangle]
pub extern "C" fn reqsock_core_create(relaxed: c_int, correlate: c_int, wait_on_peer_lost: c_int) -> *mut c_void {
    let options = Options {
        relaxed: relaxed != 0,
        correlate: correlate != 0,
        on_peer_lost: if wait_on_peer_lost != 0 {
            PeerLostPolicy::Wait
        } else {
            PeerLostPolicy::Fail
        },
    };
    let core = RequestCore::with_options(options);
    Box::into_raw(Box::new(core)) as *mut c_void
}

/// Destroy core instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn reqsock_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut RequestCore) };
}

fn read_peer_id(peer_id_16: *const u8) -> PeerId {
    let mut id = [0u8; 16];
    unsafe {
        id.copy_from_slice(slice::from_raw_parts(peer_id_16, 16));
    }
    PeerId::from_bytes(id)
}

/// Peer connected (16-byte host-chosen ID). Returns 0, or -1 on null arguments.
#[no_mangle]
pub extern "C" fn reqsock_core_peer_connected(h: *mut c_void, peer_id_16: *const u8) -> c_int {
    if h.is_null() || peer_id_16.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut RequestCore) };
    core.on_peer_connected(read_peer_id(peer_id_16));
    0
}

/// Peer disconnected. Returns 1 if this abandoned the outstanding request, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn reqsock_core_peer_disconnected(h: *mut c_void, peer_id_16: *const u8) -> c_int {
    if h.is_null() || peer_id_16.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut RequestCore) };
    match core.on_peer_disconnected(read_peer_id(peer_id_16)) {
        Some(_) => 1,
        None => 0,
    }
}

/// Send a request. `msg` is a wire frame holding the body frames. On success writes the selected
/// peer ID to `out_peer_16` and the envelope (as a wire frame) to `out_buf`; the host must enqueue
/// it on that peer's connection. Returns bytes written, -1 on bad input or short buffer,
/// `REQSOCK_ERR_STATE` or `REQSOCK_ERR_NO_PEERS`. Nothing changes unless the call succeeds.
#[no_mangle]
pub extern "C" fn reqsock_core_send(
    h: *mut c_void,
    msg: *const u8,
    msg_len: usize,
    out_peer_16: *mut u8,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || msg.is_null() || out_peer_16.is_null() || out_buf.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut RequestCore) };
    let input = unsafe { slice::from_raw_parts(msg, msg_len) };
    let frames = match decode_frame(input) {
        Ok((frames, _)) => frames,
        Err(_) => return -1,
    };
    let envelope = match core.prepare_send(frames) {
        Ok(e) => e,
        Err(RequestError::State(_)) => return REQSOCK_ERR_STATE,
        Err(_) => return -1,
    };
    let bytes = match encode_frame(&envelope) {
        Ok(b) => b,
        Err(_) => return -1,
    };
    if out_buf_len < bytes.len() {
        return -1;
    }
    let Some(peer) = core.select_peer() else {
        return REQSOCK_ERR_NO_PEERS;
    };
    if core.commit_send(peer).is_err() {
        return REQSOCK_ERR_STATE;
    }
    unsafe {
        out_peer_16.copy_from_nonoverlapping(peer.as_bytes().as_ptr(), 16);
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as c_int
}

/// Inbound message from a peer (`msg` is a wire frame holding the envelope). If it is the
/// awaited reply, writes the body frames as a wire frame to `out_buf` and returns the byte count.
/// Returns 0 when the message was discarded, -1 on bad input. `out_buf_len` must be at least
/// `msg_len`; the reply body is always shorter than the envelope it came in.
#[no_mangle]
pub extern "C" fn reqsock_core_on_message_received(
    h: *mut c_void,
    peer_id_16: *const u8,
    msg: *const u8,
    msg_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || peer_id_16.is_null() || msg.is_null() || out_buf.is_null() {
        return -1;
    }
    if out_buf_len < msg_len {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut RequestCore) };
    let input = unsafe { slice::from_raw_parts(msg, msg_len) };
    let envelope = match decode_frame(input) {
        Ok((frames, _)) => frames,
        Err(_) => return -1,
    };
    match core.on_message_received(read_peer_id(peer_id_16), envelope) {
        Verdict::Reply(body) => {
            let bytes = match encode_frame(&body) {
                Ok(b) => b,
                Err(_) => return -1,
            };
            unsafe {
                out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            }
            bytes.len() as c_int
        }
        Verdict::Discard(_) => 0,
    }
}
