//! C ABI for linking ndrt-link as a static library from the Unreal Engine host.
//! Handles are opaque `Session` pointers; every call tolerates a null handle.

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::slice;

use ndrt_core::VehicleStatus;
use tracing::{debug, warn};

use crate::error::ConnectError;
use crate::session::{PollOutcome, Session, SessionConfig};

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Library version as a NUL-terminated string with static lifetime.
#[no_mangle]
pub extern "C" fn ndrt_link_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Create a session with the default configuration. Sockets open lazily.
#[no_mangle]
pub extern "C" fn ndrt_session_create() -> *mut c_void {
    let session = Session::new(SessionConfig::default());
    Box::into_raw(Box::new(session)) as *mut c_void
}

/// Create a session from a TOML document. Returns null if `toml` is null,
/// not UTF-8 or not a valid configuration.
#[no_mangle]
pub extern "C" fn ndrt_session_create_from_toml(toml: *const c_char) -> *mut c_void {
    if toml.is_null() {
        return std::ptr::null_mut();
    }
    let text = match unsafe { CStr::from_ptr(toml) }.to_str() {
        Ok(t) => t,
        Err(_) => return std::ptr::null_mut(),
    };
    let config = match SessionConfig::from_toml(text) {
        Ok(c) => c,
        Err(e) => {
            warn!("rejected session config: {}", e);
            return std::ptr::null_mut();
        }
    };
    Box::into_raw(Box::new(Session::new(config))) as *mut c_void
}

/// Close all channels and free the session. No-op if h is null.
#[no_mangle]
pub extern "C" fn ndrt_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let mut session = unsafe { Box::from_raw(h as *mut Session) };
    session.shutdown();
}

/// Close all channels but keep the handle; later polls return -2.
#[no_mangle]
pub extern "C" fn ndrt_session_shutdown(h: *mut c_void) {
    if let Some(session) = session_mut(h) {
        session.shutdown();
    }
}

/// Poll the eye-tracker feed. Returns the number of applied samples, -1 if
/// h is null, or -2 if the feed is closed or could not connect.
#[no_mangle]
pub extern "C" fn ndrt_session_poll_gaze(h: *mut c_void) -> c_int {
    let Some(session) = session_mut(h) else {
        return -1;
    };
    poll_result(session.poll_gaze_feed())
}

/// Poll the vehicle-status feed. Returns the number of applied updates, -1
/// if h is null, or -2 if the feed is closed or could not connect.
#[no_mangle]
pub extern "C" fn ndrt_session_poll_status(h: *mut c_void) -> c_int {
    let Some(session) = session_mut(h) else {
        return -1;
    };
    poll_result(session.poll_status_feed())
}

fn poll_result(polled: Result<PollOutcome, ConnectError>) -> c_int {
    match polled {
        Ok(outcome) => count_to_c_int(outcome.applied),
        Err(e) => {
            debug!("poll skipped: {}", e);
            -2
        }
    }
}

/// Saturates at `c_int::MAX` so a count never reads as an error code.
fn count_to_c_int(n: usize) -> c_int {
    c_int::try_from(n).unwrap_or(c_int::MAX)
}

/// Feed one surface payload received by the host. Returns 1 if applied,
/// 0 if stale or empty, -1 on null arguments or a decode error.
#[no_mangle]
pub extern "C" fn ndrt_session_ingest_gaze(h: *mut c_void, bytes: *const u8, len: usize) -> c_int {
    let Some(session) = session_mut(h) else {
        return -1;
    };
    if bytes.is_null() {
        return -1;
    }
    let payload = unsafe { slice::from_raw_parts(bytes, len) };
    match session.ingest_gaze_payload(payload) {
        Ok(applied) => applied as c_int,
        Err(_) => -1,
    }
}

/// Feed one vehicle-status payload received by the host. Returns 1 if applied, -1 on error.
#[no_mangle]
pub extern "C" fn ndrt_session_ingest_status(h: *mut c_void, bytes: *const u8, len: usize) -> c_int {
    let Some(session) = session_mut(h) else {
        return -1;
    };
    if bytes.is_null() {
        return -1;
    }
    let payload = unsafe { slice::from_raw_parts(bytes, len) };
    match session.ingest_status_payload(payload) {
        Ok(applied) => applied as c_int,
        Err(_) => -1,
    }
}

/// 1 if the debounced gaze is on the HUD, 0 if not, -1 if h is null.
#[no_mangle]
pub extern "C" fn ndrt_session_is_looking_at_target(h: *const c_void) -> c_int {
    match session_ref(h) {
        Some(session) => session.is_looking_at_target() as c_int,
        None => -1,
    }
}

/// Seconds the gaze has stayed on target; 0 if off target or h is null.
#[no_mangle]
pub extern "C" fn ndrt_session_gaze_dwell_seconds(h: *const c_void) -> f64 {
    session_ref(h).map_or(0.0, |s| s.gaze_dwell_seconds())
}

/// Write the normalized gaze position (-1, -1 before any sample). Returns 0, or -1 on null arguments.
#[no_mangle]
pub extern "C" fn ndrt_session_gaze_position(h: *const c_void, out_x: *mut f64, out_y: *mut f64) -> c_int {
    let Some(session) = session_ref(h) else {
        return -1;
    };
    if out_x.is_null() || out_y.is_null() {
        return -1;
    }
    let [x, y] = session.current_gaze_position();
    unsafe {
        *out_x = x;
        *out_y = y;
    }
    0
}

/// Current status discriminant (0..=7); `Unknown` (7) if h is null.
#[no_mangle]
pub extern "C" fn ndrt_session_current_status(h: *const c_void) -> u8 {
    session_ref(h).map_or(VehicleStatus::Unknown, |s| s.current_vehicle_status()) as u8
}

/// Previous status discriminant (0..=7); `Unknown` (7) if h is null.
#[no_mangle]
pub extern "C" fn ndrt_session_previous_status(h: *const c_void) -> u8 {
    session_ref(h).map_or(VehicleStatus::Unknown, |s| s.previous_vehicle_status()) as u8
}

/// Set the status locally and publish it. Returns 0, or -1 if h is null or status is out of range.
#[no_mangle]
pub extern "C" fn ndrt_session_set_status(h: *mut c_void, status: u8) -> c_int {
    let Some(session) = session_mut(h) else {
        return -1;
    };
    match VehicleStatus::try_from(status) {
        Ok(status) => {
            session.set_vehicle_status(status);
            0
        }
        Err(e) => {
            warn!("{}", e);
            -1
        }
    }
}

fn session_ref<'a>(h: *const c_void) -> Option<&'a Session> {
    if h.is_null() {
        return None;
    }
    Some(unsafe { &*(h as *const Session) })
}

fn session_mut<'a>(h: *mut c_void) -> Option<&'a mut Session> {
    if h.is_null() {
        return None;
    }
    Some(unsafe { &mut *(h as *mut Session) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn offline_session() -> *mut c_void {
        let config = CString::new("publish_status = false\ndebounce_threshold = 1\n").unwrap();
        let h = ndrt_session_create_from_toml(config.as_ptr());
        assert!(!h.is_null());
        h
    }

    #[test]
    fn version_is_nul_terminated() {
        let v = unsafe { CStr::from_ptr(ndrt_link_version()) };
        assert_eq!(v.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn null_handle_is_safe() {
        let null = std::ptr::null_mut();
        let (mut x, mut y) = (0.0, 0.0);
        assert_eq!(ndrt_session_poll_gaze(null), -1);
        assert_eq!(ndrt_session_poll_status(null), -1);
        assert_eq!(ndrt_session_is_looking_at_target(null), -1);
        assert_eq!(ndrt_session_gaze_dwell_seconds(null), 0.0);
        assert_eq!(ndrt_session_gaze_position(null, &mut x, &mut y), -1);
        assert_eq!(ndrt_session_current_status(null), 7);
        assert_eq!(ndrt_session_previous_status(null), 7);
        assert_eq!(ndrt_session_set_status(null, 1), -1);
        assert_eq!(ndrt_session_ingest_gaze(null, [0u8].as_ptr(), 1), -1);
        ndrt_session_shutdown(null);
        ndrt_session_destroy(null);
        assert!(ndrt_session_create_from_toml(std::ptr::null()).is_null());
    }

    #[test]
    fn invalid_toml_yields_null() {
        let config = CString::new("no_such_key = 1").unwrap();
        assert!(ndrt_session_create_from_toml(config.as_ptr()).is_null());
    }

    #[test]
    fn status_roundtrip() {
        let h = offline_session();
        assert_eq!(ndrt_session_current_status(h), VehicleStatus::Unknown as u8);
        assert_eq!(ndrt_session_set_status(h, VehicleStatus::AutoPilot as u8), 0);
        assert_eq!(ndrt_session_set_status(h, VehicleStatus::TakeOver as u8), 0);
        assert_eq!(ndrt_session_set_status(h, 8), -1);
        assert_eq!(ndrt_session_current_status(h), 3);
        assert_eq!(ndrt_session_previous_status(h), 1);
        ndrt_session_destroy(h);
    }

    #[test]
    fn gaze_position_defaults_then_updates() {
        let h = offline_session();
        let (mut x, mut y) = (0.0, 0.0);
        assert_eq!(ndrt_session_gaze_position(h, &mut x, &mut y), 0);
        assert_eq!((x, y), (-1.0, -1.0));

        let payload = rmp_serde::to_vec(&serde_json::json!({
            "gaze_on_surfaces": [{"norm_pos": [0.2, 0.8], "on_surf": true, "timestamp": 1.5}],
            "timestamp": 1.5,
        }))
        .unwrap();
        assert_eq!(ndrt_session_ingest_gaze(h, payload.as_ptr(), payload.len()), 1);
        assert_eq!(ndrt_session_ingest_gaze(h, payload.as_ptr(), payload.len()), 0);
        assert_eq!(ndrt_session_is_looking_at_target(h), 1);
        assert_eq!(ndrt_session_gaze_position(h, &mut x, &mut y), 0);
        assert_eq!((x, y), (0.2, 0.8));
        assert_eq!(ndrt_session_ingest_status(h, b"{}".as_ptr(), 2), -1);
        ndrt_session_destroy(h);
    }

    #[test]
    fn counts_saturate_instead_of_wrapping() {
        assert_eq!(count_to_c_int(0), 0);
        assert_eq!(count_to_c_int(64), 64);
        assert_eq!(count_to_c_int(c_int::MAX as usize + 1), c_int::MAX);
        assert_eq!(count_to_c_int(usize::MAX), c_int::MAX);
        let many = PollOutcome {
            received: usize::MAX,
            applied: usize::MAX,
            rejected: 0,
        };
        assert_eq!(poll_result(Ok(many)), c_int::MAX);
    }

    #[test]
    fn poll_reports_connect_failure_and_shutdown() {
        let config = CString::new(
            "publish_status = false\n\
             [gaze]\n\
             subscribe = { endpoint = \"tcp://127.0.0.1:1\" }\n\
             topic = \"surfaces.HUD\"\n\
             connect_timeout_ms = 100\n",
        )
        .unwrap();
        let h = ndrt_session_create_from_toml(config.as_ptr());
        assert!(!h.is_null());
        assert_eq!(ndrt_session_poll_gaze(h), -2);
        ndrt_session_shutdown(h);
        assert_eq!(ndrt_session_poll_gaze(h), -2);
        assert_eq!(ndrt_session_poll_status(h), -2);
        ndrt_session_destroy(h);
    }
}
