//! Bindings to libsqlite3 and the few safe helpers the driver needs.
//!
//! The raw declarations come from `libsqlite3-sys`, which also builds and
//! links the bundled amalgamation.

#![allow(non_camel_case_types)]

pub use libsqlite3_sys::*;

use std::ffi::{CStr, c_int, c_void};
use std::time::Instant;

/// VM instructions between deadline checks.
pub const PROGRESS_INTERVAL: c_int = 1000;

/// SQLite library version string.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static string
    unsafe {
        CStr::from_ptr(sqlite3_libversion())
            .to_str()
            .unwrap_or("unknown")
    }
}

pub fn version_number() -> i32 {
    // SAFETY: no preconditions
    unsafe { sqlite3_libversion_number() }
}

/// English text for a result code.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string
    unsafe {
        CStr::from_ptr(sqlite3_errstr(code))
            .to_str()
            .unwrap_or("unknown error")
    }
}

/// The most recent error message of `db`.
///
/// # Safety
/// `db` must be an open connection handle.
pub unsafe fn last_error_message(db: *mut sqlite3) -> String {
    // SAFETY: the caller guarantees `db` is open; errmsg never returns null
    // for an open handle
    unsafe {
        CStr::from_ptr(sqlite3_errmsg(db))
            .to_string_lossy()
            .into_owned()
    }
}

/// Progress handler interrupting a statement once its deadline passes.
///
/// # Safety
/// `deadline` must point at an `Instant` that outlives the registration.
pub unsafe extern "C" fn deadline_handler(deadline: *mut c_void) -> c_int {
    // SAFETY: the caller registered a live `Instant`
    let deadline = unsafe { &*deadline.cast::<Instant>() };
    c_int::from(Instant::now() >= *deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_a_version_3_library() {
        assert!(version().starts_with('3'));
        assert!(version_number() >= 3_000_000);
    }

    #[test]
    fn result_codes_have_text() {
        assert_eq!(error_string(SQLITE_OK), "not an error");
        assert_eq!(error_string(SQLITE_CONSTRAINT), "constraint failed");
        assert_eq!(error_string(SQLITE_BUSY), "database is locked");
    }

    #[test]
    fn deadline_handler_fires_after_the_deadline() {
        let mut past = Instant::now();
        let mut future = Instant::now() + std::time::Duration::from_secs(60);
        // SAFETY: both instants outlive the calls
        unsafe {
            assert_eq!(deadline_handler((&raw mut past).cast()), 1);
            assert_eq!(deadline_handler((&raw mut future).cast()), 0);
        }
    }
}
