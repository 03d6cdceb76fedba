#![allow(unused)]

use anyhow::{Result, anyhow};
use std::ffi::CStr;

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// It's limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // Copy the name bytes into our C buffer. The buffer is guaranteed to
    // be null-terminated because it was zero-initialized, and we only
    // wrote to (at most) the first `MAX_PTHREAD_NAME_LEN - 1` bytes.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for i in 0..len_to_copy {
        c_name_buf[i] = bytes[i] as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Gets the name of the current thread via `pthread_getname_np`, the
/// counterpart to `pthread_setname_np`.
#[cfg(target_os = "linux")]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("failed to convert thread name from CStr: {e}"))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    Ok(std::thread::current().name().unwrap_or("").to_string())
}
