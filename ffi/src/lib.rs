// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C-bindings for the vaccel_gfx crate.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::os::raw::c_int;
use std::os::raw::c_void;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::slice::from_raw_parts;
use std::slice::from_raw_parts_mut;
use std::sync::Once;

use libc::EINVAL;
use libc::ENODEV;
use libc::ENOTSUP;
use libc::ESRCH;
use log::error;
use log::LevelFilter;
use vaccel_gfx::registry;
use vaccel_gfx::VaccelCallbacks;
use vaccel_gfx::VaccelIovec;
use vaccel_gfx::VaccelResult;
use vaccel_gfx::VACCEL_CAPSET_AMDXDNA;

const NO_ERROR: c_int = 0;

fn return_result<T>(result: VaccelResult<T>) -> c_int {
    match result {
        Ok(_) => NO_ERROR,
        Err(e) => {
            error!("received an error {}", e);
            e.errno()
        }
    }
}

macro_rules! return_on_error {
    ($result:expr) => {
        match $result {
            Ok(t) => t,
            Err(e) => {
                error!("received an error {}", e);
                return e.errno();
            }
        }
    };
}

static LOG_INIT: Once = Once::new();

/// Installs the logging backend once, honoring `XVDNA_LOG_LEVEL`
/// (`ERROR|INFO|DEBUG` or `0|1|2`).
fn init_logging() {
    LOG_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        match std::env::var("XVDNA_LOG_LEVEL").ok().as_deref() {
            Some("ERROR") | Some("0") => builder.filter_level(LevelFilter::Error),
            Some("DEBUG") | Some("2") => builder.filter_level(LevelFilter::Debug),
            Some("INFO") | Some("1") | None => builder.filter_level(LevelFilter::Info),
            Some(other) => builder.parse_filters(other),
        };
        let _ = builder.try_init();
    });
}

/// Callback table the VMM hands to `vaccel_create`. Both entries are
/// required.
#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct vaccel_callbacks {
    pub get_device_fd: Option<unsafe extern "C" fn(cookie: *mut c_void) -> c_int>,
    pub write_context_fence:
        Option<unsafe extern "C" fn(cookie: *mut c_void, ctx_id: u32, ring_idx: u32, fence_id: u64)>,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct vaccel_iovec {
    pub iov_base: *mut c_void,
    pub iov_len: usize,
}

fn wrap_callbacks(cbs: &vaccel_callbacks) -> Option<VaccelCallbacks> {
    let get_device_fd = cbs.get_device_fd?;
    let write_context_fence = cbs.write_context_fence?;
    Some(VaccelCallbacks::new(
        // SAFETY: the VMM guarantees its callbacks stay valid for the device's
        // lifetime and tolerate calls from any renderer thread.
        move |cookie| unsafe { get_device_fd(cookie as *mut c_void) },
        move |cookie, ctx_id, ring_idx, fence_id| unsafe {
            write_context_fence(cookie as *mut c_void, ctx_id, ring_idx, fence_id)
        },
    ))
}

/// # Safety
/// - `callbacks` must point to a valid callback table with both entries set.
#[no_mangle]
pub unsafe extern "C" fn vaccel_create(
    cookie: *mut c_void,
    capset_id: u32,
    callbacks: *const vaccel_callbacks,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        init_logging();
        if callbacks.is_null() {
            return -EINVAL;
        }
        let callbacks = match wrap_callbacks(&*callbacks) {
            Some(callbacks) => callbacks,
            None => {
                error!("both callbacks are required");
                return -EINVAL;
            }
        };
        return_result(registry().create(cookie as u64, capset_id, callbacks))
    }))
    .unwrap_or(-ESRCH)
}

#[no_mangle]
pub extern "C" fn vaccel_destroy(cookie: *mut c_void) {
    catch_unwind(AssertUnwindSafe(|| {
        registry().destroy(cookie as u64);
    }))
    .unwrap_or(())
}

/// # Safety
/// - `name`, when non-null, must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn vaccel_context_create(
    cookie: *mut c_void,
    ctx_id: u32,
    name: *const c_char,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        let mut ctx_name = None;
        if !name.is_null() {
            ctx_name = CStr::from_ptr(name).to_str().ok();
        }
        let device = return_on_error!(registry().lookup(cookie as u64));
        return_result(device.create_ctx(ctx_id, ctx_name))
    }))
    .unwrap_or(-ESRCH)
}

#[no_mangle]
pub extern "C" fn vaccel_context_destroy(cookie: *mut c_void, ctx_id: u32) {
    catch_unwind(AssertUnwindSafe(|| {
        if let Ok(device) = registry().lookup(cookie as u64) {
            if let Err(e) = device.destroy_ctx(ctx_id) {
                error!("failed to destroy context {}: {}", ctx_id, e);
            }
        }
    }))
    .unwrap_or(())
}

/// # Safety
/// - `iovecs`, when non-null, must point to an array of `num_iovs` entries.
/// - Each entry must describe guest memory that stays mapped until the
///   resource (and any BO created from it) is destroyed.
#[no_mangle]
pub unsafe extern "C" fn vaccel_resource_create_blob(
    cookie: *mut c_void,
    res_id: u32,
    size: u64,
    blob_flags: u32,
    iovecs: *const vaccel_iovec,
    num_iovs: u32,
    ctx_id: u32,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        let mut vecs = Vec::new();
        if !iovecs.is_null() && num_iovs > 0 {
            vecs = from_raw_parts(iovecs, num_iovs as usize)
                .iter()
                .map(|iov| VaccelIovec {
                    base: iov.iov_base,
                    len: iov.iov_len,
                })
                .collect();
        }
        let device = return_on_error!(registry().lookup(cookie as u64));
        return_result(device.create_resource(res_id, size, blob_flags, vecs, ctx_id))
    }))
    .unwrap_or(-ESRCH)
}

#[no_mangle]
pub extern "C" fn vaccel_resource_destroy(cookie: *mut c_void, res_id: u32) {
    catch_unwind(AssertUnwindSafe(|| {
        if let Ok(device) = registry().lookup(cookie as u64) {
            if let Err(e) = device.destroy_resource(res_id) {
                error!("failed to destroy resource {}: {}", res_id, e);
            }
        }
    }))
    .unwrap_or(())
}

/// # Safety
/// - `fd` must point to writable memory for one `int`.
///
/// On success the caller owns the returned descriptor and must close it.
#[no_mangle]
pub unsafe extern "C" fn vaccel_resource_export_fd(
    cookie: *mut c_void,
    res_id: u32,
    fd: *mut c_int,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        if fd.is_null() {
            return -EINVAL;
        }
        let device = return_on_error!(registry().lookup(cookie as u64));
        let exported = return_on_error!(device.export_resource_fd(res_id));
        *fd = exported;
        NO_ERROR
    }))
    .unwrap_or(-ESRCH)
}

/// # Safety
/// - `buffer` must point to `size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn vaccel_submit_ccmd(
    cookie: *mut c_void,
    ctx_id: u32,
    buffer: *const c_void,
    size: usize,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        if buffer.is_null() || size == 0 {
            return -EINVAL;
        }
        let commands = from_raw_parts(buffer as *const u8, size);
        let device = return_on_error!(registry().lookup(cookie as u64));
        return_result(device.process_ccmd(ctx_id, commands))
    }))
    .unwrap_or(-ESRCH)
}

#[no_mangle]
pub extern "C" fn vaccel_submit_fence(
    cookie: *mut c_void,
    ctx_id: u32,
    fence_id: u64,
    ring_idx: u32,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        let device = return_on_error!(registry().lookup(cookie as u64));
        return_result(device.submit_fence(ctx_id, 0, ring_idx, fence_id))
    }))
    .unwrap_or(-ESRCH)
}

/// Returns a sync fd for the fence, or -1. The caller owns the returned
/// descriptor.
#[no_mangle]
pub extern "C" fn vaccel_get_fence_fd(cookie: *mut c_void, fence_id: u64) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        match registry().lookup(cookie as u64) {
            Ok(device) => device.get_fence_fd(fence_id),
            Err(_) => -1,
        }
    }))
    .unwrap_or(-1)
}

/// # Safety
/// - `max_version` and `max_size`, when non-null, must point to writable
///   memory for one `u32` each.
#[no_mangle]
pub unsafe extern "C" fn vaccel_get_capset_info(
    cookie: *mut c_void,
    capset_id: u32,
    max_version: *mut u32,
    max_size: *mut u32,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        let device = match registry().lookup(cookie as u64) {
            Ok(device) => device,
            Err(_) => return -ENODEV,
        };
        if capset_id != VACCEL_CAPSET_AMDXDNA {
            error!("unsupported capset id {}", capset_id);
            return -ENOTSUP;
        }
        let (version, size) = device.get_capset_info();
        if !max_version.is_null() {
            *max_version = version;
        }
        if !max_size.is_null() {
            *max_size = size;
        }
        NO_ERROR
    }))
    .unwrap_or(-ESRCH)
}

/// # Safety
/// - `capset_buf` must point to `capset_size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn vaccel_fill_capset(
    cookie: *mut c_void,
    capset_id: u32,
    capset_version: u32,
    capset_size: u32,
    capset_buf: *mut c_void,
) -> c_int {
    catch_unwind(AssertUnwindSafe(|| {
        let _ = capset_version;
        let device = match registry().lookup(cookie as u64) {
            Ok(device) => device,
            Err(_) => return -ENODEV,
        };
        if capset_id != VACCEL_CAPSET_AMDXDNA {
            error!("unsupported capset id {}", capset_id);
            return -ENOTSUP;
        }
        if capset_buf.is_null() {
            return -EINVAL;
        }
        let buf = from_raw_parts_mut(capset_buf as *mut u8, capset_size as usize);
        return_result(device.fill_capset(buf))
    }))
    .unwrap_or(-ESRCH)
}

#[cfg(test)]
mod tests {
    use std::ptr::null_mut;

    use super::*;

    unsafe extern "C" fn no_fd(_cookie: *mut c_void) -> c_int {
        -1
    }

    unsafe extern "C" fn ignore_fence(
        _cookie: *mut c_void,
        _ctx_id: u32,
        _ring_idx: u32,
        _fence_id: u64,
    ) {
    }

    fn callbacks() -> vaccel_callbacks {
        vaccel_callbacks {
            get_device_fd: Some(no_fd),
            write_context_fence: Some(ignore_fence),
        }
    }

    #[test]
    fn create_roundtrip_over_ffi() {
        let cookie = 0x7001 as *mut c_void;
        let cbs = callbacks();
        // SAFETY: `cbs` is a valid callback table.
        unsafe {
            assert_eq!(vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &cbs), 0);
            assert_eq!(
                vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &cbs),
                -libc::EEXIST
            );
        }
        vaccel_destroy(cookie);
        // SAFETY: `cbs` is a valid callback table.
        unsafe {
            assert_eq!(vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &cbs), 0);
        }
        vaccel_destroy(cookie);
    }

    #[test]
    fn create_validates_arguments() {
        let cookie = 0x7002 as *mut c_void;
        // SAFETY: null is explicitly handled.
        unsafe {
            assert_eq!(
                vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, std::ptr::null()),
                -EINVAL
            );
        }
        let partial = vaccel_callbacks {
            get_device_fd: Some(no_fd),
            write_context_fence: None,
        };
        // SAFETY: `partial` is a valid callback table.
        unsafe {
            assert_eq!(
                vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &partial),
                -EINVAL
            );
        }
    }

    #[test]
    fn capset_queries_over_ffi() {
        let cookie = 0x7003 as *mut c_void;
        let cbs = callbacks();
        // SAFETY: all pointers handed over are valid or null.
        unsafe {
            assert_eq!(vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &cbs), 0);
            let mut version = 0u32;
            let mut size = 0u32;
            assert_eq!(
                vaccel_get_capset_info(cookie, VACCEL_CAPSET_AMDXDNA, &mut version, &mut size),
                0
            );
            assert_eq!(version, 1);
            let mut buf = vec![0u8; size as usize];
            assert_eq!(
                vaccel_fill_capset(
                    cookie,
                    VACCEL_CAPSET_AMDXDNA,
                    version,
                    size - 1,
                    buf.as_mut_ptr() as *mut c_void,
                ),
                -EINVAL
            );
            assert_eq!(
                vaccel_fill_capset(
                    cookie,
                    VACCEL_CAPSET_AMDXDNA,
                    version,
                    size,
                    buf.as_mut_ptr() as *mut c_void,
                ),
                0
            );
            assert_eq!(vaccel_get_capset_info(cookie, 7, null_mut(), null_mut()), -ENOTSUP);
        }
        vaccel_destroy(cookie);
    }

    #[test]
    fn fence_fd_is_unspecified() {
        let cookie = 0x7004 as *mut c_void;
        let cbs = callbacks();
        // SAFETY: `cbs` is a valid callback table.
        unsafe {
            assert_eq!(vaccel_create(cookie, VACCEL_CAPSET_AMDXDNA, &cbs), 0);
        }
        assert_eq!(vaccel_get_fence_fd(cookie, 9), -1);
        vaccel_destroy(cookie);
    }
}
