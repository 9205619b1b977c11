// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vaccel_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::io::Error as IoError;
use std::num::TryFromIntError;
use std::os::raw::c_void;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use remain::sorted;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::vaccel_os::RawDescriptor;

/// Represents a buffer. `base` contains the address of a buffer, while `len` contains the length
/// of the buffer.
#[derive(Copy, Clone, Debug)]
pub struct VaccelIovec {
    pub base: *mut c_void,
    pub len: usize,
}

/// Vaccel capsets.
pub const VACCEL_CAPSET_AMDXDNA: u32 = 0;

/// Vaccel context types advertised through the capset.
pub const VACCEL_CONTEXT_AMDXDNA: u32 = 0;

/// Capability set published to the guest driver.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct VaccelDrmCapset {
    pub wire_format_version: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patchlevel: u32,
    pub context_type: u32,
}

/// An error generated while using this crate.
#[sorted]
#[derive(Debug, thiserror::Error)]
pub enum VaccelError {
    /// The indicated key is already present in a table.
    #[error("object already exists")]
    AlreadyExists,
    /// The object is still referenced and cannot be torn down yet.
    #[error("object is still in use")]
    Busy,
    /// Invalid argument, unknown opcode or size mismatch.
    #[error("invalid argument")]
    Invalid,
    /// An input/output error occurred.
    #[error("an input/output error occurred: {0}")]
    IoError(IoError),
    /// The kernel driver rejected an ioctl; carries the negative errno.
    #[error("kernel driver returned errno {0}")]
    KernelError(i32),
    /// No device is registered for the given cookie.
    #[error("device not found")]
    NoDevice,
    /// An allocation failed.
    #[error("allocation failed")]
    NoMemory,
    /// The indicated context, resource, BO or hardware context is missing.
    #[error("object not found")]
    NotFound,
    /// The operation or capset is unsupported.
    #[error("operation unsupported")]
    NotSupported,
}

impl VaccelError {
    /// Collapses the error into the negative errno value reported on the
    /// C-callable surface.
    pub fn errno(&self) -> i32 {
        match self {
            VaccelError::AlreadyExists => -libc::EEXIST,
            VaccelError::Busy => -libc::EBUSY,
            VaccelError::Invalid => -libc::EINVAL,
            VaccelError::IoError(_) => -libc::EIO,
            VaccelError::KernelError(errno) => *errno,
            VaccelError::NoDevice => -libc::ENODEV,
            VaccelError::NoMemory => -libc::ENOMEM,
            VaccelError::NotFound => -libc::ENOENT,
            VaccelError::NotSupported => -libc::ENOTSUP,
        }
    }
}

impl From<IoError> for VaccelError {
    fn from(e: IoError) -> VaccelError {
        VaccelError::IoError(e)
    }
}

impl From<TryFromIntError> for VaccelError {
    fn from(_: TryFromIntError) -> VaccelError {
        VaccelError::Invalid
    }
}

/// The result of an operation in this crate.
pub type VaccelResult<T> = std::result::Result<T, VaccelError>;

/// Returns a `KernelError` carrying the calling thread's current errno.
pub fn last_kernel_error() -> VaccelError {
    VaccelError::KernelError(-IoError::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

/// A sync point in flight on one hardware-context timeline.
///
/// The fence is retired by the owning hardware context's polling thread once
/// the kernel signals `sync_point` (or the wait gives up), right before the
/// completion callback fires.
pub struct VaccelFence {
    pub id: u64,
    pub sync_point: u64,
    pub syncobj_handle: u32,
    pub ring_idx: u32,
    pub timeout_nsec: i64,
    retired: AtomicBool,
}

impl VaccelFence {
    pub fn new(
        id: u64,
        sync_point: u64,
        syncobj_handle: u32,
        ring_idx: u32,
        timeout_nsec: i64,
    ) -> VaccelFence {
        VaccelFence {
            id,
            sync_point,
            syncobj_handle,
            ring_idx,
            timeout_nsec,
            retired: AtomicBool::new(false),
        }
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Callbacks the VMM provides when creating a device.
///
/// `get_device_fd` hands the renderer a fresh DRM file descriptor it may own;
/// `write_context_fence` notifies the VMM that a fence has retired. Both must
/// be callable from any renderer thread.
#[derive(Clone)]
pub struct VaccelCallbacks {
    get_device_fd: Arc<dyn Fn(u64) -> RawDescriptor + Send + Sync>,
    write_context_fence: Arc<dyn Fn(u64, u32, u32, u64) + Send + Sync>,
}

impl VaccelCallbacks {
    pub fn new<D, W>(get_device_fd: D, write_context_fence: W) -> VaccelCallbacks
    where
        D: Fn(u64) -> RawDescriptor + Send + Sync + 'static,
        W: Fn(u64, u32, u32, u64) + Send + Sync + 'static,
    {
        VaccelCallbacks {
            get_device_fd: Arc::new(get_device_fd),
            write_context_fence: Arc::new(write_context_fence),
        }
    }

    pub fn get_device_fd(&self, cookie: u64) -> RawDescriptor {
        (self.get_device_fd)(cookie)
    }

    pub fn write_context_fence(&self, cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        (self.write_context_fence)(cookie, ctx_id, ring_idx, fence_id)
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VaccelError::Invalid.errno(), -libc::EINVAL);
        assert_eq!(VaccelError::AlreadyExists.errno(), -libc::EEXIST);
        assert_eq!(VaccelError::NoDevice.errno(), -libc::ENODEV);
        assert_eq!(VaccelError::KernelError(-libc::ENOTTY).errno(), -libc::ENOTTY);
    }

    #[test]
    fn capset_layout() {
        assert_eq!(size_of::<VaccelDrmCapset>(), 20);
    }

    #[test]
    fn fence_retirement_flag() {
        let fence = VaccelFence::new(7, 1, 2, 3, 0);
        assert!(!fence.is_retired());
        fence.retire();
        assert!(fence.is_retired());
    }
}
