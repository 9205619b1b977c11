// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-written bindings for the subset of the DRM and amdxdna kernel UAPI
//! consumed by this crate.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use std::os::raw::c_ulong;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::vaccel_os::iow;
use crate::vaccel_os::iowr;
use crate::vaccel_os::IoctlNr;

pub const DRM_IOCTL_BASE: c_ulong = 0x64;
pub const DRM_COMMAND_BASE: c_ulong = 0x40;

/* DRM core */

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_syncobj_destroy {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_syncobj_timeline_wait {
    pub handles: u64,
    pub points: u64,
    pub timeout_nsec: i64,
    pub count_handles: u32,
    pub flags: u32,
    pub first_signaled: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_set_client_name {
    pub name_len: u64,
    pub name: u64,
}

pub const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_ALL: u32 = 1 << 0;
pub const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT: u32 = 1 << 1;
pub const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_AVAILABLE: u32 = 1 << 2;

pub const DRM_IOCTL_GEM_CLOSE: IoctlNr = iow::<drm_gem_close>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_SYNCOBJ_DESTROY: IoctlNr = iowr::<drm_syncobj_destroy>(DRM_IOCTL_BASE, 0xc0);
pub const DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT: IoctlNr =
    iowr::<drm_syncobj_timeline_wait>(DRM_IOCTL_BASE, 0xca);
pub const DRM_IOCTL_SET_CLIENT_NAME: IoctlNr = iowr::<drm_set_client_name>(DRM_IOCTL_BASE, 0xd1);

/* amdxdna driver */

pub const DRM_AMDXDNA_CREATE_HWCTX: c_ulong = 0;
pub const DRM_AMDXDNA_DESTROY_HWCTX: c_ulong = 1;
pub const DRM_AMDXDNA_CONFIG_HWCTX: c_ulong = 2;
pub const DRM_AMDXDNA_CREATE_BO: c_ulong = 3;
pub const DRM_AMDXDNA_GET_BO_INFO: c_ulong = 4;
pub const DRM_AMDXDNA_SYNC_BO: c_ulong = 5;
pub const DRM_AMDXDNA_EXEC_CMD: c_ulong = 6;
pub const DRM_AMDXDNA_GET_INFO: c_ulong = 7;
pub const DRM_AMDXDNA_SET_STATE: c_ulong = 8;
pub const DRM_AMDXDNA_GET_ARRAY: c_ulong = 9;

pub const AMDXDNA_INVALID_ADDR: u64 = !0;
pub const AMDXDNA_INVALID_CTX_HANDLE: u32 = 0;
pub const AMDXDNA_INVALID_BO_HANDLE: u32 = 0;
pub const AMDXDNA_INVALID_FENCE_HANDLE: u32 = 0;

pub const AMDXDNA_BO_INVALID: u32 = 0;
pub const AMDXDNA_BO_SHARE: u32 = 1;
pub const AMDXDNA_BO_DEV_HEAP: u32 = 2;
pub const AMDXDNA_BO_DEV: u32 = 3;
pub const AMDXDNA_BO_CMD: u32 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct amdxdna_qos_info {
    pub gops: u32,
    pub fps: u32,
    pub dma_bandwidth: u32,
    pub latency: u32,
    pub frame_exec_time: u32,
    pub priority: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_create_hwctx {
    pub ext: u64,
    pub ext_flags: u64,
    pub qos_p: u64,
    pub umq_bo: u32,
    pub log_buf_bo: u32,
    pub max_opc: u32,
    pub num_tiles: u32,
    pub mem_size: u32,
    pub umq_doorbell: u32,
    pub handle: u32,
    pub syncobj_handle: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_destroy_hwctx {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_config_hwctx {
    pub handle: u32,
    pub param_type: u32,
    pub param_val: u64,
    pub param_val_size: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_create_bo {
    pub flags: u64,
    pub vaddr: u64,
    pub size: u64,
    pub type_: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_get_bo_info {
    pub ext: u64,
    pub ext_flags: u64,
    pub handle: u32,
    pub pad: u32,
    pub map_offset: u64,
    pub vaddr: u64,
    pub xdna_addr: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_exec_cmd {
    pub ext: u64,
    pub ext_flags: u64,
    pub hwctx: u32,
    pub type_: u32,
    pub cmd_handles: u64,
    pub args: u64,
    pub cmd_count: u32,
    pub arg_count: u32,
    pub seq: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_get_info {
    pub param: u32,
    pub buffer_size: u32,
    pub buffer: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct amdxdna_drm_get_array {
    pub param: u32,
    pub element_size: u32,
    pub num_element: u32,
    pub pad: u32,
    pub buffer: u64,
}

pub const DRM_IOCTL_AMDXDNA_CREATE_HWCTX: IoctlNr =
    iowr::<amdxdna_drm_create_hwctx>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_CREATE_HWCTX);
pub const DRM_IOCTL_AMDXDNA_DESTROY_HWCTX: IoctlNr =
    iowr::<amdxdna_drm_destroy_hwctx>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_DESTROY_HWCTX);
pub const DRM_IOCTL_AMDXDNA_CONFIG_HWCTX: IoctlNr =
    iowr::<amdxdna_drm_config_hwctx>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_CONFIG_HWCTX);
pub const DRM_IOCTL_AMDXDNA_CREATE_BO: IoctlNr =
    iowr::<amdxdna_drm_create_bo>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_CREATE_BO);
pub const DRM_IOCTL_AMDXDNA_GET_BO_INFO: IoctlNr =
    iowr::<amdxdna_drm_get_bo_info>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_GET_BO_INFO);
pub const DRM_IOCTL_AMDXDNA_EXEC_CMD: IoctlNr =
    iowr::<amdxdna_drm_exec_cmd>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_EXEC_CMD);
pub const DRM_IOCTL_AMDXDNA_GET_INFO: IoctlNr =
    iowr::<amdxdna_drm_get_info>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_GET_INFO);
pub const DRM_IOCTL_AMDXDNA_GET_ARRAY: IoctlNr =
    iowr::<amdxdna_drm_get_array>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDXDNA_GET_ARRAY);

/// VA table prepended to the scatter list handed to `CREATE_BO` for
/// guest-backed buffer objects.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromZeroes, FromBytes)]
pub struct amdxdna_va_tbl {
    pub udma_fd: i32,
    pub num_entries: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromZeroes, FromBytes)]
pub struct amdxdna_va_entry {
    pub vaddr: u64,
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drm_core_ioctl_encodings() {
        // Well-known values from the DRM UAPI headers.
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT, 0xc028_64ca);
        assert_eq!(DRM_IOCTL_SYNCOBJ_DESTROY, 0xc008_64c0);
    }

    #[test]
    fn amdxdna_ioctls_use_command_base() {
        let nr = DRM_IOCTL_AMDXDNA_CREATE_BO & 0xff;
        assert_eq!(nr, DRM_COMMAND_BASE + DRM_AMDXDNA_CREATE_BO);
    }
}
