// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel buffer-object wrapper for the amdxdna DRM device.

use std::io;
use std::mem::size_of;
use std::sync::Arc;

use log::debug;
use log::warn;
use zerocopy::AsBytes;

use crate::amdxdna::amdxdna_bindings::*;
use crate::amdxdna::amdxdna_protocol::AmdxdnaCcmdCreateBoReq;
use crate::vaccel_core::VaccelResource;
use crate::vaccel_os::ioctl_with_mut_ref;
use crate::vaccel_os::ioctl_with_ref;
use crate::vaccel_os::Descriptor;
use crate::vaccel_os::MemoryMapping;
use crate::vaccel_os::RawDescriptor;
use crate::vaccel_utils::last_kernel_error;
use crate::vaccel_utils::VaccelResult;

/// One kernel BO on a context's DRM fd, optionally backed by the guest memory
/// windows of a resource and mapped into the host address space.
pub struct VxdnaBo {
    bo_handle: u32,
    size: u64,
    xdna_addr: u64,
    mapping: Option<MemoryMapping>,
    backing: Option<Arc<VaccelResource>>,
    // Borrowed from the owning context, which drops its BO table before the
    // fd closes.
    ctx_fd: RawDescriptor,
}

impl VxdnaBo {
    /// Creates a BO backed by the guest memory windows of `res` and maps it
    /// into the host address space, honoring the request's map alignment.
    pub fn from_resource(
        res: Arc<VaccelResource>,
        ctx_fd: RawDescriptor,
        req: &AmdxdnaCcmdCreateBoReq,
    ) -> VaccelResult<VxdnaBo> {
        let iovecs = res.iovecs();
        let tbl = amdxdna_va_tbl {
            udma_fd: -1,
            num_entries: iovecs.len() as u32,
        };
        let mut va_table =
            Vec::with_capacity(size_of::<amdxdna_va_tbl>() + iovecs.len() * size_of::<amdxdna_va_entry>());
        va_table.extend_from_slice(tbl.as_bytes());
        let mut map_size: usize = 0;
        for iov in iovecs {
            let entry = amdxdna_va_entry {
                vaddr: iov.base as u64,
                len: iov.len as u64,
            };
            va_table.extend_from_slice(entry.as_bytes());
            map_size += iov.len;
        }

        let mut create = amdxdna_drm_create_bo {
            flags: req.flags,
            vaddr: va_table.as_ptr() as u64,
            size: req.size,
            type_: req.bo_type,
            ..Default::default()
        };
        // SAFETY: `create` points at the live VA table above and the fd is a
        // DRM fd owned by the calling context.
        let ret = unsafe {
            ioctl_with_mut_ref(&Descriptor(ctx_fd), DRM_IOCTL_AMDXDNA_CREATE_BO, &mut create)
        };
        if ret < 0 {
            return Err(last_kernel_error());
        }

        // From here on the handle is owned; Drop closes it on any error path.
        let mut bo = VxdnaBo {
            bo_handle: create.handle,
            size: req.size,
            xdna_addr: AMDXDNA_INVALID_ADDR,
            mapping: None,
            backing: Some(res),
            ctx_fd,
        };
        let info = bo.query_info()?;
        bo.xdna_addr = info.xdna_addr;
        bo.mapping = Some(if req.map_align != 0 {
            MemoryMapping::from_descriptor_aligned(
                &Descriptor(ctx_fd),
                map_size,
                info.map_offset,
                req.map_align,
            )?
        } else {
            MemoryMapping::from_descriptor(&Descriptor(ctx_fd), map_size, info.map_offset)?
        });
        Ok(bo)
    }

    /// Creates a device-memory BO; no VA table and no host mapping.
    pub fn new_device(ctx_fd: RawDescriptor, req: &AmdxdnaCcmdCreateBoReq) -> VaccelResult<VxdnaBo> {
        let mut create = amdxdna_drm_create_bo {
            flags: req.flags,
            size: req.size,
            type_: req.bo_type,
            ..Default::default()
        };
        // SAFETY: no pointers are passed for a device BO.
        let ret = unsafe {
            ioctl_with_mut_ref(&Descriptor(ctx_fd), DRM_IOCTL_AMDXDNA_CREATE_BO, &mut create)
        };
        if ret < 0 {
            return Err(last_kernel_error());
        }
        let mut bo = VxdnaBo {
            bo_handle: create.handle,
            size: req.size,
            xdna_addr: AMDXDNA_INVALID_ADDR,
            mapping: None,
            backing: None,
            ctx_fd,
        };
        bo.xdna_addr = bo.query_info()?.xdna_addr;
        Ok(bo)
    }

    fn query_info(&self) -> VaccelResult<amdxdna_drm_get_bo_info> {
        let mut info = amdxdna_drm_get_bo_info {
            handle: self.bo_handle,
            ..Default::default()
        };
        // SAFETY: `info` is a plain output struct on the stack.
        let ret = unsafe {
            ioctl_with_mut_ref(&Descriptor(self.ctx_fd), DRM_IOCTL_AMDXDNA_GET_BO_INFO, &mut info)
        };
        if ret < 0 {
            return Err(last_kernel_error());
        }
        Ok(info)
    }

    pub fn handle(&self) -> u32 {
        self.bo_handle
    }

    /// The address the guest should use for this BO: the kernel-assigned XDNA
    /// address when one exists, otherwise the host mapping address.
    pub fn addr(&self) -> u64 {
        if self.xdna_addr != AMDXDNA_INVALID_ADDR {
            return self.xdna_addr;
        }
        self.mapping
            .as_ref()
            .map(|m| m.as_ptr() as u64)
            .unwrap_or(0)
    }

    /// Id of the resource whose windows back this BO, if any.
    pub fn backing_res_id(&self) -> Option<u32> {
        self.backing.as_ref().map(|res| res.res_id())
    }
}

impl Drop for VxdnaBo {
    fn drop(&mut self) {
        debug!("releasing bo {} ({} bytes)", self.bo_handle, self.size);
        // The mapping goes first; the kernel object must outlive it.
        self.mapping.take();
        if self.bo_handle != AMDXDNA_INVALID_BO_HANDLE {
            let close = drm_gem_close {
                handle: self.bo_handle,
                pad: 0,
            };
            // SAFETY: the owning context keeps the fd open until its BO table
            // is gone.
            let ret = unsafe { ioctl_with_ref(&Descriptor(self.ctx_fd), DRM_IOCTL_GEM_CLOSE, &close) };
            if ret < 0 {
                warn!(
                    "failed to close bo {}: {}",
                    self.bo_handle,
                    io::Error::last_os_error()
                );
            }
        }
    }
}
