// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! amdxdna: the renderer backend that translates guest compute commands into
//! ioctls against the host's amdxdna DRM device.

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::amdxdna::amdxdna_bindings::*;
use crate::amdxdna::amdxdna_bo::VxdnaBo;
use crate::amdxdna::amdxdna_hwctx::VxdnaHwctx;
use crate::amdxdna::amdxdna_protocol::*;
use crate::sync::Mutex;
use crate::vaccel_core::VaccelMap;
use crate::vaccel_core::VaccelResource;
use crate::vaccel_os::dup_descriptor_cloexec;
use crate::vaccel_os::ioctl_with_mut_ref;
use crate::vaccel_os::AsRawDescriptor;
use crate::vaccel_os::Descriptor;
use crate::vaccel_os::RawDescriptor;
use crate::vaccel_utils::last_kernel_error;
use crate::vaccel_utils::VaccelCallbacks;
use crate::vaccel_utils::VaccelDrmCapset;
use crate::vaccel_utils::VaccelError;
use crate::vaccel_utils::VaccelFence;
use crate::vaccel_utils::VaccelIovec;
use crate::vaccel_utils::VaccelResult;
use crate::vaccel_utils::VACCEL_CONTEXT_AMDXDNA;

/// Alignment of successive commands inside one submitted buffer.
const VXDNA_CCMD_ALIGN: u32 = 8;

const VXDNA_CAPSET: VaccelDrmCapset = VaccelDrmCapset {
    wire_format_version: 1,
    version_major: 1,
    version_minor: 0,
    version_patchlevel: 0,
    context_type: VACCEL_CONTEXT_AMDXDNA,
};

struct CcmdInfo {
    name: &'static str,
    min_size: usize,
}

/// Dispatch table indexed by `hdr.cmd - 1`.
const CCMD_TABLE: [CcmdInfo; 11] = [
    CcmdInfo {
        name: "nop",
        min_size: size_of::<VdrmCcmdReq>(),
    },
    CcmdInfo {
        name: "init",
        min_size: size_of::<AmdxdnaCcmdInitReq>(),
    },
    CcmdInfo {
        name: "create_bo",
        min_size: size_of::<AmdxdnaCcmdCreateBoReq>(),
    },
    CcmdInfo {
        name: "destroy_bo",
        min_size: size_of::<AmdxdnaCcmdDestroyBoReq>(),
    },
    CcmdInfo {
        name: "create_ctx",
        min_size: size_of::<AmdxdnaCcmdCreateCtxReq>(),
    },
    CcmdInfo {
        name: "destroy_ctx",
        min_size: size_of::<AmdxdnaCcmdDestroyCtxReq>(),
    },
    CcmdInfo {
        name: "config_ctx",
        min_size: size_of::<AmdxdnaCcmdConfigCtxReq>(),
    },
    CcmdInfo {
        name: "exec_cmd",
        min_size: size_of::<AmdxdnaCcmdExecCmdReq>(),
    },
    CcmdInfo {
        name: "wait_cmd",
        min_size: size_of::<AmdxdnaCcmdWaitCmdReq>(),
    },
    CcmdInfo {
        name: "get_info",
        min_size: size_of::<AmdxdnaCcmdGetInfoReq>(),
    },
    CcmdInfo {
        name: "read_sysfs",
        min_size: size_of::<AmdxdnaCcmdReadSysfsReq>(),
    },
];

fn read_req<T: FromBytes>(scratch: &[u8]) -> VaccelResult<T> {
    T::read_from_prefix(scratch).ok_or(VaccelError::Invalid)
}

fn ok_rsp<T>() -> AmdxdnaCcmdRsp {
    AmdxdnaCcmdRsp {
        base: VdrmCcmdRsp {
            len: size_of::<T>() as u32,
        },
        ret: 0,
    }
}

/// One guest device instance: per-device resource, context and fence tables
/// plus the VMM callback table.
pub struct Vxdna {
    cookie: u64,
    capset_id: u32,
    callbacks: VaccelCallbacks,
    resources: VaccelMap<u32, VaccelResource>,
    contexts: VaccelMap<u32, VxdnaContext>,
    fences: VaccelMap<u64, VaccelFence>,
}

impl Vxdna {
    pub(crate) fn new(cookie: u64, capset_id: u32, callbacks: VaccelCallbacks) -> Vxdna {
        Vxdna {
            cookie,
            capset_id,
            callbacks,
            resources: VaccelMap::new(),
            contexts: VaccelMap::new(),
            fences: VaccelMap::new(),
        }
    }

    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    /// Returns the maximum capset version and the capset size in bytes.
    pub fn get_capset_info(&self) -> (u32, u32) {
        (
            VXDNA_CAPSET.version_major,
            size_of::<VaccelDrmCapset>() as u32,
        )
    }

    /// Copies the capset into `buf`, which must be at least capset-sized.
    pub fn fill_capset(&self, buf: &mut [u8]) -> VaccelResult<()> {
        let capset = VXDNA_CAPSET.as_bytes();
        if buf.len() < capset.len() {
            error!(
                "capset buffer too small: {} bytes, need {}",
                buf.len(),
                capset.len()
            );
            return Err(VaccelError::Invalid);
        }
        buf[..capset.len()].copy_from_slice(capset);
        Ok(())
    }

    /// Creates a guest execution context on a fresh DRM fd obtained from the
    /// VMM. A non-empty `name` is forwarded to the kernel as the client name.
    pub fn create_ctx(&self, ctx_id: u32, name: Option<&str>) -> VaccelResult<()> {
        if self.contexts.lookup(ctx_id).is_some() {
            error!("context {} already exists", ctx_id);
            return Err(VaccelError::AlreadyExists);
        }
        let fd = self.callbacks.get_device_fd(self.cookie);
        if fd < 0 {
            error!("no device fd for cookie {:#x}", self.cookie);
            return Err(VaccelError::NoDevice);
        }
        // SAFETY: the callback hands over ownership of a fresh descriptor.
        let drm_fd = unsafe { File::from_raw_fd(fd) };
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            set_client_name(&drm_fd, name);
        }
        let ctx = Arc::new(VxdnaContext::new(
            ctx_id,
            drm_fd,
            VXDNA_CCMD_ALIGN,
            self.cookie,
            self.callbacks.clone(),
        ));
        if !self.contexts.insert(ctx_id, ctx) {
            return Err(VaccelError::AlreadyExists);
        }
        Ok(())
    }

    pub fn destroy_ctx(&self, ctx_id: u32) -> VaccelResult<()> {
        let ctx = self.contexts.erase(ctx_id).ok_or(VaccelError::NotFound)?;
        // Dropped outside the table lock; teardown joins fence pollers.
        drop(ctx);
        Ok(())
    }

    pub fn get_ctx(&self, ctx_id: u32) -> VaccelResult<Arc<VxdnaContext>> {
        self.contexts.lookup(ctx_id).ok_or(VaccelError::NotFound)
    }

    /// Registers a guest-provided buffer as a resource on this device.
    pub fn create_resource(
        &self,
        res_id: u32,
        size: u64,
        blob_flags: u32,
        iovecs: Vec<VaccelIovec>,
        ctx_id: u32,
    ) -> VaccelResult<()> {
        let res = Arc::new(VaccelResource::new(res_id, size, blob_flags, iovecs, ctx_id));
        if !self.resources.insert(res_id, res) {
            error!("resource {} already exists", res_id);
            return Err(VaccelError::AlreadyExists);
        }
        Ok(())
    }

    pub fn get_resource(&self, res_id: u32) -> Option<Arc<VaccelResource>> {
        self.resources.lookup(res_id)
    }

    /// Removes a resource. Fails with `Busy` while a BO in any context still
    /// backs onto the resource's guest windows.
    pub fn destroy_resource(&self, res_id: u32) -> VaccelResult<()> {
        if self.resources.lookup(res_id).is_none() {
            return Err(VaccelError::NotFound);
        }
        if self
            .contexts
            .any(|ctx| ctx.references_resource(res_id))
        {
            error!("resource {} is still backing a bo", res_id);
            return Err(VaccelError::Busy);
        }
        self.resources.erase(res_id);
        Ok(())
    }

    /// Exports a resource as a file descriptor the caller owns.
    pub fn export_resource_fd(&self, res_id: u32) -> VaccelResult<RawDescriptor> {
        let res = self.resources.lookup(res_id).ok_or(VaccelError::NotFound)?;
        if res.opaque_handle() < 0 {
            error!("resource {} is not exportable", res_id);
            return Err(VaccelError::Invalid);
        }
        let ctx = self
            .contexts
            .lookup(res.ctx_id())
            .ok_or(VaccelError::NotFound)?;
        ctx.export_resource_fd(&res)
    }

    /// Submits fence `fence_id` on ring `ring_idx` of context `ctx_id`.
    pub fn submit_fence(
        &self,
        ctx_id: u32,
        flags: u32,
        ring_idx: u32,
        fence_id: u64,
    ) -> VaccelResult<()> {
        let _ = flags;
        let ctx = self.get_ctx(ctx_id)?;
        if let Some(fence) = ctx.submit_fence(ring_idx, fence_id)? {
            self.fences.retain(|_, fence| !fence.is_retired());
            self.fences.insert(fence_id, fence);
        }
        Ok(())
    }

    /// Returns a pollable fd for the fence, or -1.
    ///
    /// Timeline syncobj points have no exportable fd on this path yet, so the
    /// answer is always -1; the lookup still distinguishes unknown ids in the
    /// logs.
    pub fn get_fence_fd(&self, fence_id: u64) -> RawDescriptor {
        if self.fences.lookup(fence_id).is_none() {
            debug!("fence {} not found", fence_id);
        }
        -1
    }

    /// Processes a buffer holding one or more compute commands addressed to
    /// context `ctx_id`.
    pub fn process_ccmd(&self, ctx_id: u32, buffer: &[u8]) -> VaccelResult<()> {
        if buffer.is_empty() {
            return Err(VaccelError::Invalid);
        }
        let ctx = self.get_ctx(ctx_id)?;
        let align = ctx.ccmd_align() as usize;
        let mut offset = 0;
        while offset < buffer.len() {
            let hdr =
                VdrmCcmdReq::read_from_prefix(&buffer[offset..]).ok_or(VaccelError::Invalid)?;
            let len = hdr.len as usize;
            if len < size_of::<VdrmCcmdReq>() || len > buffer.len() - offset {
                error!(
                    "ccmd length {} does not fit the submitted buffer ({} bytes at offset {})",
                    len,
                    buffer.len(),
                    offset
                );
                return Err(VaccelError::Invalid);
            }
            self.dispatch_ccmd(&ctx, &buffer[offset..offset + len])?;
            offset += (len + align - 1) / align * align;
        }
        Ok(())
    }

    /// Decodes and runs one command. On failure an error response is written
    /// at offset 0 of the context's response resource and the error is
    /// propagated to the caller.
    fn dispatch_ccmd(&self, ctx: &Arc<VxdnaContext>, ccmd: &[u8]) -> VaccelResult<()> {
        let hdr = VdrmCcmdReq::read_from_prefix(ccmd).ok_or(VaccelError::Invalid)?;
        if hdr.cmd < 1 || hdr.cmd as usize > CCMD_TABLE.len() {
            error!("unknown ccmd {}", hdr.cmd);
            return Err(VaccelError::Invalid);
        }
        let info = &CCMD_TABLE[(hdr.cmd - 1) as usize];
        if (hdr.len as usize) < info.min_size {
            error!(
                "ccmd {}: request is {} bytes, expected at least {}",
                info.name, hdr.len, info.min_size
            );
            return Err(VaccelError::Invalid);
        }
        debug!("ccmd {} seqno {}", info.name, hdr.seqno);
        // Requests from older guests are zero-padded up to the handler's
        // expected size; newer guests may send grown requests.
        let mut scratch = vec![0u8; info.min_size.max(hdr.len as usize)];
        scratch[..hdr.len as usize].copy_from_slice(&ccmd[..hdr.len as usize]);
        let result = self.handle_ccmd(ctx, hdr.cmd, &scratch);
        if let Err(e) = &result {
            error!("ccmd {} failed: {}", info.name, e);
            ctx.write_err_rsp(e.errno());
        }
        result
    }

    fn handle_ccmd(&self, ctx: &Arc<VxdnaContext>, cmd: u32, scratch: &[u8]) -> VaccelResult<()> {
        match cmd {
            AMDXDNA_CCMD_NOP => Ok(()),
            AMDXDNA_CCMD_INIT => ctx.init(self, scratch),
            AMDXDNA_CCMD_CREATE_BO => ctx.create_bo(self, scratch),
            AMDXDNA_CCMD_DESTROY_BO => ctx.destroy_bo(scratch),
            AMDXDNA_CCMD_CREATE_CTX => ctx.create_hwctx(scratch),
            AMDXDNA_CCMD_DESTROY_CTX => ctx.destroy_hwctx(scratch),
            AMDXDNA_CCMD_CONFIG_CTX => ctx.config_hwctx(scratch),
            AMDXDNA_CCMD_EXEC_CMD => ctx.exec_cmd(scratch),
            AMDXDNA_CCMD_WAIT_CMD => ctx.wait_cmd(scratch),
            AMDXDNA_CCMD_GET_INFO => ctx.get_info(self, scratch),
            AMDXDNA_CCMD_READ_SYSFS => ctx.read_sysfs(scratch),
            _ => Err(VaccelError::Invalid),
        }
    }
}

fn set_client_name(drm_fd: &File, name: &str) {
    let mut args = drm_set_client_name {
        name_len: name.len() as u64,
        name: name.as_ptr() as u64,
    };
    // SAFETY: `name` outlives the call; the kernel copies the bytes.
    let ret = unsafe { ioctl_with_mut_ref(drm_fd, DRM_IOCTL_SET_CLIENT_NAME, &mut args) };
    if ret < 0 {
        // Purely cosmetic, so the context is still usable.
        warn!(
            "failed to set drm client name {:?}: {}",
            name,
            io::Error::last_os_error()
        );
    }
}

/// One guest execution context: a private DRM fd, the BO and hardware-context
/// tables, and the response resource commands write their results into.
pub struct VxdnaContext {
    ctx_id: u32,
    ccmd_align: u32,
    cookie: u64,
    callbacks: VaccelCallbacks,
    resp_res: Mutex<Option<Arc<VaccelResource>>>,
    bos: VaccelMap<u32, VxdnaBo>,
    hwctxs: VaccelMap<u32, VxdnaHwctx>,
    // Declared last: BOs and hardware contexts release their kernel handles
    // before the fd closes.
    drm_fd: File,
}

impl VxdnaContext {
    fn new(
        ctx_id: u32,
        drm_fd: File,
        ccmd_align: u32,
        cookie: u64,
        callbacks: VaccelCallbacks,
    ) -> VxdnaContext {
        debug!(
            "context created: ctx_id={}, fd={}",
            ctx_id,
            drm_fd.as_raw_descriptor()
        );
        VxdnaContext {
            ctx_id,
            ccmd_align,
            cookie,
            callbacks,
            resp_res: Mutex::new(None),
            bos: VaccelMap::new(),
            hwctxs: VaccelMap::new(),
            drm_fd,
        }
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn ccmd_align(&self) -> u32 {
        self.ccmd_align
    }

    fn fd(&self) -> RawDescriptor {
        self.drm_fd.as_raw_descriptor()
    }

    fn resp_res(&self) -> VaccelResult<Arc<VaccelResource>> {
        self.resp_res.lock().clone().ok_or_else(|| {
            error!("ctx {}: response resource not found", self.ctx_id);
            VaccelError::Invalid
        })
    }

    fn write_rsp(&self, rsp: &[u8], rsp_off: u32) -> VaccelResult<()> {
        self.resp_res()?.write(rsp_off as u64, rsp)?;
        Ok(())
    }

    /// Writes `{base.len, ret}` at offset 0 of the response resource. Nothing
    /// happens when no response resource is bound; errors never propagate out
    /// of the error path.
    fn write_err_rsp(&self, err: i32) {
        let resp_res = self.resp_res.lock().clone();
        let Some(res) = resp_res else {
            return;
        };
        let rsp = AmdxdnaCcmdRsp {
            base: VdrmCcmdRsp {
                len: size_of::<AmdxdnaCcmdRsp>() as u32,
            },
            ret: err,
        };
        if let Err(e) = res.write(0, rsp.as_bytes()) {
            warn!("ctx {}: failed to write error response: {}", self.ctx_id, e);
        }
    }

    fn init(&self, device: &Vxdna, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdInitReq = read_req(scratch)?;
        let res = device
            .get_resource(req.rsp_res_id)
            .ok_or(VaccelError::NotFound)?;
        *self.resp_res.lock() = Some(res);
        Ok(())
    }

    fn create_bo(&self, device: &Vxdna, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdCreateBoReq = read_req(scratch)?;
        let bo = if req.bo_type != AMDXDNA_BO_DEV {
            let res = device.get_resource(req.res_id).ok_or_else(|| {
                error!("bo backing resource {} not found", req.res_id);
                VaccelError::Invalid
            })?;
            VxdnaBo::from_resource(res, self.fd(), &req)?
        } else {
            VxdnaBo::new_device(self.fd(), &req)?
        };
        let rsp = AmdxdnaCcmdCreateBoRsp {
            res: ok_rsp::<AmdxdnaCcmdCreateBoRsp>(),
            xdna_addr: bo.addr(),
            handle: bo.handle(),
            pad: 0,
        };
        self.write_rsp(rsp.as_bytes(), req.hdr.rsp_off)?;
        self.bos.insert(bo.handle(), Arc::new(bo));
        Ok(())
    }

    fn destroy_bo(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdDestroyBoReq = read_req(scratch)?;
        self.bos.erase(req.handle).ok_or(VaccelError::NotFound)?;
        Ok(())
    }

    fn create_hwctx(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdCreateCtxReq = read_req(scratch)?;
        let hwctx = VxdnaHwctx::new(self.fd(), self.ctx_id, self.cookie, &self.callbacks, &req)?;
        let rsp = AmdxdnaCcmdCreateCtxRsp {
            res: ok_rsp::<AmdxdnaCcmdCreateCtxRsp>(),
            handle: hwctx.handle(),
            pad: 0,
        };
        self.write_rsp(rsp.as_bytes(), req.hdr.rsp_off)?;
        self.hwctxs.insert(hwctx.handle(), Arc::new(hwctx));
        Ok(())
    }

    fn destroy_hwctx(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdDestroyCtxReq = read_req(scratch)?;
        self.hwctxs.erase(req.handle).ok_or(VaccelError::NotFound)?;
        Ok(())
    }

    fn config_hwctx(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdConfigCtxReq = read_req(scratch)?;
        let hwctx = self.hwctxs.lookup(req.handle).ok_or(VaccelError::NotFound)?;
        let inline = &scratch[size_of::<AmdxdnaCcmdConfigCtxReq>()..];
        if req.param_val_size as usize > inline.len() {
            error!(
                "config_ctx: {} bytes of parameter data, request carries {}",
                req.param_val_size,
                inline.len()
            );
            return Err(VaccelError::Invalid);
        }
        hwctx.config(&req, &inline[..req.param_val_size as usize])
    }

    fn exec_cmd(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdExecCmdReq = read_req(scratch)?;
        let hwctx = self
            .hwctxs
            .lookup(req.ctx_handle)
            .ok_or(VaccelError::NotFound)?;
        let cmds_n_args = &scratch[size_of::<AmdxdnaCcmdExecCmdReq>()..];
        let seq = hwctx.exec_cmd(&req, cmds_n_args)?;
        let rsp = AmdxdnaCcmdExecCmdRsp {
            res: ok_rsp::<AmdxdnaCcmdExecCmdRsp>(),
            seq,
        };
        self.write_rsp(rsp.as_bytes(), req.hdr.rsp_off)
    }

    fn wait_cmd(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdWaitCmdReq = read_req(scratch)?;
        let hwctx = self
            .hwctxs
            .lookup(req.ctx_handle)
            .ok_or(VaccelError::NotFound)?;
        hwctx.set_sync_point(req.seq, req.timeout_nsec);
        let rsp = ok_rsp::<AmdxdnaCcmdRsp>();
        self.write_rsp(rsp.as_bytes(), req.hdr.rsp_off)
    }

    fn get_info(&self, device: &Vxdna, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdGetInfoReq = read_req(scratch)?;
        let res = device
            .get_resource(req.info_res)
            .ok_or(VaccelError::NotFound)?;
        let total = (req.size as usize)
            .checked_mul(req.num_element.max(1) as usize)
            .ok_or(VaccelError::Invalid)?;
        // The scratch round-trips through the info resource, so it can never
        // be larger than the resource itself.
        if total as u64 > res.size() {
            error!(
                "get_info: {} bytes requested from a {}-byte resource",
                total,
                res.size()
            );
            return Err(VaccelError::Invalid);
        }
        let mut buf = vec![0u8; total];
        res.read(0, &mut buf)?;
        let (size, num_element) = if req.num_element > 0 {
            let mut args = amdxdna_drm_get_array {
                param: req.param,
                element_size: req.size,
                num_element: req.num_element,
                pad: 0,
                buffer: buf.as_mut_ptr() as u64,
            };
            // SAFETY: `buf` outlives the call and is writable for `total`
            // bytes.
            let ret = unsafe {
                ioctl_with_mut_ref(&Descriptor(self.fd()), DRM_IOCTL_AMDXDNA_GET_ARRAY, &mut args)
            };
            if ret < 0 {
                return Err(last_kernel_error());
            }
            (args.element_size, args.num_element)
        } else {
            let mut args = amdxdna_drm_get_info {
                param: req.param,
                buffer_size: req.size,
                buffer: buf.as_mut_ptr() as u64,
            };
            // SAFETY: `buf` outlives the call and is writable for `total`
            // bytes.
            let ret = unsafe {
                ioctl_with_mut_ref(&Descriptor(self.fd()), DRM_IOCTL_AMDXDNA_GET_INFO, &mut args)
            };
            if ret < 0 {
                return Err(last_kernel_error());
            }
            (args.buffer_size, 0)
        };
        res.write(0, &buf)?;
        let rsp = AmdxdnaCcmdGetInfoRsp {
            res: ok_rsp::<AmdxdnaCcmdGetInfoRsp>(),
            size,
            num_element,
        };
        self.write_rsp(rsp.as_bytes(), req.hdr.rsp_off)
    }

    fn read_sysfs(&self, scratch: &[u8]) -> VaccelResult<()> {
        let req: AmdxdnaCcmdReadSysfsReq = read_req(scratch)?;
        let name_bytes = &scratch[size_of::<AmdxdnaCcmdReadSysfsReq>()..];
        if req.node_name_len == 0 || req.node_name_len as usize > name_bytes.len() {
            return Err(VaccelError::Invalid);
        }
        let mut name_bytes = &name_bytes[..req.node_name_len as usize];
        while let [head @ .., 0] = name_bytes {
            name_bytes = head;
        }
        let name = std::str::from_utf8(name_bytes).map_err(|_| VaccelError::Invalid)?;
        if name.is_empty() || name.contains('/') || name.contains("..") {
            error!("read_sysfs: bad node name {:?}", name);
            return Err(VaccelError::Invalid);
        }
        let rdev = self.drm_fd.metadata()?.rdev();
        let path = format!(
            "/sys/dev/char/{}:{}/device/{}",
            libc::major(rdev),
            libc::minor(rdev),
            name
        );
        let contents = std::fs::read(&path).map_err(|e| {
            error!("read_sysfs: failed to read {}: {}", path, e);
            VaccelError::IoError(e)
        })?;
        let val_len = u32::try_from(contents.len())?;
        let mut rsp = AmdxdnaCcmdReadSysfsRsp {
            res: ok_rsp::<AmdxdnaCcmdReadSysfsRsp>(),
            val_len,
            pad: 0,
        };
        rsp.res.base.len = (size_of::<AmdxdnaCcmdReadSysfsRsp>() + contents.len()) as u32;
        let res = self.resp_res()?;
        res.write(req.hdr.rsp_off as u64, rsp.as_bytes())?;
        res.write(
            req.hdr.rsp_off as u64 + size_of::<AmdxdnaCcmdReadSysfsRsp>() as u64,
            &contents,
        )?;
        Ok(())
    }

    /// Submits a fence on ring `ring_idx`. A queued fence is handed back for
    /// tracking; a trivial fence already fired synchronously.
    pub fn submit_fence(
        &self,
        ring_idx: u32,
        fence_id: u64,
    ) -> VaccelResult<Option<Arc<VaccelFence>>> {
        let hwctx = self.hwctxs.lookup(ring_idx).ok_or(VaccelError::NotFound)?;
        Ok(hwctx.submit_fence(fence_id))
    }

    fn references_resource(&self, res_id: u32) -> bool {
        self.bos.any(|bo| bo.backing_res_id() == Some(res_id))
    }

    fn export_resource_fd(&self, res: &Arc<VaccelResource>) -> VaccelResult<RawDescriptor> {
        dup_descriptor_cloexec(res.opaque_handle())
    }
}

impl Drop for VxdnaContext {
    fn drop(&mut self) {
        debug!(
            "context destroying: ctx_id={}, fd={}",
            self.ctx_id,
            self.drm_fd.as_raw_descriptor()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::IntoRawFd;

    use super::*;
    use crate::vaccel_utils::VACCEL_CAPSET_AMDXDNA;

    fn test_device() -> Vxdna {
        let callbacks = VaccelCallbacks::new(
            |_| tempfile::tempfile().unwrap().into_raw_fd(),
            |_, _, _, _| {},
        );
        Vxdna::new(0xc0ffee, VACCEL_CAPSET_AMDXDNA, callbacks)
    }

    fn add_resource(device: &Vxdna, res_id: u32, backing: &mut [u8]) {
        let iovecs = vec![VaccelIovec {
            base: backing.as_mut_ptr() as *mut _,
            len: backing.len(),
        }];
        device
            .create_resource(res_id, backing.len() as u64, 0, iovecs, 1)
            .unwrap();
    }

    fn init_ccmd(rsp_res_id: u32) -> Vec<u8> {
        let req = AmdxdnaCcmdInitReq {
            hdr: VdrmCcmdReq {
                cmd: AMDXDNA_CCMD_INIT,
                len: size_of::<AmdxdnaCcmdInitReq>() as u32,
                seqno: 1,
                rsp_off: 0,
            },
            rsp_res_id,
            pad: 0,
        };
        req.as_bytes().to_vec()
    }

    fn destroy_bo_ccmd(handle: u32) -> Vec<u8> {
        let req = AmdxdnaCcmdDestroyBoReq {
            hdr: VdrmCcmdReq {
                cmd: AMDXDNA_CCMD_DESTROY_BO,
                len: size_of::<AmdxdnaCcmdDestroyBoReq>() as u32,
                seqno: 2,
                rsp_off: 0,
            },
            handle,
            pad: 0,
        };
        req.as_bytes().to_vec()
    }

    fn nop_ccmd() -> Vec<u8> {
        let hdr = VdrmCcmdReq {
            cmd: AMDXDNA_CCMD_NOP,
            len: size_of::<VdrmCcmdReq>() as u32,
            seqno: 3,
            rsp_off: 0,
        };
        hdr.as_bytes().to_vec()
    }

    #[test]
    fn capset_query() {
        let device = test_device();
        let (version, size) = device.get_capset_info();
        assert_eq!(version, 1);
        assert_eq!(size as usize, size_of::<VaccelDrmCapset>());

        let mut short = vec![0u8; size as usize - 1];
        assert!(matches!(
            device.fill_capset(&mut short),
            Err(VaccelError::Invalid)
        ));

        let mut buf = vec![0u8; size as usize];
        device.fill_capset(&mut buf).unwrap();
        let capset = VaccelDrmCapset::read_from_prefix(&buf).unwrap();
        assert_eq!(capset.wire_format_version, 1);
        assert_eq!(capset.context_type, VACCEL_CONTEXT_AMDXDNA);
    }

    #[test]
    fn context_lifecycle() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        assert!(matches!(
            device.create_ctx(1, None),
            Err(VaccelError::AlreadyExists)
        ));
        device.destroy_ctx(1).unwrap();
        assert!(matches!(device.destroy_ctx(1), Err(VaccelError::NotFound)));
    }

    #[test]
    fn nop_dispatches() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        device.process_ccmd(1, &nop_ccmd()).unwrap();
    }

    #[test]
    fn invalid_opcodes_rejected() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        for cmd in [0u32, 12] {
            let hdr = VdrmCcmdReq {
                cmd,
                len: size_of::<VdrmCcmdReq>() as u32,
                seqno: 0,
                rsp_off: 0,
            };
            let err = device.process_ccmd(1, hdr.as_bytes()).unwrap_err();
            assert_eq!(err.errno(), -libc::EINVAL);
        }
    }

    #[test]
    fn short_request_rejected() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        // An init request truncated to just the header.
        let hdr = VdrmCcmdReq {
            cmd: AMDXDNA_CCMD_INIT,
            len: size_of::<VdrmCcmdReq>() as u32,
            seqno: 0,
            rsp_off: 0,
        };
        assert!(matches!(
            device.process_ccmd(1, hdr.as_bytes()),
            Err(VaccelError::Invalid)
        ));
    }

    #[test]
    fn response_requires_init() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let ctx = device.get_ctx(1).unwrap();
        let err = ctx.write_rsp(&[0u8; 8], 0).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn init_binds_response_resource() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        device.process_ccmd(1, &init_ccmd(10)).unwrap();

        // A failing command now writes its error response at offset 0.
        let err = device.process_ccmd(1, &destroy_bo_ccmd(7)).unwrap_err();
        assert_eq!(err.errno(), -libc::ENOENT);
        let rsp = AmdxdnaCcmdRsp::read_from_prefix(&backing).unwrap();
        assert_eq!(rsp.base.len as usize, size_of::<AmdxdnaCcmdRsp>());
        assert_eq!(rsp.ret, -libc::ENOENT);
    }

    #[test]
    fn init_with_unknown_resource_fails() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        assert!(matches!(
            device.process_ccmd(1, &init_ccmd(99)),
            Err(VaccelError::NotFound)
        ));
    }

    #[test]
    fn multiple_ccmds_in_one_buffer() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        let mut buffer = init_ccmd(10);
        buffer.extend_from_slice(&nop_ccmd());
        device.process_ccmd(1, &buffer).unwrap();
    }

    #[test]
    fn wait_cmd_without_hwctx_fails() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        device.process_ccmd(1, &init_ccmd(10)).unwrap();

        let req = AmdxdnaCcmdWaitCmdReq {
            hdr: VdrmCcmdReq {
                cmd: AMDXDNA_CCMD_WAIT_CMD,
                len: size_of::<AmdxdnaCcmdWaitCmdReq>() as u32,
                seqno: 5,
                rsp_off: 64,
            },
            seq: 7,
            timeout_nsec: 1_000_000,
            ctx_handle: 3,
            pad: 0,
        };
        let err = device.process_ccmd(1, req.as_bytes()).unwrap_err();
        assert_eq!(err.errno(), -libc::ENOENT);
    }

    fn read_sysfs_ccmd(name: &[u8]) -> Vec<u8> {
        let req = AmdxdnaCcmdReadSysfsReq {
            hdr: VdrmCcmdReq {
                cmd: AMDXDNA_CCMD_READ_SYSFS,
                len: (size_of::<AmdxdnaCcmdReadSysfsReq>() + name.len()) as u32,
                seqno: 8,
                rsp_off: 32,
            },
            node_name_len: name.len() as u32,
            pad: 0,
        };
        let mut buffer = req.as_bytes().to_vec();
        buffer.extend_from_slice(name);
        buffer
    }

    #[test]
    fn read_sysfs_missing_node() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        device.process_ccmd(1, &init_ccmd(10)).unwrap();

        // The test context's fd is a regular file, so the derived sysfs path
        // cannot exist.
        let err = device.process_ccmd(1, &read_sysfs_ccmd(b"vbnv\0")).unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);
        let rsp = AmdxdnaCcmdRsp::read_from_prefix(&backing).unwrap();
        assert_eq!(rsp.ret, -libc::EIO);
    }

    #[test]
    fn read_sysfs_rejects_bad_names() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        device.process_ccmd(1, &init_ccmd(10)).unwrap();

        for name in [&b"../passwd"[..], b"a/b", b"\0"] {
            let err = device.process_ccmd(1, &read_sysfs_ccmd(name)).unwrap_err();
            assert_eq!(err.errno(), -libc::EINVAL);
        }
    }

    #[test]
    fn get_info_bounded_by_resource() {
        let device = test_device();
        device.create_ctx(1, None).unwrap();
        let mut backing = vec![0u8; 256];
        add_resource(&device, 10, &mut backing);
        device.process_ccmd(1, &init_ccmd(10)).unwrap();
        let mut info_backing = vec![0u8; 64];
        add_resource(&device, 11, &mut info_backing);

        let req = AmdxdnaCcmdGetInfoReq {
            hdr: VdrmCcmdReq {
                cmd: AMDXDNA_CCMD_GET_INFO,
                len: size_of::<AmdxdnaCcmdGetInfoReq>() as u32,
                seqno: 9,
                rsp_off: 0,
            },
            param: 1,
            size: 128,
            num_element: 4,
            info_res: 11,
        };
        let err = device.process_ccmd(1, req.as_bytes()).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn resource_lifecycle() {
        let device = test_device();
        let mut backing = vec![0u8; 64];
        add_resource(&device, 5, &mut backing);
        assert!(matches!(
            device.create_resource(5, 64, 0, Vec::new(), 1),
            Err(VaccelError::AlreadyExists)
        ));
        device.destroy_resource(5).unwrap();
        assert!(matches!(
            device.destroy_resource(5),
            Err(VaccelError::NotFound)
        ));
    }

    #[test]
    fn export_requires_opaque_handle() {
        let device = test_device();
        let mut backing = vec![0u8; 64];
        add_resource(&device, 5, &mut backing);
        assert!(matches!(
            device.export_resource_fd(5),
            Err(VaccelError::Invalid)
        ));
    }

    #[test]
    fn submit_fence_unknown_targets() {
        let device = test_device();
        assert!(matches!(
            device.submit_fence(1, 0, 0, 42),
            Err(VaccelError::NotFound)
        ));
        device.create_ctx(1, None).unwrap();
        assert!(matches!(
            device.submit_fence(1, 0, 9, 42),
            Err(VaccelError::NotFound)
        ));
    }

    #[test]
    fn fence_fd_export_unspecified() {
        let device = test_device();
        assert_eq!(device.get_fence_fd(123), -1);
    }
}
