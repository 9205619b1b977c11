// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-context wrapper: the kernel hwctx plus its timeline syncobj and
//! the polling thread that retires fences back to the VMM.

use std::io;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::warn;

use crate::amdxdna::amdxdna_bindings::*;
use crate::amdxdna::amdxdna_protocol::AmdxdnaCcmdConfigCtxReq;
use crate::amdxdna::amdxdna_protocol::AmdxdnaCcmdCreateCtxReq;
use crate::amdxdna::amdxdna_protocol::AmdxdnaCcmdExecCmdReq;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::vaccel_os::ioctl_with_mut_ref;
use crate::vaccel_os::ioctl_with_ref;
use crate::vaccel_os::Descriptor;
use crate::vaccel_os::RawDescriptor;
use crate::vaccel_utils::last_kernel_error;
use crate::vaccel_utils::VaccelCallbacks;
use crate::vaccel_utils::VaccelError;
use crate::vaccel_utils::VaccelFence;
use crate::vaccel_utils::VaccelResult;

struct FenceQueue {
    pending: Vec<Arc<VaccelFence>>,
    sync_point: u64,
    timeout_nsec: i64,
    has_sync_point: bool,
    stop: bool,
}

struct EngineShared {
    queue: Mutex<FenceQueue>,
    cv: Condvar,
}

/// The fence-retirement pipeline of one hardware context.
///
/// Owns no kernel handles itself; it waits on the syncobj it is given and
/// reports completions through `write_context_fence`. Keeping the kernel
/// objects out of this type lets the pipeline run against any descriptor.
pub struct VxdnaFenceEngine {
    shared: Arc<EngineShared>,
    poller: Option<JoinHandle<()>>,
    syncobj_handle: u32,
    ring_idx: u32,
    cookie: u64,
    ctx_id: u32,
    callbacks: VaccelCallbacks,
}

impl VxdnaFenceEngine {
    pub fn new(
        ctx_fd: RawDescriptor,
        syncobj_handle: u32,
        ring_idx: u32,
        ctx_id: u32,
        cookie: u64,
        callbacks: VaccelCallbacks,
    ) -> VaccelResult<VxdnaFenceEngine> {
        let shared = Arc::new(EngineShared {
            queue: Mutex::new(FenceQueue {
                pending: Vec::new(),
                sync_point: 0,
                timeout_nsec: 0,
                has_sync_point: false,
                stop: false,
            }),
            cv: Condvar::new(),
        });
        let poller_shared = shared.clone();
        let poller_callbacks = callbacks.clone();
        let poller = thread::Builder::new()
            .name(format!("vxdna-fence-{}", ring_idx))
            .spawn(move || {
                VxdnaFenceEngine::poll_fences(
                    poller_shared,
                    ctx_fd,
                    syncobj_handle,
                    ring_idx,
                    ctx_id,
                    cookie,
                    poller_callbacks,
                )
            })?;
        Ok(VxdnaFenceEngine {
            shared,
            poller: Some(poller),
            syncobj_handle,
            ring_idx,
            cookie,
            ctx_id,
            callbacks,
        })
    }

    /// Arms the sync point the next submitted fence will wait for.
    pub fn set_sync_point(&self, sync_point: u64, timeout_nsec: i64) {
        let mut queue = self.shared.queue.lock();
        queue.sync_point = sync_point;
        queue.timeout_nsec = timeout_nsec;
        queue.has_sync_point = true;
    }

    /// Submits a fence against the armed sync point, consuming it.
    ///
    /// With no sync point armed the fence is trivial: the completion callback
    /// fires synchronously and nothing is queued. Otherwise the fence is
    /// handed to the polling thread and returned to the caller for tracking.
    pub fn submit_fence(&self, fence_id: u64) -> Option<Arc<VaccelFence>> {
        let queued = {
            let mut queue = self.shared.queue.lock();
            if !queue.has_sync_point {
                None
            } else {
                let fence = Arc::new(VaccelFence::new(
                    fence_id,
                    queue.sync_point,
                    self.syncobj_handle,
                    self.ring_idx,
                    queue.timeout_nsec,
                ));
                queue.pending.push(fence.clone());
                queue.has_sync_point = false;
                Some(fence)
            }
        };
        match queued {
            Some(fence) => {
                self.shared.cv.notify_one();
                Some(fence)
            }
            None => {
                self.callbacks
                    .write_context_fence(self.cookie, self.ctx_id, self.ring_idx, fence_id);
                None
            }
        }
    }

    /// Stops and joins the polling thread; pending fences are discarded
    /// without firing their callback. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
        }
        self.shared.cv.notify_one();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }

    fn poll_fences(
        shared: Arc<EngineShared>,
        ctx_fd: RawDescriptor,
        syncobj_handle: u32,
        ring_idx: u32,
        ctx_id: u32,
        cookie: u64,
        callbacks: VaccelCallbacks,
    ) {
        loop {
            let batch = {
                let mut queue = shared.queue.lock();
                while !queue.stop && queue.pending.is_empty() {
                    queue = shared.cv.wait(queue);
                }
                if queue.stop {
                    return;
                }
                mem::take(&mut queue.pending)
            };
            for fence in batch {
                let handles = [syncobj_handle];
                let points = [fence.sync_point];
                let mut wait = drm_syncobj_timeline_wait {
                    handles: handles.as_ptr() as u64,
                    points: points.as_ptr() as u64,
                    timeout_nsec: fence.timeout_nsec,
                    count_handles: 1,
                    flags: DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT,
                    ..Default::default()
                };
                // SAFETY: the handle and point arrays outlive the call.
                let ret = unsafe {
                    ioctl_with_mut_ref(
                        &Descriptor(ctx_fd),
                        DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT,
                        &mut wait,
                    )
                };
                if ret < 0 {
                    // A timed-out or failed wait still retires the fence;
                    // stalling the pipeline would wedge the guest.
                    debug!(
                        "ring {}: timeline wait for point {} failed: {}",
                        ring_idx,
                        fence.sync_point,
                        io::Error::last_os_error()
                    );
                }
                fence.retire();
                callbacks.write_context_fence(cookie, ctx_id, ring_idx, fence.id);
            }
        }
    }
}

impl Drop for VxdnaFenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One kernel hardware context and its fence pipeline. The hwctx handle
/// doubles as the fence ring index on the callback interface.
pub struct VxdnaHwctx {
    hwctx_handle: u32,
    syncobj_handle: u32,
    ctx_fd: RawDescriptor,
    engine: VxdnaFenceEngine,
}

impl VxdnaHwctx {
    pub fn new(
        ctx_fd: RawDescriptor,
        ctx_id: u32,
        cookie: u64,
        callbacks: &VaccelCallbacks,
        req: &AmdxdnaCcmdCreateCtxReq,
    ) -> VaccelResult<VxdnaHwctx> {
        let qos = req.qos_info;
        let mut create = amdxdna_drm_create_hwctx {
            qos_p: &qos as *const amdxdna_qos_info as u64,
            max_opc: req.max_opc,
            num_tiles: req.num_tiles,
            mem_size: req.mem_size,
            ..Default::default()
        };
        // SAFETY: `qos` lives across the call and the struct is otherwise
        // plain data.
        let ret = unsafe {
            ioctl_with_mut_ref(&Descriptor(ctx_fd), DRM_IOCTL_AMDXDNA_CREATE_HWCTX, &mut create)
        };
        if ret < 0 {
            return Err(last_kernel_error());
        }
        if create.handle == AMDXDNA_INVALID_CTX_HANDLE {
            return Err(VaccelError::Invalid);
        }
        let engine = match VxdnaFenceEngine::new(
            ctx_fd,
            create.syncobj_handle,
            create.handle,
            ctx_id,
            cookie,
            callbacks.clone(),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                destroy_kernel_handles(ctx_fd, create.syncobj_handle, create.handle);
                return Err(e);
            }
        };
        Ok(VxdnaHwctx {
            hwctx_handle: create.handle,
            syncobj_handle: create.syncobj_handle,
            ctx_fd,
            engine,
        })
    }

    pub fn handle(&self) -> u32 {
        self.hwctx_handle
    }

    /// Applies one configuration parameter, either inline or via the
    /// out-of-line buffer the guest appended to the request.
    pub fn config(&self, req: &AmdxdnaCcmdConfigCtxReq, inline: &[u8]) -> VaccelResult<()> {
        let mut cfg = amdxdna_drm_config_hwctx {
            handle: self.hwctx_handle,
            param_type: req.param_type,
            param_val: req.param_val,
            param_val_size: 0,
            pad: 0,
        };
        if req.param_val_size > 0 {
            cfg.param_val = inline.as_ptr() as u64;
            cfg.param_val_size = req.param_val_size;
        }
        // SAFETY: `inline` outlives the call when referenced.
        let ret =
            unsafe { ioctl_with_ref(&Descriptor(self.ctx_fd), DRM_IOCTL_AMDXDNA_CONFIG_HWCTX, &cfg) };
        if ret < 0 {
            return Err(last_kernel_error());
        }
        Ok(())
    }

    /// Queues a command batch on the hardware context and returns the kernel
    /// sequence number. `cmds_n_args` holds the command handles followed, at
    /// `arg_offset`, by their arguments.
    pub fn exec_cmd(&self, req: &AmdxdnaCcmdExecCmdReq, cmds_n_args: &[u8]) -> VaccelResult<u64> {
        let arg_offset = req.arg_offset as usize;
        if arg_offset > cmds_n_args.len() {
            return Err(VaccelError::Invalid);
        }
        let mut exec = amdxdna_drm_exec_cmd {
            hwctx: self.hwctx_handle,
            type_: req.cmd_type,
            cmd_handles: cmds_n_args.as_ptr() as u64,
            args: cmds_n_args[arg_offset..].as_ptr() as u64,
            cmd_count: req.cmd_count,
            arg_count: req.arg_count,
            ..Default::default()
        };
        // SAFETY: both pointers reference `cmds_n_args`, which outlives the
        // call.
        let ret = unsafe {
            ioctl_with_mut_ref(&Descriptor(self.ctx_fd), DRM_IOCTL_AMDXDNA_EXEC_CMD, &mut exec)
        };
        if ret < 0 {
            return Err(last_kernel_error());
        }
        Ok(exec.seq)
    }

    pub fn set_sync_point(&self, sync_point: u64, timeout_nsec: i64) {
        self.engine.set_sync_point(sync_point, timeout_nsec);
    }

    pub fn submit_fence(&self, fence_id: u64) -> Option<Arc<VaccelFence>> {
        self.engine.submit_fence(fence_id)
    }
}

impl Drop for VxdnaHwctx {
    fn drop(&mut self) {
        // The polling thread must be gone before the kernel handles are
        // released under it.
        self.engine.stop();
        destroy_kernel_handles(self.ctx_fd, self.syncobj_handle, self.hwctx_handle);
    }
}

fn destroy_kernel_handles(ctx_fd: RawDescriptor, syncobj_handle: u32, hwctx_handle: u32) {
    if syncobj_handle != AMDXDNA_INVALID_FENCE_HANDLE {
        let destroy = drm_syncobj_destroy {
            handle: syncobj_handle,
            pad: 0,
        };
        // SAFETY: plain-data argument.
        let ret =
            unsafe { ioctl_with_ref(&Descriptor(ctx_fd), DRM_IOCTL_SYNCOBJ_DESTROY, &destroy) };
        if ret < 0 {
            warn!(
                "failed to destroy syncobj {}: {}",
                syncobj_handle,
                io::Error::last_os_error()
            );
        }
    }
    if hwctx_handle != AMDXDNA_INVALID_CTX_HANDLE {
        let destroy = amdxdna_drm_destroy_hwctx {
            handle: hwctx_handle,
            pad: 0,
        };
        // SAFETY: plain-data argument.
        let ret =
            unsafe { ioctl_with_ref(&Descriptor(ctx_fd), DRM_IOCTL_AMDXDNA_DESTROY_HWCTX, &destroy) };
        if ret < 0 {
            warn!(
                "failed to destroy hwctx {}: {}",
                hwctx_handle,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::vaccel_os::AsRawDescriptor;
    use crate::vaccel_os::DEFAULT_RAW_DESCRIPTOR;

    struct FenceEvent {
        ctx_id: u32,
        ring_idx: u32,
        fence_id: u64,
    }

    fn channel_callbacks() -> (VaccelCallbacks, mpsc::Receiver<FenceEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callbacks = VaccelCallbacks::new(
            |_| DEFAULT_RAW_DESCRIPTOR,
            move |_, ctx_id, ring_idx, fence_id| {
                tx.lock()
                    .send(FenceEvent {
                        ctx_id,
                        ring_idx,
                        fence_id,
                    })
                    .unwrap();
            },
        );
        (callbacks, rx)
    }

    fn test_engine(ring_idx: u32) -> (VxdnaFenceEngine, mpsc::Receiver<FenceEvent>, std::fs::File) {
        // A timeline wait on a regular file fails immediately, which the
        // pipeline treats the same as a completed wait.
        let file = tempfile::tempfile().unwrap();
        let (callbacks, rx) = channel_callbacks();
        let engine = VxdnaFenceEngine::new(
            file.as_raw_descriptor(),
            1,
            ring_idx,
            9,
            0xc0ffee,
            callbacks,
        )
        .unwrap();
        (engine, rx, file)
    }

    #[test]
    fn trivial_fence_fires_synchronously() {
        let (engine, rx, _file) = test_engine(4);
        assert!(engine.submit_fence(42).is_none());
        // Already delivered; no waiting on the poller involved.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.fence_id, 42);
        assert_eq!(event.ring_idx, 4);
        assert_eq!(event.ctx_id, 9);
    }

    #[test]
    fn armed_sync_point_goes_through_poller() {
        let (engine, rx, _file) = test_engine(2);
        engine.set_sync_point(7, 1_000_000);
        let fence = engine.submit_fence(100).unwrap();
        assert_eq!(fence.sync_point, 7);
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.fence_id, 100);
        assert_eq!(event.ring_idx, 2);
        assert!(fence.is_retired());

        // The sync point was consumed: the next submit takes the fast path.
        assert!(engine.submit_fence(101).is_none());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.fence_id, 101);
    }

    #[test]
    fn fences_retire_in_submission_order() {
        let (engine, rx, _file) = test_engine(1);
        for id in 0..8u64 {
            engine.set_sync_point(id + 1, 1_000);
            engine.submit_fence(id).unwrap();
        }
        for id in 0..8u64 {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(event.fence_id, id);
        }
    }

    #[test]
    fn stop_discards_unretired_fences() {
        let (mut engine, rx, _file) = test_engine(3);
        engine.stop();
        // A fence queued after the poller is gone is discarded, not retired.
        engine.set_sync_point(1, 0);
        engine.submit_fence(5);
        drop(engine);
        // The queued fence never fires since the poller is gone.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
