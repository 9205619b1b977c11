// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-written protocol for the amdxdna context type. Intended to be shared
//! with the guest's user-mode driver.

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::amdxdna::amdxdna_bindings::amdxdna_qos_info;

/// amdxdna compute commands, one-based.
pub const AMDXDNA_CCMD_NOP: u32 = 1;
pub const AMDXDNA_CCMD_INIT: u32 = 2;
pub const AMDXDNA_CCMD_CREATE_BO: u32 = 3;
pub const AMDXDNA_CCMD_DESTROY_BO: u32 = 4;
pub const AMDXDNA_CCMD_CREATE_CTX: u32 = 5;
pub const AMDXDNA_CCMD_DESTROY_CTX: u32 = 6;
pub const AMDXDNA_CCMD_CONFIG_CTX: u32 = 7;
pub const AMDXDNA_CCMD_EXEC_CMD: u32 = 8;
pub const AMDXDNA_CCMD_WAIT_CMD: u32 = 9;
pub const AMDXDNA_CCMD_GET_INFO: u32 = 10;
pub const AMDXDNA_CCMD_READ_SYSFS: u32 = 11;

/// Header carried by every compute command. The response, if any, is written
/// into the context's response resource at byte offset `rsp_off`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct VdrmCcmdReq {
    pub cmd: u32,
    pub len: u32,
    pub seqno: u32,
    pub rsp_off: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct VdrmCcmdRsp {
    pub len: u32,
}

/// Prefix of every amdxdna response; `ret` is zero or a negative errno.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdRsp {
    pub base: VdrmCcmdRsp,
    pub ret: i32,
}

/* AMDXDNA_CCMD_INIT */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdInitReq {
    pub hdr: VdrmCcmdReq,
    pub rsp_res_id: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_CREATE_BO */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdCreateBoReq {
    pub hdr: VdrmCcmdReq,
    pub res_id: u32,
    pub bo_type: u32,
    pub size: u64,
    pub map_align: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdCreateBoRsp {
    pub res: AmdxdnaCcmdRsp,
    pub xdna_addr: u64,
    pub handle: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_DESTROY_BO */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdDestroyBoReq {
    pub hdr: VdrmCcmdReq,
    pub handle: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_CREATE_CTX */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdCreateCtxReq {
    pub hdr: VdrmCcmdReq,
    pub qos_info: amdxdna_qos_info,
    pub max_opc: u32,
    pub num_tiles: u32,
    pub mem_size: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdCreateCtxRsp {
    pub res: AmdxdnaCcmdRsp,
    pub handle: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_DESTROY_CTX */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdDestroyCtxReq {
    pub hdr: VdrmCcmdReq,
    pub handle: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_CONFIG_CTX; `param_val_size` bytes of out-of-line data follow
 * the struct when non-zero, otherwise `param_val` is consumed inline. */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdConfigCtxReq {
    pub hdr: VdrmCcmdReq,
    pub handle: u32,
    pub param_type: u32,
    pub param_val: u64,
    pub param_val_size: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_EXEC_CMD; the command handles and their arguments share one
 * trailing buffer, with the arguments starting `arg_offset` bytes in. */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdExecCmdReq {
    pub hdr: VdrmCcmdReq,
    pub ctx_handle: u32,
    pub cmd_type: u32,
    pub cmd_count: u32,
    pub arg_count: u32,
    pub arg_offset: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdExecCmdRsp {
    pub res: AmdxdnaCcmdRsp,
    pub seq: u64,
}

/* AMDXDNA_CCMD_WAIT_CMD */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdWaitCmdReq {
    pub hdr: VdrmCcmdReq,
    pub seq: u64,
    pub timeout_nsec: i64,
    pub ctx_handle: u32,
    pub pad: u32,
}

/* AMDXDNA_CCMD_GET_INFO */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdGetInfoReq {
    pub hdr: VdrmCcmdReq,
    pub param: u32,
    pub size: u32,
    pub num_element: u32,
    pub info_res: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdGetInfoRsp {
    pub res: AmdxdnaCcmdRsp,
    pub size: u32,
    pub num_element: u32,
}

/* AMDXDNA_CCMD_READ_SYSFS; `node_name_len` bytes of node name follow the
 * struct. The response header is followed by `val_len` bytes of file
 * contents. */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdReadSysfsReq {
    pub hdr: VdrmCcmdReq,
    pub node_name_len: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
pub struct AmdxdnaCcmdReadSysfsRsp {
    pub res: AmdxdnaCcmdRsp,
    pub val_len: u32,
    pub pad: u32,
}
