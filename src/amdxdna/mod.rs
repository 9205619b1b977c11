// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The amdxdna component type, which translates guest compute commands into
//! ioctls against the host's amdxdna DRM device.

mod amdxdna;
mod amdxdna_bindings;
mod amdxdna_bo;
mod amdxdna_hwctx;
mod amdxdna_protocol;

pub use amdxdna::Vxdna;
pub use amdxdna::VxdnaContext;
