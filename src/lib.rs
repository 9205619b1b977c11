// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for handling virtio-vaccel NPU hypercalls.

mod amdxdna;
mod sync;
mod vaccel_core;
mod vaccel_os;
mod vaccel_utils;

pub use crate::amdxdna::Vxdna;
pub use crate::amdxdna::VxdnaContext;
pub use crate::vaccel_core::*;
pub use crate::vaccel_os::RawDescriptor;
pub use crate::vaccel_utils::*;
