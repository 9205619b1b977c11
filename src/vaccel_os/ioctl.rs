// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Macros and helpers for issuing ioctls.

use std::mem::size_of;
use std::os::raw::c_int;
use std::os::raw::c_ulong;
use std::os::raw::c_void;

use crate::vaccel_os::AsRawDescriptor;

pub type IoctlNr = c_ulong;

const _IOC_NRSHIFT: c_ulong = 0;
const _IOC_TYPESHIFT: c_ulong = 8;
const _IOC_SIZESHIFT: c_ulong = 16;
const _IOC_DIRSHIFT: c_ulong = 30;

const _IOC_WRITE: c_ulong = 1;
const _IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, ty: c_ulong, nr: c_ulong, size: c_ulong) -> IoctlNr {
    (dir << _IOC_DIRSHIFT) | (ty << _IOC_TYPESHIFT) | (nr << _IOC_NRSHIFT) | (size << _IOC_SIZESHIFT)
}

/// Computes an ioctl number for a write-only ioctl carrying a `T`.
pub const fn iow<T>(ty: c_ulong, nr: c_ulong) -> IoctlNr {
    ioc(_IOC_WRITE, ty, nr, size_of::<T>() as c_ulong)
}

/// Computes an ioctl number for a read-write ioctl carrying a `T`.
pub const fn iowr<T>(ty: c_ulong, nr: c_ulong) -> IoctlNr {
    ioc(_IOC_READ | _IOC_WRITE, ty, nr, size_of::<T>() as c_ulong)
}

/// Runs an ioctl with an immutable reference.
/// # Safety
/// The caller is responsible for determining the safety of the particular
/// ioctl.
pub unsafe fn ioctl_with_ref<T>(descriptor: &dyn AsRawDescriptor, nr: IoctlNr, arg: &T) -> c_int {
    libc::ioctl(
        descriptor.as_raw_descriptor(),
        nr,
        arg as *const T as *const c_void,
    )
}

/// Runs an ioctl with a mutable reference.
/// # Safety
/// The caller is responsible for determining the safety of the particular
/// ioctl.
pub unsafe fn ioctl_with_mut_ref<T>(
    descriptor: &dyn AsRawDescriptor,
    nr: IoctlNr,
    arg: &mut T,
) -> c_int {
    libc::ioctl(
        descriptor.as_raw_descriptor(),
        nr,
        arg as *mut T as *mut c_void,
    )
}
