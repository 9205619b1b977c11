// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vaccel_os: descriptor, ioctl and memory-mapping plumbing for the renderer.

mod ioctl;
mod mmap;

pub use ioctl::*;
pub use mmap::MemoryMapping;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use crate::vaccel_utils::last_kernel_error;
use crate::vaccel_utils::VaccelError;
use crate::vaccel_utils::VaccelResult;

pub type RawDescriptor = RawFd;
pub const DEFAULT_RAW_DESCRIPTOR: RawDescriptor = -1;

/// Trait for returning the underlying raw descriptor without giving up
/// ownership of it.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

impl AsRawDescriptor for File {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

/// Wraps a borrowed raw descriptor so it can be handed to the ioctl helpers.
#[derive(Copy, Clone)]
pub struct Descriptor(pub RawDescriptor);

impl AsRawDescriptor for Descriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.0
    }
}

/// Duplicates `fd` with close-on-exec set. The caller owns the returned
/// descriptor.
pub fn dup_descriptor_cloexec(fd: RawDescriptor) -> VaccelResult<RawDescriptor> {
    if fd < 0 {
        return Err(VaccelError::Invalid);
    }
    // SAFETY: F_DUPFD_CLOEXEC allocates a new descriptor and does not touch
    // memory.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(last_kernel_error());
    }
    Ok(dup)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::unix::io::FromRawFd;

    use super::*;

    #[test]
    fn dup_rejects_invalid() {
        assert!(matches!(
            dup_descriptor_cloexec(-1),
            Err(VaccelError::Invalid)
        ));
    }

    #[test]
    fn dup_returns_new_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let dup = dup_descriptor_cloexec(file.as_raw_descriptor()).unwrap();
        assert_ne!(dup, file.as_raw_descriptor());
        // SAFETY: `dup` was just created and is owned by this test.
        drop(unsafe { File::from_raw_fd(dup) });
    }
}
