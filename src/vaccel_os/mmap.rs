// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The mmap module provides a safe interface to mmap memory and ensures unmap
//! is called when the mmap object leaves scope.

use std::io;
use std::ptr::null_mut;

use libc::c_void;
use log::warn;

use crate::vaccel_os::AsRawDescriptor;
use crate::vaccel_utils::last_kernel_error;
use crate::vaccel_utils::VaccelError;
use crate::vaccel_utils::VaccelResult;

/// Wraps a shared mapping of a device file in the current process. Provides
/// RAII semantics including munmap when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: accessing that pointer is only done through the stateless interface
// which allows the object to be shared by multiple threads without a decrease
// in safety.
unsafe impl Send for MemoryMapping {}
// SAFETY: see the `Send` impl.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps `size` bytes of `fd` starting at `offset` as a shared, locked
    /// read/write mapping.
    pub fn from_descriptor(
        fd: &dyn AsRawDescriptor,
        size: usize,
        offset: u64,
    ) -> VaccelResult<MemoryMapping> {
        let off = libc::off_t::try_from(offset)?;
        if size == 0 {
            return Err(VaccelError::Invalid);
        }
        // SAFETY: the kernel picks the placement and the resulting region is
        // solely owned by this object.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED,
                fd.as_raw_descriptor(),
                off,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(last_kernel_error());
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Maps `size` bytes of `fd` at `offset` so that the mapping starts on an
    /// `align`-byte boundary.
    ///
    /// mmap itself only guarantees page alignment, so this reserves
    /// `size + align` bytes of anonymous memory, maps the descriptor with
    /// `MAP_FIXED` at the first aligned address inside the reservation, and
    /// returns the fragments of the reservation outside the aligned window to
    /// the kernel.
    pub fn from_descriptor_aligned(
        fd: &dyn AsRawDescriptor,
        size: usize,
        offset: u64,
        align: u64,
    ) -> VaccelResult<MemoryMapping> {
        if align == 0 {
            return MemoryMapping::from_descriptor(fd, size, offset);
        }
        let align = usize::try_from(align)?;
        if !align.is_power_of_two() || size == 0 {
            return Err(VaccelError::Invalid);
        }
        let off = libc::off_t::try_from(offset)?;
        let reserve_size = size.checked_add(align).ok_or(VaccelError::Invalid)?;
        // SAFETY: reserving anonymous memory with no protection cannot clobber
        // existing mappings.
        let reserve = unsafe {
            libc::mmap(
                null_mut(),
                reserve_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserve == libc::MAP_FAILED {
            return Err(last_kernel_error());
        }
        let reserve_addr = reserve as usize;
        let aligned_addr = (reserve_addr + align - 1) & !(align - 1);
        // SAFETY: [aligned_addr, aligned_addr + size) lies inside the
        // reservation this function just created, so MAP_FIXED replaces only
        // memory owned here.
        let mapped = unsafe {
            libc::mmap(
                aligned_addr as *mut c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_FIXED,
                fd.as_raw_descriptor(),
                off,
            )
        };
        if mapped == libc::MAP_FAILED {
            // SAFETY: the reservation belongs to this function.
            unsafe {
                libc::munmap(reserve, reserve_size);
            }
            return Err(VaccelError::KernelError(-libc::EFAULT));
        }
        let front = aligned_addr - reserve_addr;
        if front > 0 {
            // SAFETY: the front fragment is the unused start of the
            // reservation.
            unsafe {
                libc::munmap(reserve, front);
            }
        }
        let back = reserve_addr + reserve_size - (aligned_addr + size);
        if back > 0 {
            // SAFETY: the back fragment is the unused tail of the reservation.
            unsafe {
                libc::munmap((aligned_addr + size) as *mut c_void, back);
            }
        }
        Ok(MemoryMapping {
            addr: aligned_addr as *mut u8,
            size,
        })
    }

    /// Returns a pointer to the beginning of the memory region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the size of the memory region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: this object owns the mapped region.
        let ret = unsafe { libc::munmap(self.addr as *mut c_void, self.size) };
        if ret < 0 {
            warn!(
                "failed to munmap {} bytes at {:p}: {}",
                self.size,
                self.addr,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn page_file() -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0xa5u8; 4096]).unwrap();
        file
    }

    #[test]
    fn plain_mapping_roundtrip() {
        let file = page_file();
        let mapping = MemoryMapping::from_descriptor(&file, 4096, 0).unwrap();
        assert_eq!(mapping.size(), 4096);
        // SAFETY: the mapping covers 4096 bytes of the file.
        assert_eq!(unsafe { *mapping.as_ptr() }, 0xa5);
    }

    #[test]
    fn aligned_mapping_is_aligned() {
        let file = page_file();
        let mapping = MemoryMapping::from_descriptor_aligned(&file, 4096, 0, 16384).unwrap();
        assert_eq!(mapping.as_ptr() as usize % 16384, 0);
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        let file = page_file();
        assert!(matches!(
            MemoryMapping::from_descriptor_aligned(&file, 4096, 0, 3),
            Err(VaccelError::Invalid)
        ));
    }
}
