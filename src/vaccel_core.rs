// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vaccel_core: the process-wide device registry plus the table, resource and
//! fence building blocks shared by the renderer.

use std::cmp::min;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ptr::copy_nonoverlapping;
use std::sync::Arc;

use log::error;

use crate::amdxdna::Vxdna;
use crate::sync::Mutex;
use crate::vaccel_os::RawDescriptor;
use crate::vaccel_os::DEFAULT_RAW_DESCRIPTOR;
use crate::vaccel_utils::VaccelCallbacks;
use crate::vaccel_utils::VaccelError;
use crate::vaccel_utils::VaccelIovec;
use crate::vaccel_utils::VaccelResult;
use crate::vaccel_utils::VACCEL_CAPSET_AMDXDNA;

/// Thread-safe table from a scalar key to a refcounted entry.
///
/// An entry obtained through `lookup` stays alive after `erase` removes its
/// key; it is destroyed when the last outstanding handle drops.
pub struct VaccelMap<K, V> {
    map: Mutex<BTreeMap<K, Arc<V>>>,
}

impl<K: Ord + Copy, V> VaccelMap<K, V> {
    pub fn new() -> VaccelMap<K, V> {
        VaccelMap {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, key: K) -> Option<Arc<V>> {
        self.map.lock().get(&key).cloned()
    }

    /// Inserts `value` under `key`. Returns false (leaving the table
    /// unchanged) when the key is already present.
    pub fn insert(&self, key: K, value: Arc<V>) -> bool {
        match self.map.lock().entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Removes `key`, handing the entry back so the caller decides where the
    /// final drop happens (never under the table lock).
    pub fn erase(&self, key: K) -> Option<Arc<V>> {
        self.map.lock().remove(&key)
    }

    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.map.lock());
        drop(entries);
    }

    pub fn retain<F: FnMut(&K, &mut Arc<V>) -> bool>(&self, f: F) {
        self.map.lock().retain(f)
    }

    pub fn any<F: FnMut(&Arc<V>) -> bool>(&self, mut f: F) -> bool {
        self.map.lock().values().any(|v| f(v))
    }
}

impl<K: Ord + Copy, V> Default for VaccelMap<K, V> {
    fn default() -> Self {
        VaccelMap::new()
    }
}

/// Host-side view of a guest-provided buffer: an ordered list of guest memory
/// windows plus the identifiers tying it back to its owner.
pub struct VaccelResource {
    res_id: u32,
    size: u64,
    flags: u32,
    iovecs: Vec<VaccelIovec>,
    ctx_id: u32,
    opaque_handle: RawDescriptor,
}

// SAFETY: the iovec windows point into guest memory that the VMM keeps mapped
// for as long as the resource is alive, and positional reads/writes only copy
// bytes through those windows.
unsafe impl Send for VaccelResource {}
// SAFETY: see the `Send` impl.
unsafe impl Sync for VaccelResource {}

impl VaccelResource {
    pub fn new(
        res_id: u32,
        size: u64,
        flags: u32,
        iovecs: Vec<VaccelIovec>,
        ctx_id: u32,
    ) -> VaccelResource {
        VaccelResource {
            res_id,
            size,
            flags,
            iovecs,
            ctx_id,
            opaque_handle: DEFAULT_RAW_DESCRIPTOR,
        }
    }

    pub fn res_id(&self) -> u32 {
        self.res_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn opaque_handle(&self) -> RawDescriptor {
        self.opaque_handle
    }

    pub fn iovecs(&self) -> &[VaccelIovec] {
        &self.iovecs
    }

    /// Copies `buf` into the resource starting at `offset`, walking the iovec
    /// list linearly. Bytes that fit are written even when the copy overruns
    /// the final window, in which case the call fails with `Invalid`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> VaccelResult<usize> {
        let mut offset = usize::try_from(offset)?;
        let mut written = 0;
        for iov in &self.iovecs {
            if written == buf.len() {
                break;
            }
            if offset >= iov.len {
                offset -= iov.len;
                continue;
            }
            let len = min(buf.len() - written, iov.len - offset);
            // SAFETY: the window is valid for `iov.len` bytes per the VMM
            // contract and `offset + len` stays within it.
            unsafe {
                copy_nonoverlapping(
                    buf[written..].as_ptr(),
                    (iov.base as *mut u8).add(offset),
                    len,
                );
            }
            written += len;
            offset = 0;
        }
        if written < buf.len() {
            error!(
                "res {}: write overruns iovec list, {} bytes left after writing {}",
                self.res_id,
                buf.len() - written,
                written
            );
            return Err(VaccelError::Invalid);
        }
        Ok(written)
    }

    /// Copies bytes out of the resource starting at `offset` into `buf`.
    /// Fails with `Invalid` when fewer than `buf.len()` bytes are available
    /// past `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VaccelResult<usize> {
        let mut offset = usize::try_from(offset)?;
        let mut read = 0;
        for iov in &self.iovecs {
            if read == buf.len() {
                break;
            }
            if offset >= iov.len {
                offset -= iov.len;
                continue;
            }
            let len = min(buf.len() - read, iov.len - offset);
            // SAFETY: the window is valid for `iov.len` bytes per the VMM
            // contract and `offset + len` stays within it.
            unsafe {
                copy_nonoverlapping(
                    (iov.base as *const u8).add(offset),
                    buf[read..].as_mut_ptr(),
                    len,
                );
            }
            read += len;
            offset = 0;
        }
        if read < buf.len() {
            error!(
                "res {}: read overruns iovec list, {} bytes left after reading {}",
                self.res_id,
                buf.len() - read,
                read
            );
            return Err(VaccelError::Invalid);
        }
        Ok(read)
    }
}

/// Process-wide table of live devices, keyed by the VMM-supplied cookie.
pub struct VaccelRegistry {
    devices: Mutex<BTreeMap<u64, Arc<Vxdna>>>,
}

static DEVICE_REGISTRY: VaccelRegistry = VaccelRegistry::new();

/// Returns the registry shared by every caller in this process.
pub fn registry() -> &'static VaccelRegistry {
    &DEVICE_REGISTRY
}

impl VaccelRegistry {
    const fn new() -> VaccelRegistry {
        VaccelRegistry {
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Creates a device for `cookie`. Exactly one of two racing creates for
    /// the same cookie succeeds; the other observes `AlreadyExists`.
    pub fn create(
        &self,
        cookie: u64,
        capset_id: u32,
        callbacks: VaccelCallbacks,
    ) -> VaccelResult<()> {
        if capset_id != VACCEL_CAPSET_AMDXDNA {
            error!("unsupported capset id {}", capset_id);
            return Err(VaccelError::Invalid);
        }
        match self.devices.lock().entry(cookie) {
            Entry::Occupied(_) => {
                error!("device already exists for cookie {:#x}", cookie);
                Err(VaccelError::AlreadyExists)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Vxdna::new(cookie, capset_id, callbacks)));
                Ok(())
            }
        }
    }

    /// Looks up the device for `cookie`; the returned handle extends the
    /// device's lifetime until dropped.
    pub fn lookup(&self, cookie: u64) -> VaccelResult<Arc<Vxdna>> {
        self.devices
            .lock()
            .get(&cookie)
            .cloned()
            .ok_or(VaccelError::NoDevice)
    }

    /// Removes the device for `cookie`; a no-op when absent. The device tears
    /// down synchronously here unless other handles are still outstanding.
    pub fn destroy(&self, cookie: u64) {
        let device = self.devices.lock().remove(&cookie);
        // Dropped outside the registry lock: device teardown joins fence
        // pollers.
        drop(device);
    }

    /// Drops every registered device.
    pub fn clear(&self) {
        let devices = std::mem::take(&mut *self.devices.lock());
        drop(devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vaccel_os::DEFAULT_RAW_DESCRIPTOR;

    fn test_callbacks() -> VaccelCallbacks {
        VaccelCallbacks::new(|_| DEFAULT_RAW_DESCRIPTOR, |_, _, _, _| {})
    }

    #[test]
    fn create_destroy_roundtrip() {
        let cookie = 0xc0ffee;
        registry()
            .create(cookie, VACCEL_CAPSET_AMDXDNA, test_callbacks())
            .unwrap();
        assert!(matches!(
            registry().create(cookie, VACCEL_CAPSET_AMDXDNA, test_callbacks()),
            Err(VaccelError::AlreadyExists)
        ));
        registry().destroy(cookie);
        registry()
            .create(cookie, VACCEL_CAPSET_AMDXDNA, test_callbacks())
            .unwrap();
        registry().destroy(cookie);
        assert!(matches!(
            registry().lookup(cookie),
            Err(VaccelError::NoDevice)
        ));
    }

    #[test]
    fn create_rejects_foreign_capset() {
        assert!(matches!(
            registry().create(0xdead, 17, test_callbacks()),
            Err(VaccelError::Invalid)
        ));
    }

    #[test]
    fn lookup_extends_device_lifetime() {
        let cookie = 0xfeed01;
        registry()
            .create(cookie, VACCEL_CAPSET_AMDXDNA, test_callbacks())
            .unwrap();
        let device = registry().lookup(cookie).unwrap();
        registry().destroy(cookie);
        // The handle obtained before destroy still works.
        let (version, _) = device.get_capset_info();
        assert_eq!(version, 1);
    }

    #[test]
    fn resource_write_read_roundtrip() {
        let mut backing = vec![0u8; 64];
        let iovecs = vec![VaccelIovec {
            base: backing.as_mut_ptr() as *mut _,
            len: backing.len(),
        }];
        let res = VaccelResource::new(1, 64, 0, iovecs, 0);
        let pattern: Vec<u8> = (0..48).collect();
        assert_eq!(res.write(8, &pattern).unwrap(), 48);
        let mut readback = vec![0u8; 48];
        assert_eq!(res.read(8, &mut readback).unwrap(), 48);
        assert_eq!(readback, pattern);
    }

    #[test]
    fn resource_write_spans_iovecs() {
        let mut first = vec![0u8; 16];
        let mut second = vec![0u8; 16];
        let iovecs = vec![
            VaccelIovec {
                base: first.as_mut_ptr() as *mut _,
                len: first.len(),
            },
            VaccelIovec {
                base: second.as_mut_ptr() as *mut _,
                len: second.len(),
            },
        ];
        let res = VaccelResource::new(2, 32, 0, iovecs, 0);
        let pattern = [0xabu8; 20];
        assert_eq!(res.write(10, &pattern).unwrap(), 20);
        assert_eq!(&first[10..], &pattern[..6]);
        assert_eq!(&second[..14], &pattern[6..]);
    }

    #[test]
    fn resource_write_out_of_bounds_is_partial() {
        let mut backing = vec![0u8; 64];
        let iovecs = vec![VaccelIovec {
            base: backing.as_mut_ptr() as *mut _,
            len: backing.len(),
        }];
        let res = VaccelResource::new(3, 64, 0, iovecs, 0);
        let buf = [0x5au8; 16];
        assert!(matches!(res.write(60, &buf), Err(VaccelError::Invalid)));
        // The four bytes that fit were still written.
        assert_eq!(&backing[60..], &[0x5a; 4]);
        assert_eq!(backing[59], 0);
    }

    #[test]
    fn map_entries_survive_erase() {
        let map: VaccelMap<u32, String> = VaccelMap::new();
        assert!(map.insert(1, Arc::new("one".to_owned())));
        assert!(!map.insert(1, Arc::new("dup".to_owned())));
        let held = map.lookup(1).unwrap();
        let erased = map.erase(1).unwrap();
        assert!(map.lookup(1).is_none());
        assert_eq!(*held, "one");
        drop(erased);
        assert_eq!(*held, "one");
    }
}
