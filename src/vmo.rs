//! Shared memory buffers ("VMOs") and the fixed-size registry that hands out their ids.
//!
//! A session's data and descriptor VMOs are anonymous, page-aligned shared mappings, the same way
//! an AF_XDP socket binding backs its fill/completion/rx/tx rings with raw `mmap`/`munmap`. Here
//! there is no kernel fd to back the mapping — the "VMO" is purely a framework-local shared
//! buffer — so `MAP_ANONYMOUS` replaces the fd-backed mapping.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::status::{Result, Status};

/// A single shared, page-aligned, anonymous memory region.
///
/// Cloning a [`Vmo`] yields a second handle to the *same* backing pages (reference-counted), which
/// is what lets the framework and a device implementation both map a session's data VMO.
pub struct Vmo {
    inner: std::sync::Arc<Mapping>,
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is never unmapped while any `Vmo` handle referencing it exists (enforced by
// `Arc` refcounting in `Drop` below), and callers are responsible for the same non-aliasing
// discipline the descriptor protocol already requires (shared-resource
// discipline).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Vmo {
    /// Creates a new anonymous shared mapping of at least `len` bytes.
    pub fn create(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Status::InvalidArgs);
        }
        // SAFETY: MAP_ANONYMOUS with a null fd and zero offset is always a well-formed mmap
        // request; we check the sentinel return value below.
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Status::NoMemory);
        }
        let ptr = NonNull::new(addr as *mut u8).ok_or(Status::NoMemory)?;
        Ok(Vmo {
            inner: std::sync::Arc::new(Mapping { ptr, len }),
        })
    }

    /// The mapping's length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the mapping is empty (never true for a successfully created [`Vmo`]).
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Copies `src` into the mapping at `offset`.
    ///
    /// Returns [`Status::OutOfRange`] if `offset + src.len()` exceeds the mapping's length.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let region = self.bounds_check(offset, src.len())?;
        // SAFETY: `region` was bounds-checked against the mapping above, and the pointer is valid
        // for the mapping's lifetime.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), region, src.len());
        }
        Ok(())
    }

    /// Copies `len` bytes starting at `offset` into `dst`.
    ///
    /// Returns [`Status::OutOfRange`] if `offset + len` exceeds the mapping's length.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let region = self.bounds_check(offset, dst.len())?;
        // SAFETY: see `write`.
        unsafe {
            core::ptr::copy_nonoverlapping(region, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copies `len` bytes from `(self, src_offset)` to `(dst, dst_offset)`.
    ///
    /// The two VMOs may be the same or different mappings; regions may not overlap.
    pub fn copy_to(&self, src_offset: u64, dst: &Vmo, dst_offset: u64, len: usize) -> Result<()> {
        let src_region = self.bounds_check(src_offset, len)?;
        let dst_region = dst.bounds_check(dst_offset, len)?;
        // SAFETY: both regions bounds-checked above; overlap is a caller contract violation (the
        // descriptor protocol never aliases a held region with another session's), mirrored by
        // `copy_nonoverlapping`'s own precondition.
        unsafe {
            core::ptr::copy_nonoverlapping(src_region, dst_region, len);
        }
        Ok(())
    }

    fn bounds_check(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let offset = usize::try_from(offset).map_err(|_| Status::OutOfRange)?;
        let end = offset.checked_add(len).ok_or(Status::OutOfRange)?;
        if end > self.inner.len {
            return Err(Status::OutOfRange);
        }
        // SAFETY: `offset` is within `[0, self.inner.len]` by the check above.
        Ok(unsafe { self.inner.ptr.as_ptr().add(offset) })
    }
}

impl Clone for Vmo {
    fn clone(&self) -> Self {
        Vmo {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: this is the last reference to the mapping (Arc guarantees it), `ptr`/`len` are
        // exactly what was passed to the matching `mmap` call.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Sentinel `vmo_id` meaning "no VMO registered" (one past the last valid slot).
pub const INVALID_VMO_ID: u8 = u8::MAX;

/// Fixed-size registry mapping small integer ids to registered [`Vmo`]s.
///
/// Capacity is bounded by `u8`, matching the wire-level `vmo_id` field width.
pub struct VmoStore {
    slots: spin::RwLock<Vec<Option<Vmo>>>,
    registered: AtomicUsize,
}

impl VmoStore {
    /// Creates a store with room for `capacity` simultaneously registered VMOs.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > INVALID_VMO_ID as usize {
            return Err(Status::InvalidArgs);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(VmoStore {
            slots: spin::RwLock::new(slots),
            registered: AtomicUsize::new(0),
        })
    }

    /// Registers `vmo`, returning the id it was assigned.
    pub fn register(&self, vmo: Vmo) -> Result<u8> {
        let mut slots = self.slots.write();
        let id = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Status::NoResources)?;
        slots[id] = Some(vmo);
        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(id as u8)
    }

    /// Removes and returns the VMO registered under `id`.
    pub fn unregister(&self, id: u8) -> Result<Vmo> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id as usize).ok_or(Status::OutOfRange)?;
        let vmo = slot.take().ok_or(Status::NotFound)?;
        self.registered.fetch_sub(1, Ordering::Relaxed);
        Ok(vmo)
    }

    /// Looks up the VMO registered under `id`, if any.
    pub fn get(&self, id: u8) -> Result<Vmo> {
        let slots = self.slots.read();
        slots
            .get(id as usize)
            .and_then(|slot| slot.clone())
            .ok_or(Status::NotFound)
    }

    /// The number of currently registered VMOs.
    pub fn count(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let vmo = Vmo::create(4096).unwrap();
        vmo.write(100, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        vmo.read(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_rejected() {
        let vmo = Vmo::create(16).unwrap();
        assert_eq!(vmo.write(10, &[0u8; 16]).unwrap_err(), Status::OutOfRange);
    }

    #[test]
    fn copy_between_vmos() {
        let a = Vmo::create(64).unwrap();
        let b = Vmo::create(64).unwrap();
        a.write(0, b"hello").unwrap();
        a.copy_to(0, &b, 8, 5).unwrap();
        let mut out = [0u8; 5];
        b.read(8, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn store_register_unregister() {
        let store = VmoStore::new(2).unwrap();
        let id_a = store.register(Vmo::create(4096).unwrap()).unwrap();
        let id_b = store.register(Vmo::create(4096).unwrap()).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(store.count(), 2);
        assert_eq!(
            store.register(Vmo::create(4096).unwrap()).unwrap_err(),
            Status::NoResources
        );
        store.unregister(id_a).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.unregister(id_a).unwrap_err(), Status::NotFound);
        let _ = id_b;
    }
}
