//! Memory plumbing for the shadow-queue engine.
//!
//! The core consumes two seams from the surrounding hypervisor: a guest
//! physical memory mapper (queue rings and data buffers the guest owns) and a
//! DMA pool for host-owned queue memory and scratch pages the controller will
//! DMA into. Both are traits so the PCI/IOMMU layer can provide the real
//! thing; `EmulatedMemory` is a flat in-process backend in the spirit of the
//! QEMU-style single-allocation physical memory used for hosted testing.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The core supports the 4096-byte controller memory page size only.
pub const PAGE_NBYTES: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Maximum pages reachable through one PRP list chain the core will build.
pub const PRP_MAX_N_PAGES: usize = 512;

/// Store fence: all prior stores to queue memory must be globally visible
/// before a doorbell write or a completion status-word store.
#[inline]
pub fn store_fence() {
    fence(Ordering::SeqCst);
}

#[inline]
pub(crate) fn round_up_page(nbytes: usize) -> usize {
    (nbytes + PAGE_NBYTES - 1) & !(PAGE_NBYTES - 1)
}

bitflags::bitflags! {
    /// Access flags for guest physical mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

// =============================================================================
// Guest physical memory
// =============================================================================

/// Maps guest physical ranges into host virtual space. Mappings are scoped:
/// dropping the returned [`GuestMapping`] releases the range.
pub trait GuestMemory: Send + Sync {
    fn map(&self, gphys: u64, nbytes: usize, flags: MapFlags) -> Option<GuestMapping>;
}

/// A mapped guest physical range.
pub struct GuestMapping {
    ptr: NonNull<u8>,
    nbytes: usize,
    writable: bool,
}

// The mapping points at guest RAM which the guest mutates concurrently; all
// access goes through the byte-copy methods below.
unsafe impl Send for GuestMapping {}
unsafe impl Sync for GuestMapping {}

impl GuestMapping {
    /// # Safety
    ///
    /// `ptr` must stay valid for `nbytes` bytes for the mapping's lifetime.
    pub unsafe fn from_raw(ptr: *mut u8, nbytes: usize, writable: bool) -> Self {
        Self {
            ptr: NonNull::new(ptr).expect("null guest mapping"),
            nbytes,
            writable,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nbytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.nbytes);
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(self.writable, "write through a read-only guest mapping");
        assert!(offset + data.len() <= self.nbytes);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
    }

    pub fn fill(&self, offset: usize, value: u8, nbytes: usize) {
        assert!(self.writable, "memset through a read-only guest mapping");
        assert!(offset + nbytes <= self.nbytes);
        unsafe {
            core::ptr::write_bytes(self.ptr.as_ptr().add(offset), value, nbytes);
        }
    }

    pub(crate) fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_bytes(offset, &mut bytes);
        u64::from_le_bytes(bytes)
    }
}

// =============================================================================
// DMA pool
// =============================================================================

/// Host-side DMA allocator. Returned memory is zeroed, page aligned and
/// physically contiguous; the physical address is what goes into hardware
/// registers and PRP entries.
pub trait DmaPool: Send + Sync {
    fn alloc_raw(&self, nbytes: usize) -> (NonNull<u8>, u64);
    fn free_raw(&self, ptr: NonNull<u8>, phys: u64, nbytes: usize);
}

/// An owned DMA allocation, released back to its pool on drop.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    phys: u64,
    nbytes: usize,
    pool: Arc<dyn DmaPool>,
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `nbytes` (rounded up to whole pages, at least one page).
    pub fn alloc(pool: &Arc<dyn DmaPool>, nbytes: usize) -> DmaBuffer {
        let nbytes = round_up_page(nbytes.max(1));
        let (ptr, phys) = pool.alloc_raw(nbytes);
        DmaBuffer {
            ptr,
            phys,
            nbytes,
            pool: Arc::clone(pool),
        }
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.phys
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nbytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    /// Physical address of the idx-th page of the allocation.
    #[inline]
    pub fn phys_page(&self, idx: usize) -> u64 {
        debug_assert!(idx * PAGE_NBYTES < self.nbytes);
        self.phys + (idx * PAGE_NBYTES) as u64
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.nbytes);
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.nbytes);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.nbytes) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.nbytes) }
    }

    pub(crate) fn write_u64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.pool.free_raw(self.ptr, self.phys, self.nbytes);
    }
}

// =============================================================================
// Emulated flat physical memory
// =============================================================================

/// A flat emulated physical address space backing both guest RAM and the
/// host DMA pool, so an emulated device and the core observe the same bytes.
///
/// Layout: `[0, dma_base)` is guest-visible RAM, `[dma_base, nbytes)` is the
/// DMA region. The DMA region is a bump allocator; freed ranges are not
/// recycled, which is fine for tests and short-lived tools.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    nbytes: usize,
    dma_base: usize,
    dma_next: Mutex<usize>,
}

unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// `ram_nbytes` of guest RAM plus `dma_nbytes` of DMA pool, both rounded
    /// up to page multiples.
    pub fn new(ram_nbytes: usize, dma_nbytes: usize) -> Arc<EmulatedMemory> {
        let ram_nbytes = round_up_page(ram_nbytes);
        let dma_nbytes = round_up_page(dma_nbytes);
        let nbytes = ram_nbytes + dma_nbytes;
        let layout = Layout::from_size_align(nbytes, PAGE_NBYTES).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).expect("emulated memory allocation failed");
        Arc::new(EmulatedMemory {
            base,
            nbytes,
            dma_base: ram_nbytes,
            dma_next: Mutex::new(ram_nbytes),
        })
    }

    #[inline]
    pub fn ram_nbytes(&self) -> usize {
        self.dma_base
    }

    fn check_range(&self, phys: u64, nbytes: usize) {
        assert!(
            (phys as usize) + nbytes <= self.nbytes,
            "phys access out of emulated memory: {:#x}+{:#x}",
            phys,
            nbytes
        );
    }

    /// Device-side access: read raw bytes at a physical address.
    pub fn read_phys(&self, phys: u64, out: &mut [u8]) {
        self.check_range(phys, out.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(phys as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// Device-side access: write raw bytes at a physical address.
    pub fn write_phys(&self, phys: u64, data: &[u8]) {
        self.check_range(phys, data.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(phys as usize),
                data.len(),
            );
        }
    }
}

impl GuestMemory for EmulatedMemory {
    fn map(&self, gphys: u64, nbytes: usize, flags: MapFlags) -> Option<GuestMapping> {
        if (gphys as usize) + nbytes > self.nbytes {
            return None;
        }
        let ptr = unsafe { self.base.as_ptr().add(gphys as usize) };
        Some(unsafe { GuestMapping::from_raw(ptr, nbytes, flags.contains(MapFlags::WRITE)) })
    }
}

impl DmaPool for EmulatedMemory {
    fn alloc_raw(&self, nbytes: usize) -> (NonNull<u8>, u64) {
        let nbytes = round_up_page(nbytes);
        let mut next = self.dma_next.lock();
        assert!(*next + nbytes <= self.nbytes, "emulated DMA pool exhausted");
        let phys = *next as u64;
        *next += nbytes;
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(phys as usize)) };
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, nbytes) };
        (ptr, phys)
    }

    fn free_raw(&self, _ptr: NonNull<u8>, _phys: u64, _nbytes: usize) {}
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.nbytes, PAGE_NBYTES).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dma_pool(mem: &Arc<EmulatedMemory>) -> Arc<dyn DmaPool> {
        Arc::clone(mem) as Arc<dyn DmaPool>
    }

    #[test]
    fn dma_alloc_is_page_aligned_and_zeroed() {
        let mem = EmulatedMemory::new(1 << 20, 1 << 20);
        let pool = dma_pool(&mem);
        let buf = DmaBuffer::alloc(&pool, 100);
        assert_eq!(buf.len(), PAGE_NBYTES);
        assert_eq!(buf.phys() % PAGE_NBYTES as u64, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn dma_and_phys_views_agree() {
        let mem = EmulatedMemory::new(1 << 20, 1 << 20);
        let pool = dma_pool(&mem);
        let buf = DmaBuffer::alloc(&pool, PAGE_NBYTES);
        buf.write_bytes(16, &[0xAB; 4]);
        let mut out = [0u8; 4];
        mem.read_phys(buf.phys() + 16, &mut out);
        assert_eq!(out, [0xAB; 4]);
    }

    #[test]
    fn guest_mapping_bounds() {
        let mem = EmulatedMemory::new(1 << 20, 0);
        let m = mem
            .map(0x1000, 0x2000, MapFlags::READ | MapFlags::WRITE)
            .unwrap();
        m.write_bytes(0, &[1, 2, 3]);
        let mut out = [0u8; 3];
        m.read_bytes(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert!(mem.map(1 << 20, 1, MapFlags::READ).is_none());
    }

    #[test]
    #[should_panic]
    fn readonly_mapping_rejects_writes() {
        let mem = EmulatedMemory::new(1 << 20, 0);
        let m = mem.map(0, PAGE_NBYTES, MapFlags::READ).unwrap();
        m.write_bytes(0, &[0]);
    }
}
