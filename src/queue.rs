//! Shadow queue bookkeeping.
//!
//! Every guest-visible queue is backed by a pair: the guest's own ring mapped
//! into host virtual space, and a host-owned ring in DMA memory that is what
//! the controller actually sees. Queue IDs are shared between the two sides;
//! ID 0 is always the admin pair.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hub::RequestHub;
use crate::memory::{DmaBuffer, DmaPool, GuestMapping, GuestMemory, MapFlags};

/// Sentinel for a submission queue that has not been paired with a
/// completion queue yet.
pub(crate) const NO_PAIRED_COMP_QUEUE: u16 = u16::MAX;

/// NVMe initial phase bit after queue creation.
pub(crate) const INITIAL_PHASE: bool = true;

// =============================================================================
// Rings
// =============================================================================

/// Host-side ring: DMA memory handed to the controller.
pub(crate) struct HostRing {
    pub dma: DmaBuffer,
    pub n_entries: u16,
    pub entry_nbytes: usize,
}

impl HostRing {
    pub(crate) fn read_entry(&self, idx: u16, out: &mut [u8]) {
        self.dma
            .read_bytes(idx as usize * self.entry_nbytes, out);
    }

    pub(crate) fn write_entry(&self, idx: u16, data: &[u8]) {
        debug_assert!(data.len() <= self.entry_nbytes);
        self.dma.write_bytes(idx as usize * self.entry_nbytes, data);
    }
}

/// Guest-side ring: the guest's queue memory mapped into host space.
pub(crate) struct GuestRing {
    pub mapping: GuestMapping,
    pub gphys: u64,
    pub n_entries: u16,
    pub entry_nbytes: usize,
}

impl GuestRing {
    pub(crate) fn read_entry(&self, idx: u16, out: &mut [u8]) {
        self.mapping
            .read_bytes(idx as usize * self.entry_nbytes, out);
    }

    pub(crate) fn entry_offset(&self, idx: u16) -> usize {
        idx as usize * self.entry_nbytes
    }
}

/// Allocate the host ring and map the guest ring for one queue.
///
/// The host side comes from the DMA pool rounded up to at least one page;
/// the guest side is mapped for at least one page as well so short queues do
/// not produce sub-page mappings. Returns `None` when the guest address
/// cannot be mapped.
#[allow(clippy::too_many_arguments)]
pub(crate) fn init_queue_rings(
    dma: &Arc<dyn DmaPool>,
    mem: &Arc<dyn GuestMemory>,
    page_nbytes: usize,
    h_n_entries: u16,
    g_n_entries: u16,
    h_entry_nbytes: usize,
    g_entry_nbytes: usize,
    g_queue_phys: u64,
    map_flags: MapFlags,
) -> Option<(HostRing, GuestRing)> {
    let h_nbytes = (h_n_entries as usize * h_entry_nbytes).max(page_nbytes);
    let g_nbytes = (g_n_entries as usize * g_entry_nbytes).max(page_nbytes);

    let dma_buf = DmaBuffer::alloc(dma, h_nbytes);
    let mapping = mem.map(g_queue_phys, g_nbytes, map_flags)?;

    log::debug!(
        "queue rings: guest 0x{:016X} ({} x {}B), host 0x{:016X} ({} x {}B)",
        g_queue_phys,
        g_n_entries,
        g_entry_nbytes,
        dma_buf.phys(),
        h_n_entries,
        h_entry_nbytes
    );

    Some((
        HostRing {
            dma: dma_buf,
            n_entries: h_n_entries,
            entry_nbytes: h_entry_nbytes,
        },
        GuestRing {
            mapping,
            gphys: g_queue_phys,
            n_entries: g_n_entries,
            entry_nbytes: g_entry_nbytes,
        },
    ))
}

// =============================================================================
// Queues
// =============================================================================

/// Guest-fetch state of one submission queue. The host-side submission ring
/// lives in the paired hub's [`crate::hub::SubmSlot`] so ring writes and slot
/// accounting share one lock.
pub(crate) struct SubmFetch {
    pub g: GuestRing,
    /// Tail the guest last wrote to its doorbell.
    pub new_tail: u16,
    /// Tail up to which commands have been fetched.
    pub cur_tail: u16,
}

pub(crate) struct SubmQueue {
    pub id: u16,
    /// `NO_PAIRED_COMP_QUEUE` until the Create I/O SQ command names the pair.
    pub paired_cq: AtomicU16,
    pub disabled: AtomicBool,
    pub fetch: Mutex<SubmFetch>,
}

impl SubmQueue {
    pub(crate) fn new(id: u16, g: GuestRing) -> Arc<SubmQueue> {
        Arc::new(SubmQueue {
            id,
            paired_cq: AtomicU16::new(NO_PAIRED_COMP_QUEUE),
            disabled: AtomicBool::new(false),
            fetch: Mutex::new(SubmFetch {
                g,
                new_tail: 0,
                cur_tail: 0,
            }),
        })
    }

    #[inline]
    pub(crate) fn paired_comp_queue(&self) -> Option<u16> {
        match self.paired_cq.load(Ordering::Acquire) {
            NO_PAIRED_COMP_QUEUE => None,
            id => Some(id),
        }
    }

    #[inline]
    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}

/// One completion queue pair: the host ring scanned by phase bit and the
/// guest ring the core synthesises entries into.
pub(crate) struct CompInner {
    pub h: HostRing,
    pub g: GuestRing,
    /// Next host entry to examine.
    pub h_head: u16,
    /// Next guest entry to synthesise.
    pub g_head: u16,
    /// Head the guest last acknowledged through its doorbell.
    pub g_new_head: u16,
    pub h_phase: bool,
    pub g_phase: bool,
}

pub(crate) struct CompQueue {
    pub id: u16,
    pub disabled: AtomicBool,
    pub inner: Mutex<CompInner>,
}

impl CompQueue {
    pub(crate) fn new(id: u16, h: HostRing, g: GuestRing) -> Arc<CompQueue> {
        Arc::new(CompQueue {
            id,
            disabled: AtomicBool::new(false),
            inner: Mutex::new(CompInner {
                h,
                g,
                h_head: 0,
                g_head: 0,
                g_new_head: 0,
                h_phase: INITIAL_PHASE,
                g_phase: INITIAL_PHASE,
            }),
        })
    }
}

// =============================================================================
// Queue set
// =============================================================================

/// All queues and request hubs of one controller, indexed by queue ID.
///
/// The arrays start with a single (admin) entry. Once Set Features: Number of
/// Queues tells us the real maximum, they are swapped to the full size with
/// the admin entry preserved at index 0.
pub(crate) struct QueueSet {
    pub subm: Vec<Option<Arc<SubmQueue>>>,
    pub comp: Vec<Option<Arc<CompQueue>>>,
    pub hubs: Vec<Option<Arc<RequestHub>>>,
    pub max_n_subm: u16,
    pub max_n_comp: u16,
}

impl QueueSet {
    pub(crate) fn new() -> QueueSet {
        QueueSet {
            subm: vec![None],
            comp: vec![None],
            hubs: vec![None],
            max_n_subm: 0,
            max_n_comp: 0,
        }
    }

    pub(crate) fn subm_queue(&self, id: u16) -> Option<Arc<SubmQueue>> {
        self.subm.get(id as usize).and_then(|q| q.clone())
    }

    pub(crate) fn comp_queue(&self, id: u16) -> Option<Arc<CompQueue>> {
        self.comp.get(id as usize).and_then(|q| q.clone())
    }

    pub(crate) fn hub(&self, comp_queue_id: u16) -> Option<Arc<RequestHub>> {
        self.hubs.get(comp_queue_id as usize).and_then(|h| h.clone())
    }

    /// Hub owning requests of a submission queue, via its paired completion
    /// queue.
    pub(crate) fn hub_for_subm(&self, subm_queue_id: u16) -> Option<Arc<RequestHub>> {
        let sq = self.subm_queue(subm_queue_id)?;
        self.hub(sq.paired_comp_queue()?)
    }

    /// Swap to full-size arrays, keeping the admin entries.
    pub(crate) fn set_max_n_queues(&mut self, max_n_subm: u16, max_n_comp: u16) {
        let n = max_n_subm.max(max_n_comp) as usize + 1;
        let mut subm: Vec<Option<Arc<SubmQueue>>> = vec![None; n];
        let mut comp: Vec<Option<Arc<CompQueue>>> = vec![None; n];
        let mut hubs: Vec<Option<Arc<RequestHub>>> = vec![None; n];
        subm[0] = self.subm[0].take();
        comp[0] = self.comp[0].take();
        hubs[0] = self.hubs[0].take();
        self.subm = subm;
        self.comp = comp;
        self.hubs = hubs;
        self.max_n_subm = max_n_subm;
        self.max_n_comp = max_n_comp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EmulatedMemory;

    #[test]
    fn queue_set_swap_preserves_admin() {
        let mem = EmulatedMemory::new(1 << 20, 1 << 20);
        let dma: Arc<dyn DmaPool> = mem.clone();
        let gmem: Arc<dyn GuestMemory> = mem.clone();

        let (_h, g) =
            init_queue_rings(&dma, &gmem, 4096, 64, 64, 64, 64, 0x1000, MapFlags::READ).unwrap();
        let mut set = QueueSet::new();
        set.subm[0] = Some(SubmQueue::new(0, g));
        set.hubs[0] = Some(Arc::new(RequestHub::new()));

        set.set_max_n_queues(8, 8);
        assert_eq!(set.subm.len(), 9);
        assert!(set.subm_queue(0).is_some());
        assert!(set.hub(0).is_some());
        assert!(set.subm_queue(1).is_none());
        assert_eq!(set.max_n_subm, 8);
    }

    #[test]
    fn host_ring_rounds_to_page() {
        let mem = EmulatedMemory::new(1 << 20, 1 << 20);
        let dma: Arc<dyn DmaPool> = mem.clone();
        let gmem: Arc<dyn GuestMemory> = mem.clone();
        let (h, g) =
            init_queue_rings(&dma, &gmem, 4096, 4, 4, 16, 16, 0x2000, MapFlags::WRITE).unwrap();
        assert!(h.dma.len() >= 4096);
        assert!(g.mapping.len() >= 4096);
    }
}
