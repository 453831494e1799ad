//! Interceptor ABI and the facilities extensions build on.
//!
//! An extension installs one [`IoInterceptor`] per controller and gets a
//! chance to observe, defer, rewrite or shadow every guest I/O command, to
//! filter identify payloads, and to multiplex its own commands onto the
//! physical controller next to the guest's.
//!
//! The usual shape of an extension:
//!
//! 1. Register it with [`register_ext`] so the `ext=NAME` driver option can
//!    find it; the init function installs the interceptor with
//!    [`NvmeHost::install_interceptor`].
//! 2. `on_init` runs at the guest's first I/O doorbell. Returning
//!    [`FetchPolicy::Pause`] holds guest fetching until the extension calls
//!    [`NvmeHost::start_fetching_g_reqs`], which is how an extension that
//!    needs drive access for its own setup gets a quiet controller.
//! 3. In `on_read`/`on_write` the extension may shadow the request's buffer
//!    ([`DmaBuf`] + [`NvmeHost::set_shadow_buffer`]), copy guest data through
//!    a [`GuestBuf`], defer the request (`Request::set_pause` and later
//!    [`NvmeHost::resume_guest_request`]), and observe the completion with
//!    `Request::set_callback`.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::cmd::{self, CMD_NBYTES};
use crate::host::NvmeHost;
use crate::hub::{CompStatus, Request};
use crate::memory::{DmaBuffer, GuestMapping, MapFlags, PAGE_NBYTES, PRP_MAX_N_PAGES};
use crate::regs::VENDOR_ID_APPLE;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NvmeIoError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("controller not ready")]
    NotReady,
    #[error("nothing to do")]
    NoOperation,
    #[error("internal error")]
    Internal,
    #[error("timed out")]
    Timeout,
    #[error("I/O error reported by the controller")]
    Io,
}

pub type Result<T> = std::result::Result<T, NvmeIoError>;

/// What `on_init` wants the core to do about guest command fetching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchPolicy {
    Resume,
    Pause,
}

/// The per-controller plug-in contract. All hooks have no-op defaults; an
/// interceptor implements the ones it cares about.
#[allow(unused_variables)]
pub trait IoInterceptor: Send + Sync {
    /// First I/O-queue doorbell. [`FetchPolicy::Pause`] suspends guest
    /// fetching until the interceptor calls
    /// [`NvmeHost::start_fetching_g_reqs`].
    fn on_init(&self, host: &NvmeHost) -> FetchPolicy {
        FetchPolicy::Resume
    }

    fn on_read(&self, host: &NvmeHost, req: &mut Request, nsid: u32, lba_start: u64, n_lbas: u32) {}

    fn on_write(&self, host: &NvmeHost, req: &mut Request, nsid: u32, lba_start: u64, n_lbas: u32) {
    }

    fn on_compare(&self, host: &NvmeHost, req: &mut Request, nsid: u32, lba_start: u64, n_lbas: u32)
    {
    }

    /// Deallocate range list, already copied into a host page; may be
    /// rewritten in place. Returns the new 0-based range count for CDW10.
    fn on_data_management(
        &self,
        host: &NvmeHost,
        req: &mut Request,
        nsid: u32,
        range_buf: &mut [u8],
        n_ranges: u32,
    ) -> u32 {
        n_ranges
    }

    /// In-place filter over a 4096-byte identify payload, after the default
    /// filter.
    fn filter_identify_data(&self, nsid: u32, controller_id: u16, cns: u8, data: &mut [u8]) {}

    /// Per-doorbell fetch budget; 0 means do not fetch now.
    fn fetch_limit(&self, n_waiting_g_reqs: u32) -> u32 {
        crate::hub::DEFAULT_FETCH_LIMIT
    }

    /// Host-side depth for a new I/O queue; the guest-side depth stays what
    /// the guest asked for.
    fn io_queue_entries(&self, g_n_entries: u16, max_n_entries: u16) -> u16 {
        g_n_entries
    }

    /// Whether the submission path should poll until fetched guest requests
    /// have all been handed to the controller. Useful against firmware
    /// drivers with short command deadlines.
    fn poll_completeness(&self) -> bool {
        false
    }

    /// Called on each iteration of the completeness poll.
    fn polling_callback(&self) {}

    /// Polled before a controller reset; return true once the interceptor
    /// has no external work in flight.
    fn can_stop(&self) -> bool {
        true
    }

    /// Read once at install: serialize guest fetching across all queues.
    fn serialize_queue_fetch(&self) -> bool {
        false
    }
}

// =============================================================================
// Extension registry
// =============================================================================

pub type ExtInit = fn(&Arc<NvmeHost>) -> Result<()>;

fn registry() -> &'static StdMutex<Vec<(String, ExtInit)>> {
    static EXTENSIONS: OnceLock<StdMutex<Vec<(String, ExtInit)>>> = OnceLock::new();
    EXTENSIONS.get_or_init(|| {
        #[allow(unused_mut)]
        let mut builtin: Vec<(String, ExtInit)> = Vec::new();
        #[cfg(feature = "crypt")]
        builtin.push(("encrypt".to_string(), crate::crypt::install));
        StdMutex::new(builtin)
    })
}

/// Make an extension loadable through the `ext=NAME` driver option.
pub fn register_ext(name: &str, init: ExtInit) {
    registry().lock().unwrap().push((name.to_string(), init));
}

pub(crate) fn init_ext(host: &Arc<NvmeHost>, name: &str) {
    let init = registry()
        .lock()
        .unwrap()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, init)| *init);
    match init {
        Some(init) => {
            if let Err(err) = init(host) {
                log::error!("NVMe {} extension initialization failed: {}", name, err);
            }
        }
        None => log::error!("NVMe {} extension not found", name),
    }
}

// =============================================================================
// Guest buffers
// =============================================================================

struct GuestBufSeg {
    /// Guest physical address of this piece.
    phys: u64,
    /// Physical address of the PRP list cell naming this page, 0 when the
    /// page came straight from PRP1/PRP2.
    addr_in_list: u64,
    mapping: GuestMapping,
    nbytes: usize,
}

/// Scatter-gather view over a guest request's PRP chain, every page mapped
/// into host space.
pub struct GuestBuf {
    segs: Vec<GuestBufSeg>,
    total_nbytes: u64,
}

impl GuestBuf {
    #[inline]
    pub fn total_nbytes(&self) -> u64 {
        self.total_nbytes
    }

    fn seek(&self, mut offset: u64) -> Option<(usize, usize)> {
        for (idx, seg) in self.segs.iter().enumerate() {
            if offset < seg.nbytes as u64 {
                return Some((idx, offset as usize));
            }
            offset -= seg.nbytes as u64;
        }
        None
    }

    /// Copy guest data into `dst`, starting `offset` bytes into the chain.
    pub fn copy_from_guest(&self, dst: &mut [u8], offset: u64) -> Result<()> {
        let (mut idx, mut seg_off) = self.seek(offset).ok_or(NvmeIoError::InvalidParam)?;
        let mut done = 0usize;
        while done < dst.len() {
            let seg = self.segs.get(idx).ok_or(NvmeIoError::InvalidParam)?;
            let nbytes = (seg.nbytes - seg_off).min(dst.len() - done);
            seg.mapping.read_bytes(seg_off, &mut dst[done..done + nbytes]);
            done += nbytes;
            seg_off = 0;
            idx += 1;
        }
        Ok(())
    }

    /// Copy `src` into the guest buffer, starting `offset` bytes in.
    pub fn copy_to_guest(&self, src: &[u8], offset: u64) -> Result<()> {
        let (mut idx, mut seg_off) = self.seek(offset).ok_or(NvmeIoError::InvalidParam)?;
        let mut done = 0usize;
        while done < src.len() {
            let seg = self.segs.get(idx).ok_or(NvmeIoError::InvalidParam)?;
            let nbytes = (seg.nbytes - seg_off).min(src.len() - done);
            seg.mapping.write_bytes(seg_off, &src[done..done + nbytes]);
            done += nbytes;
            seg_off = 0;
            idx += 1;
        }
        Ok(())
    }

    /// Fill `nbytes` of the guest buffer with `value` starting at `offset`.
    pub fn fill(&self, value: u8, mut nbytes: u64, offset: u64) -> Result<()> {
        let (mut idx, mut seg_off) = self.seek(offset).ok_or(NvmeIoError::InvalidParam)?;
        while nbytes > 0 {
            let seg = self.segs.get(idx).ok_or(NvmeIoError::InvalidParam)?;
            let n = ((seg.nbytes - seg_off) as u64).min(nbytes) as usize;
            seg.mapping.fill(seg_off, value, n);
            nbytes -= n as u64;
            seg_off = 0;
            idx += 1;
        }
        Ok(())
    }

    /// Physical address of the chain piece at `offset`, plus the physical
    /// address of the PRP-list cell it came from (0 for direct entries).
    pub(crate) fn phys_at(&self, offset: u64) -> Option<(u64, u64, usize)> {
        let (idx, seg_off) = self.seek(offset)?;
        let seg = &self.segs[idx];
        Some((seg.phys + seg_off as u64, seg.addr_in_list, idx))
    }
}

// =============================================================================
// Shadow DMA buffers
// =============================================================================

/// A page-aligned DMA buffer plus the physical page list that lets it stand
/// in for a guest buffer via PRP rewriting.
pub struct DmaBuf {
    buf: DmaBuffer,
    dma_list: DmaBuffer,
    nbytes: u64,
}

impl DmaBuf {
    #[inline]
    pub fn len(&self) -> u64 {
        self.nbytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_slice()[..self.nbytes as usize]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes as usize;
        &mut self.buf.as_mut_slice()[..nbytes]
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.buf.phys()
    }

    fn n_pages(&self) -> usize {
        (self.nbytes as usize + PAGE_NBYTES - 1) >> crate::memory::PAGE_SHIFT
    }
}

impl NvmeHost {
    /// Allocate a DMA buffer an interceptor can substitute for a guest
    /// buffer.
    pub fn alloc_dmabuf(&self, nbytes: u64) -> Result<DmaBuf> {
        if nbytes == 0 {
            return Err(NvmeIoError::InvalidParam);
        }
        let n_pages = (nbytes as usize + PAGE_NBYTES - 1) >> crate::memory::PAGE_SHIFT;
        let buf = DmaBuffer::alloc(&self.dma, nbytes as usize);
        let dma_list = DmaBuffer::alloc(&self.dma, n_pages * 8);
        for i in 0..n_pages {
            dma_list.write_u64(i * 8, buf.phys_page(i));
        }
        Ok(DmaBuf {
            buf,
            dma_list,
            nbytes,
        })
    }

    /// Walk a guest request's PRP chain and map every page of its buffer.
    ///
    /// Apple controllers with flags bit 5 set are special: PRP1 alone names
    /// the whole (contiguous) transfer.
    pub fn alloc_guest_buf(&self, req: &Request) -> Result<GuestBuf> {
        if req.is_h_req {
            return Err(NvmeIoError::InvalidParam);
        }

        let (page_nbytes, page_mask) = {
            let hp = self.hparams.read();
            (hp.page_nbytes, hp.page_mask)
        };

        let g_ptr1 = req.g_prp1;
        let mut g_ptr2 = req.g_prp2;
        if g_ptr1 == 0 {
            return Err(NvmeIoError::InvalidParam);
        }

        let total_nbytes = req.total_nbytes;
        let mut segs = Vec::new();

        if self.vendor_id() == VENDOR_ID_APPLE && req.cmd.std.flags & 0x20 != 0 {
            let mapping = self
                .mem
                .map(g_ptr1, total_nbytes as usize, MapFlags::READ | MapFlags::WRITE)
                .ok_or(NvmeIoError::InvalidParam)?;
            segs.push(GuestBufSeg {
                phys: g_ptr1,
                addr_in_list: 0,
                mapping,
                nbytes: total_nbytes as usize,
            });
            return Ok(GuestBuf { segs, total_nbytes });
        }

        let ptr1_offset = (g_ptr1 & !page_mask) as usize;
        let ptr1_nbytes = if ptr1_offset as u64 + total_nbytes <= page_nbytes as u64 {
            total_nbytes as usize
        } else {
            page_nbytes - ptr1_offset
        };
        let mapping = self
            .mem
            .map(g_ptr1, ptr1_nbytes, MapFlags::READ | MapFlags::WRITE)
            .ok_or(NvmeIoError::InvalidParam)?;
        segs.push(GuestBufSeg {
            phys: g_ptr1,
            addr_in_list: 0,
            mapping,
            nbytes: ptr1_nbytes,
        });

        let mut remaining = total_nbytes - ptr1_nbytes as u64;
        if remaining == 0 {
            return Ok(GuestBuf { segs, total_nbytes });
        }

        if remaining <= page_nbytes as u64 {
            if g_ptr2 == 0 {
                return Err(NvmeIoError::InvalidParam);
            }
            let mapping = self
                .mem
                .map(g_ptr2, remaining as usize, MapFlags::READ | MapFlags::WRITE)
                .ok_or(NvmeIoError::InvalidParam)?;
            segs.push(GuestBufSeg {
                phys: g_ptr2,
                addr_in_list: 0,
                mapping,
                nbytes: remaining as usize,
            });
            return Ok(GuestBuf { segs, total_nbytes });
        }

        // PRP list, possibly chained: the last cell of a list page points at
        // the next list page.
        let mut page_idx = ((g_ptr2 & !page_mask) >> 3) as usize;
        let page_last_idx = (page_nbytes - 1) >> 3;
        g_ptr2 &= page_mask;
        let mut list = self
            .mem
            .map(g_ptr2, page_nbytes, MapFlags::READ)
            .ok_or(NvmeIoError::InvalidParam)?;

        while remaining != 0 {
            if segs.len() > PRP_MAX_N_PAGES {
                return Err(NvmeIoError::InvalidParam);
            }
            if page_idx == page_last_idx {
                g_ptr2 = list.read_u64(page_idx * 8) & page_mask;
                page_idx = 0;
                list = self
                    .mem
                    .map(g_ptr2, page_nbytes, MapFlags::READ)
                    .ok_or(NvmeIoError::InvalidParam)?;
            }
            let phys = list.read_u64(page_idx * 8);
            if phys == 0 {
                return Err(NvmeIoError::InvalidParam);
            }
            let nbytes = remaining.min(page_nbytes as u64) as usize;
            let mapping = self
                .mem
                .map(phys, nbytes, MapFlags::READ | MapFlags::WRITE)
                .ok_or(NvmeIoError::InvalidParam)?;
            segs.push(GuestBufSeg {
                phys,
                addr_in_list: g_ptr2 + (page_idx * 8) as u64,
                mapping,
                nbytes,
            });
            page_idx += 1;
            remaining -= nbytes as u64;
        }

        Ok(GuestBuf { segs, total_nbytes })
    }

    /// Rewrite a guest request's PRPs to point at a shadow DMA buffer. The
    /// guest's original pointers stay recorded on the request; copying data
    /// back is the interceptor's business.
    pub fn set_shadow_buffer(&self, req: &mut Request, dmabuf: &DmaBuf) -> Result<()> {
        if req.is_h_req || req.total_nbytes != dmabuf.nbytes {
            return Err(NvmeIoError::InvalidParam);
        }

        let n_pages = dmabuf.n_pages();
        let cmd = &mut req.cmd.std;
        cmd.prp1 = dmabuf.buf.phys_page(0);
        cmd.prp2 = match n_pages {
            1 => 0,
            2 => dmabuf.buf.phys_page(1),
            _ => dmabuf.dma_list.phys() + 8,
        };
        Ok(())
    }

    // =========================================================================
    // Guest request helpers
    // =========================================================================

    /// Move a guest request's access window. Fails when the window would run
    /// past the namespace.
    pub fn patch_start_lba(&self, req: &mut Request, new_start_lba: u64) -> Result<()> {
        if req.is_h_req {
            return Err(NvmeIoError::InvalidParam);
        }
        let total_lbas = {
            let state = self.state.lock();
            state
                .ns_metas
                .get(req.cmd.std.nsid as usize)
                .map(|meta| meta.n_lbas)
                .ok_or(NvmeIoError::InvalidParam)?
        };
        if new_start_lba + req.n_lbas as u64 > total_lbas {
            return Err(NvmeIoError::InvalidParam);
        }
        req.cmd.std.set_lba_start(new_start_lba);
        Ok(())
    }

    /// Turn a swallowed guest request into a harmless 1-LBA read so the
    /// controller still produces a completion for it. A fresh scratch page is
    /// allocated every time; reusing one stalls Apple controllers.
    pub fn change_g_req_to_dummy_read(&self, req: &mut Request, dummy_lba: u64) -> Result<()> {
        if req.is_h_req {
            return Err(NvmeIoError::InvalidParam);
        }
        let scratch = DmaBuffer::alloc(&self.dma, PAGE_NBYTES);
        let cmd = &mut req.cmd.std;
        cmd.opcode = cmd::IO_READ;
        cmd.prp1 = scratch.phys();
        cmd.prp2 = 0;
        cmd.set_lba_start(dummy_lba);
        cmd.cdw[2] = 0; // a single LBA
        cmd.cdw[3] = 0;
        cmd.cdw[4] = 0;
        cmd.cdw[5] = 0;
        req.h_buf = Some(scratch);
        Ok(())
    }

    /// Install an interceptor. Fails if one is already installed; only one
    /// interceptor is supported per controller.
    pub fn install_interceptor(&self, interceptor: Arc<dyn IoInterceptor>) -> Result<()> {
        let serialize = interceptor.serialize_queue_fetch();
        if self.io_interceptor.set(interceptor).is_err() {
            log::error!("an interceptor has already been installed");
            return Err(NvmeIoError::Internal);
        }
        self.serialize_fetch
            .store(serialize, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Resume guest command fetching after an `on_init` pause.
    pub fn start_fetching_g_reqs(&self) {
        self.set_fetch_paused(false);
    }

    /// Whether the controller is enabled and I/O ready.
    pub fn host_ready(&self) -> bool {
        self.is_enabled() && self.is_io_ready()
    }

    // =========================================================================
    // Drive information
    // =========================================================================

    pub fn n_ns(&self) -> Result<u32> {
        let state = self.state.lock();
        if state.n_ns == 0 {
            return Err(NvmeIoError::NotReady);
        }
        Ok(state.n_ns)
    }

    pub fn total_lbas(&self, nsid: u32) -> Result<u64> {
        let state = self.state.lock();
        if state.n_ns == 0 {
            return Err(NvmeIoError::NotReady);
        }
        state
            .ns_metas
            .get(nsid as usize)
            .filter(|_| nsid != 0)
            .map(|meta| meta.n_lbas)
            .ok_or(NvmeIoError::InvalidParam)
    }

    pub fn lba_nbytes(&self, nsid: u32) -> Result<u64> {
        let state = self.state.lock();
        if state.n_ns == 0 {
            return Err(NvmeIoError::NotReady);
        }
        state
            .ns_metas
            .get(nsid as usize)
            .filter(|_| nsid != 0)
            .map(|meta| meta.lba_nbytes)
            .ok_or(NvmeIoError::InvalidParam)
    }

    /// Largest LBA count one transfer may carry for a namespace.
    pub fn max_n_lbas(&self, nsid: u32) -> Result<u16> {
        let lba_nbytes = self.lba_nbytes(nsid)?;
        let max_data_transfer = self.state.lock().max_data_transfer;
        Ok((max_data_transfer / lba_nbytes).min(u16::MAX as u64) as u16)
    }

    // =========================================================================
    // Host-originated I/O
    // =========================================================================

    /// Describe a host I/O access before attaching buffers to it.
    pub fn init_descriptor(&self, nsid: u32, lba_start: u64, n_lbas: u16) -> Result<IoDescriptor> {
        if n_lbas == 0 {
            return Err(NvmeIoError::InvalidParam);
        }
        let max_n_lbas = self.max_n_lbas(nsid)?;
        if n_lbas > max_n_lbas {
            return Err(NvmeIoError::InvalidParam);
        }
        Ok(IoDescriptor {
            buf_phys1: 0,
            buf_phys2: 0,
            nsid,
            lba_start,
            n_lbas,
        })
    }

    /// Point a descriptor at a page array. Every page must be aligned; the
    /// first may carry an offset.
    pub fn set_phys_buffers(
        &self,
        io_desc: &mut IoDescriptor,
        pagebuf_arr: &[u64],
        pagebuf_arr_phys: u64,
        first_page_offset: u64,
    ) -> Result<()> {
        let page_mask = self.hparams.read().page_mask;
        if pagebuf_arr.is_empty()
            || pagebuf_arr.len() >= PRP_MAX_N_PAGES
            || pagebuf_arr_phys == 0
            || first_page_offset >= PAGE_NBYTES as u64
        {
            return Err(NvmeIoError::InvalidParam);
        }
        for &page in pagebuf_arr {
            if page == 0 || page & !page_mask != 0 {
                return Err(NvmeIoError::InvalidParam);
            }
        }
        io_desc.buf_phys1 = pagebuf_arr[0] + first_page_offset;
        io_desc.buf_phys2 = match pagebuf_arr.len() {
            1 => 0,
            2 => pagebuf_arr[1],
            _ => pagebuf_arr_phys + 8,
        };
        Ok(())
    }

    /// Descriptor over a window of a guest request's own buffer, for an
    /// interceptor re-issuing guest data under different parameters.
    pub fn g_buf_io_descriptor(
        &self,
        req: &Request,
        g_buf: &GuestBuf,
        g_buf_offset: u64,
        lba_start: u64,
        n_lbas: u16,
    ) -> Result<IoDescriptor> {
        if g_buf_offset >= req.total_nbytes {
            return Err(NvmeIoError::InvalidParam);
        }
        let mut io_desc = self.init_descriptor(req.cmd.std.nsid, lba_start, n_lbas)?;

        let (phys1, _, seg_idx) = g_buf
            .phys_at(g_buf_offset)
            .ok_or(NvmeIoError::InvalidParam)?;
        io_desc.buf_phys1 = phys1;

        let lba_nbytes = self.lba_nbytes(req.cmd.std.nsid)?;
        let access_nbytes = n_lbas as u64 * lba_nbytes;
        let first_nbytes = {
            let seg = &g_buf.segs[seg_idx];
            seg.nbytes as u64 - (phys1 - seg.phys)
        };

        if access_nbytes > first_nbytes {
            let next = g_buf.segs.get(seg_idx + 1).ok_or(NvmeIoError::InvalidParam)?;
            let remaining = access_nbytes - first_nbytes;
            io_desc.buf_phys2 = if remaining <= PAGE_NBYTES as u64 {
                next.phys
            } else {
                next.addr_in_list
            };
        }
        Ok(io_desc)
    }

    /// Batch handle for host-originated requests on one submission queue.
    pub fn prepare_requests(&self, queue_id: u16) -> Result<ReqHandle> {
        if queue_id > self.queues.read().max_n_subm {
            return Err(NvmeIoError::InvalidParam);
        }
        Ok(ReqHandle {
            queue_id,
            inner: Arc::new(Mutex::new(ReqHandleInner {
                reqs: Vec::new(),
                remaining: 0,
                submitted: false,
                io_error: false,
                done: false,
            })),
        })
    }

    pub fn add_read_request(
        &self,
        handle: &ReqHandle,
        io_desc: IoDescriptor,
        callback: Option<IoCallback>,
    ) -> Result<()> {
        self.add_rw_request(handle, cmd::IO_READ, io_desc, callback)
    }

    pub fn add_write_request(
        &self,
        handle: &ReqHandle,
        io_desc: IoDescriptor,
        callback: Option<IoCallback>,
    ) -> Result<()> {
        self.add_rw_request(handle, cmd::IO_WRITE, io_desc, callback)
    }

    fn add_rw_request(
        &self,
        handle: &ReqHandle,
        opcode: u8,
        io_desc: IoDescriptor,
        callback: Option<IoCallback>,
    ) -> Result<()> {
        if handle.queue_id == 0 || io_desc.buf_phys1 == 0 {
            return Err(NvmeIoError::InvalidParam);
        }
        let cmd_nbytes = self.hparams.read().h_io_subm_entry_nbytes;
        let mut req = Request::new_host(cmd_nbytes);
        req.queue_id = handle.queue_id;
        req.lba_start = io_desc.lba_start;
        req.n_lbas = io_desc.n_lbas as u32;

        let h_cmd = &mut req.cmd.std;
        h_cmd.opcode = opcode;
        h_cmd.nsid = io_desc.nsid;
        h_cmd.prp1 = io_desc.buf_phys1;
        h_cmd.prp2 = io_desc.buf_phys2;
        h_cmd.set_lba_start(io_desc.lba_start);
        h_cmd.cdw[2] = (io_desc.n_lbas - 1) as u32;

        handle.push(req, callback);
        Ok(())
    }

    pub fn add_flush_request(
        &self,
        handle: &ReqHandle,
        nsid: u32,
        callback: Option<IoCallback>,
    ) -> Result<()> {
        if handle.queue_id == 0 || nsid == 0 {
            return Err(NvmeIoError::InvalidParam);
        }
        let cmd_nbytes = self.hparams.read().h_io_subm_entry_nbytes;
        let mut req = Request::new_host(cmd_nbytes);
        req.queue_id = handle.queue_id;
        req.cmd.std.opcode = cmd::IO_FLUSH;
        req.cmd.std.nsid = nsid;
        handle.push(req, callback);
        Ok(())
    }

    /// Hand every request of the batch to the submission path.
    pub fn submit_requests(&self, handle: &ReqHandle) -> Result<()> {
        if !self.is_enabled() || (handle.queue_id != 0 && !self.is_io_ready()) {
            return Err(NvmeIoError::NotReady);
        }
        let reqs = {
            let mut inner = handle.inner.lock();
            if inner.submitted {
                return Err(NvmeIoError::InvalidParam);
            }
            inner.submitted = true;
            if inner.reqs.is_empty() {
                inner.done = true;
            }
            std::mem::take(&mut inner.reqs)
        };
        for req in reqs {
            self.register_request(req);
        }
        self.submit_queuing_requests(handle.queue_id);
        Ok(())
    }

    /// Yield-poll until the whole batch has completed.
    pub fn wait_for_completion(&self, handle: &ReqHandle, timeout: Duration) -> Result<()> {
        if !handle.inner.lock().submitted {
            return Err(NvmeIoError::InvalidParam);
        }
        let start = Instant::now();
        loop {
            let inner = handle.inner.lock();
            if inner.done {
                return if inner.io_error {
                    Err(NvmeIoError::Io)
                } else {
                    Ok(())
                };
            }
            drop(inner);
            if start.elapsed() > timeout {
                return Err(NvmeIoError::Timeout);
            }
            std::thread::yield_now();
            self.process_all_comp_queues();
        }
    }

    // =========================================================================
    // Host-originated admin commands
    // =========================================================================

    /// Issue Identify on the core's own behalf; `callback` runs from the
    /// completion path with the payload already in `pagebuf_phys`.
    pub fn identify_async(
        &self,
        nsid: u32,
        pagebuf_phys: u64,
        cns: u8,
        controller_id: u16,
        callback: IoCallback,
    ) -> Result<()> {
        if pagebuf_phys == 0 {
            return Err(NvmeIoError::InvalidParam);
        }
        let mut req = Request::new_host(CMD_NBYTES);
        req.queue_id = 0;
        let h_cmd = &mut req.cmd.std;
        h_cmd.opcode = cmd::ADMIN_IDENTIFY;
        h_cmd.nsid = nsid;
        h_cmd.prp1 = pagebuf_phys;
        h_cmd.cdw[0] = ((controller_id as u32) << 16) | cns as u32;
        req.callback = Some(callback);
        self.register_request(req);
        self.submit_queuing_requests(0);
        Ok(())
    }

    /// Issue Get Features: Number of Queues; the granted counts arrive in the
    /// callback's `cmd_specific`.
    pub fn get_n_queues_async(&self, callback: IoCallback) -> Result<()> {
        let mut req = Request::new_host(CMD_NBYTES);
        req.queue_id = 0;
        let h_cmd = &mut req.cmd.std;
        h_cmd.opcode = cmd::ADMIN_GET_FEATURES;
        h_cmd.cdw[0] = cmd::FEATURE_NUM_QUEUES as u32;
        // 0xFFFE is the specification maximum; safe for querying.
        h_cmd.cdw[1] = 0xFFFE_FFFE;
        req.callback = Some(callback);
        self.register_request(req);
        self.submit_queuing_requests(0);
        Ok(())
    }
}

pub type IoCallback = Box<dyn FnOnce(&NvmeHost, CompStatus) + Send>;

/// A host I/O access being assembled: target LBAs plus PRP pointers.
pub struct IoDescriptor {
    buf_phys1: u64,
    buf_phys2: u64,
    nsid: u32,
    lba_start: u64,
    n_lbas: u16,
}

struct ReqHandleInner {
    reqs: Vec<Box<Request>>,
    remaining: u32,
    submitted: bool,
    io_error: bool,
    done: bool,
}

/// A batch of host-originated requests sharing one completion wait.
pub struct ReqHandle {
    queue_id: u16,
    inner: Arc<Mutex<ReqHandleInner>>,
}

impl ReqHandle {
    fn push(&self, mut req: Box<Request>, callback: Option<IoCallback>) {
        let tracker = Arc::clone(&self.inner);
        req.set_callback(move |host, status| {
            if let Some(cb) = callback {
                cb(host, status);
            }
            let mut inner = tracker.lock();
            if !status.ok() {
                inner.io_error = true;
            }
            inner.remaining -= 1;
            if inner.remaining == 0 {
                inner.done = true;
            }
        });
        let mut inner = self.inner.lock();
        inner.remaining += 1;
        inner.reqs.push(req);
    }
}
