//! Controller host state, register intercepts and the configuration state
//! machine.
//!
//! One [`NvmeHost`] exists per physical controller. The PCI layer hands it
//! every MMIO access the guest makes to BAR0 and the MSI-X BAR; the host
//! decides per register whether to pass through, latch, synthesise or act.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::cmd::COMP_NBYTES;
use crate::hub::RequestHub;
use crate::interceptor::{init_ext, FetchPolicy, IoInterceptor};
use crate::memory::{DmaPool, GuestMemory, MapFlags, PAGE_NBYTES};
use crate::ns::NamespaceMeta;
use crate::queue::{init_queue_rings, CompQueue, QueueSet, SubmQueue};
use crate::regs::{self, ControllerRegs};
use crate::subm::CMD_NBYTES_STD;

static NEXT_HOST_ID: AtomicU32 = AtomicU32::new(0);

const PAGE_SHIFT_INIT: u32 = 12;

/// Which BAR an MMIO access targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarRegion {
    Bar0,
    MsixBar,
}

/// Identification and options collected by the PCI driver layer at bind.
#[derive(Clone, Debug, Default)]
pub struct BindParams {
    pub vendor_id: u16,
    pub device_id: u16,
    /// BAR index carrying the MSI-X table; 0 when it shares BAR0.
    pub msix_bar: u8,
    /// Table offset within the MSI-X BAR, 0 when the device has no MSI-X.
    pub msix_vector_base: u64,
    pub msix_n_vectors: u16,
    /// `ans2_wrapper=1` driver option: present 64-byte submission entries to
    /// the guest while the ANS2 hardware uses 128-byte ones.
    pub ans2_wrapper: bool,
    /// `ext=NAME` driver option: extension to install at bind.
    pub ext: Option<String>,
}

/// Values latched from guest register writes, plus derived layout parameters.
pub(crate) struct HostParams {
    pub page_nbytes: usize,
    pub page_mask: u64,
    /// CC exactly as the guest wrote it; readback must not show the ANS2
    /// IOSQES rewrite.
    pub g_cc: u32,
    pub h_io_subm_entry_nbytes: usize,
    pub g_io_subm_entry_nbytes: usize,
    pub h_io_comp_entry_nbytes: usize,
    pub g_io_comp_entry_nbytes: usize,
    pub g_admin_subm_queue_addr: u64,
    pub g_admin_comp_queue_addr: u64,
    pub g_admin_subm_n_entries: u32,
    pub g_admin_comp_n_entries: u32,
}

/// Mutable controller-wide state under the host lock.
pub(crate) struct HostState {
    /// Non-zero while a completion scan is in progress; admin fetches from
    /// the doorbell path are deferred and reset waits for it to drain.
    pub handling_comp: u32,
    /// Round-robin cursor for the completion-handler fetch tail.
    pub queue_to_fetch: u16,
    /// Queues whose Delete command has completed; freed at the end of the
    /// scan pass so completions still in flight in later queues of the same
    /// pass keep their hub.
    pub pending_sq_free: Vec<u16>,
    pub pending_cq_free: Vec<u16>,
    /// Namespace metadata indexed by NSID (entry 0 unused).
    pub ns_metas: Vec<NamespaceMeta>,
    pub n_ns: u32,
    pub default_n_subm_queues: u16,
    pub default_n_comp_queues: u16,
    pub max_data_transfer: u64,
}

pub struct NvmeHost {
    pub(crate) regs: Arc<dyn ControllerRegs>,
    pub(crate) msix_regs: Option<Arc<dyn ControllerRegs>>,
    pub(crate) mem: Arc<dyn GuestMemory>,
    pub(crate) dma: Arc<dyn DmaPool>,

    vendor_id: u16,
    device_id: u16,
    id: u32,
    db_stride: u8,
    max_n_entries: u16,
    msix_bar: u8,
    msix_vector_base: u64,
    msix_n_vectors: u16,
    ans2_wrapper: bool,

    pub(crate) io_interceptor: OnceLock<Arc<dyn IoInterceptor>>,
    pub(crate) serialize_fetch: AtomicBool,

    enabled: AtomicBool,
    io_ready: AtomicBool,
    pause_fetching: AtomicBool,
    pub(crate) g_cmd_size_check: AtomicBool,

    pub(crate) state: Mutex<HostState>,
    pub(crate) hparams: RwLock<HostParams>,
    pub(crate) queues: RwLock<QueueSet>,
    pub(crate) fetch_req_lock: Mutex<()>,
}

impl NvmeHost {
    /// Take over a controller. Mirrors the PCI `new` path: read capabilities,
    /// set up the initial (admin-only) queue arrays, install the configured
    /// extension, and stop the controller if firmware left it running.
    pub fn bind(
        regs: Arc<dyn ControllerRegs>,
        msix_regs: Option<Arc<dyn ControllerRegs>>,
        mem: Arc<dyn GuestMemory>,
        dma: Arc<dyn DmaPool>,
        params: BindParams,
    ) -> Arc<NvmeHost> {
        let cap = regs.read64(regs::REG_CAP);
        log::debug!("max queue entries supported: {}", regs::cap_mqes(cap) + 1);
        log::debug!("contiguous queues required : {}", regs::cap_cqr(cap));
        log::debug!("doorbell stride            : {}", regs::cap_dstrd(cap));
        log::debug!("NVM subsystem reset        : {}", regs::cap_nssrs(cap));
        log::debug!("memory page size min       : {}", regs::cap_mpsmin(cap));
        log::debug!("memory page size max       : {}", regs::cap_mpsmax(cap));

        let cmbsz = regs.read32(regs::REG_CMBSZ);
        if cmbsz != 0 {
            log::debug!("controller memory buffer detected, CMBSZ 0x{:08X}", cmbsz);
        }

        let page_nbytes = 1usize << (PAGE_SHIFT_INIT + regs::cap_mpsmin(cap) as u32);

        let host = Arc::new(NvmeHost {
            regs,
            msix_regs,
            mem,
            dma,
            vendor_id: params.vendor_id,
            device_id: params.device_id,
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            db_stride: regs::cap_dstrd(cap),
            max_n_entries: regs::cap_mqes(cap) + 1,
            msix_bar: params.msix_bar,
            msix_vector_base: params.msix_vector_base,
            msix_n_vectors: params.msix_n_vectors,
            ans2_wrapper: params.ans2_wrapper,
            io_interceptor: OnceLock::new(),
            serialize_fetch: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            io_ready: AtomicBool::new(false),
            pause_fetching: AtomicBool::new(false),
            g_cmd_size_check: AtomicBool::new(false),
            state: Mutex::new(HostState {
                handling_comp: 0,
                queue_to_fetch: 1,
                pending_sq_free: Vec::new(),
                pending_cq_free: Vec::new(),
                ns_metas: Vec::new(),
                n_ns: 0,
                default_n_subm_queues: 0,
                default_n_comp_queues: 0,
                max_data_transfer: 0,
            }),
            hparams: RwLock::new(HostParams {
                page_nbytes,
                page_mask: !(page_nbytes as u64 - 1),
                g_cc: 0,
                h_io_subm_entry_nbytes: CMD_NBYTES_STD,
                g_io_subm_entry_nbytes: CMD_NBYTES_STD,
                h_io_comp_entry_nbytes: COMP_NBYTES,
                g_io_comp_entry_nbytes: COMP_NBYTES,
                g_admin_subm_queue_addr: 0,
                g_admin_comp_queue_addr: 0,
                g_admin_subm_n_entries: 0,
                g_admin_comp_n_entries: 0,
            }),
            queues: RwLock::new(QueueSet::new()),
            fetch_req_lock: Mutex::new(()),
        });

        if params.ans2_wrapper {
            log::info!("ANS2 controller wrapper enabled");
        }

        if let Some(name) = params.ext.as_deref() {
            init_ext(&host, name);
        }

        // Some controllers misbehave if not disabled after the handoff from
        // firmware; writing ASQ/ACQ while running yields wrong values.
        if regs::cc_enable(host.regs.read32(regs::REG_CC)) {
            log::info!("NVMe controller is running, stop it");
            host.regs.write32(regs::REG_CC, 0);
        }
        while regs::csts_ready(host.regs.read32(regs::REG_CSTS)) && !host.skip_wait_quirk() {
            std::thread::yield_now();
        }

        log::info!("NVMe initialization done");
        host
    }

    fn skip_wait_quirk(&self) -> bool {
        let skip = self.vendor_id == regs::VENDOR_ID_TOSHIBA
            && self.device_id == regs::DEV_TOSHIBA_0115;
        if skip {
            log::info!(
                "skip waiting for controller {:04X}:{:04X}",
                self.vendor_id,
                self.device_id
            );
        }
        skip
    }

    // ----- small accessors ---------------------------------------------------

    #[inline]
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    #[inline]
    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    #[inline]
    pub fn host_id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_io_ready(&self) -> bool {
        self.io_ready.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn max_n_entries(&self) -> u16 {
        self.max_n_entries
    }

    #[inline]
    pub fn page_nbytes(&self) -> usize {
        self.hparams.read().page_nbytes
    }

    #[inline]
    pub(crate) fn set_io_ready(&self, ready: bool) {
        self.io_ready.store(ready, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_fetch_paused(&self) -> bool {
        self.pause_fetching.load(Ordering::Acquire)
    }

    pub(crate) fn set_fetch_paused(&self, paused: bool) {
        self.pause_fetching.store(paused, Ordering::Release);
    }

    pub(crate) fn interceptor(&self) -> Option<&Arc<dyn IoInterceptor>> {
        self.io_interceptor.get()
    }

    pub(crate) fn subm_queue(&self, id: u16) -> Option<Arc<SubmQueue>> {
        self.queues.read().subm_queue(id)
    }

    pub(crate) fn comp_queue(&self, id: u16) -> Option<Arc<CompQueue>> {
        self.queues.read().comp_queue(id)
    }

    pub(crate) fn hub_for_subm(&self, subm_queue_id: u16) -> Option<Arc<RequestHub>> {
        self.queues.read().hub_for_subm(subm_queue_id)
    }

    // ----- hardware doorbells ------------------------------------------------

    pub(crate) fn write_subm_db(&self, queue_id: u16, tail: u16) {
        self.regs
            .write32(regs::sq_doorbell_offset(queue_id, self.db_stride), tail as u32);
    }

    pub(crate) fn write_comp_db(&self, queue_id: u16, head: u16) {
        self.regs
            .write32(regs::cq_doorbell_offset(queue_id, self.db_stride), head as u32);
    }

    // ----- MMIO dispatch -----------------------------------------------------

    /// Intercept one guest MMIO access. `buf` receives the value on reads
    /// and carries the written value on writes. Widths other than 4 and 8
    /// bytes are ignored; NVMe defines nothing meaningful at other widths on
    /// these regions.
    pub fn mmio_access(&self, region: BarRegion, offset: u64, is_write: bool, buf: &mut [u8]) {
        if buf.len() != 4 && buf.len() != 8 {
            return;
        }

        if region == BarRegion::MsixBar {
            self.msix_access(region, offset, is_write, buf);
            return;
        }

        let acc_start = offset;
        let acc_end = offset + buf.len() as u64;
        let within = |reg: u64, nbytes: u64| acc_start >= reg && acc_end <= reg + nbytes;

        if within(regs::REG_CAP, 8) {
            if !is_write {
                self.cap_read(offset, buf);
            }
        } else if within(regs::REG_VS, 4) {
            self.reg_passthrough(offset, is_write, buf);
        } else if within(regs::REG_INTMS, 4) || within(regs::REG_INTMC, 4) {
            self.completion_handler();
            self.reg_passthrough(offset, is_write, buf);
        } else if within(regs::REG_CC, 4) {
            if is_write {
                self.cc_write(buf);
            } else {
                let g_cc = self.hparams.read().g_cc;
                buf[..4].copy_from_slice(&g_cc.to_le_bytes());
            }
        } else if within(regs::REG_CSTS, 4) {
            if is_write {
                regs::reg_write(&*self.regs, offset, buf);
            } else {
                self.csts_read(buf);
            }
        } else if within(regs::REG_NSSRC, 4) {
            if is_write {
                let value = u32::from_le_bytes(buf[..4].try_into().unwrap());
                if value == regs::NSSRC_MAGIC {
                    self.reset_controller();
                }
                regs::reg_write(&*self.regs, offset, buf);
            } else {
                regs::reg_read(&*self.regs, offset, buf);
            }
        } else if within(regs::REG_AQA, 4) {
            if is_write {
                self.aqa_write(buf);
            } else {
                regs::reg_read(&*self.regs, offset, buf);
            }
        } else if within(regs::REG_ASQ, 8) {
            self.admin_queue_addr_access(offset - regs::REG_ASQ, is_write, buf, true);
        } else if within(regs::REG_ACQ, 8) {
            self.admin_queue_addr_access(offset - regs::REG_ACQ, is_write, buf, false);
        } else if within(regs::REG_CMBLOC, 4) || within(regs::REG_CMBSZ, 4) {
            // The guest is told there is no controller memory buffer.
            if !is_write {
                buf.fill(0);
            }
        } else {
            self.doorbell_or_beyond(offset, is_write, buf);
        }
    }

    fn reg_passthrough(&self, offset: u64, is_write: bool, buf: &mut [u8]) {
        if is_write {
            regs::reg_write(&*self.regs, offset, buf);
        } else {
            regs::reg_read(&*self.regs, offset, buf);
        }
    }

    fn cap_read(&self, offset: u64, buf: &mut [u8]) {
        let shift = (offset - regs::REG_CAP) * 8;
        // Force Contiguous Queues Required; the core only shadows
        // physically-contiguous queues.
        let cap = regs::cap_set_cqr(self.regs.read64(regs::REG_CAP)) >> shift;
        buf.copy_from_slice(&cap.to_le_bytes()[..buf.len()]);
    }

    fn csts_read(&self, buf: &mut [u8]) {
        let value = self.regs.read32(regs::REG_CSTS);
        if regs::csts_cfs(value) {
            log::error!("controller fatal status detected");
        }
        if regs::csts_nssro(value) {
            log::warn!("NVM subsystem reset detected");
        }
        if regs::csts_pp(value) {
            log::warn!("processing paused detected");
        }
        buf[..4].copy_from_slice(&value.to_le_bytes());
    }

    fn aqa_write(&self, buf: &mut [u8]) {
        let value = u32::from_le_bytes(buf[..4].try_into().unwrap());
        {
            let mut hp = self.hparams.write();
            // Fields are zero based
            hp.g_admin_subm_n_entries = regs::aqa_asqs(value) + 1;
            hp.g_admin_comp_n_entries = regs::aqa_acqs(value) + 1;
            log::debug!(
                "admin queue entries: subm {} comp {}",
                hp.g_admin_subm_n_entries,
                hp.g_admin_comp_n_entries
            );
        }
        regs::reg_write(&*self.regs, regs::REG_AQA, buf);
    }

    /// ASQ/ACQ are latched, never forwarded: the hardware gets the host's
    /// shadow admin queues when the controller is enabled.
    fn admin_queue_addr_access(&self, field_offset: u64, is_write: bool, buf: &mut [u8], asq: bool) {
        if is_write {
            let mut hp = self.hparams.write();
            let addr = if asq {
                &mut hp.g_admin_subm_queue_addr
            } else {
                &mut hp.g_admin_comp_queue_addr
            };
            match buf.len() {
                4 => {
                    let half = u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64;
                    if field_offset == 0 {
                        *addr = (*addr & !0xFFFF_FFFF) | half;
                    } else {
                        *addr = (*addr & 0xFFFF_FFFF) | (half << 32);
                    }
                }
                _ => *addr = u64::from_le_bytes(buf[..8].try_into().unwrap()),
            }
        } else {
            let hp = self.hparams.read();
            let addr = if asq {
                hp.g_admin_subm_queue_addr
            } else {
                hp.g_admin_comp_queue_addr
            };
            let value = addr >> (field_offset * 8);
            buf.copy_from_slice(&value.to_le_bytes()[..buf.len()]);
        }
    }

    // ----- CC state machine --------------------------------------------------

    fn cc_write(&self, buf: &mut [u8]) {
        let mut value = u32::from_le_bytes(buf[..4].try_into().unwrap());
        self.hparams.write().g_cc = value;

        if value != 0 {
            let cmd_set = regs::cc_css(value);
            if cmd_set != 0 {
                panic!("unsupported NVMe command set {}", cmd_set);
            }

            let page_shift = PAGE_SHIFT_INIT + regs::cc_mps(value) as u32;
            let page_nbytes = 1usize << page_shift;
            if page_nbytes != PAGE_NBYTES {
                panic!("only 4096-byte memory pages are supported");
            }

            let mut hp = self.hparams.write();
            hp.page_nbytes = page_nbytes;
            hp.page_mask = !((1u64 << page_shift) - 1);

            if regs::cc_iosqes(value) != 0 {
                hp.g_io_subm_entry_nbytes = 1 << regs::cc_iosqes(value);
                if self.ans2_wrapper && regs::cc_iosqes(value) == 6 {
                    log::debug!("patching I/O submission entry size to 128 bytes");
                    value = regs::cc_set_iosqes(value, 7);
                }
                hp.h_io_subm_entry_nbytes = 1 << regs::cc_iosqes(value);
                log::debug!(
                    "I/O submission entry size: host {} guest {}",
                    hp.h_io_subm_entry_nbytes,
                    hp.g_io_subm_entry_nbytes
                );
                self.check_subm_entry_size(&hp);
            }

            if regs::cc_iocqes(value) != 0 {
                hp.g_io_comp_entry_nbytes = 1 << regs::cc_iocqes(value);
                hp.h_io_comp_entry_nbytes = 1 << regs::cc_iocqes(value);
                if hp.h_io_comp_entry_nbytes != COMP_NBYTES {
                    panic!(
                        "unsupported I/O completion entry size of {} bytes",
                        hp.h_io_comp_entry_nbytes
                    );
                }
            }

            if regs::cc_shn(value) != 0 {
                log::debug!("NVMe shutdown notification");
            }
        }

        let enabled = self.is_enabled();
        if enabled && (!regs::cc_enable(value) || regs::cc_shn(value) != 0) {
            self.reset_controller();
            log::debug!("NVMe has been disabled");
        } else if !enabled && regs::cc_enable(value) {
            self.init_admin_queue();
            self.enabled.store(true, Ordering::Release);
            self.g_cmd_size_check.store(true, Ordering::Release);
            log::debug!("NVMe has been enabled");
        }

        buf[..4].copy_from_slice(&value.to_le_bytes());
        regs::reg_write(&*self.regs, regs::REG_CC, buf);
    }

    fn check_subm_entry_size(&self, hp: &HostParams) {
        let apple_ans2 = self.vendor_id == regs::VENDOR_ID_APPLE
            && self.device_id == regs::DEV_APPLE_ANS2;
        if hp.h_io_subm_entry_nbytes == CMD_NBYTES_STD {
            if apple_ans2 && !self.ans2_wrapper {
                log::warn!("ANS2 controller without ans2_wrapper enabled");
            }
            return;
        }
        if apple_ans2 && hp.h_io_subm_entry_nbytes == crate::cmd::CMD_ANS2_NBYTES {
            return;
        }
        panic!(
            "unsupported I/O submission entry size of {} bytes",
            hp.h_io_subm_entry_nbytes
        );
    }

    /// CC.EN 0 -> 1: build the shadow admin queues and point the hardware at
    /// them. The guest's ASQ/ACQ values are only ever used for the guest-side
    /// mappings.
    fn init_admin_queue(&self) {
        assert!(!self.is_enabled(), "double admin queue initialization");

        let (g_asq, g_acq, n_subm, n_comp, page_nbytes) = {
            let hp = self.hparams.read();
            (
                hp.g_admin_subm_queue_addr,
                hp.g_admin_comp_queue_addr,
                hp.g_admin_subm_n_entries,
                hp.g_admin_comp_n_entries,
                hp.page_nbytes,
            )
        };
        assert!(n_subm > 0 && n_comp > 0, "admin queues enabled before AQA");

        log::debug!("initializing admin completion queue");
        let (h_comp, g_comp) = init_queue_rings(
            &self.dma,
            &self.mem,
            page_nbytes,
            n_comp as u16,
            n_comp as u16,
            COMP_NBYTES,
            COMP_NBYTES,
            g_acq,
            MapFlags::READ | MapFlags::WRITE,
        )
        .expect("cannot map guest admin completion queue");

        log::debug!("initializing admin submission queue");
        let (h_subm, g_subm) = init_queue_rings(
            &self.dma,
            &self.mem,
            page_nbytes,
            n_subm as u16,
            n_subm as u16,
            CMD_NBYTES_STD,
            CMD_NBYTES_STD,
            g_asq,
            MapFlags::READ,
        )
        .expect("cannot map guest admin submission queue");

        let h_subm_phys = h_subm.dma.phys();
        let h_comp_phys = h_comp.dma.phys();

        let hub = Arc::new(RequestHub::new());
        hub.add_slot(crate::hub::SubmSlot::new(0, h_subm));

        let subm_queue = SubmQueue::new(0, g_subm);
        subm_queue.paired_cq.store(0, Ordering::Release);
        let comp_queue = CompQueue::new(0, h_comp, g_comp);

        {
            let mut queues = self.queues.write();
            queues.subm[0] = Some(subm_queue);
            queues.comp[0] = Some(comp_queue);
            queues.hubs[0] = Some(hub);
        }

        self.regs.write64(regs::REG_ASQ, h_subm_phys);
        self.regs.write64(regs::REG_ACQ, h_comp_phys);
    }

    /// CC.EN 1 -> 0, shutdown notification, or NSSRC magic write.
    pub(crate) fn reset_controller(&self) {
        self.io_ready.store(false, Ordering::Release);

        if let Some(interceptor) = self.interceptor() {
            while !interceptor.can_stop() {
                std::thread::yield_now();
            }
        }

        self.enabled.store(false, Ordering::Release);
        loop {
            let state = self.state.lock();
            if state.handling_comp == 0 {
                break;
            }
            drop(state);
            log::debug!("waiting for completion handler before reset");
            std::thread::yield_now();
        }

        self.do_reset();
    }

    fn do_reset(&self) {
        log::info!("controller reset occurs");

        let old = std::mem::replace(&mut *self.queues.write(), QueueSet::new());
        let mut callbacks = Vec::new();
        for hub in old.hubs.iter().flatten() {
            callbacks.extend(hub.cancel_all());
        }
        drop(old);

        {
            let mut hp = self.hparams.write();
            hp.g_admin_subm_queue_addr = 0;
            hp.g_admin_comp_queue_addr = 0;
            hp.g_admin_subm_n_entries = 0;
            hp.g_admin_comp_n_entries = 0;
        }

        {
            let mut state = self.state.lock();
            state.ns_metas.clear();
            state.n_ns = 0;
            state.queue_to_fetch = 1;
            state.pending_sq_free.clear();
            state.pending_cq_free.clear();
        }
        self.set_fetch_paused(false);

        // Requests that will never complete: report the sentinel status.
        for cb in callbacks {
            cb(self, crate::hub::CompStatus::NONE);
        }
    }

    // ----- doorbells and the MSI-X tail -------------------------------------

    fn doorbell_or_beyond(&self, offset: u64, is_write: bool, buf: &mut [u8]) {
        let db_nbytes = regs::db_stride_nbytes(self.db_stride);
        let (max_subm, max_comp) = {
            let queues = self.queues.read();
            (queues.max_n_subm as u64, queues.max_n_comp as u64)
        };
        // +1 for the admin pair; submission and completion doorbells interleave.
        let total_doorbells = (max_subm.max(max_comp) + 1) * 2;
        let db_start = regs::REG_DB_BASE;
        let db_end = db_start + total_doorbells * db_nbytes;

        let acc_end = offset + buf.len() as u64;
        if offset >= db_start && acc_end <= db_end {
            if is_write {
                let idx = ((offset - db_start) / db_nbytes) as u16;
                self.intercept_db_write(idx, buf);
            }
        } else if offset >= db_start {
            // MSI/MSI-X registers live in BAR0 beyond the doorbells on some
            // devices; those accesses must go through.
            self.msix_access(BarRegion::Bar0, offset, is_write, buf);
        } else if !is_write {
            buf.fill(0);
        }
    }

    fn msix_access(&self, region: BarRegion, offset: u64, is_write: bool, buf: &mut [u8]) {
        let target: &Arc<dyn ControllerRegs> = if self.msix_bar == 0 {
            &self.regs
        } else {
            match self.msix_regs.as_ref() {
                Some(target) => target,
                None => return,
            }
        };

        self.do_reg_rw(target, offset, is_write, buf);

        if self.msix_vector_base == 0 {
            return;
        }
        let in_msix_bar = (self.msix_bar == 0) == (region == BarRegion::Bar0);
        let msix_start = self.msix_vector_base;
        let msix_end = msix_start + self.msix_n_vectors as u64 * 16;
        if in_msix_bar && offset >= msix_start && offset < msix_end {
            // Vector control dword: an unmask write may let a pending
            // interrupt through, so scan completions now.
            if (offset & 0xF) == 0xC && is_write && (buf[0] & 0x1) == 0 {
                let _ = target.read32(offset); // flush the write
                self.completion_handler();
            }
        }
    }

    fn do_reg_rw(&self, target: &Arc<dyn ControllerRegs>, offset: u64, is_write: bool, buf: &mut [u8]) {
        if is_write {
            regs::reg_write(&**target, offset, buf);
        } else {
            regs::reg_read(&**target, offset, buf);
        }
    }

    /// A write to a shadowed doorbell register.
    pub(crate) fn intercept_db_write(&self, idx: u16, buf: &[u8]) {
        if !self.is_enabled() {
            return;
        }

        let mut value = [0u8; 8];
        value[..buf.len()].copy_from_slice(buf);
        let write_value = u64::from_le_bytes(value);
        let queue_id = idx / 2;

        if idx & 0x1 == 0 {
            self.subm_db_write(queue_id, (write_value & regs::DB_VALUE_MASK) as u16);
        } else {
            self.update_comp_db(queue_id, (write_value & regs::DB_VALUE_MASK) as u16);
        }

        self.process_all_comp_queues();
    }

    fn subm_db_write(&self, queue_id: u16, g_new_tail: u16) {
        let sq = match self.subm_queue(queue_id) {
            Some(sq) => sq,
            None => {
                log::warn!("submission doorbell for unknown queue {}", queue_id);
                return;
            }
        };

        let mut fetch = sq.fetch.lock();

        // Intercept here rather than when the controller becomes ready; we
        // would never know whether the ready bit gets read at all.
        if self.state.lock().n_ns == 0 && !self.is_fetch_paused() {
            self.get_drive_info();
        }

        if queue_id != 0 && !self.is_io_ready() {
            self.io_ready.store(true, Ordering::Release);
            self.state.lock().queue_to_fetch = 1;
            let pause = self
                .interceptor()
                .map(|i| i.on_init(self) == FetchPolicy::Pause)
                .unwrap_or(false);
            if pause {
                self.set_fetch_paused(true);
                drop(fetch);
                // The guest's first I/O doorbell is held until the
                // interceptor reports ready.
                while self.is_fetch_paused() {
                    std::thread::yield_now();
                    self.process_all_comp_queues();
                }
                fetch = sq.fetch.lock();
            }
        }

        // Commands the guest stored must be visible before we fetch them.
        crate::memory::store_fence();

        fetch.new_tail = g_new_tail;
        drop(fetch);

        if queue_id != 0 {
            self.try_process_requests(queue_id);
        } else {
            // Postpone admin fetches while a completion scan runs; deleting a
            // queue mid-scan would yield unexpected errors.
            let defer = self.state.lock().handling_comp != 0;
            if !defer {
                self.try_process_requests(queue_id);
            }
        }

        self.try_polling_for_completeness(queue_id);
    }

    /// Entry point for interrupt-side invocations (MSI-X unmask, INTMS/INTMC
    /// writes, or the PCI layer's interrupt callback).
    pub fn completion_handler(&self) {
        if !self.is_enabled() {
            return;
        }
        self.process_all_comp_queues();
    }
}
