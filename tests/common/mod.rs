//! Hardware emulation for exercising the shadow-queue engine end to end.
//!
//! The principle is to emulate the device, not to mock the core: the real
//! engine runs unchanged against a behavioural NVMe controller model wired
//! to the same emulated physical memory. The mock executes submission rings
//! synchronously when its doorbell is written, which makes every scenario
//! deterministic without threads.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use nvme_passthru::{
    BarRegion, BindParams, ControllerRegs, DmaPool, EmulatedMemory, GuestMemory, NvmeHost,
};

pub const PAGE: u64 = 4096;

// Guest-physical layout used by the tests
pub const G_ASQ: u64 = 0x10_000;
pub const G_ACQ: u64 = 0x20_000;
pub const G_IO_SQ: u64 = 0x30_000;
pub const G_IO_CQ: u64 = 0x40_000;
pub const G_DATA: u64 = 0x100_000;

pub const ADMIN_DEPTH: u16 = 64;

// Register offsets (mirrors the BAR0 map)
const REG_CC: u64 = 0x14;
const REG_CSTS: u64 = 0x1C;
const REG_AQA: u64 = 0x24;
const REG_ASQ: u64 = 0x28;
const REG_ACQ: u64 = 0x30;
const DB_BASE: u64 = 0x1000;

// =============================================================================
// Device model
// =============================================================================

#[derive(Clone)]
pub struct MockConfig {
    /// CAP.MQES, 0-based.
    pub mqes: u16,
    pub n_namespaces: u32,
    pub mdts: u8,
    pub sgl_support: u32,
    pub oncs: u16,
    /// Queue counts granted by Set/Get Features (1-based).
    pub granted_sq: u16,
    pub granted_cq: u16,
    pub lba_nbytes: u32,
    pub ns_lbas: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            mqes: 255,
            n_namespaces: 1,
            mdts: 5,
            sgl_support: 0,
            oncs: 0,
            granted_sq: 8,
            granted_cq: 8,
            lba_nbytes: 512,
            ns_lbas: 8192,
        }
    }
}

struct DevSq {
    base: u64,
    n_entries: u16,
    entry_nbytes: usize,
    head: u16,
    tail: u16,
    cqid: u16,
}

struct DevCq {
    base: u64,
    n_entries: u16,
    tail: u16,
    phase: bool,
    last_head_db: u16,
}

/// A completion the device produced but has not posted yet (deferred mode).
struct PendingCqe {
    cqid: u16,
    sqid: u16,
    sq_head: u16,
    cid: u16,
    dword0: u32,
    status_bits: u16, // sct/sc shifted, phase bit added at post time
}

struct MockInner {
    cfg: MockConfig,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    nssrc: u32,
    intms: u32,
    vs: u32,
    sqs: HashMap<u16, DevSq>,
    cqs: HashMap<u16, DevCq>,
    disks: HashMap<u32, Vec<u8>>,
    /// Pending Asynchronous Event Requests (never completed by the mock).
    aer_pending: Vec<u16>,
    /// Defer I/O completions until `flush_completions`.
    defer_io: bool,
    /// Fail the next I/O command with Internal Error.
    fail_next_io: bool,
    deferred: Vec<PendingCqe>,
    /// Delete SQ completions held back until the queue's I/O drains.
    pending_deletes: Vec<PendingCqe>,
}

pub struct MockNvmeController {
    mem: Arc<EmulatedMemory>,
    inner: Mutex<MockInner>,
}

fn rd16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
}

fn rd32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn rd64(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
}

impl MockNvmeController {
    pub fn new(mem: Arc<EmulatedMemory>, cfg: MockConfig) -> Arc<MockNvmeController> {
        Arc::new(MockNvmeController {
            mem,
            inner: Mutex::new(MockInner {
                cfg,
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                nssrc: 0,
                intms: 0,
                vs: 0x0001_0300, // NVMe 1.3
                sqs: HashMap::new(),
                cqs: HashMap::new(),
                disks: HashMap::new(),
                aer_pending: Vec::new(),
                defer_io: false,
                fail_next_io: false,
                deferred: Vec::new(),
                pending_deletes: Vec::new(),
            }),
        })
    }

    // MQES | CQR=0 | TO | NSSRS; DSTRD=0, MPSMIN=0
    fn cap_value(cfg: &MockConfig) -> u64 {
        (cfg.mqes as u64) | (0xFF << 24) | (1 << 36)
    }

    // ----- test-side observation --------------------------------------------

    /// The ASQ base the hardware actually got programmed with.
    pub fn device_asq(&self) -> u64 {
        self.inner.lock().asq
    }

    pub fn device_acq(&self) -> u64 {
        self.inner.lock().acq
    }

    /// Last completion head doorbell value the device saw for a queue.
    pub fn last_cq_head_db(&self, qid: u16) -> Option<u16> {
        self.inner.lock().cqs.get(&qid).map(|cq| cq.last_head_db)
    }

    pub fn has_sq(&self, qid: u16) -> bool {
        self.inner.lock().sqs.contains_key(&qid)
    }

    /// Raw bytes of some LBAs, as stored on the device.
    pub fn disk_data(&self, nsid: u32, lba: u64, n_lbas: u64) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let lba_nbytes = inner.cfg.lba_nbytes as u64;
        let disk = Self::disk(&mut inner, nsid);
        let start = (lba * lba_nbytes) as usize;
        let end = start + (n_lbas * lba_nbytes) as usize;
        disk[start..end].to_vec()
    }

    pub fn set_disk_data(&self, nsid: u32, lba: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let start = (lba * inner.cfg.lba_nbytes as u64) as usize;
        let disk = Self::disk(&mut inner, nsid);
        disk[start..start + data.len()].copy_from_slice(data);
    }

    pub fn set_defer_io(&self, defer: bool) {
        self.inner.lock().defer_io = defer;
    }

    pub fn set_fail_next_io(&self) {
        self.inner.lock().fail_next_io = true;
    }

    /// Post every deferred I/O completion, then any Delete SQ completion that
    /// was waiting for those I/Os to drain.
    pub fn flush_completions(&self) {
        let mut inner = self.inner.lock();
        let deferred: Vec<PendingCqe> = inner.deferred.drain(..).collect();
        for cqe in deferred {
            Self::post_cqe(&self.mem, &mut inner, cqe);
        }
        let deletes: Vec<PendingCqe> = inner.pending_deletes.drain(..).collect();
        for cqe in deletes {
            Self::post_cqe(&self.mem, &mut inner, cqe);
        }
    }

    // ----- device behaviour --------------------------------------------------

    fn disk<'a>(inner: &'a mut MockInner, nsid: u32) -> &'a mut Vec<u8> {
        let nbytes = (inner.cfg.ns_lbas * inner.cfg.lba_nbytes as u64) as usize;
        inner.disks.entry(nsid).or_insert_with(|| vec![0u8; nbytes])
    }

    fn handle_cc_write(&self, value: u32) {
        let mut inner = self.inner.lock();
        let was_enabled = inner.cc & 1 != 0;
        inner.cc = value;
        if value & 1 != 0 && !was_enabled {
            // Admin queues come from AQA/ASQ/ACQ at enable time.
            let asqs = (inner.aqa & 0xFFF) as u16 + 1;
            let acqs = ((inner.aqa >> 16) & 0xFFF) as u16 + 1;
            let (asq, acq) = (inner.asq, inner.acq);
            inner.sqs.insert(
                0,
                DevSq {
                    base: asq,
                    n_entries: asqs,
                    entry_nbytes: 64,
                    head: 0,
                    tail: 0,
                    cqid: 0,
                },
            );
            inner.cqs.insert(
                0,
                DevCq {
                    base: acq,
                    n_entries: acqs,
                    tail: 0,
                    phase: true,
                    last_head_db: 0,
                },
            );
            inner.csts |= 1;
        } else if value & 1 == 0 && was_enabled {
            inner.sqs.clear();
            inner.cqs.clear();
            inner.aer_pending.clear();
            inner.deferred.clear();
            inner.pending_deletes.clear();
            inner.csts &= !1;
        }
    }

    fn handle_doorbell(&self, offset: u64, value: u32) {
        let idx = ((offset - DB_BASE) / 4) as u16;
        let qid = idx / 2;
        if idx & 1 == 0 {
            {
                let mut inner = self.inner.lock();
                match inner.sqs.get_mut(&qid) {
                    Some(sq) => sq.tail = value as u16,
                    None => return,
                }
            }
            self.process_sq(qid);
        } else {
            let mut inner = self.inner.lock();
            if let Some(cq) = inner.cqs.get_mut(&qid) {
                cq.last_head_db = value as u16;
            }
        }
    }

    fn process_sq(&self, qid: u16) {
        loop {
            let mut inner = self.inner.lock();
            let sq = match inner.sqs.get_mut(&qid) {
                Some(sq) => sq,
                None => return,
            };
            if sq.head == sq.tail {
                return;
            }
            let entry_nbytes = sq.entry_nbytes;
            let entry_addr = sq.base + sq.head as u64 * entry_nbytes as u64;
            sq.head = (sq.head + 1) % sq.n_entries;
            let sq_head = sq.head;
            let cqid = sq.cqid;

            let mut entry = vec![0u8; entry_nbytes];
            self.mem.read_phys(entry_addr, &mut entry);

            if qid == 0 {
                self.exec_admin(&mut inner, &entry, sq_head);
            } else {
                self.exec_io(&mut inner, qid, cqid, &entry, sq_head);
            }
        }
    }

    fn exec_admin(&self, inner: &mut MockInner, entry: &[u8], sq_head: u16) {
        let opcode = entry[0];
        let cid = rd16(entry, 2);
        let nsid = rd32(entry, 4);
        let prp1 = rd64(entry, 24);
        let cdw10 = rd32(entry, 40);
        let cdw11 = rd32(entry, 44);

        let mut dword0 = 0u32;
        let mut status_bits = 0u16;

        match opcode {
            0x06 => {
                // Identify
                let mut data = vec![0u8; 4096];
                let cns = cdw10 & 0xFF;
                if cns == 1 {
                    data[77] = inner.cfg.mdts;
                    data[516..520].copy_from_slice(&inner.cfg.n_namespaces.to_le_bytes());
                    data[520..522].copy_from_slice(&inner.cfg.oncs.to_le_bytes());
                    data[536..540].copy_from_slice(&inner.cfg.sgl_support.to_le_bytes());
                } else if cns == 0 {
                    data[0..8].copy_from_slice(&inner.cfg.ns_lbas.to_le_bytes());
                    let lbads = inner.cfg.lba_nbytes.trailing_zeros();
                    data[128..132].copy_from_slice(&(lbads << 16).to_le_bytes());
                    let _ = nsid;
                }
                self.mem.write_phys(prp1, &data);
            }
            0x09 | 0x0A => {
                // Set/Get Features
                if cdw10 & 0xFF == 0x07 {
                    dword0 = ((inner.cfg.granted_cq as u32 - 1) << 16)
                        | (inner.cfg.granted_sq as u32 - 1);
                }
            }
            0x05 => {
                // Create I/O CQ
                let new_qid = (cdw10 & 0xFFFF) as u16;
                let n_entries = (cdw10 >> 16) as u16 + 1;
                if cdw11 & 1 == 0 {
                    status_bits = 0x02 << 1; // invalid field: PC required
                } else {
                    inner.cqs.insert(
                        new_qid,
                        DevCq {
                            base: prp1,
                            n_entries,
                            tail: 0,
                            phase: true,
                            last_head_db: 0,
                        },
                    );
                }
            }
            0x01 => {
                // Create I/O SQ
                let new_qid = (cdw10 & 0xFFFF) as u16;
                let n_entries = (cdw10 >> 16) as u16 + 1;
                let cqid = (cdw11 >> 16) as u16;
                let entry_nbytes = 1usize << ((inner.cc >> 16) & 0xF);
                inner.sqs.insert(
                    new_qid,
                    DevSq {
                        base: prp1,
                        n_entries,
                        entry_nbytes,
                        head: 0,
                        tail: 0,
                        cqid,
                    },
                );
            }
            0x00 => {
                // Delete I/O SQ: completes only after the queue's I/O drains.
                let del_qid = (cdw10 & 0xFFFF) as u16;
                inner.sqs.remove(&del_qid);
                let has_inflight = inner.deferred.iter().any(|c| c.sqid == del_qid);
                if has_inflight {
                    inner.pending_deletes.push(PendingCqe {
                        cqid: 0,
                        sqid: 0,
                        sq_head,
                        cid,
                        dword0: 0,
                        status_bits: 0,
                    });
                    return;
                }
            }
            0x04 => {
                // Delete I/O CQ
                let del_qid = (cdw10 & 0xFFFF) as u16;
                inner.cqs.remove(&del_qid);
            }
            0x08 => {
                // Abort: pretend the target was aborted (bit 0 clear), so a
                // patched completion is distinguishable.
            }
            0x0C => {
                // Asynchronous Event Request: completes only on an event.
                inner.aer_pending.push(cid);
                return;
            }
            _ => {}
        }

        Self::post_cqe(
            &self.mem,
            inner,
            PendingCqe {
                cqid: 0,
                sqid: 0,
                sq_head,
                cid,
                dword0,
                status_bits,
            },
        );
    }

    fn exec_io(&self, inner: &mut MockInner, qid: u16, cqid: u16, entry: &[u8], sq_head: u16) {
        let opcode = entry[0];
        let cid = rd16(entry, 2);
        let nsid = rd32(entry, 4);
        let prp1 = rd64(entry, 24);
        let prp2 = rd64(entry, 32);
        let lba = rd64(entry, 40);
        let n_lbas = (rd32(entry, 48) & 0xFFFF) as u64 + 1;

        let lba_nbytes = inner.cfg.lba_nbytes as u64;
        let nbytes = n_lbas * lba_nbytes;
        let mut status_bits = 0u16;

        if inner.fail_next_io {
            inner.fail_next_io = false;
            let cqe = PendingCqe {
                cqid,
                sqid: qid,
                sq_head,
                cid,
                dword0: 0,
                status_bits: 0x06 << 1, // internal error
            };
            if inner.defer_io {
                inner.deferred.push(cqe);
            } else {
                Self::post_cqe(&self.mem, inner, cqe);
            }
            return;
        }

        match opcode {
            0x01 => {
                // Write
                let mut data = vec![0u8; nbytes as usize];
                let mut off = 0usize;
                for (phys, n) in self.prp_segments(prp1, prp2, nbytes) {
                    self.mem.read_phys(phys, &mut data[off..off + n]);
                    off += n;
                }
                let start = (lba * lba_nbytes) as usize;
                Self::disk(inner, nsid)[start..start + nbytes as usize].copy_from_slice(&data);
            }
            0x02 => {
                // Read
                let start = (lba * lba_nbytes) as usize;
                let data = Self::disk(inner, nsid)[start..start + nbytes as usize].to_vec();
                let mut off = 0usize;
                for (phys, n) in self.prp_segments(prp1, prp2, nbytes) {
                    self.mem.write_phys(phys, &data[off..off + n]);
                    off += n;
                }
            }
            0x05 => {
                // Compare
                let mut data = vec![0u8; nbytes as usize];
                let mut off = 0usize;
                for (phys, n) in self.prp_segments(prp1, prp2, nbytes) {
                    self.mem.read_phys(phys, &mut data[off..off + n]);
                    off += n;
                }
                let start = (lba * lba_nbytes) as usize;
                if Self::disk(inner, nsid)[start..start + nbytes as usize] != data[..] {
                    status_bits = (0x2 << 9) | (0x85 << 1); // compare failure
                }
            }
            0x00 => {} // Flush
            _ => {
                status_bits = 0x01 << 1; // invalid opcode
            }
        }

        let cqe = PendingCqe {
            cqid,
            sqid: qid,
            sq_head,
            cid,
            dword0: 0,
            status_bits,
        };
        if inner.defer_io {
            inner.deferred.push(cqe);
        } else {
            Self::post_cqe(&self.mem, inner, cqe);
        }
    }

    fn post_cqe(mem: &EmulatedMemory, inner: &mut MockInner, cqe: PendingCqe) {
        let cq = inner.cqs.get_mut(&cqe.cqid).expect("completion queue exists");
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&cqe.dword0.to_le_bytes());
        bytes[8..10].copy_from_slice(&cqe.sq_head.to_le_bytes());
        bytes[10..12].copy_from_slice(&cqe.sqid.to_le_bytes());
        bytes[12..14].copy_from_slice(&cqe.cid.to_le_bytes());
        let status = cqe.status_bits | cq.phase as u16;
        bytes[14..16].copy_from_slice(&status.to_le_bytes());

        mem.write_phys(cq.base + cq.tail as u64 * 16, &bytes);
        cq.tail += 1;
        if cq.tail == cq.n_entries {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }

    fn prp_segments(&self, prp1: u64, prp2: u64, nbytes: u64) -> Vec<(u64, usize)> {
        let mut segs = Vec::new();
        let first_off = prp1 % PAGE;
        let first = nbytes.min(PAGE - first_off);
        segs.push((prp1, first as usize));
        let mut remaining = nbytes - first;
        if remaining == 0 {
            return segs;
        }
        if remaining <= PAGE {
            segs.push((prp2, remaining as usize));
            return segs;
        }
        let mut list_base = prp2 & !(PAGE - 1);
        let mut idx = ((prp2 % PAGE) / 8) as usize;
        while remaining > 0 {
            if idx == 511 && remaining > PAGE {
                let mut next = [0u8; 8];
                self.mem.read_phys(list_base + 511 * 8, &mut next);
                let next = u64::from_le_bytes(next);
                list_base = next & !(PAGE - 1);
                idx = ((next % PAGE) / 8) as usize;
            }
            let mut cell = [0u8; 8];
            self.mem.read_phys(list_base + (idx * 8) as u64, &mut cell);
            let phys = u64::from_le_bytes(cell);
            let n = remaining.min(PAGE);
            segs.push((phys, n as usize));
            idx += 1;
            remaining -= n;
        }
        segs
    }
}

impl ControllerRegs for MockNvmeController {
    fn read32(&self, offset: u64) -> u32 {
        let inner = self.inner.lock();
        match offset {
            0x00 => Self::cap_value(&inner.cfg) as u32,
            0x04 => (Self::cap_value(&inner.cfg) >> 32) as u32,
            0x08 => inner.vs,
            0x0C | 0x10 => inner.intms,
            0x14 => inner.cc,
            0x1C => inner.csts,
            0x20 => inner.nssrc,
            0x24 => inner.aqa,
            0x28 => inner.asq as u32,
            0x2C => (inner.asq >> 32) as u32,
            0x30 => inner.acq as u32,
            0x34 => (inner.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        match offset {
            0x14 => {
                self.handle_cc_write(value);
                return;
            }
            _ if offset >= DB_BASE => {
                self.handle_doorbell(offset, value);
                return;
            }
            _ => {}
        }
        let mut inner = self.inner.lock();
        match offset {
            0x0C => inner.intms |= value,
            0x10 => inner.intms &= !value,
            0x20 => inner.nssrc = value,
            0x24 => inner.aqa = value,
            0x28 => inner.asq = (inner.asq & !0xFFFF_FFFF) | value as u64,
            0x2C => inner.asq = (inner.asq & 0xFFFF_FFFF) | ((value as u64) << 32),
            0x30 => inner.acq = (inner.acq & !0xFFFF_FFFF) | value as u64,
            0x34 => inner.acq = (inner.acq & 0xFFFF_FFFF) | ((value as u64) << 32),
            _ => {}
        }
    }
}

// =============================================================================
// Guest-side rig
// =============================================================================

/// A parsed guest-visible completion entry.
#[derive(Clone, Copy, Debug)]
pub struct GuestCqe {
    pub dword0: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

impl GuestCqe {
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    pub fn ok(&self) -> bool {
        self.status & 0xFFFE == 0
    }
}

pub struct TestRig {
    pub mem: Arc<EmulatedMemory>,
    pub dev: Arc<MockNvmeController>,
    pub host: Arc<NvmeHost>,
    pub io_depth: u16,
    asq_tail: u16,
    acq_head: u16,
    acq_phase: bool,
    io_sq_tail: u16,
    io_cq_head: u16,
    io_cq_phase: bool,
    next_cid: u16,
}

pub fn setup(cfg: MockConfig) -> TestRig {
    setup_with(cfg, BindParams::default(), |_| {})
}

/// Build the rig; `configure` runs against the host right after bind, e.g.
/// to install an interceptor before the guest enables the controller.
pub fn setup_with(
    cfg: MockConfig,
    params: BindParams,
    configure: impl FnOnce(&Arc<NvmeHost>),
) -> TestRig {
    let _ = env_logger::builder().is_test(true).try_init();

    let mem = EmulatedMemory::new(8 << 20, 8 << 20);
    let dev = MockNvmeController::new(mem.clone(), cfg);
    let host = NvmeHost::bind(
        dev.clone() as Arc<dyn ControllerRegs>,
        None,
        mem.clone() as Arc<dyn GuestMemory>,
        mem.clone() as Arc<dyn DmaPool>,
        params,
    );
    configure(&host);

    TestRig {
        mem,
        dev,
        host,
        io_depth: 32,
        asq_tail: 0,
        acq_head: 0,
        acq_phase: true,
        io_sq_tail: 0,
        io_cq_head: 0,
        io_cq_phase: true,
        next_cid: 0x100,
    }
}

impl TestRig {
    pub fn mmio_write32(&self, offset: u64, value: u32) {
        let mut buf = value.to_le_bytes();
        self.host
            .mmio_access(BarRegion::Bar0, offset, true, &mut buf);
    }

    pub fn mmio_write64(&self, offset: u64, value: u64) {
        let mut buf = value.to_le_bytes();
        self.host
            .mmio_access(BarRegion::Bar0, offset, true, &mut buf);
    }

    pub fn mmio_read32(&self, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.host
            .mmio_access(BarRegion::Bar0, offset, false, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn mmio_read64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.host
            .mmio_access(BarRegion::Bar0, offset, false, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn next_cid(&mut self) -> u16 {
        self.next_cid = self.next_cid.wrapping_add(1);
        self.next_cid
    }

    /// Program AQA/ASQ/ACQ and set CC.EN the way a guest driver does.
    pub fn enable_controller(&mut self) {
        let aqa = ((ADMIN_DEPTH as u32 - 1) << 16) | (ADMIN_DEPTH as u32 - 1);
        self.mmio_write32(REG_AQA, aqa);
        self.mmio_write64(REG_ASQ, G_ASQ);
        self.mmio_write64(REG_ACQ, G_ACQ);
        // EN, IOSQES=6 (64B), IOCQES=4 (16B)
        self.mmio_write32(REG_CC, 1 | (6 << 16) | (4 << 20));
        assert!(self.mmio_read32(REG_CSTS) & 1 != 0, "controller not ready");
        self.asq_tail = 0;
        self.acq_head = 0;
        self.acq_phase = true;
    }

    // ----- admin queue -------------------------------------------------------

    pub fn submit_admin(&mut self, entry: &[u8; 64]) {
        self.mem
            .write_phys(G_ASQ + self.asq_tail as u64 * 64, entry);
        self.asq_tail = (self.asq_tail + 1) % ADMIN_DEPTH;
        self.mmio_write32(DB_BASE, self.asq_tail as u32);
    }

    fn read_cqe(&self, base: u64, head: u16, expected_phase: bool) -> Option<GuestCqe> {
        let mut bytes = [0u8; 16];
        self.mem.read_phys(base + head as u64 * 16, &mut bytes);
        let cqe = GuestCqe {
            dword0: rd32(&bytes, 0),
            sq_head: rd16(&bytes, 8),
            sq_id: rd16(&bytes, 10),
            cid: rd16(&bytes, 12),
            status: rd16(&bytes, 14),
        };
        if cqe.phase() == expected_phase {
            Some(cqe)
        } else {
            None
        }
    }

    /// Consume the next admin completion (running the interrupt-side handler
    /// first) and acknowledge it through the completion doorbell.
    pub fn wait_admin_comp(&mut self) -> GuestCqe {
        self.host.completion_handler();
        let cqe = self
            .read_cqe(G_ACQ, self.acq_head, self.acq_phase)
            .expect("no admin completion");
        self.acq_head += 1;
        if self.acq_head == ADMIN_DEPTH {
            self.acq_head = 0;
            self.acq_phase = !self.acq_phase;
        }
        self.mmio_write32(DB_BASE + 4, self.acq_head as u32);
        cqe
    }

    pub fn try_admin_comp(&mut self) -> Option<GuestCqe> {
        self.host.completion_handler();
        self.read_cqe(G_ACQ, self.acq_head, self.acq_phase)
    }

    // ----- admin command builders -------------------------------------------

    pub fn admin_cmd(&mut self, opcode: u8) -> ([u8; 64], u16) {
        let cid = self.next_cid();
        let mut entry = [0u8; 64];
        entry[0] = opcode;
        entry[2..4].copy_from_slice(&cid.to_le_bytes());
        (entry, cid)
    }

    pub fn identify_cmd(&mut self, nsid: u32, cns: u8, prp1: u64) -> ([u8; 64], u16) {
        let (mut entry, cid) = self.admin_cmd(0x06);
        entry[4..8].copy_from_slice(&nsid.to_le_bytes());
        entry[24..32].copy_from_slice(&prp1.to_le_bytes());
        entry[40..44].copy_from_slice(&(cns as u32).to_le_bytes());
        (entry, cid)
    }

    pub fn set_features_nq_cmd(&mut self, n: u16) -> ([u8; 64], u16) {
        let (mut entry, cid) = self.admin_cmd(0x09);
        entry[40..44].copy_from_slice(&0x07u32.to_le_bytes());
        let requested = ((n as u32 - 1) << 16) | (n as u32 - 1);
        entry[44..48].copy_from_slice(&requested.to_le_bytes());
        (entry, cid)
    }

    pub fn create_cq_cmd(&mut self, qid: u16, depth: u16, gphys: u64) -> ([u8; 64], u16) {
        let (mut entry, cid) = self.admin_cmd(0x05);
        entry[24..32].copy_from_slice(&gphys.to_le_bytes());
        let cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
        entry[40..44].copy_from_slice(&cdw10.to_le_bytes());
        entry[44..48].copy_from_slice(&3u32.to_le_bytes()); // IEN | PC
        (entry, cid)
    }

    pub fn create_sq_cmd(&mut self, qid: u16, depth: u16, gphys: u64, cqid: u16) -> ([u8; 64], u16) {
        let (mut entry, cid) = self.admin_cmd(0x01);
        entry[24..32].copy_from_slice(&gphys.to_le_bytes());
        let cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
        entry[40..44].copy_from_slice(&cdw10.to_le_bytes());
        let cdw11 = ((cqid as u32) << 16) | 1; // PC
        entry[44..48].copy_from_slice(&cdw11.to_le_bytes());
        (entry, cid)
    }

    pub fn delete_sq_cmd(&mut self, qid: u16) -> ([u8; 64], u16) {
        let (mut entry, cid) = self.admin_cmd(0x00);
        entry[40..44].copy_from_slice(&(qid as u32).to_le_bytes());
        (entry, cid)
    }

    /// Full bring-up: enable, Set Features, create the I/O queue pair.
    pub fn bring_up_io_queue(&mut self, depth: u16) {
        self.enable_controller();
        self.io_depth = depth;

        let (entry, cid) = self.set_features_nq_cmd(8);
        self.submit_admin(&entry);
        let cqe = self.wait_admin_comp();
        assert!(cqe.ok(), "set features failed: {:#x}", cqe.status);
        assert_eq!(cqe.cid, cid);

        let (entry, _) = self.create_cq_cmd(1, depth, G_IO_CQ);
        self.submit_admin(&entry);
        assert!(self.wait_admin_comp().ok());

        let (entry, _) = self.create_sq_cmd(1, depth, G_IO_SQ, 1);
        self.submit_admin(&entry);
        assert!(self.wait_admin_comp().ok());

        self.io_sq_tail = 0;
        self.io_cq_head = 0;
        self.io_cq_phase = true;
    }

    // ----- I/O queue ---------------------------------------------------------

    pub fn io_cmd(&mut self, opcode: u8, nsid: u32, lba: u64, n_lbas: u16, prp1: u64, prp2: u64) -> ([u8; 64], u16) {
        let cid = self.next_cid();
        let mut entry = [0u8; 64];
        entry[0] = opcode;
        entry[2..4].copy_from_slice(&cid.to_le_bytes());
        entry[4..8].copy_from_slice(&nsid.to_le_bytes());
        entry[24..32].copy_from_slice(&prp1.to_le_bytes());
        entry[32..40].copy_from_slice(&prp2.to_le_bytes());
        entry[40..48].copy_from_slice(&lba.to_le_bytes());
        entry[48..52].copy_from_slice(&((n_lbas as u32) - 1).to_le_bytes());
        (entry, cid)
    }

    pub fn submit_io(&mut self, entry: &[u8; 64]) {
        self.mem
            .write_phys(G_IO_SQ + self.io_sq_tail as u64 * 64, entry);
        self.io_sq_tail = (self.io_sq_tail + 1) % self.io_depth;
        self.mmio_write32(DB_BASE + 8, self.io_sq_tail as u32);
    }

    pub fn wait_io_comp(&mut self) -> GuestCqe {
        self.host.completion_handler();
        let cqe = self
            .read_cqe(G_IO_CQ, self.io_cq_head, self.io_cq_phase)
            .expect("no I/O completion");
        self.io_cq_head += 1;
        if self.io_cq_head == self.io_depth {
            self.io_cq_head = 0;
            self.io_cq_phase = !self.io_cq_phase;
        }
        self.mmio_write32(DB_BASE + 12, self.io_cq_head as u32);
        cqe
    }

    pub fn try_io_comp(&mut self) -> Option<GuestCqe> {
        self.host.completion_handler();
        self.read_cqe(G_IO_CQ, self.io_cq_head, self.io_cq_phase)
    }

    /// Read the next I/O completion without acknowledging it.
    pub fn peek_io_comp(&mut self) -> Option<GuestCqe> {
        self.host.completion_handler();
        self.read_cqe(G_IO_CQ, self.io_cq_head, self.io_cq_phase)
    }

    pub fn ack_io_comp(&mut self) {
        self.io_cq_head += 1;
        if self.io_cq_head == self.io_depth {
            self.io_cq_head = 0;
            self.io_cq_phase = !self.io_cq_phase;
        }
        self.mmio_write32(DB_BASE + 12, self.io_cq_head as u32);
    }
}
