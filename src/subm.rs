//! Submission path: fetching guest commands and classifying them.
//!
//! Triggered by submission doorbell writes and by the completion handler's
//! fetch tail. Admin commands are inspected and possibly patched before they
//! reach the hardware; I/O commands are measured and offered to the
//! interceptor.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cmd::{self, CMD_ANS2_NBYTES, CMD_NBYTES, TX_TYPE_PRP};
use crate::host::NvmeHost;
use crate::hub::{CompStatus, Request, SubmSlot, DEFAULT_FETCH_LIMIT};
use crate::memory::{DmaBuffer, MapFlags};
use crate::queue::{CompQueue, SubmFetch, SubmQueue};
use crate::regs;

pub(crate) const CMD_NBYTES_STD: usize = CMD_NBYTES;

/// Polling for completeness gives up after this long; firmware with a short
/// command deadline would have timed out anyway and the state is
/// unrecoverable.
pub(crate) const POLL_COMPLETENESS_TIMEOUT: Duration = Duration::from_secs(30);

impl NvmeHost {
    /// Fetch new guest commands on a submission queue (unless fetching is
    /// paused or the queue is disabled) and drain whatever is waiting to the
    /// hardware. Returns the number of commands fetched.
    pub(crate) fn try_process_requests(&self, queue_id: u16) -> u32 {
        let sq = match self.subm_queue(queue_id) {
            Some(sq) => sq,
            None => return 0,
        };
        if sq.is_disabled() {
            return 0;
        }

        let mut fetched = 0;
        if !self.is_fetch_paused() {
            let _serial = if self.serialize_fetch.load(Ordering::Acquire) {
                Some(self.fetch_req_lock.lock())
            } else {
                None
            };
            let mut fetch = sq.fetch.lock();
            fetched = self.fetch_requests_from_guest(&sq, &mut fetch);
        }

        self.submit_queuing_requests(queue_id);
        fetched
    }

    fn fetching_limit(&self, queue_id: u16) -> u32 {
        if queue_id == 0 {
            return DEFAULT_FETCH_LIMIT;
        }
        match self.interceptor() {
            Some(interceptor) => {
                let n_waiting = self
                    .hub_for_subm(queue_id)
                    .map(|hub| hub.n_waiting_guest())
                    .unwrap_or(0);
                interceptor.fetch_limit(n_waiting)
            }
            None => DEFAULT_FETCH_LIMIT,
        }
    }

    fn fetch_requests_from_guest(&self, sq: &Arc<SubmQueue>, fetch: &mut SubmFetch) -> u32 {
        if sq.id != 0
            && fetch.new_tail > 1
            && self.has_ans2_cmd_quirk()
            && self.g_cmd_size_check.swap(false, Ordering::AcqRel)
        {
            self.try_correct_g_cmd_size(fetch);
        }

        let mut n_fetchable = self.fetching_limit(sq.id);
        let n_entries = fetch.g.n_entries;
        let mut count = 0u32;
        let mut entry = [0u8; CMD_ANS2_NBYTES];

        while fetch.cur_tail != fetch.new_tail && n_fetchable != 0 {
            let entry_nbytes = fetch.g.entry_nbytes;
            fetch.g.read_entry(fetch.cur_tail, &mut entry[..entry_nbytes]);

            let mut req = Request::from_guest_cmd(&entry[..entry_nbytes], sq.id);
            if sq.id == 0 {
                self.admin_cmd_handler(&mut req);
            } else {
                self.io_cmd_handler(&mut req);
            }
            self.register_request(req);

            count += 1;
            fetch.cur_tail = (fetch.cur_tail + 1) % n_entries;
            n_fetchable -= 1;
        }

        count
    }

    fn has_ans2_cmd_quirk(&self) -> bool {
        self.vendor_id() == regs::VENDOR_ID_APPLE
            && self.device_id() == regs::DEV_APPLE_ANS2
            && self.hparams.read().h_io_subm_entry_nbytes == CMD_ANS2_NBYTES
    }

    /// ANS2 hardware takes 128-byte commands, but the guest may have latched
    /// a 64-byte entry size while actually writing 128-byte commands. Decide
    /// by looking at the second 64-byte cell of the guest ring: all zero
    /// means the guest really uses 128-byte entries.
    ///
    /// This assumes the guest zeroed its submission ring before first use,
    /// which every known OS does but no spec requires; a guest recycling
    /// dirty memory would be misdiagnosed here, so both outcomes are logged.
    fn try_correct_g_cmd_size(&self, fetch: &mut SubmFetch) {
        if fetch.g.entry_nbytes == CMD_ANS2_NBYTES {
            log::debug!("guest I/O command size is already 128 bytes");
            return;
        }

        let mut second = [0u8; CMD_NBYTES];
        fetch.g.read_entry(1, &mut second);
        if second.iter().any(|&b| b != 0) {
            log::debug!("second 64-byte cell is non-zero, guest uses 64-byte I/O commands");
            return;
        }

        log::debug!(
            "second 64-byte cell is all zero, assuming a zeroed ring and \
             128-byte guest I/O commands"
        );

        let n_entries = fetch.g.n_entries;
        let nbytes = (n_entries as usize * CMD_ANS2_NBYTES).max(self.page_nbytes());
        match self.mem.map(fetch.g.gphys, nbytes, MapFlags::READ) {
            Some(mapping) => {
                fetch.g.mapping = mapping;
                fetch.g.entry_nbytes = CMD_ANS2_NBYTES;
            }
            None => log::error!("cannot remap guest submission ring with 128-byte entries"),
        }
    }

    // =========================================================================
    // Admin command classification
    // =========================================================================

    fn admin_cmd_handler(&self, req: &mut Request) {
        let opcode = req.cmd.std.opcode;
        match opcode {
            cmd::ADMIN_DELETE_SQ | cmd::ADMIN_DELETE_CQ => {
                log::debug!("admin: delete queue (opcode 0x{:02X})", opcode);
                self.handle_delete_queue(req);
            }
            cmd::ADMIN_CREATE_SQ | cmd::ADMIN_CREATE_CQ => {
                log::debug!("admin: create queue (opcode 0x{:02X})", opcode);
                self.handle_create_queue(req);
            }
            cmd::ADMIN_IDENTIFY => {
                log::debug!("admin: identify");
                self.handle_identify(req);
            }
            cmd::ADMIN_ABORT => {
                log::debug!("admin: abort");
                self.handle_abort(req);
            }
            cmd::ADMIN_SET_FEATURES | cmd::ADMIN_GET_FEATURES => {
                log::debug!(
                    "admin: features opcode 0x{:02X} id 0x{:X}",
                    opcode,
                    req.cmd.std.feature_id()
                );
            }
            cmd::ADMIN_ASYNC_EVENT => {
                log::debug!("admin: asynchronous event request");
            }
            cmd::ADMIN_GET_LOG_PAGE
            | cmd::ADMIN_NS_MGMT
            | cmd::ADMIN_FW_COMMIT
            | cmd::ADMIN_FW_DOWNLOAD
            | cmd::ADMIN_NS_ATTACH
            | cmd::ADMIN_KEEP_ALIVE
            | cmd::ADMIN_FORMAT_NVM
            | cmd::ADMIN_SECURITY_SEND
            | cmd::ADMIN_SECURITY_RECV => {
                log::debug!("admin: passthrough opcode 0x{:02X}", opcode);
            }
            _ => {
                log::debug!("unknown admin opcode 0x{:02X}", opcode);
            }
        }
    }

    fn handle_delete_queue(&self, req: &mut Request) {
        let queue_id = req.cmd.std.queue_id();
        let opcode = req.cmd.std.opcode;
        let (max_subm, max_comp) = {
            let queues = self.queues.read();
            (queues.max_n_subm, queues.max_n_comp)
        };

        if queue_id == 0
            || (opcode == cmd::ADMIN_DELETE_SQ && queue_id > max_subm)
            || (opcode == cmd::ADMIN_DELETE_CQ && queue_id > max_comp)
        {
            log::warn!(
                "delete queue opcode 0x{:02X} queue {} is invalid, no action",
                opcode,
                queue_id
            );
            return;
        }

        self.set_io_ready(false);

        // Disable now so no further guest commands are fetched; the backing
        // structures are freed once the delete itself completes.
        if opcode == cmd::ADMIN_DELETE_SQ {
            if let Some(sq) = self.subm_queue(queue_id) {
                sq.disabled.store(true, Ordering::Release);
            }
        } else if let Some(cq) = self.comp_queue(queue_id) {
            cq.disabled.store(true, Ordering::Release);
        }
    }

    fn handle_create_queue(&self, req: &mut Request) {
        let opcode = req.cmd.std.opcode;

        if self.queues.read().max_n_subm == 0 {
            log::warn!("Set Features for queue counts not seen, using defaults");
            let (n_subm, n_comp) = {
                let state = self.state.lock();
                (state.default_n_subm_queues, state.default_n_comp_queues)
            };
            self.set_max_n_queues(n_subm, n_comp);
        }

        if !req.cmd.std.queue_pc() {
            // CAP told the guest contiguous queues are required; let the
            // hardware fail the command.
            log::error!("create queue without the physically-contiguous bit");
            return;
        }

        let queue_id = req.cmd.std.queue_id();
        let g_n_entries = req.cmd.std.queue_size() + 1;
        let mut h_n_entries = g_n_entries;

        let (max_subm, max_comp) = {
            let queues = self.queues.read();
            (queues.max_n_subm, queues.max_n_comp)
        };
        if queue_id == 0
            || (opcode == cmd::ADMIN_CREATE_SQ && queue_id > max_subm)
            || (opcode == cmd::ADMIN_CREATE_CQ && queue_id > max_comp)
        {
            log::warn!(
                "create queue opcode 0x{:02X} queue {} is invalid, no action",
                opcode,
                queue_id
            );
            return;
        }

        if let Some(interceptor) = self.interceptor() {
            h_n_entries = interceptor.io_queue_entries(g_n_entries, self.max_n_entries());
            if h_n_entries != g_n_entries {
                req.cmd.std.set_queue_size(h_n_entries - 1);
            }
        }

        log::debug!(
            "create queue {}: host {} entries, guest {} entries",
            queue_id,
            h_n_entries,
            g_n_entries
        );

        let hp = {
            let hp = self.hparams.read();
            (
                hp.page_nbytes,
                hp.h_io_subm_entry_nbytes,
                hp.g_io_subm_entry_nbytes,
                hp.h_io_comp_entry_nbytes,
                hp.g_io_comp_entry_nbytes,
            )
        };
        let (page_nbytes, h_sq_entry, g_sq_entry, h_cq_entry, g_cq_entry) = hp;

        if opcode == cmd::ADMIN_CREATE_SQ {
            self.free_subm_queue_info(queue_id);

            let comp_queue_id = req.cmd.std.paired_comp_queue_id();
            let hub = match self.queues.read().hub(comp_queue_id) {
                Some(hub) => hub,
                None => {
                    log::warn!(
                        "create SQ {} names completion queue {} with no hub",
                        queue_id,
                        comp_queue_id
                    );
                    return;
                }
            };

            let rings = crate::queue::init_queue_rings(
                &self.dma,
                &self.mem,
                page_nbytes,
                h_n_entries,
                g_n_entries,
                h_sq_entry,
                g_sq_entry,
                req.cmd.std.prp1,
                MapFlags::READ,
            );
            let (h_ring, g_ring) = match rings {
                Some(rings) => rings,
                None => {
                    log::error!("cannot map guest submission queue {}", queue_id);
                    return;
                }
            };

            log::debug!("paired completion queue: {}", comp_queue_id);

            // The hardware gets the host ring, not the guest's.
            req.cmd.std.prp1 = h_ring.dma.phys();

            let sq = SubmQueue::new(queue_id, g_ring);
            sq.paired_cq.store(comp_queue_id, Ordering::Release);
            hub.add_slot(SubmSlot::new(queue_id, h_ring));
            self.queues.write().subm[queue_id as usize] = Some(sq);
        } else {
            self.free_comp_queue_info(queue_id);

            let rings = crate::queue::init_queue_rings(
                &self.dma,
                &self.mem,
                page_nbytes,
                h_n_entries,
                g_n_entries,
                h_cq_entry,
                g_cq_entry,
                req.cmd.std.prp1,
                MapFlags::READ | MapFlags::WRITE,
            );
            let (h_ring, g_ring) = match rings {
                Some(rings) => rings,
                None => {
                    log::error!("cannot map guest completion queue {}", queue_id);
                    return;
                }
            };

            req.cmd.std.prp1 = h_ring.dma.phys();

            let cq = CompQueue::new(queue_id, h_ring, g_ring);
            let mut queues = self.queues.write();
            queues.comp[queue_id as usize] = Some(cq);
            queues.hubs[queue_id as usize] = Some(Arc::new(crate::hub::RequestHub::new()));
        }
    }

    /// Swap the queue/hub arrays to their full size, admin entry preserved.
    pub(crate) fn set_max_n_queues(&self, max_n_subm: u16, max_n_comp: u16) {
        log::debug!(
            "I/O queues allocated: {} submission, {} completion",
            max_n_subm,
            max_n_comp
        );
        self.queues.write().set_max_n_queues(max_n_subm, max_n_comp);
    }

    pub(crate) fn free_subm_queue_info(&self, queue_id: u16) {
        let sq = self
            .queues
            .write()
            .subm
            .get_mut(queue_id as usize)
            .and_then(|entry| entry.take());
        let sq = match sq {
            Some(sq) => sq,
            None => return,
        };
        if let Some(comp_queue_id) = sq.paired_comp_queue() {
            if let Some(hub) = self.queues.read().hub(comp_queue_id) {
                for cb in hub.remove_slot(queue_id) {
                    cb(self, CompStatus::NONE);
                }
            }
        }
    }

    pub(crate) fn free_comp_queue_info(&self, queue_id: u16) {
        let (cq, hub) = {
            let mut queues = self.queues.write();
            let cq = queues.comp.get_mut(queue_id as usize).and_then(|e| e.take());
            let hub = queues.hubs.get_mut(queue_id as usize).and_then(|e| e.take());
            (cq, hub)
        };
        drop(cq);
        if let Some(hub) = hub {
            for cb in hub.cancel_all() {
                cb(self, CompStatus::NONE);
            }
        }
    }

    /// Identify transfers one page; redirect it to a host scratch page so the
    /// payload can be filtered before the guest sees it.
    fn handle_identify(&self, req: &mut Request) {
        let tx_type = req.cmd.std.transfer_type();
        if tx_type != TX_TYPE_PRP {
            log::debug!("identify with transfer type {}, not intercepting", tx_type);
            return;
        }
        if req.cmd.std.prp1 == 0 {
            log::debug!("identify without a guest buffer, not intercepting");
            return;
        }

        let scratch = DmaBuffer::alloc(&self.dma, self.page_nbytes());
        req.cmd.std.prp1 = scratch.phys();
        req.h_buf = Some(scratch);
    }

    /// With an interceptor installed the guest must not abort commands
    /// directly: the interceptor may have rewritten or swallowed the target.
    /// Point the CID-to-abort outside the admin ring; the guest observes a
    /// no-op Abort, which is legal since Abort is advisory.
    fn handle_abort(&self, req: &mut Request) {
        if self.interceptor().is_none() {
            return;
        }
        let n_entries = self.hparams.read().g_admin_subm_n_entries as u16;
        req.cmd.std.set_abort_target_cid(n_entries + 1);
        log::debug!("patched abort command");
    }

    // =========================================================================
    // I/O command classification
    // =========================================================================

    fn io_cmd_handler(&self, req: &mut Request) {
        match req.cmd.std.opcode {
            cmd::IO_READ | cmd::IO_WRITE | cmd::IO_COMPARE => self.handle_rw(req),
            cmd::IO_DATASET_MGMT => self.handle_data_management(req),
            _ => {}
        }
    }

    fn handle_rw(&self, req: &mut Request) {
        let nsid = req.cmd.std.nsid;
        let lba_nbytes = {
            let state = self.state.lock();
            match state.ns_metas.get(nsid as usize) {
                Some(meta) => meta.lba_nbytes,
                None => {
                    log::error!("I/O command for unknown namespace {}", nsid);
                    return;
                }
            }
        };

        req.lba_start = req.cmd.std.lba_start();
        // The count field is zero based
        req.n_lbas = req.cmd.std.n_lbas_raw() as u32 + 1;
        req.total_nbytes = req.n_lbas as u64 * lba_nbytes;

        if let Some(interceptor) = self.interceptor().cloned() {
            let (lba, n_lbas) = (req.lba_start, req.n_lbas);
            match req.cmd.std.opcode {
                cmd::IO_READ => interceptor.on_read(self, req, nsid, lba, n_lbas),
                cmd::IO_WRITE => interceptor.on_write(self, req, nsid, lba, n_lbas),
                cmd::IO_COMPARE => interceptor.on_compare(self, req, nsid, lba, n_lbas),
                _ => unreachable!(),
            }
        }
    }

    /// Dataset Management with the deallocate bit set exposes the range list
    /// to the interceptor, which may rewrite it in place. The list is copied
    /// into a host scratch page first and PRP1 patched to it.
    fn handle_data_management(&self, req: &mut Request) {
        let attributes = req.cmd.std.cdw[1];
        if attributes & cmd::DSM_ATTR_DEALLOCATE == 0 {
            return;
        }
        let interceptor = match self.interceptor().cloned() {
            Some(interceptor) => interceptor,
            None => return,
        };

        let page_nbytes = self.page_nbytes();
        let g_buf = match self.mem.map(req.cmd.std.prp1, page_nbytes, MapFlags::READ) {
            Some(mapping) => mapping,
            None => {
                log::error!("cannot map dataset management range list");
                return;
            }
        };

        let mut scratch = DmaBuffer::alloc(&self.dma, page_nbytes);
        g_buf.read_bytes(0, &mut scratch.as_mut_slice()[..page_nbytes]);
        req.cmd.std.prp1 = scratch.phys();

        let nsid = req.cmd.std.nsid;
        let n_ranges = req.cmd.std.cdw[0];
        let new_n_ranges =
            interceptor.on_data_management(self, req, nsid, scratch.as_mut_slice(), n_ranges);
        req.cmd.std.cdw[0] = new_n_ranges;
        req.h_buf = Some(scratch);
    }

    // =========================================================================
    // Firmware-deadline mitigation
    // =========================================================================

    /// If the interceptor asks for it, hold the doorbell write until every
    /// fetched guest request has been handed to the controller. Firmware
    /// drivers time out quickly, so an interceptor deferring requests for
    /// external work can request this synchronous drain.
    pub(crate) fn try_polling_for_completeness(&self, queue_id: u16) {
        let interceptor = match self.interceptor() {
            Some(interceptor) => interceptor.clone(),
            None => return,
        };
        if !interceptor.poll_completeness() {
            return;
        }

        let hub = match self.hub_for_subm(queue_id) {
            Some(hub) => hub,
            None => return,
        };

        let start = Instant::now();
        while hub.n_waiting_guest() != 0 {
            if start.elapsed() > POLL_COMPLETENESS_TIMEOUT {
                panic!("polling timeout waiting for guest request completeness");
            }
            std::thread::yield_now();
            self.process_all_comp_queues();
            interceptor.polling_callback();
        }
    }
}
