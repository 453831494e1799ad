//! Completion path: scanning host completion queues and reflecting entries
//! back into the guest's rings.
//!
//! The scan walks every host completion queue by phase bit, matches entries
//! to outstanding requests by host CID, runs completion-side handlers, and
//! synthesises the guest-visible entry with the original CID, the guest
//! ring's phase and a guest-space head value.

use std::sync::Arc;
use std::time::Duration;

use crate::cmd::{self, NvmeComp, COMP_NBYTES, TX_TYPE_PRP};
use crate::host::NvmeHost;
use crate::hub::{CompStatus, Request, RequestHub, LONG_RESPONSE_WATERMARK_SECS};
use crate::memory::{store_fence, MapFlags};
use crate::queue::{CompInner, GuestRing};

/// Write a synthesised entry into the guest ring. The status word carries the
/// phase bit, which is the guest's completion signal, so everything else must
/// be globally visible before it.
fn write_guest_comp(g: &GuestRing, offset: usize, comp: &NvmeComp) {
    let bytes = comp.as_bytes();
    g.mapping.write_bytes(offset, &bytes[..COMP_NBYTES - 2]);
    store_fence();
    g.mapping
        .write_bytes(offset + COMP_NBYTES - 2, &bytes[COMP_NBYTES - 2..]);
}

/// Conceal controller features the shadow engine does not support: clamp an
/// absent or oversized MDTS and clear SGL support (PRP is the only transfer
/// scheme the core handles).
pub(crate) fn identify_default_filter(_nsid: u32, _controller_id: u16, cns: u8, data: &mut [u8]) {
    if cns != cmd::CNS_CONTROLLER {
        return;
    }
    if data[77] == 0 || data[77] > 8 {
        log::debug!("limiting maximum data transfer size to 1 MiB");
        data[77] = 8; // 2 ^ (12 + 8)
    }
    let sgl_support = u32::from_le_bytes(data[536..540].try_into().unwrap());
    if sgl_support != 0 {
        log::debug!("concealing SGL support");
        data[536..540].fill(0);
    }
}

impl NvmeHost {
    /// Scan every host completion queue, then give the submission path a
    /// chance to make progress: the admin queue always, plus one I/O queue
    /// chosen round robin.
    pub fn process_all_comp_queues(&self) {
        self.state.lock().handling_comp += 1;

        let max_n_comp = self.queues.read().max_n_comp;
        for comp_queue_id in 0..=max_n_comp {
            let cq = match self.comp_queue(comp_queue_id) {
                Some(cq) => cq,
                None => continue,
            };
            let mut ci = cq.inner.lock();
            self.process_comp_queue(comp_queue_id, &mut ci);
        }

        let (sq_free, cq_free) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending_sq_free),
                std::mem::take(&mut state.pending_cq_free),
            )
        };
        for queue_id in sq_free {
            self.free_subm_queue_info(queue_id);
        }
        for queue_id in cq_free {
            self.free_comp_queue_info(queue_id);
        }

        self.try_process_requests(0);

        let max_n_subm = self.queues.read().max_n_subm;
        if max_n_subm > 0 {
            let mut queue = self.state.lock().queue_to_fetch;
            if queue == 0 || queue > max_n_subm {
                queue = 1;
            }
            for _ in 0..max_n_subm {
                let count = if self.subm_queue(queue).is_some() {
                    self.try_process_requests(queue)
                } else {
                    0
                };
                queue += 1;
                if queue > max_n_subm {
                    queue = 1;
                }
                if count > 0 {
                    self.state.lock().queue_to_fetch = queue;
                    break;
                }
            }
        }

        self.state.lock().handling_comp -= 1;
    }

    fn process_comp_queue(&self, comp_queue_id: u16, ci: &mut CompInner) {
        // An interrupt the guest takes on a phase-bit change must not race
        // with later completions of the same scan, so the first guest entry
        // is written last.
        let mut first_entry: Option<(usize, NvmeComp)> = None;

        loop {
            let mut entry = [0u8; COMP_NBYTES];
            ci.h.read_entry(ci.h_head, &mut entry);
            let mut h_comp = NvmeComp::from_bytes(&entry);
            if h_comp.phase() != ci.h_phase {
                break;
            }

            // The queue ID field names the submission queue.
            let subm_queue_id = h_comp.queue_id;
            let hub = match self.hub_for_subm(subm_queue_id) {
                Some(hub) => hub,
                None => {
                    log::error!(
                        "completion on queue {} names submission queue {} with no hub",
                        comp_queue_id,
                        subm_queue_id
                    );
                    break;
                }
            };

            let mut req = match hub.take_request(subm_queue_id, h_comp.cmd_id) {
                Some(req) => req,
                None => {
                    log::error!(
                        "completion for unknown CID {} on submission queue {}",
                        h_comp.cmd_id,
                        subm_queue_id
                    );
                    break;
                }
            };

            if let Some(submitted) = req.submit_time {
                let taken = submitted.elapsed();
                if taken > Duration::from_secs(LONG_RESPONSE_WATERMARK_SECS) {
                    log::warn!(
                        "long controller response: {:?}, queue {} opcode 0x{:02X}",
                        taken,
                        subm_queue_id,
                        req.cmd.std.opcode
                    );
                }
            }

            if subm_queue_id == 0 {
                self.process_admin_comp(&hub, &mut h_comp, &mut req);
            } else {
                self.process_io_comp(&h_comp, &mut req);
            }

            ci.h_head += 1;
            if ci.h_head >= ci.h.n_entries {
                ci.h_phase = !ci.h_phase;
                ci.h_head = 0;
            }

            if !req.is_h_req {
                let mut g_comp = h_comp;
                g_comp.cmd_id = req.orig_cmd_id;
                g_comp.set_phase(ci.g_phase);
                // The hardware's head value is in host ring space; report the
                // guest-space value instead. Host and guest depths may differ
                // when host and guest commands share a queue.
                g_comp.queue_head = ci.g_head;

                let g_offset = ci.g.entry_offset(ci.g_head);
                if first_entry.is_none() {
                    first_entry = Some((g_offset, g_comp));
                } else {
                    write_guest_comp(&ci.g, g_offset, &g_comp);
                }

                ci.g_head += 1;
                if ci.g_head >= ci.g.n_entries {
                    ci.g_phase = !ci.g_phase;
                    ci.g_head = 0;
                }
                // The guest acknowledges through its completion doorbell;
                // n_not_ack_g is settled there, not here.
            } else {
                self.write_comp_db(comp_queue_id, ci.h_head);
                let mut inner = hub.inner.lock();
                inner.n_not_ack_h = inner.n_not_ack_h.saturating_sub(1);
            }
            // The request and any scratch buffer are freed here.
        }

        if let Some((offset, comp)) = first_entry {
            write_guest_comp(&ci.g, offset, &comp);
        }
    }

    // =========================================================================
    // Admin completions
    // =========================================================================

    fn process_admin_comp(&self, hub: &Arc<RequestHub>, comp: &mut NvmeComp, req: &mut Request) {
        if req.is_h_req {
            if let Some(cb) = req.take_callback() {
                cb(self, CompStatus::from_comp(comp));
            }
            return;
        }

        match req.cmd.std.opcode {
            cmd::ADMIN_DELETE_SQ => {
                // Freed at the end of the scan pass; completions of this
                // queue's requests may still sit in a later completion queue.
                self.state
                    .lock()
                    .pending_sq_free
                    .push(req.cmd.std.queue_id());
            }
            cmd::ADMIN_DELETE_CQ => {
                self.state
                    .lock()
                    .pending_cq_free
                    .push(req.cmd.std.queue_id());
            }
            cmd::ADMIN_IDENTIFY => {
                self.handle_identify_completion(req);
            }
            cmd::ADMIN_ABORT => {
                if self.interceptor().is_some() {
                    // Mask the CID patch: report "not aborted".
                    log::debug!("patching abort command status");
                    comp.cmd_specific |= 0x1;
                }
            }
            cmd::ADMIN_SET_FEATURES => {
                self.handle_set_features_completion(comp, req);
            }
            cmd::ADMIN_ASYNC_EVENT => {
                let mut inner = hub.inner.lock();
                inner.n_async_g = inner.n_async_g.saturating_sub(1);
            }
            cmd::ADMIN_NS_MGMT | cmd::ADMIN_NS_ATTACH | cmd::ADMIN_FORMAT_NVM => {
                // The namespace layout may have changed under us.
                self.get_drive_info();
            }
            _ => {}
        }
    }

    /// Copy the filtered identify payload from the scratch page back into the
    /// guest's buffer.
    fn handle_identify_completion(&self, req: &mut Request) {
        if req.cmd.std.transfer_type() != TX_TYPE_PRP || req.g_prp1 == 0 {
            return;
        }
        let scratch = match req.h_buf.as_mut() {
            Some(scratch) => scratch,
            None => return,
        };

        let cns = req.cmd.std.identify_cns();
        let controller_id = req.cmd.std.identify_controller_id();
        let nsid = req.cmd.std.nsid;

        identify_default_filter(nsid, controller_id, cns, scratch.as_mut_slice());
        if let Some(interceptor) = self.interceptor() {
            interceptor.filter_identify_data(nsid, controller_id, cns, scratch.as_mut_slice());
        }

        let page_nbytes = self.page_nbytes();
        match self.mem.map(req.g_prp1, page_nbytes, MapFlags::WRITE) {
            Some(g_buf) => g_buf.write_bytes(0, &scratch.as_slice()[..page_nbytes]),
            None => log::error!("cannot map guest identify buffer"),
        }
    }

    fn handle_set_features_completion(&self, comp: &NvmeComp, req: &Request) {
        if req.cmd.std.feature_id() != cmd::FEATURE_NUM_QUEUES {
            return;
        }
        if self.queues.read().max_n_subm > 0 {
            log::warn!("duplicated Number of Queues feature, keeping current layout");
            return;
        }
        // Granted counts are zero based.
        let max_n_subm = cmd::feature_n_subm_queues(comp.cmd_specific) + 1;
        let max_n_comp = cmd::feature_n_comp_queues(comp.cmd_specific) + 1;
        self.set_max_n_queues(max_n_subm, max_n_comp);
    }

    // =========================================================================
    // I/O completions
    // =========================================================================

    fn process_io_comp(&self, comp: &NvmeComp, req: &mut Request) {
        if comp.status_type() != cmd::STATUS_TYPE_GENERIC || comp.status_code() != 0 {
            log::warn!(
                "QID {} I/O error type {} status 0x{:02X} opcode 0x{:02X}",
                comp.queue_id,
                comp.status_type(),
                comp.status_code(),
                req.cmd.std.opcode
            );
        }
        if let Some(cb) = req.take_callback() {
            cb(self, CompStatus::from_comp(comp));
        }
    }
}
