//! Request lifecycle: slots, waiting FIFOs and per-completion-queue hubs.
//!
//! Every submission queue owns a fixed slot array indexed by the host-side
//! command ID. A request is in exactly one place at a time: a waiting FIFO
//! (fetched but not yet handed to the controller), its slot (outstanding on
//! the controller), or gone. The hub groups the slots of all submission
//! queues paired with one completion queue and carries the counters the
//! drain rules and doorbell translation work from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::cmd::{CmdBuf, NvmeComp, ADMIN_ASYNC_EVENT, CMD_ANS2_NBYTES, CMD_NBYTES};
use crate::host::NvmeHost;
use crate::memory::{store_fence, DmaBuffer};
use crate::queue::HostRing;

/// Default number of guest commands fetched per doorbell when no interceptor
/// imposes a limit.
pub const DEFAULT_FETCH_LIMIT: u32 = 32;

/// Controller responses slower than this are logged with queue and opcode.
pub(crate) const LONG_RESPONSE_WATERMARK_SECS: u64 = 20;

static NEXT_REQ_TAG: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Completion status handed to request callbacks
// =============================================================================

/// Completion outcome delivered to a request callback.
#[derive(Clone, Copy, Debug)]
pub struct CompStatus {
    pub status_type: u8,
    pub status: u8,
    pub cmd_specific: u32,
}

impl CompStatus {
    /// Sentinel for "no completion at all" (controller reset or disappeared).
    pub const NONE: CompStatus = CompStatus {
        status_type: 0xFF,
        status: 0xFF,
        cmd_specific: 0,
    };

    #[inline]
    pub fn ok(&self) -> bool {
        self.status_type == 0 && self.status == 0
    }

    pub(crate) fn from_comp(comp: &NvmeComp) -> CompStatus {
        CompStatus {
            status_type: comp.status_type(),
            status: comp.status_code(),
            cmd_specific: comp.cmd_specific,
        }
    }
}

pub(crate) type ReqCallback = Box<dyn FnOnce(&NvmeHost, CompStatus) + Send>;

// =============================================================================
// Request
// =============================================================================

/// Handle an interceptor keeps to a paused guest request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestReqHandle {
    pub(crate) queue_id: u16,
    pub(crate) tag: u64,
}

/// One in-flight command, guest-fetched or host-originated.
pub struct Request {
    pub(crate) cmd: CmdBuf,
    pub(crate) cmd_nbytes: usize,
    /// The guest's original data pointers, before any shadowing.
    pub(crate) g_prp1: u64,
    pub(crate) g_prp2: u64,
    /// CID in the guest's eyes; the host CID is the slot index.
    pub(crate) orig_cmd_id: u16,
    pub(crate) queue_id: u16,
    pub(crate) is_h_req: bool,
    pub(crate) pause: bool,
    pub(crate) tag: u64,
    pub(crate) submit_time: Option<Instant>,
    /// Host scratch page when the command's buffer was taken over.
    pub(crate) h_buf: Option<DmaBuffer>,
    pub(crate) callback: Option<ReqCallback>,
    pub(crate) lba_start: u64,
    pub(crate) n_lbas: u32,
    pub(crate) total_nbytes: u64,
}

impl Request {
    pub(crate) fn from_guest_cmd(entry: &[u8], queue_id: u16) -> Box<Request> {
        let mut cmd = CmdBuf::default();
        cmd.copy_from_bytes(entry);
        Box::new(Request {
            orig_cmd_id: cmd.std.cmd_id,
            g_prp1: cmd.std.prp1,
            g_prp2: cmd.std.prp2,
            cmd,
            cmd_nbytes: entry.len(),
            queue_id,
            is_h_req: false,
            pause: false,
            tag: NEXT_REQ_TAG.fetch_add(1, Ordering::Relaxed),
            submit_time: None,
            h_buf: None,
            callback: None,
            lba_start: 0,
            n_lbas: 0,
            total_nbytes: 0,
        })
    }

    pub(crate) fn new_host(cmd_nbytes: usize) -> Box<Request> {
        debug_assert!(cmd_nbytes == CMD_NBYTES || cmd_nbytes == CMD_ANS2_NBYTES);
        Box::new(Request {
            cmd: CmdBuf::default(),
            cmd_nbytes,
            g_prp1: 0,
            g_prp2: 0,
            orig_cmd_id: 0,
            queue_id: 0,
            is_h_req: true,
            pause: false,
            tag: NEXT_REQ_TAG.fetch_add(1, Ordering::Relaxed),
            submit_time: None,
            h_buf: None,
            callback: None,
            lba_start: 0,
            n_lbas: 0,
            total_nbytes: 0,
        })
    }

    #[inline]
    pub fn nsid(&self) -> u32 {
        self.cmd.std.nsid
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.cmd.std.opcode
    }

    #[inline]
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    #[inline]
    pub fn lba_start(&self) -> u64 {
        self.lba_start
    }

    #[inline]
    pub fn n_lbas(&self) -> u32 {
        self.n_lbas
    }

    #[inline]
    pub fn total_nbytes(&self) -> u64 {
        self.total_nbytes
    }

    #[inline]
    pub fn is_host_request(&self) -> bool {
        self.is_h_req
    }

    #[inline]
    pub fn handle(&self) -> GuestReqHandle {
        GuestReqHandle {
            queue_id: self.queue_id,
            tag: self.tag,
        }
    }

    /// Defer this guest request; it stays in its waiting FIFO until resumed.
    #[inline]
    pub fn set_pause(&mut self) {
        self.pause = true;
    }

    /// Completion callback, invoked from the completion path after the
    /// controller finishes the request (or with [`CompStatus::NONE`] if it
    /// never will).
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(&NvmeHost, CompStatus) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub(crate) fn take_callback(&mut self) -> Option<ReqCallback> {
        self.callback.take()
    }
}

// =============================================================================
// Submission slots
// =============================================================================

/// Per-submission-queue slot table plus the host ring it feeds.
pub(crate) struct SubmSlot {
    pub subm_queue_id: u16,
    pub h_ring: HostRing,
    pub h_tail: u16,
    pub req_slot: Vec<Option<Box<Request>>>,
    pub n_slots_used: u16,
    pub next_slot: u16,
    pub queuing_h: VecDeque<Box<Request>>,
    pub queuing_g: VecDeque<Box<Request>>,
}

impl SubmSlot {
    pub(crate) fn new(subm_queue_id: u16, h_ring: HostRing) -> SubmSlot {
        let n_slots = h_ring.n_entries as usize;
        let mut req_slot = Vec::with_capacity(n_slots);
        req_slot.resize_with(n_slots, || None);
        SubmSlot {
            subm_queue_id,
            h_ring,
            h_tail: 0,
            req_slot,
            n_slots_used: 0,
            next_slot: 0,
            queuing_h: VecDeque::new(),
            queuing_g: VecDeque::new(),
        }
    }

    /// Pick a free slot, walking forward from the cursor. The cursor advances
    /// on every probe, including the successful one, so a freshly freed slot
    /// is never handed out on the immediately following allocation. Some
    /// controllers (ANS2) reject a duplicate tag reissued too quickly.
    pub(crate) fn get_free_slot(&mut self) -> Option<u16> {
        let n_slots = self.req_slot.len() as u16;
        let mut found = None;
        for _ in 0..n_slots {
            if found.is_none() && self.req_slot[self.next_slot as usize].is_none() {
                found = Some(self.next_slot);
            }
            self.next_slot = (self.next_slot + 1) % n_slots;
            if found.is_some() {
                break;
            }
        }
        found
    }

    /// Next request to hand to the controller. Paused guest requests are
    /// skipped; the rest keep FIFO order.
    fn dequeue(&mut self, host_req: bool) -> Option<Box<Request>> {
        if host_req {
            self.queuing_h.pop_front()
        } else {
            let pos = self.queuing_g.iter().position(|r| !r.pause)?;
            self.queuing_g.remove(pos)
        }
    }

    /// Clear the pause flag of a queued request.
    fn resume(&mut self, tag: u64) -> bool {
        for req in self.queuing_g.iter_mut() {
            if req.tag == tag {
                req.pause = false;
                return true;
            }
        }
        false
    }
}

// =============================================================================
// Request hub
// =============================================================================

pub(crate) struct HubInner {
    pub slots: Vec<SubmSlot>,
    /// Fetched but not yet placed in the host ring.
    pub n_waiting_h: u32,
    pub n_waiting_g: u32,
    /// Placed in the host ring, completion not yet acknowledged.
    pub n_not_ack_h: u32,
    pub n_not_ack_g: u32,
    /// Guest Asynchronous Event Requests outstanding; they hold a slot but do
    /// not count against the stall-avoidance rules.
    pub n_async_g: u32,
}

impl HubInner {
    pub(crate) fn slot_mut(&mut self, subm_queue_id: u16) -> Option<&mut SubmSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.subm_queue_id == subm_queue_id)
    }
}

/// One hub per completion queue.
pub struct RequestHub {
    pub(crate) inner: Mutex<HubInner>,
}

impl RequestHub {
    pub(crate) fn new() -> RequestHub {
        RequestHub {
            inner: Mutex::new(HubInner {
                slots: Vec::new(),
                n_waiting_h: 0,
                n_waiting_g: 0,
                n_not_ack_h: 0,
                n_not_ack_g: 0,
                n_async_g: 0,
            }),
        }
    }

    pub(crate) fn add_slot(&self, slot: SubmSlot) {
        self.inner.lock().slots.push(slot);
    }

    pub(crate) fn n_waiting_guest(&self) -> u32 {
        self.inner.lock().n_waiting_g
    }

    /// Pull the request out of its slot by host CID. The slot is empty until
    /// the next allocation reuses it.
    pub(crate) fn take_request(&self, subm_queue_id: u16, cmd_id: u16) -> Option<Box<Request>> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(subm_queue_id)?;
        let req = slot.req_slot.get_mut(cmd_id as usize)?.take()?;
        slot.n_slots_used -= 1;
        Some(req)
    }

    /// Tear down one submission queue's slot: every queued or outstanding
    /// request is cancelled. Returns the callbacks to invoke with
    /// [`CompStatus::NONE`] once no hub lock is held.
    pub(crate) fn remove_slot(&self, subm_queue_id: u16) -> Vec<ReqCallback> {
        let mut inner = self.inner.lock();
        let idx = match inner
            .slots
            .iter()
            .position(|s| s.subm_queue_id == subm_queue_id)
        {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        let mut slot = inner.slots.swap_remove(idx);

        let mut callbacks = Vec::new();
        let mut cancel = |req: &mut Box<Request>, inner: &mut HubInner, waiting: bool| {
            if req.is_h_req {
                if waiting {
                    inner.n_waiting_h -= 1;
                } else {
                    inner.n_not_ack_h = inner.n_not_ack_h.saturating_sub(1);
                }
            } else {
                if waiting {
                    inner.n_waiting_g -= 1;
                } else {
                    inner.n_not_ack_g = inner.n_not_ack_g.saturating_sub(1);
                }
                if req.queue_id == 0 && req.cmd.std.opcode == ADMIN_ASYNC_EVENT {
                    inner.n_async_g = inner.n_async_g.saturating_sub(1);
                }
            }
            if let Some(cb) = req.take_callback() {
                callbacks.push(cb);
            }
        };

        while let Some(mut req) = slot.queuing_h.pop_front() {
            cancel(&mut req, &mut inner, true);
        }
        while let Some(mut req) = slot.queuing_g.pop_front() {
            cancel(&mut req, &mut inner, true);
        }
        for entry in slot.req_slot.iter_mut() {
            if let Some(mut req) = entry.take() {
                cancel(&mut req, &mut inner, false);
            }
        }
        callbacks
    }

    /// Cancel everything owned by this hub (controller reset).
    pub(crate) fn cancel_all(&self) -> Vec<ReqCallback> {
        let ids: Vec<u16> = self
            .inner
            .lock()
            .slots
            .iter()
            .map(|s| s.subm_queue_id)
            .collect();
        let mut callbacks = Vec::new();
        for id in ids {
            callbacks.extend(self.remove_slot(id));
        }
        callbacks
    }
}

// =============================================================================
// Host-side operations
// =============================================================================

impl NvmeHost {
    /// Place a fetched or host-built request on its submission queue's
    /// waiting FIFO. Does not touch the hardware.
    pub(crate) fn register_request(&self, req: Box<Request>) {
        let queue_id = req.queue_id;
        let hub = match self.hub_for_subm(queue_id) {
            Some(hub) => hub,
            None => {
                log::warn!(
                    "dropping request for queue {} with no request hub",
                    queue_id
                );
                return;
            }
        };

        let mut inner = hub.inner.lock();
        let is_async_g =
            !req.is_h_req && queue_id == 0 && req.cmd.std.opcode == ADMIN_ASYNC_EVENT;
        if is_async_g {
            inner.n_async_g += 1;
        }
        if req.is_h_req {
            inner.n_waiting_h += 1;
        } else {
            inner.n_waiting_g += 1;
        }
        let slot = inner
            .slot_mut(queue_id)
            .expect("submission queue registered without a slot");
        if req.is_h_req {
            slot.queuing_h.push_back(req);
        } else {
            slot.queuing_g.push_back(req);
        }
    }

    /// Drain waiting requests into the host ring and ring the doorbell.
    ///
    /// Host and guest requests are never mixed in one pass, and a pass is
    /// skipped entirely while host requests are outstanding: some controllers
    /// stall when too many unrelated completion notifications queue up.
    pub(crate) fn submit_queuing_requests(&self, subm_queue_id: u16) {
        let hub = match self.hub_for_subm(subm_queue_id) {
            Some(hub) => hub,
            None => return,
        };

        let mut guard = hub.inner.lock();
        let inner = &mut *guard;

        let mut drain_host = inner.n_waiting_h > 0;
        if drain_host && inner.n_not_ack_g.saturating_sub(inner.n_async_g) > 0 {
            drain_host = false;
        }
        if !drain_host && inner.n_not_ack_h > 0 {
            return;
        }

        let HubInner {
            slots,
            n_waiting_h,
            n_waiting_g,
            n_not_ack_h,
            n_not_ack_g,
            ..
        } = inner;
        let slot = match slots.iter_mut().find(|s| s.subm_queue_id == subm_queue_id) {
            Some(slot) => slot,
            None => return,
        };

        let n_entries = slot.h_ring.n_entries;
        let mut count = 0u32;

        // n_entries - 1: a full ring would make the tail wrap onto the head
        // and some controllers stop generating interrupts.
        while slot.n_slots_used < n_entries - 1 {
            let mut req = match slot.dequeue(drain_host) {
                Some(req) => req,
                None => break,
            };
            let slot_idx = slot
                .get_free_slot()
                .expect("free slot must exist below the ring occupancy bound");

            req.cmd.std.cmd_id = slot_idx;
            req.submit_time = Some(Instant::now());
            slot.h_ring
                .write_entry(slot.h_tail, req.cmd.as_bytes(req.cmd_nbytes));

            if req.is_h_req {
                *n_not_ack_h += 1;
                *n_waiting_h -= 1;
            } else {
                *n_not_ack_g += 1;
                *n_waiting_g -= 1;
            }
            slot.req_slot[slot_idx as usize] = Some(req);
            slot.n_slots_used += 1;
            slot.h_tail = (slot.h_tail + 1) % n_entries;
            count += 1;
        }

        if count > 0 {
            let new_tail = slot.h_tail;
            store_fence();
            self.write_subm_db(subm_queue_id, new_tail);
        }
    }

    /// Guest wrote its completion doorbell: translate the acknowledgment into
    /// the host's modular space and forward it.
    ///
    /// The core never writes the completion doorbell on the guest's behalf
    /// during completion handling, so interrupts keep flowing to the guest;
    /// the guest may also ack fewer entries than it was shown. Host and guest
    /// depths can differ, so the guest's ack of N entries must advance the
    /// hardware head by exactly N in host space.
    pub(crate) fn update_comp_db(&self, comp_queue_id: u16, new_head: u16) {
        let (cq, hub) = {
            let queues = self.queues.read();
            match (queues.comp_queue(comp_queue_id), queues.hub(comp_queue_id)) {
                (Some(cq), Some(hub)) => (cq, hub),
                _ => {
                    log::warn!(
                        "completion doorbell for unknown queue {}",
                        comp_queue_id
                    );
                    return;
                }
            }
        };

        let mut ci = cq.inner.lock();
        let mut hub_inner = hub.inner.lock();

        let g_n_entries = ci.g.n_entries as u32;
        let old_head = ci.g_new_head as u32;
        let n_ack_reqs = (new_head as u32 + g_n_entries - old_head) % g_n_entries;

        // Observed in the field when a guest writes the submission and
        // completion doorbells of one queue at the same time; dump the state
        // we are maintaining instead of giving up.
        if n_ack_reqs == 0 || hub_inner.n_not_ack_g < n_ack_reqs {
            log::warn!(
                "ignoring inconsistent completion doorbell: queue {} new_head {} old_head {} \
                 n_ack {} n_not_ack_g {} h_head {} g_head {}",
                comp_queue_id,
                new_head,
                old_head,
                n_ack_reqs,
                hub_inner.n_not_ack_g,
                ci.h_head,
                ci.g_head
            );
            return;
        }

        hub_inner.n_not_ack_g -= n_ack_reqs;
        ci.g_new_head = new_head;

        let h_n_entries = ci.h.n_entries as u32;
        let not_seen = (ci.g_head as u32 + g_n_entries - new_head as u32) % g_n_entries;
        let value = (ci.h_head as u32 + h_n_entries - not_seen) % h_n_entries;

        self.write_comp_db(comp_queue_id, value as u16);
    }

    /// Clear the pause flag of a deferred guest request.
    pub fn resume_guest_request(&self, handle: GuestReqHandle, trigger_submit: bool) -> bool {
        let hub = match self.hub_for_subm(handle.queue_id) {
            Some(hub) => hub,
            None => return false,
        };
        let resumed = {
            let mut inner = hub.inner.lock();
            inner
                .slot_mut(handle.queue_id)
                .map(|s| s.resume(handle.tag))
                .unwrap_or(false)
        };
        if resumed && trigger_submit {
            self.submit_queuing_requests(handle.queue_id);
        }
        resumed
    }
}
