//! NVMe para-passthrough core.
//!
//! A guest OS believes it owns a physical NVMe controller: it programs
//! CAP/CC/CSTS/AQA/ASQ/ACQ and operates submission/completion queues as
//! usual. This crate sits between the guest and the hardware, observing
//! every command, optionally rewriting or intercepting it, and multiplexing
//! host-originated commands onto the same controller, without the guest
//! noticing anything beyond the capabilities it negotiated.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------+
//! |   guest MMIO accesses     |  (PCI layer forwards BAR0 / MSI-X BAR)
//! +---------------------------+
//!              |
//! +---------------------------+
//! |   host.rs                 |  (register intercepts, CC state machine,
//! |                           |   doorbell dispatch)
//! +---------------------------+
//!        |             |
//! +-------------+ +-------------+
//! |  subm.rs    | |  comp.rs    |  (fetch & classify / scan & reflect)
//! +-------------+ +-------------+
//!        |             |
//! +---------------------------+
//! |   hub.rs / queue.rs       |  (slots, waiting FIFOs, shadow rings)
//! +---------------------------+
//!              |
//! +---------------------------+
//! |   physical controller     |
//! +---------------------------+
//! ```
//!
//! Requests flow fetch -> rewrite -> submit -> complete -> ack. The guest's
//! rings are never handed to the hardware; the core keeps host-owned shadow
//! rings and translates command IDs, head/tail positions and phase bits in
//! both directions. An optional [`IoInterceptor`] (see [`crypt`] for the
//! storage-encryption one) can shadow guest buffers along the way.
//!
//! Lock order, outermost first: a completion queue's scan lock or a
//! submission queue's fetch lock (plus the global fetch-serialization lock),
//! then the request hub. The host state, the latched parameters and the
//! queue-set map are leaves, never held across another acquisition.

pub mod cmd;
pub mod regs;

pub mod memory;

mod comp;
mod host;
mod hub;
mod ns;
mod queue;
mod subm;

pub mod interceptor;

#[cfg(feature = "crypt")]
pub mod crypt;

pub use host::{BarRegion, BindParams, NvmeHost};
pub use hub::{CompStatus, GuestReqHandle, Request, RequestHub, DEFAULT_FETCH_LIMIT};
pub use interceptor::{
    register_ext, DmaBuf, ExtInit, FetchPolicy, GuestBuf, IoCallback, IoDescriptor, IoInterceptor,
    NvmeIoError, ReqHandle, Result,
};
pub use memory::{
    DmaBuffer, DmaPool, EmulatedMemory, GuestMapping, GuestMemory, MapFlags, PAGE_NBYTES,
};
pub use ns::NamespaceMeta;
pub use regs::ControllerRegs;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
