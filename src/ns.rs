//! Namespace discovery.
//!
//! The first doorbell write after enable triggers a self-issued admin chain:
//! Get Features (Number of Queues), Identify Controller, then one Identify
//! Namespace per NSID, each step continued from the previous step's
//! completion callback. Guest fetching stays paused until the chain ends so
//! I/O classification always has namespace geometry at hand.

use crate::cmd::{feature_n_comp_queues, feature_n_subm_queues, CNS_CONTROLLER, CNS_NAMESPACE};
use crate::host::NvmeHost;
use crate::memory::DmaBuffer;

/// Geometry of one namespace, from its identify payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct NamespaceMeta {
    pub nsid: u32,
    pub n_lbas: u64,
    pub lba_nbytes: u64,
    pub meta_nbytes: u16,
    /// Metadata transferred at the end of the LBA payload rather than in a
    /// separate buffer.
    pub meta_lba_ending: bool,
}

/// Fallback when the controller reports no or an oversized MDTS.
const DEFAULT_MAX_DATA_TRANSFER: u64 = 1024 * 1024;

fn parse_ns_identify(nsid: u32, data: &[u8]) -> NamespaceMeta {
    let n_lbas = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let fmt_idx = (data[26] & 0xF) as usize;
    let meta_lba_ending = (data[26] >> 4) & 0x1 != 0;
    let fmt_off = 128 + fmt_idx * 4;
    let lba_format = u32::from_le_bytes(data[fmt_off..fmt_off + 4].try_into().unwrap());

    NamespaceMeta {
        nsid,
        n_lbas,
        lba_nbytes: 1u64 << ((lba_format >> 16) & 0xFF),
        meta_nbytes: (lba_format & 0xFFFF) as u16,
        meta_lba_ending,
    }
}

impl NvmeHost {
    /// Kick off the enumeration chain. Fetching is paused until the last
    /// namespace's identify completes.
    pub(crate) fn get_drive_info(&self) {
        self.set_fetch_paused(true);

        let result = self.get_n_queues_async(Box::new(|host, status| {
            if !status.ok() {
                log::error!("Get Features (Number of Queues) failed, resuming fetch");
                host.set_fetch_paused(false);
                return;
            }
            {
                let mut state = host.state.lock();
                // Granted counts are zero based.
                state.default_n_subm_queues = feature_n_subm_queues(status.cmd_specific) + 1;
                state.default_n_comp_queues = feature_n_comp_queues(status.cmd_specific) + 1;
                log::debug!(
                    "default queue counts: {} submission, {} completion",
                    state.default_n_subm_queues,
                    state.default_n_comp_queues
                );
            }
            host.identify_controller_step();
        }));

        if result.is_err() {
            log::error!("cannot issue Get Features (Number of Queues)");
            self.set_fetch_paused(false);
        }
    }

    fn identify_controller_step(&self) {
        let page = DmaBuffer::alloc(&self.dma, self.page_nbytes());
        let page_phys = page.phys();
        let host_id = self.host_id() as u16;

        let result = self.identify_async(
            0,
            page_phys,
            CNS_CONTROLLER,
            host_id,
            Box::new(move |host, status| {
                if !status.ok() {
                    log::error!(
                        "identify controller failed (type {} status 0x{:02X}), resuming fetch",
                        status.status_type,
                        status.status
                    );
                    host.set_fetch_paused(false);
                    return;
                }

                let mut data = vec![0u8; 4096];
                page.read_bytes(0, &mut data);

                let mdts = data[77];
                let max_data_transfer = if mdts == 0 || mdts > 8 {
                    DEFAULT_MAX_DATA_TRANSFER
                } else {
                    1u64 << (12 + mdts as u32)
                };
                log::info!("maximum data transfer: {} bytes", max_data_transfer);

                let n_ns = u32::from_le_bytes(data[516..520].try_into().unwrap());
                assert!(n_ns > 0, "controller reports no namespaces");
                log::debug!("{} namespaces", n_ns);

                {
                    let mut state = host.state.lock();
                    state.max_data_transfer = max_data_transfer;
                    state.n_ns = n_ns;
                    // NSIDs start at 1
                    state.ns_metas = vec![NamespaceMeta::default(); n_ns as usize + 1];
                    for nsid in 1..=n_ns {
                        state.ns_metas[nsid as usize].nsid = nsid;
                    }
                }

                // Identify namespaces one at a time, in NSID order.
                host.identify_namespace_step(1);
            }),
        );

        if result.is_err() {
            log::error!("cannot issue Identify Controller");
            self.set_fetch_paused(false);
        }
    }

    fn identify_namespace_step(&self, nsid: u32) {
        let page = DmaBuffer::alloc(&self.dma, self.page_nbytes());
        let page_phys = page.phys();
        let host_id = self.host_id() as u16;

        let result = self.identify_async(
            nsid,
            page_phys,
            CNS_NAMESPACE,
            host_id,
            Box::new(move |host, status| {
                if !status.ok() {
                    log::error!(
                        "identify namespace {} failed (type {} status 0x{:02X}), resuming fetch",
                        nsid,
                        status.status_type,
                        status.status
                    );
                    host.set_fetch_paused(false);
                    return;
                }

                let mut data = vec![0u8; 4096];
                page.read_bytes(0, &mut data);
                let meta = parse_ns_identify(nsid, &data);

                log::debug!(
                    "NSID {}: {} LBAs of {} bytes, {} metadata bytes{}",
                    meta.nsid,
                    meta.n_lbas,
                    meta.lba_nbytes,
                    meta.meta_nbytes,
                    if meta.meta_lba_ending {
                        " (at LBA end)"
                    } else {
                        ""
                    }
                );

                let n_ns = {
                    let mut state = host.state.lock();
                    state.ns_metas[nsid as usize] = meta;
                    state.n_ns
                };

                if nsid < n_ns {
                    host.identify_namespace_step(nsid + 1);
                } else {
                    host.set_fetch_paused(false);
                }
            }),
        );

        if result.is_err() {
            log::error!("cannot issue Identify Namespace {}", nsid);
            self.set_fetch_paused(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identify_namespace_payload() {
        let mut data = vec![0u8; 4096];
        data[0..8].copy_from_slice(&0x10_0000u64.to_le_bytes());
        data[26] = 0x11; // format index 1, metadata at LBA end
        // format 1: lbads=12 (4096 bytes), 8 metadata bytes
        data[132..136].copy_from_slice(&((12u32 << 16) | 8).to_le_bytes());

        let meta = parse_ns_identify(3, &data);
        assert_eq!(meta.nsid, 3);
        assert_eq!(meta.n_lbas, 0x10_0000);
        assert_eq!(meta.lba_nbytes, 4096);
        assert_eq!(meta.meta_nbytes, 8);
        assert!(meta.meta_lba_ending);
    }

    #[test]
    fn parses_512_byte_lba_format() {
        let mut data = vec![0u8; 4096];
        data[0..8].copy_from_slice(&2048u64.to_le_bytes());
        data[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes());

        let meta = parse_ns_identify(1, &data);
        assert_eq!(meta.lba_nbytes, 512);
        assert_eq!(meta.meta_nbytes, 0);
        assert!(!meta.meta_lba_ending);
    }
}
