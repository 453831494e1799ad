//! Storage encryption extension.
//!
//! Transparent at-rest encryption at the LBA level, and the reference
//! consumer of the interceptor ABI: every guest write is diverted into a
//! shadow DMA buffer and encrypted before the controller sees it; every
//! guest read is decrypted from the shadow buffer into the guest's pages
//! after the controller completes it. The guest observes plain data and
//! normal completions.
//!
//! Load with the `ext=encrypt` driver option; the passphrase comes from the
//! `NVME_CRYPT_KEY` environment variable. Keys are derived per purpose with
//! SHA-256; sectors are encrypted with AES-256 in an XEX construction whose
//! tweak binds each 16-byte block to its LBA and block index, so the
//! ciphertext length equals the plaintext length and any sector can be
//! re-encrypted independently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};

use crate::host::NvmeHost;
use crate::hub::Request;
use crate::interceptor::{IoInterceptor, NvmeIoError, Result};

const AES_BLOCK_NBYTES: usize = 16;

/// Stop fetching new guest commands once this many intercepted requests are
/// in flight.
const FETCHING_THRESHOLD: u32 = 32;

// =============================================================================
// Cipher
// =============================================================================

struct XexCipher {
    data: Aes256,
    tweak: Aes256,
}

impl XexCipher {
    fn new(passphrase: &str) -> XexCipher {
        XexCipher {
            data: Aes256::new_from_slice(&Self::derive_key(passphrase, b"data")).unwrap(),
            tweak: Aes256::new_from_slice(&Self::derive_key(passphrase, b"tweak")).unwrap(),
        }
    }

    fn derive_key(passphrase: &str, purpose: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"nvme-crypt:");
        hasher.update(purpose);
        hasher.update(b":");
        hasher.update(passphrase.as_bytes());
        hasher.finalize().into()
    }

    fn tweak_block(&self, lba: u64, block_idx: u64) -> [u8; AES_BLOCK_NBYTES] {
        let mut t = [0u8; AES_BLOCK_NBYTES];
        t[..8].copy_from_slice(&lba.to_le_bytes());
        t[8..].copy_from_slice(&block_idx.to_le_bytes());
        let block = GenericArray::from_mut_slice(&mut t);
        self.tweak.encrypt_block(block);
        t
    }

    fn xor(block: &mut [u8], tweak: &[u8; AES_BLOCK_NBYTES]) {
        for (b, t) in block.iter_mut().zip(tweak.iter()) {
            *b ^= t;
        }
    }

    fn encrypt_sector(&self, lba: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len() % AES_BLOCK_NBYTES, 0);
        for (idx, chunk) in sector.chunks_exact_mut(AES_BLOCK_NBYTES).enumerate() {
            let tweak = self.tweak_block(lba, idx as u64);
            Self::xor(chunk, &tweak);
            self.data.encrypt_block(GenericArray::from_mut_slice(chunk));
            Self::xor(chunk, &tweak);
        }
    }

    fn decrypt_sector(&self, lba: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len() % AES_BLOCK_NBYTES, 0);
        for (idx, chunk) in sector.chunks_exact_mut(AES_BLOCK_NBYTES).enumerate() {
            let tweak = self.tweak_block(lba, idx as u64);
            Self::xor(chunk, &tweak);
            self.data.decrypt_block(GenericArray::from_mut_slice(chunk));
            Self::xor(chunk, &tweak);
        }
    }

    fn encrypt_range(&self, lba_start: u64, lba_nbytes: usize, buf: &mut [u8]) {
        for (idx, sector) in buf.chunks_exact_mut(lba_nbytes).enumerate() {
            self.encrypt_sector(lba_start + idx as u64, sector);
        }
    }

    fn decrypt_range(&self, lba_start: u64, lba_nbytes: usize, buf: &mut [u8]) {
        for (idx, sector) in buf.chunks_exact_mut(lba_nbytes).enumerate() {
            self.decrypt_sector(lba_start + idx as u64, sector);
        }
    }
}

// =============================================================================
// Interceptor
// =============================================================================

struct CryptState {
    cipher: XexCipher,
    n_intercepted_reqs: AtomicU32,
}

pub struct CryptInterceptor {
    state: Arc<CryptState>,
}

impl CryptInterceptor {
    fn new(passphrase: &str) -> CryptInterceptor {
        CryptInterceptor {
            state: Arc::new(CryptState {
                cipher: XexCipher::new(passphrase),
                n_intercepted_reqs: AtomicU32::new(0),
            }),
        }
    }

    /// Intercepted requests currently in flight.
    pub fn n_intercepted_reqs(&self) -> u32 {
        self.state.n_intercepted_reqs.load(Ordering::Acquire)
    }

    fn intercept_rw(
        &self,
        host: &NvmeHost,
        req: &mut Request,
        nsid: u32,
        lba_start: u64,
        n_lbas: u32,
        write: bool,
    ) {
        let lba_nbytes = host
            .lba_nbytes(nsid)
            .expect("namespace geometry unavailable during interception")
            as usize;
        let nbytes = n_lbas as u64 * lba_nbytes as u64;

        let mut dmabuf = host
            .alloc_dmabuf(nbytes)
            .expect("cannot allocate shadow buffer");
        let g_buf = host
            .alloc_guest_buf(req)
            .expect("cannot map guest I/O buffer");
        host.set_shadow_buffer(req, &dmabuf)
            .expect("shadow buffer size mismatch");

        if write {
            // Pull the plaintext out of the guest and encrypt it in the
            // shadow before the controller gets to DMA it.
            g_buf
                .copy_from_guest(dmabuf.as_mut_slice(), 0)
                .expect("guest buffer shorter than the transfer");
            self.state
                .cipher
                .encrypt_range(lba_start, lba_nbytes, dmabuf.as_mut_slice());
        }

        self.state.n_intercepted_reqs.fetch_add(1, Ordering::AcqRel);

        let state = Arc::clone(&self.state);
        req.set_callback(move |_host, status| {
            if !write {
                if status.ok() {
                    state
                        .cipher
                        .decrypt_range(lba_start, lba_nbytes, dmabuf.as_mut_slice());
                    let _ = g_buf.copy_to_guest(dmabuf.as_slice(), 0);
                } else {
                    log::warn!(
                        "read of LBA {} failed (type {} status 0x{:02X}), skipping decryption",
                        lba_start,
                        status.status_type,
                        status.status
                    );
                }
            }
            state.n_intercepted_reqs.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl IoInterceptor for CryptInterceptor {
    fn on_read(&self, host: &NvmeHost, req: &mut Request, nsid: u32, lba_start: u64, n_lbas: u32) {
        self.intercept_rw(host, req, nsid, lba_start, n_lbas, false);
    }

    fn on_write(&self, host: &NvmeHost, req: &mut Request, nsid: u32, lba_start: u64, n_lbas: u32) {
        self.intercept_rw(host, req, nsid, lba_start, n_lbas, true);
    }

    fn on_compare(
        &self,
        _host: &NvmeHost,
        _req: &mut Request,
        _nsid: u32,
        _lba_start: u64,
        _n_lbas: u32,
    ) {
        // Compare support is concealed by the identify filter below; a guest
        // issuing it anyway compares ciphertext against plaintext.
        panic!("storage encryption does not support the Compare command");
    }

    fn filter_identify_data(&self, _nsid: u32, _controller_id: u16, cns: u8, data: &mut [u8]) {
        if cns != crate::cmd::CNS_CONTROLLER {
            log::debug!("not filtering identify cns {}", cns);
            return;
        }
        // ONCS: conceal Compare, Write Uncorrectable and Write Zeroes; they
        // would bypass or break block-level encryption.
        let mut oncs = u16::from_le_bytes(data[520..522].try_into().unwrap());
        if oncs & 0x0001 != 0 {
            log::info!("concealing Compare command support");
        }
        if oncs & 0x0002 != 0 {
            log::info!("concealing Write Uncorrectable command support");
        }
        if oncs & 0x0008 != 0 {
            log::info!("concealing Write Zeroes command support");
        }
        oncs &= 0xFFF4;
        data[520..522].copy_from_slice(&oncs.to_le_bytes());
    }

    fn fetch_limit(&self, _n_waiting_g_reqs: u32) -> u32 {
        let in_flight = self.n_intercepted_reqs();
        if in_flight > FETCHING_THRESHOLD {
            0
        } else {
            FETCHING_THRESHOLD - in_flight
        }
    }

    fn serialize_queue_fetch(&self) -> bool {
        true
    }
}

/// Registry entry point for the `ext=encrypt` driver option.
pub fn install(host: &Arc<NvmeHost>) -> Result<()> {
    let passphrase = match std::env::var("NVME_CRYPT_KEY") {
        Ok(passphrase) if !passphrase.is_empty() => passphrase,
        _ => {
            log::error!("NVME_CRYPT_KEY is not set; refusing to install encryption");
            return Err(NvmeIoError::InvalidParam);
        }
    };
    install_with_passphrase(host, &passphrase).map(|_| ())
}

/// Install the encryption interceptor with an explicit passphrase.
pub fn install_with_passphrase(
    host: &Arc<NvmeHost>,
    passphrase: &str,
) -> Result<Arc<CryptInterceptor>> {
    let interceptor = Arc::new(CryptInterceptor::new(passphrase));
    log::info!("installing encryption interceptor");
    host.install_interceptor(interceptor.clone())?;
    Ok(interceptor)
}
