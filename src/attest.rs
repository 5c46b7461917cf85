//! Attestation and sealing
//!
//! A running enclave can ask the monitor for a signed attestation report binding user data to
//! the device, monitor, and enclave identities, or for a sealing key derived from the monitor
//! root and the enclave measurement. Both services are signed with the monitor key; the report
//! signature covers exactly the user data length bound into it.

use castellan_core::size::{ATTEST_DATA_MAXLEN, MDSIZE, PUBLIC_KEY_SIZE, SEALING_KEY_SIZE, SIGNATURE_SIZE};
use hkdf::Hkdf;
use sha3::Sha3_512;

use crate::enclave::{EnclaveId, EnclaveState, SecurityMonitor};
use crate::error::SmError;
use crate::mem;

/// Maximum length of a sealing-key identifier.
pub const SEALING_IDENT_MAXLEN: usize = 1024;

// ————————————————————————————— Report Layout —————————————————————————————— //

pub const SM_REPORT_BYTES: usize = MDSIZE + PUBLIC_KEY_SIZE + SIGNATURE_SIZE;
pub const ENCLAVE_REPORT_BYTES: usize = MDSIZE + 8 + ATTEST_DATA_MAXLEN + SIGNATURE_SIZE;
pub const REPORT_BYTES: usize = PUBLIC_KEY_SIZE + SM_REPORT_BYTES + ENCLAVE_REPORT_BYTES;

pub const SEALING_KEY_BYTES: usize = SEALING_KEY_SIZE + SIGNATURE_SIZE;

/// The monitor sub-record of a report.
#[derive(Clone)]
pub struct SmReport {
    pub hash: [u8; MDSIZE],
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

/// The enclave sub-record of a report.
///
/// The signature covers `hash ‖ data_len ‖ data[..data_len]`, so bytes beyond `data_len` never
/// influence it.
#[derive(Clone)]
pub struct EnclaveReport {
    pub hash: [u8; MDSIZE],
    pub data_len: u64,
    pub data: [u8; ATTEST_DATA_MAXLEN],
    pub signature: [u8; SIGNATURE_SIZE],
}

/// The signed bundle handed back to an attesting enclave.
#[derive(Clone)]
pub struct Report {
    pub dev_public_key: [u8; PUBLIC_KEY_SIZE],
    pub sm: SmReport,
    pub enclave: EnclaveReport,
}

impl EnclaveReport {
    /// The number of bytes covered by the signature for a given data length.
    pub const fn signed_len(data_len: usize) -> usize {
        MDSIZE + 8 + data_len
    }

    fn to_bytes(&self, out: &mut [u8; ENCLAVE_REPORT_BYTES]) {
        out[..MDSIZE].copy_from_slice(&self.hash);
        out[MDSIZE..MDSIZE + 8].copy_from_slice(&self.data_len.to_le_bytes());
        out[MDSIZE + 8..MDSIZE + 8 + ATTEST_DATA_MAXLEN].copy_from_slice(&self.data);
        out[MDSIZE + 8 + ATTEST_DATA_MAXLEN..].copy_from_slice(&self.signature);
    }
}

impl Report {
    fn zeroed() -> Self {
        Report {
            dev_public_key: [0; PUBLIC_KEY_SIZE],
            sm: SmReport {
                hash: [0; MDSIZE],
                public_key: [0; PUBLIC_KEY_SIZE],
                signature: [0; SIGNATURE_SIZE],
            },
            enclave: EnclaveReport {
                hash: [0; MDSIZE],
                data_len: 0,
                data: [0; ATTEST_DATA_MAXLEN],
                signature: [0; SIGNATURE_SIZE],
            },
        }
    }

    pub fn to_bytes(&self, out: &mut [u8; REPORT_BYTES]) {
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.dev_public_key);
        let sm = &mut out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + SM_REPORT_BYTES];
        sm[..MDSIZE].copy_from_slice(&self.sm.hash);
        sm[MDSIZE..MDSIZE + PUBLIC_KEY_SIZE].copy_from_slice(&self.sm.public_key);
        sm[MDSIZE + PUBLIC_KEY_SIZE..].copy_from_slice(&self.sm.signature);

        let mut enclave = [0u8; ENCLAVE_REPORT_BYTES];
        self.enclave.to_bytes(&mut enclave);
        out[PUBLIC_KEY_SIZE + SM_REPORT_BYTES..].copy_from_slice(&enclave);
    }

    pub fn from_bytes(bytes: &[u8; REPORT_BYTES]) -> Self {
        let mut report = Report::zeroed();
        report
            .dev_public_key
            .copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);

        let sm = &bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + SM_REPORT_BYTES];
        report.sm.hash.copy_from_slice(&sm[..MDSIZE]);
        report
            .sm
            .public_key
            .copy_from_slice(&sm[MDSIZE..MDSIZE + PUBLIC_KEY_SIZE]);
        report
            .sm
            .signature
            .copy_from_slice(&sm[MDSIZE + PUBLIC_KEY_SIZE..]);

        let enclave = &bytes[PUBLIC_KEY_SIZE + SM_REPORT_BYTES..];
        report.enclave.hash.copy_from_slice(&enclave[..MDSIZE]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&enclave[MDSIZE..MDSIZE + 8]);
        report.enclave.data_len = u64::from_le_bytes(len);
        report
            .enclave
            .data
            .copy_from_slice(&enclave[MDSIZE + 8..MDSIZE + 8 + ATTEST_DATA_MAXLEN]);
        report
            .enclave
            .signature
            .copy_from_slice(&enclave[MDSIZE + 8 + ATTEST_DATA_MAXLEN..]);
        report
    }
}

// ——————————————————————————————— Operations ——————————————————————————————— //

impl SecurityMonitor {
    /// Builds a signed attestation report over `size` bytes of enclave data.
    ///
    /// The report is written back to `report_ptr` inside the enclave. The global lock is released
    /// while the monitor signs, signing is by far the most expensive step.
    pub fn attest_enclave(
        &self,
        eid: EnclaveId,
        report_ptr: usize,
        data_ptr: usize,
        size: usize,
    ) -> Result<(), SmError> {
        if size > ATTEST_DATA_MAXLEN {
            return Err(SmError::IllegalArgument);
        }

        let mut report = Report::zeroed();

        let table = self.lock_table();
        let slot = table
            .get(eid)
            .filter(|slot| slot.state >= EnclaveState::Fresh)
            .ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);
        mem::copy_from_enclave(&mut report.enclave.data[..size], data_ptr, regions.as_slice())
            .map_err(|_| SmError::NotAccessible)?;
        report.enclave.data_len = size as u64;
        report.enclave.hash = slot.hash;
        drop(table);

        report.dev_public_key = self.identity.dev_public_key;
        report.sm.hash = self.identity.sm_hash;
        report.sm.public_key = self.identity.sm_public_key;
        report.sm.signature = self.identity.sm_signature;

        let mut enclave_bytes = [0u8; ENCLAVE_REPORT_BYTES];
        report.enclave.to_bytes(&mut enclave_bytes);
        report.enclave.signature = self
            .identity
            .sign(&enclave_bytes[..EnclaveReport::signed_len(size)]);

        let mut bytes = [0u8; REPORT_BYTES];
        report.to_bytes(&mut bytes);

        let table = self.lock_table();
        let slot = table.get(eid).ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);
        mem::copy_to_enclave(report_ptr, &bytes, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        Ok(())
    }

    /// Derives the enclave's sealing key for `ident` and signs it with the monitor key.
    ///
    /// The key is bound to the monitor root and the enclave measurement: the same enclave always
    /// derives the same key, a different enclave never does.
    pub fn get_sealing_key(
        &self,
        eid: EnclaveId,
        key_ptr: usize,
        ident_ptr: usize,
        ident_len: usize,
    ) -> Result<(), SmError> {
        if ident_len > SEALING_IDENT_MAXLEN {
            return Err(SmError::IllegalArgument);
        }

        let table = self.lock_table();
        let slot = table
            .get(eid)
            .filter(|slot| slot.state >= EnclaveState::Fresh)
            .ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);
        let mut ident = [0u8; SEALING_IDENT_MAXLEN];
        mem::copy_from_enclave(&mut ident[..ident_len], ident_ptr, regions.as_slice())
            .map_err(|_| SmError::NotAccessible)?;
        let hash = slot.hash;
        drop(table);

        let mut info = [0u8; MDSIZE + SEALING_IDENT_MAXLEN];
        info[..MDSIZE].copy_from_slice(&hash);
        info[MDSIZE..MDSIZE + ident_len].copy_from_slice(&ident[..ident_len]);

        let mut key = [0u8; SEALING_KEY_SIZE];
        Hkdf::<Sha3_512>::new(None, self.identity.sealing_root())
            .expand(&info[..MDSIZE + ident_len], &mut key)
            .map_err(|_| SmError::UnknownError)?;
        let signature = self.identity.sign(&key);

        let mut out = [0u8; SEALING_KEY_BYTES];
        out[..SEALING_KEY_SIZE].copy_from_slice(&key);
        out[SEALING_KEY_SIZE..].copy_from_slice(&signature);

        let table = self.lock_table();
        let slot = table.get(eid).ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);
        mem::copy_to_enclave(key_ptr, &out, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
