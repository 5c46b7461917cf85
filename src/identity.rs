//! Identity and certification
//!
//! The monitor derives a DICE-style identity chain for every enclave: the measurement is folded
//! into a compound device identifier (CDI), the CDI seeds the local attestation keypair (LAK),
//! and the monitor's embedded certification authority issues an X.509 certificate binding the
//! LAK to the measurement. Enclaves can later derive further certified keypairs, the first of
//! which is designated the local device identity (LDevID).

use castellan_core::size::{MAX_CERT_LEN, MDSIZE, PUBLIC_KEY_SIZE};
use ed25519_dalek::{Signer, SigningKey};
use tiny_keccak::{Hasher, Sha3};
use zeroize::Zeroize;

use crate::enclave::SecurityMonitor;
use crate::error::SmError;
use crate::mem;
use crate::x509::{Date, X509Builder};

/// The parent CDI folded into every enclave CDI.
///
/// Zero unless a platform hook provisions a device-unique value at boot.
pub const PARENT_CDI: [u8; MDSIZE] = [0; MDSIZE];

// —————————————————————————— DER Certificate Buffer ———————————————————————— //

/// An owned DER certificate, stored in a fixed-size buffer.
#[derive(Clone)]
pub struct CertDer {
    bytes: [u8; MAX_CERT_LEN],
    len: usize,
}

impl CertDer {
    pub const fn empty() -> Self {
        CertDer {
            bytes: [0; MAX_CERT_LEN],
            len: 0,
        }
    }

    pub fn from_slice(der: &[u8]) -> Result<Self, SmError> {
        if der.len() > MAX_CERT_LEN {
            return Err(SmError::IllegalArgument);
        }
        let mut cert = CertDer::empty();
        cert.bytes[..der.len()].copy_from_slice(der);
        cert.len = der.len();
        Ok(cert)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ————————————————————————————— Monitor Identity ——————————————————————————— //

/// The monitor's own identity material, provisioned at boot.
///
/// The signing key never leaves this structure: signatures are produced through [SmIdentity::sign]
/// or by handing the key to the certificate builder as an opaque signer.
pub struct SmIdentity {
    /// The device root public key.
    pub dev_public_key: [u8; PUBLIC_KEY_SIZE],
    /// The monitor's measurement, taken by the boot loader.
    pub sm_hash: [u8; MDSIZE],
    /// The device root's signature over the monitor measurement.
    pub sm_signature: [u8; 64],
    /// The monitor's public key.
    pub sm_public_key: [u8; PUBLIC_KEY_SIZE],
    sm_key: SigningKey,
    sealing_root: [u8; MDSIZE],
    /// The monitor's certificate, signed by the device root.
    pub sm_cert: CertDer,
    /// The self-signed device root certificate.
    pub dev_cert: CertDer,
}

impl SmIdentity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut sm_key_seed: [u8; 32],
        sm_hash: [u8; MDSIZE],
        sm_signature: [u8; 64],
        dev_public_key: [u8; PUBLIC_KEY_SIZE],
        sealing_root: [u8; MDSIZE],
        sm_cert: CertDer,
        dev_cert: CertDer,
    ) -> Self {
        let sm_key = SigningKey::from_bytes(&sm_key_seed);
        sm_key_seed.zeroize();

        let sm_public_key = sm_key.verifying_key().to_bytes();
        SmIdentity {
            dev_public_key,
            sm_hash,
            sm_signature,
            sm_public_key,
            sm_key,
            sealing_root,
            sm_cert,
            dev_cert,
        }
    }

    pub(crate) fn sm_key(&self) -> &SigningKey {
        &self.sm_key
    }

    pub(crate) fn sealing_root(&self) -> &[u8; MDSIZE] {
        &self.sealing_root
    }

    /// Signs `message` with the monitor key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.sm_key.sign(message).to_bytes()
    }
}

// ————————————————————————————— Key Derivation ————————————————————————————— //

/// Derives the compound device identifier: `SHA3-512(parent_cdi ‖ enclave_hash)`.
pub(crate) fn derive_cdi(parent_cdi: &[u8; MDSIZE], hash: &[u8; MDSIZE]) -> [u8; MDSIZE] {
    let mut hasher = Sha3::v512();
    hasher.update(parent_cdi);
    hasher.update(hash);
    let mut cdi = [0u8; MDSIZE];
    hasher.finalize(&mut cdi);
    cdi
}

/// Derives the local attestation keypair from the CDI.
pub(crate) fn lak_from_cdi(cdi: &[u8; MDSIZE]) -> SigningKey {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&cdi[..32]);
    let key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    key
}

/// Derives an enclave-requested keypair: the seed is `SHA3-512(CDI ‖ ascii_digit(index))`.
pub(crate) fn keypair_from_index(cdi: &[u8; MDSIZE], index: usize) -> SigningKey {
    let digit = b'0'.wrapping_add(index as u8);
    let mut hasher = Sha3::v512();
    hasher.update(cdi);
    hasher.update(&[digit]);
    let mut seed64 = [0u8; MDSIZE];
    hasher.finalize(&mut seed64);

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&seed64[..32]);
    let key = SigningKey::from_bytes(&seed);
    seed64.zeroize();
    seed.zeroize();
    key
}

// ———————————————————————— Certificate Issuance ———————————————————————————— //

/// Issues the LAK certificate for a freshly measured enclave, signed by the monitor's embedded
/// certification authority.
pub(crate) fn issue_lak_certificate(
    eid: usize,
    hash: &[u8; MDSIZE],
    lak_public: &[u8; PUBLIC_KEY_SIZE],
    sm_key: &SigningKey,
) -> Result<CertDer, SmError> {
    let serial = [eid as u8];
    let builder = X509Builder {
        issuer_cn: "Security Monitor",
        subject_cn: "Enclave LAK",
        serial: &serial,
        not_before: Date::new(2023, 1, 1),
        not_after: Date::new(2026, 1, 1),
        subject_public_key: lak_public,
        measurement: hash,
    };
    emit_to_cert_der(&builder, sm_key)
}

/// Issues the LDevID certificate for the first enclave-requested keypair.
pub(crate) fn issue_ldev_certificate(
    eid: usize,
    hash: &[u8; MDSIZE],
    ldev_public: &[u8; PUBLIC_KEY_SIZE],
    sm_key: &SigningKey,
) -> Result<CertDer, SmError> {
    let serial = [(10 * eid + 1) as u8];
    let builder = X509Builder {
        issuer_cn: "Security Monitor",
        subject_cn: "Enclave LDevID",
        serial: &serial,
        not_before: Date::new(2023, 1, 1),
        not_after: Date::new(2025, 1, 1),
        subject_public_key: ldev_public,
        measurement: hash,
    };
    emit_to_cert_der(&builder, sm_key)
}

fn emit_to_cert_der(builder: &X509Builder, sm_key: &SigningKey) -> Result<CertDer, SmError> {
    let mut out = [0u8; MAX_CERT_LEN];
    let len = builder
        .emit_signed(sm_key, &mut out)
        .map_err(|_| SmError::UnknownError)?;
    CertDer::from_slice(&out[..len])
}

// ——————————————————————— Enclave-Facing Operations ———————————————————————— //

impl SecurityMonitor {
    /// Derives a fresh keypair for the enclave and stores it in the slot.
    ///
    /// The public key is copied to `pk_ptr`. The first keypair an enclave requests is designated
    /// its LDevID: it receives an X.509 certificate, copied to `crt_ptr` with its length at
    /// `crt_len_ptr`.
    pub fn create_keypair(
        &self,
        eid: usize,
        pk_ptr: usize,
        index: usize,
        crt_ptr: usize,
        crt_len_ptr: usize,
    ) -> Result<(), SmError> {
        let mut table = self.lock_table();
        let slot = table.get_mut(eid).ok_or(SmError::NotInitialized)?;
        if slot.n_keypair >= crate::config::NB_KEYPAIRS_MAX {
            return Err(SmError::NoFreeResource);
        }

        let key = keypair_from_index(&slot.cdi, index);
        let public = key.verifying_key().to_bytes();
        let mut keypair_bytes = key.to_keypair_bytes();

        let slot_index = slot.n_keypair;
        slot.pk_array[slot_index] = public;
        slot.sk_array[slot_index] = keypair_bytes;

        // The first requested keypair becomes the local device identity.
        let is_ldev = slot_index == 0;
        if is_ldev {
            slot.pk_ldev = public;
            slot.sk_ldev = keypair_bytes;
            slot.crt_ldev = issue_ldev_certificate(eid, &slot.hash, &public, self.identity.sm_key())?;
        }
        slot.n_keypair += 1;
        keypair_bytes.zeroize();

        log::debug!("Derived keypair {} for enclave {}", slot_index, eid);

        let regions = self.region_segments(slot);
        let ldev_cert = slot.crt_ldev.clone();
        mem::copy_to_enclave(pk_ptr, &public, regions.as_slice())?;

        if is_ldev {
            let len_bytes = ldev_cert.len().to_le_bytes();
            mem::copy_to_enclave(crt_len_ptr, &len_bytes, regions.as_slice())?;
            mem::copy_to_enclave(crt_ptr, ldev_cert.as_slice(), regions.as_slice())?;
        }
        Ok(())
    }

    /// Copies the certificate chain to the enclave: `[LAK, SM, DEV]`.
    ///
    /// `certs_ptr` points to three destination buffer addresses, `sizes_ptr` to three length
    /// slots.
    pub fn get_cert_chain(&self, eid: usize, certs_ptr: usize, sizes_ptr: usize) -> Result<(), SmError> {
        const WORD: usize = core::mem::size_of::<usize>();

        let table = self.lock_table();
        let slot = table.get(eid).ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);

        // Read the three destination pointers from enclave memory.
        let mut ptr_bytes = [0u8; 3 * WORD];
        mem::copy_from_enclave(&mut ptr_bytes, certs_ptr, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        let mut dests = [0usize; 3];
        for (i, dest) in dests.iter_mut().enumerate() {
            let mut word = [0u8; WORD];
            word.copy_from_slice(&ptr_bytes[i * WORD..(i + 1) * WORD]);
            *dest = usize::from_le_bytes(word);
        }

        let chain = [
            slot.crt_local_att.as_slice(),
            self.identity.sm_cert.as_slice(),
            self.identity.dev_cert.as_slice(),
        ];

        let mut size_bytes = [0u8; 3 * WORD];
        for (i, cert) in chain.iter().enumerate() {
            size_bytes[i * WORD..(i + 1) * WORD].copy_from_slice(&cert.len().to_le_bytes());
        }
        mem::copy_to_enclave(sizes_ptr, &size_bytes, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;

        for (cert, dest) in chain.iter().zip(dests) {
            mem::copy_to_enclave(dest, cert, regions.as_slice())
                .map_err(|_| SmError::IllegalArgument)?;
        }
        Ok(())
    }

    /// Signing operations over the enclave's derived keys.
    ///
    /// `flag = 1` signs `SHA3-512(data ‖ enclave_hash ‖ pk_ldev)` with the LAK, `flag = 2` signs
    /// `data` with the keypair matching the provided public key.
    pub fn crypto_op(
        &self,
        eid: usize,
        flag: usize,
        data_ptr: usize,
        data_len: usize,
        out_ptr: usize,
        out_len_ptr: usize,
        pk_ptr: usize,
    ) -> Result<(), SmError> {
        use castellan_core::size::CRYPTO_DATA_MAXLEN;

        if data_len > CRYPTO_DATA_MAXLEN {
            return Err(SmError::IllegalArgument);
        }

        let table = self.lock_table();
        let slot = table.get(eid).ok_or(SmError::NotInitialized)?;
        let regions = self.region_segments(slot);

        let mut data = [0u8; CRYPTO_DATA_MAXLEN];
        mem::copy_from_enclave(&mut data[..data_len], data_ptr, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        let mut pk = [0u8; PUBLIC_KEY_SIZE];
        mem::copy_from_enclave(&mut pk, pk_ptr, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;

        let signature: [u8; 64] = match flag {
            // Sign of measurement-bound data with the local attestation key. The attestation
            // public key can be obtained from the certificate chain.
            1 => {
                let mut hasher = Sha3::v512();
                hasher.update(&data[..data_len]);
                hasher.update(&slot.hash);
                hasher.update(&slot.pk_ldev);
                let mut digest = [0u8; MDSIZE];
                hasher.finalize(&mut digest);

                let lak = SigningKey::from_keypair_bytes(&slot.local_att_priv)
                    .map_err(|_| SmError::UnknownError)?;
                lak.sign(&digest).to_bytes()
            }
            // Sign of generic data with a specific derived keypair.
            2 => {
                let pos = (0..slot.n_keypair)
                    .find(|&i| slot.pk_array[i] == pk)
                    .ok_or(SmError::IllegalArgument)?;
                let key = SigningKey::from_keypair_bytes(&slot.sk_array[pos])
                    .map_err(|_| SmError::UnknownError)?;
                key.sign(&data[..data_len]).to_bytes()
            }
            _ => return Err(SmError::IllegalArgument),
        };

        mem::copy_to_enclave(out_ptr, &signature, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        let sig_len = signature.len().to_le_bytes();
        mem::copy_to_enclave(out_len_ptr, &sig_len, regions.as_slice())
            .map_err(|_| SmError::IllegalArgument)?;
        Ok(())
    }
}

// ————————————————————————— Userspace Provisioning ————————————————————————— //

/// Builds a deterministic identity for userspace runs, playing the role of the boot-time
/// provisioning flow: a fixed device root key, a monitor key certified by it, and a self-signed
/// root certificate.
#[cfg(any(test, feature = "userspace"))]
pub fn test_identity() -> SmIdentity {
    use castellan_core::size::MAX_CERT_LEN;

    let dev_key = SigningKey::from_bytes(&[0x01; 32]);
    let sm_seed = [0x02; 32];
    let sm_key = SigningKey::from_bytes(&sm_seed);

    let mut sm_hash = [0u8; MDSIZE];
    let mut hasher = Sha3::v512();
    hasher.update(b"castellan userspace firmware");
    hasher.finalize(&mut sm_hash);

    let sm_signature = dev_key.sign(&sm_hash).to_bytes();

    let mut sealing_root = [0u8; MDSIZE];
    let mut hasher = Sha3::v512();
    hasher.update(b"castellan userspace sealing root");
    hasher.finalize(&mut sealing_root);

    let dev_public = dev_key.verifying_key().to_bytes();
    let sm_public = sm_key.verifying_key().to_bytes();
    let zero_measurement = [0u8; MDSIZE];

    let mut buf = [0u8; MAX_CERT_LEN];
    let len = X509Builder {
        issuer_cn: "Device Root Key",
        subject_cn: "Device Root Key",
        serial: &[1],
        not_before: Date::new(2023, 1, 1),
        not_after: Date::new(2033, 1, 1),
        subject_public_key: &dev_public,
        measurement: &zero_measurement,
    }
    .emit_signed(&dev_key, &mut buf)
    .expect("Failed to emit the device root certificate");
    let dev_cert = CertDer::from_slice(&buf[..len]).unwrap();

    let len = X509Builder {
        issuer_cn: "Device Root Key",
        subject_cn: "Security Monitor",
        serial: &[2],
        not_before: Date::new(2023, 1, 1),
        not_after: Date::new(2033, 1, 1),
        subject_public_key: &sm_public,
        measurement: &sm_hash,
    }
    .emit_signed(&dev_key, &mut buf)
    .expect("Failed to emit the monitor certificate");
    let sm_cert = CertDer::from_slice(&buf[..len]).unwrap();

    SmIdentity::new(
        sm_seed,
        sm_hash,
        sm_signature,
        dev_public,
        sealing_root,
        sm_cert,
        dev_cert,
    )
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509;

    #[test]
    fn cdi_derivation_is_deterministic() {
        let hash = [0x11; MDSIZE];
        let cdi_a = derive_cdi(&PARENT_CDI, &hash);
        let cdi_b = derive_cdi(&PARENT_CDI, &hash);
        assert_eq!(cdi_a, cdi_b);

        // A different measurement yields a different CDI and a different LAK.
        let other = derive_cdi(&PARENT_CDI, &[0x12; MDSIZE]);
        assert_ne!(cdi_a, other);
        assert_ne!(
            lak_from_cdi(&cdi_a).verifying_key(),
            lak_from_cdi(&other).verifying_key()
        );
    }

    #[test]
    fn derived_keypairs_differ_by_index() {
        let cdi = derive_cdi(&PARENT_CDI, &[0x33; MDSIZE]);
        let k0 = keypair_from_index(&cdi, 0);
        let k1 = keypair_from_index(&cdi, 1);
        assert_ne!(k0.verifying_key(), k1.verifying_key());

        // Same index, same key.
        assert_eq!(
            keypair_from_index(&cdi, 1).verifying_key(),
            k1.verifying_key()
        );
    }

    #[test]
    fn provisioned_chain_verifies() {
        let identity = test_identity();

        // The monitor certificate is signed by the device root, the root by itself.
        assert!(x509::verify_signature(
            identity.sm_cert.as_slice(),
            &identity.dev_public_key
        ));
        assert!(x509::verify_signature(
            identity.dev_cert.as_slice(),
            &identity.dev_public_key
        ));

        let cert = x509::Certificate::parse(identity.sm_cert.as_slice()).unwrap();
        assert_eq!(cert.tbs_certificate.subject.cn(), "Security Monitor");
        assert_eq!(cert.fwid_digest().unwrap(), identity.sm_hash);
    }

    #[test]
    fn lak_certificate_binds_measurement() {
        let identity = test_identity();
        let hash = [0x77; MDSIZE];
        let cdi = derive_cdi(&PARENT_CDI, &hash);
        let lak = lak_from_cdi(&cdi);
        let lak_public = lak.verifying_key().to_bytes();

        let cert = issue_lak_certificate(3, &hash, &lak_public, identity.sm_key()).unwrap();
        assert!(x509::verify_signature(cert.as_slice(), &identity.sm_public_key));

        let parsed = x509::Certificate::parse(cert.as_slice()).unwrap();
        assert_eq!(parsed.tbs_certificate.subject.cn(), "Enclave LAK");
        assert_eq!(parsed.tbs_certificate.serial_number.as_bytes(), &[3]);
        assert_eq!(parsed.fwid_digest().unwrap(), hash);
        assert_eq!(parsed.public_key(), lak_public);
    }
}
