//! X.509 certificate emission
//!
//! A no-alloc DER builder for the small family of certificates the monitor issues: Ed25519
//! keys, a single common-name attribute per distinguished name, a key-usage extension, and the
//! DICE TcbInfo extension pinning the certificate to a measurement. Certificates are encoded
//! into caller-provided buffers and can be decoded back, which is how the chain is verified.

use der::asn1::{BitStringRef, ObjectIdentifier, OctetStringRef, UintRef, UtcTime, Utf8StringRef};
use der::{
    Decode, DecodeValue, DateTime, Encode, EncodeValue, FixedTag, Header, Length, Reader,
    Sequence, Tag, Writer,
};
use ed25519_dalek::{Signature, Signer};

use castellan_core::size::MAX_CERT_LEN;

// —————————————————————————————————— OIDs —————————————————————————————————— //

/// X.520 common name.
pub const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
/// Ed25519 signature algorithm.
pub const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
/// X.509 key usage extension.
pub const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
/// TCG DICE TcbInfo extension.
pub const OID_DICE_TCB_INFO: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.5.4.1");
/// NIST SHA3-512.
pub const OID_SHA3_512: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.10");

/// DER encoding of a key-usage BIT STRING with only `digitalSignature` set.
const KEY_USAGE_DIGITAL_SIGNATURE: [u8; 4] = [0x03, 0x02, 0x07, 0x80];

// ————————————————————————————— DER Structures ————————————————————————————— //

#[derive(Clone, Copy, Sequence)]
pub struct AlgorithmIdentifier {
    pub algorithm: ObjectIdentifier,
}

/// The Ed25519 algorithm identifier, used for both keys and signatures.
pub const ALG_ED25519: AlgorithmIdentifier = AlgorithmIdentifier {
    algorithm: OID_ED25519,
};

#[derive(Clone, Copy, Sequence)]
pub struct AttributeTypeAndValue<'a> {
    pub oid: ObjectIdentifier,
    pub value: Utf8StringRef<'a>,
}

/// A relative distinguished name holding exactly one attribute.
///
/// DER encodes this as a SET, which the `der` derive does not produce for plain structs, so the
/// tagging is implemented by hand.
#[derive(Clone, Copy)]
pub struct RdnSet<'a>(pub AttributeTypeAndValue<'a>);

impl EncodeValue for RdnSet<'_> {
    fn value_len(&self) -> der::Result<Length> {
        self.0.encoded_len()
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.0.encode(writer)
    }
}

impl<'a> DecodeValue<'a> for RdnSet<'a> {
    fn decode_value<R: Reader<'a>>(reader: &mut R, _header: Header) -> der::Result<Self> {
        Ok(RdnSet(AttributeTypeAndValue::decode(reader)?))
    }
}

impl FixedTag for RdnSet<'_> {
    const TAG: Tag = Tag::Set;
}

/// An X.501 name with a single common-name attribute.
#[derive(Clone, Copy, Sequence)]
pub struct Name<'a> {
    pub rdn: RdnSet<'a>,
}

impl<'a> Name<'a> {
    pub fn common_name(cn: &'a str) -> der::Result<Self> {
        Ok(Name {
            rdn: RdnSet(AttributeTypeAndValue {
                oid: OID_COMMON_NAME,
                value: Utf8StringRef::new(cn)?,
            }),
        })
    }

    /// The common name carried by this name.
    pub fn cn(&self) -> &'a str {
        self.rdn.0.value.as_str()
    }
}

#[derive(Clone, Copy, Sequence)]
pub struct Validity {
    pub not_before: UtcTime,
    pub not_after: UtcTime,
}

/// A calendar day, expanded to midnight when encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Date { year, month, day }
    }

    fn to_utc_time(self) -> der::Result<UtcTime> {
        let datetime = DateTime::new(self.year, self.month, self.day, 0, 0, 0)?;
        UtcTime::from_date_time(datetime)
    }
}

#[derive(Clone, Copy, Sequence)]
pub struct SubjectPublicKeyInfo<'a> {
    pub algorithm: AlgorithmIdentifier,
    pub subject_public_key: BitStringRef<'a>,
}

#[derive(Clone, Copy, Sequence)]
pub struct Extension<'a> {
    pub extn_id: ObjectIdentifier,
    pub critical: bool,
    pub extn_value: OctetStringRef<'a>,
}

/// The extension list issued with every certificate: key usage, then DICE TcbInfo.
#[derive(Clone, Copy, Sequence)]
pub struct Extensions<'a> {
    pub key_usage: Extension<'a>,
    pub dice_tcb_info: Extension<'a>,
}

/// A firmware identifier: the hash algorithm and the measurement digest.
#[derive(Clone, Copy, Sequence)]
pub struct Fwid<'a> {
    pub hash_alg: ObjectIdentifier,
    pub digest: OctetStringRef<'a>,
}

#[derive(Clone, Copy, Sequence)]
pub struct FwidList<'a> {
    pub fwid: Fwid<'a>,
}

/// The DICE TcbInfo payload, restricted to the single measurement the monitor records.
#[derive(Clone, Copy, Sequence)]
pub struct DiceTcbInfo<'a> {
    #[asn1(context_specific = "6", tag_mode = "IMPLICIT")]
    pub fwids: FwidList<'a>,
}

#[derive(Clone, Copy, Sequence)]
pub struct TbsCertificate<'a> {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    pub version: u8,
    pub serial_number: UintRef<'a>,
    pub signature: AlgorithmIdentifier,
    pub issuer: Name<'a>,
    pub validity: Validity,
    pub subject: Name<'a>,
    pub subject_public_key_info: SubjectPublicKeyInfo<'a>,
    #[asn1(context_specific = "3", tag_mode = "EXPLICIT")]
    pub extensions: Extensions<'a>,
}

#[derive(Clone, Copy, Sequence)]
pub struct Certificate<'a> {
    pub tbs_certificate: TbsCertificate<'a>,
    pub signature_algorithm: AlgorithmIdentifier,
    pub signature: BitStringRef<'a>,
}

impl<'a> Certificate<'a> {
    /// Decodes a certificate from its DER encoding.
    pub fn parse(der_bytes: &'a [u8]) -> der::Result<Self> {
        Certificate::from_der(der_bytes)
    }

    /// The measurement digest pinned by the DICE TcbInfo extension.
    pub fn fwid_digest(&self) -> der::Result<&'a [u8]> {
        let tcb_info =
            DiceTcbInfo::from_der(self.tbs_certificate.extensions.dice_tcb_info.extn_value.as_bytes())?;
        Ok(tcb_info.fwids.fwid.digest.as_bytes())
    }

    /// The raw subject public key.
    pub fn public_key(&self) -> &'a [u8] {
        self.tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes()
    }
}

// ——————————————————————————— Certificate Builder —————————————————————————— //

/// Assembles and signs a single certificate.
///
/// The signer only needs to produce Ed25519 signatures, the certification authority key itself
/// stays behind the [Signer] trait.
pub struct X509Builder<'a> {
    pub issuer_cn: &'a str,
    pub subject_cn: &'a str,
    pub serial: &'a [u8],
    pub not_before: Date,
    pub not_after: Date,
    pub subject_public_key: &'a [u8; 32],
    /// The measurement bound into the DICE TcbInfo extension.
    pub measurement: &'a [u8; 64],
}

impl<'a> X509Builder<'a> {
    /// Emits the signed certificate in DER at the head of `out`, returning its length.
    pub fn emit_signed<S: Signer<Signature>>(
        &self,
        signer: &S,
        out: &mut [u8],
    ) -> der::Result<usize> {
        // The TcbInfo payload is encoded first, it ends up wrapped in an octet string.
        let fwid = Fwid {
            hash_alg: OID_SHA3_512,
            digest: OctetStringRef::new(self.measurement)?,
        };
        let mut tcb_info_buf = [0u8; 128];
        let tcb_info_der =
            DiceTcbInfo { fwids: FwidList { fwid } }.encode_to_slice(&mut tcb_info_buf)?;

        let extensions = Extensions {
            key_usage: Extension {
                extn_id: OID_KEY_USAGE,
                critical: true,
                extn_value: OctetStringRef::new(&KEY_USAGE_DIGITAL_SIGNATURE)?,
            },
            dice_tcb_info: Extension {
                extn_id: OID_DICE_TCB_INFO,
                critical: false,
                extn_value: OctetStringRef::new(tcb_info_der)?,
            },
        };

        let tbs = TbsCertificate {
            version: 2, // X.509 v3
            serial_number: UintRef::new(self.serial)?,
            signature: ALG_ED25519,
            issuer: Name::common_name(self.issuer_cn)?,
            validity: Validity {
                not_before: self.not_before.to_utc_time()?,
                not_after: self.not_after.to_utc_time()?,
            },
            subject: Name::common_name(self.subject_cn)?,
            subject_public_key_info: SubjectPublicKeyInfo {
                algorithm: ALG_ED25519,
                subject_public_key: BitStringRef::from_bytes(self.subject_public_key)?,
            },
            extensions,
        };

        // Sign over the encoded TBS, then emit the full certificate. DER encoding is
        // deterministic so the TBS bytes inside the certificate match the signed ones.
        let mut tbs_buf = [0u8; MAX_CERT_LEN];
        let tbs_der = tbs.encode_to_slice(&mut tbs_buf)?;
        let signature = signer.sign(tbs_der).to_bytes();

        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: ALG_ED25519,
            signature: BitStringRef::from_bytes(&signature)?,
        };
        let der_bytes = certificate.encode_to_slice(out)?;
        Ok(der_bytes.len())
    }
}

/// Checks the certificate's signature against the issuer public key.
pub fn verify_signature(cert_der: &[u8], issuer_public_key: &[u8; 32]) -> bool {
    use ed25519_dalek::{Verifier, VerifyingKey};

    let Ok(certificate) = Certificate::parse(cert_der) else {
        return false;
    };
    let mut tbs_buf = [0u8; MAX_CERT_LEN];
    let Ok(tbs_der) = certificate.tbs_certificate.encode_to_slice(&mut tbs_buf) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(issuer_public_key) else {
        return false;
    };
    let Ok(signature_bytes) = <[u8; 64]>::try_from(certificate.signature.raw_bytes()) else {
        return false;
    };
    key.verify(tbs_der, &Signature::from_bytes(&signature_bytes))
        .is_ok()
}

// ————————————————————————————————— Tests —————————————————————————————————— //
