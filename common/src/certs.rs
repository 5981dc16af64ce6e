//! Rebuilds X.509 certificates from the compressed form kept in the secure
//! element.
//!
//! A compressed certificate is 72 bytes: the raw ECDSA signature, three
//! bytes of packed dates, the signer id, and format bits. Everything else
//! comes from a DER template for the role plus the role's public key.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

use crate::{
    element::{CertRole, Digest, PublicKey, SecureElement, SharedElement, Signature, PUBLIC_KEY_LEN},
    error::KitError,
    shared::lock,
};

pub const COMPRESSED_CERT_LEN: usize = 72;
pub const SERIAL_LEN: usize = 16;
const UTC_TIME_LEN: usize = 13;
const PEM_LINE_LEN: usize = 64;

const OID_COMMON_NAME: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
const ALG_ECDSA_WITH_SHA256: [u8; 12] = [
    0x30, 0x0A, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02,
];
const SPKI_P256_PREFIX: [u8; 27] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x08,
    0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00, 0x04,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedCert {
    pub signature: Signature,
    pub enc_dates: [u8; 3],
    pub signer_id: [u8; 2],
    pub template_id: u8,
    pub chain_id: u8,
    pub sn_source: u8,
    pub format: u8,
}

impl CompressedCert {
    pub fn from_bytes(raw: &[u8; COMPRESSED_CERT_LEN]) -> Self {
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&raw[..64]);
        Self {
            signature,
            enc_dates: [raw[64], raw[65], raw[66]],
            signer_id: [raw[67], raw[68]],
            template_id: raw[69] >> 4,
            chain_id: raw[69] & 0x0F,
            sn_source: raw[70] >> 4,
            format: raw[70] & 0x0F,
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPRESSED_CERT_LEN] {
        let mut raw = [0u8; COMPRESSED_CERT_LEN];
        raw[..64].copy_from_slice(&self.signature);
        raw[64..67].copy_from_slice(&self.enc_dates);
        raw[67..69].copy_from_slice(&self.signer_id);
        raw[69] = (self.template_id << 4) | (self.chain_id & 0x0F);
        raw[70] = (self.sn_source << 4) | (self.format & 0x0F);
        raw
    }
}

/// Packs an issue date (hour precision) and validity in years:
/// year-2000:5, month:4, day:5, hour:5, expire years:5.
pub fn encode_dates(issued: NaiveDateTime, expire_years: u8) -> Result<[u8; 3], KitError> {
    let year = issued.year() - 2000;
    if !(0..32).contains(&year) || expire_years == 0 || expire_years > 31 {
        return Err(KitError::BadParam);
    }
    let raw = ((year as u32) << 19)
        | (issued.month() << 15)
        | (issued.day() << 10)
        | (issued.hour() << 5)
        | u32::from(expire_years);
    let bytes = raw.to_be_bytes();
    Ok([bytes[1], bytes[2], bytes[3]])
}

pub fn decode_dates(enc: [u8; 3]) -> Result<(NaiveDateTime, NaiveDateTime), KitError> {
    let raw = u32::from_be_bytes([0, enc[0], enc[1], enc[2]]);
    let year = 2000 + ((raw >> 19) & 0x1F) as i32;
    let month = (raw >> 15) & 0x0F;
    let day = (raw >> 10) & 0x1F;
    let hour = (raw >> 5) & 0x1F;
    let expire_years = (raw & 0x1F) as i32;
    if expire_years == 0 {
        return Err(KitError::CertFailure);
    }

    let issued = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, 0, 0))
        .ok_or(KitError::CertFailure)?;
    let expire_year = year + expire_years;
    let expires = issued
        .with_year(expire_year)
        .or_else(|| {
            NaiveDate::from_ymd_opt(expire_year, month, 28)
                .and_then(|date| date.and_hms_opt(hour, 0, 0))
        })
        .ok_or(KitError::CertFailure)?;
    Ok((issued, expires))
}

fn utc_time(at: NaiveDateTime) -> Result<String, KitError> {
    if !(2000..2050).contains(&at.year()) {
        return Err(KitError::CertFailure);
    }
    Ok(at.format("%y%m%d%H%M%SZ").to_string())
}

/// Certificate serial derived from the public key and packed dates, with the
/// top bits forced so the DER integer stays positive and 16 bytes long.
pub fn serial_number(public_key: &PublicKey, enc_dates: &[u8; 3]) -> [u8; SERIAL_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(enc_dates);
    let digest = hasher.finalize();
    let mut serial = [0u8; SERIAL_LEN];
    serial.copy_from_slice(&digest[..SERIAL_LEN]);
    serial[0] = (serial[0] & 0x7F) | 0x40;
    serial
}

fn der_header(tag: u8, len: usize, out: &mut Vec<u8>) {
    out.push(tag);
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    der_header(tag, content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn der_unsigned(bytes: &[u8]) -> Vec<u8> {
    let skip = bytes
        .iter()
        .take_while(|byte| **byte == 0)
        .count()
        .min(bytes.len().saturating_sub(1));
    let trimmed = &bytes[skip..];
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().is_some_and(|byte| byte & 0x80 != 0) {
        content.push(0);
    }
    content.extend_from_slice(trimmed);
    der_tlv(0x02, &content)
}

fn der_name(common_name: &str) -> Vec<u8> {
    let mut attribute = OID_COMMON_NAME.to_vec();
    attribute.extend(der_tlv(0x0C, common_name.as_bytes()));
    der_tlv(0x30, &der_tlv(0x31, &der_tlv(0x30, &attribute)))
}

/// DER template for one certificate role and where the variable elements
/// sit inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertDefinition {
    pub role: CertRole,
    pub template: Vec<u8>,
    pub serial_offset: usize,
    pub issue_date_offset: usize,
    pub expire_date_offset: usize,
    pub public_key_offset: usize,
}

impl CertDefinition {
    /// Template for a P-256 certificate with single-CN issuer and subject.
    pub fn p256(role: CertRole, issuer_cn: &str, subject_cn: &str) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&[0xA0, 0x03, 0x02, 0x01, 0x02]);

        body.extend_from_slice(&[0x02, SERIAL_LEN as u8]);
        let serial_offset = body.len();
        body.push(0x40);
        body.extend_from_slice(&[0u8; SERIAL_LEN - 1]);

        body.extend_from_slice(&ALG_ECDSA_WITH_SHA256);
        body.extend(der_name(issuer_cn));

        body.extend_from_slice(&[0x30, 2 * (UTC_TIME_LEN as u8 + 2)]);
        body.extend_from_slice(&[0x17, UTC_TIME_LEN as u8]);
        let issue_date_offset = body.len();
        body.extend_from_slice(b"000101000000Z");
        body.extend_from_slice(&[0x17, UTC_TIME_LEN as u8]);
        let expire_date_offset = body.len();
        body.extend_from_slice(b"000101000000Z");

        body.extend(der_name(subject_cn));

        body.extend_from_slice(&SPKI_P256_PREFIX);
        let public_key_offset = body.len();
        body.extend_from_slice(&[0u8; PUBLIC_KEY_LEN]);

        let mut template = Vec::with_capacity(body.len() + 4);
        der_header(0x30, body.len(), &mut template);
        let shift = template.len();
        template.extend(body);

        Self {
            role,
            template,
            serial_offset: serial_offset + shift,
            issue_date_offset: issue_date_offset + shift,
            expire_date_offset: expire_date_offset + shift,
            public_key_offset: public_key_offset + shift,
        }
    }

    /// The to-be-signed portion with every variable element filled in.
    pub fn build_tbs(&self, enc_dates: &[u8; 3], public_key: &PublicKey) -> Result<Vec<u8>, KitError> {
        let (issued, expires) = decode_dates(*enc_dates)?;
        let mut tbs = self.template.clone();
        splice(&mut tbs, self.public_key_offset, public_key)?;
        splice(&mut tbs, self.issue_date_offset, utc_time(issued)?.as_bytes())?;
        splice(&mut tbs, self.expire_date_offset, utc_time(expires)?.as_bytes())?;
        splice(&mut tbs, self.serial_offset, &serial_number(public_key, enc_dates))?;
        Ok(tbs)
    }
}

fn splice(target: &mut [u8], offset: usize, value: &[u8]) -> Result<(), KitError> {
    target
        .get_mut(offset..offset + value.len())
        .ok_or(KitError::CertFailure)?
        .copy_from_slice(value);
    Ok(())
}

fn assemble(tbs: &[u8], signature: &Signature) -> Vec<u8> {
    let mut ecdsa = der_unsigned(&signature[..32]);
    ecdsa.extend(der_unsigned(&signature[32..]));
    let ecdsa = der_tlv(0x30, &ecdsa);

    let mut bit_string = Vec::with_capacity(ecdsa.len() + 1);
    bit_string.push(0);
    bit_string.extend(ecdsa);

    let mut body = tbs.to_vec();
    body.extend_from_slice(&ALG_ECDSA_WITH_SHA256);
    body.extend(der_tlv(0x03, &bit_string));
    der_tlv(0x30, &body)
}

pub fn pem_encode(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(PEM_LINE_LEN) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCert {
    pub role: CertRole,
    pub der: Vec<u8>,
    pub pem: String,
    pub public_key: PublicKey,
    pub tbs_digest: Digest,
    pub signature: Signature,
    pub issued: NaiveDateTime,
    pub expires: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub signer: BuiltCert,
    pub device: BuiltCert,
}

impl CertificateBundle {
    /// Calendar-date check of the device certificate against `now`.
    pub fn valid_at(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        self.device.issued.date() <= today && today <= self.device.expires.date()
    }
}

pub struct CertificateBuilder<S> {
    element: SharedElement<S>,
    signer: CertDefinition,
    device: CertDefinition,
}

impl<S: SecureElement> CertificateBuilder<S> {
    pub fn new(element: SharedElement<S>, signer: CertDefinition, device: CertDefinition) -> Self {
        Self {
            element,
            signer,
            device,
        }
    }

    pub fn build_device_and_signer_certs(&self) -> Result<CertificateBundle, KitError> {
        let mut element = lock(&self.element);
        let signer = rebuild(&mut *element, &self.signer)?;
        let device = rebuild(&mut *element, &self.device)?;

        let chained = element
            .verify(&signer.public_key, &device.tbs_digest, &device.signature)
            .map_err(|err| {
                warn!("device certificate verify failed: {err}");
                KitError::CertFailure
            })?;
        if !chained {
            warn!("device certificate is not signed by the signer key");
            return Err(KitError::CertFailure);
        }

        debug!(
            "rebuilt certificates: signer {} bytes, device {} bytes",
            signer.der.len(),
            device.der.len()
        );
        Ok(CertificateBundle { signer, device })
    }
}

impl<S> Clone for CertificateBuilder<S> {
    fn clone(&self) -> Self {
        Self {
            element: Arc::clone(&self.element),
            signer: self.signer.clone(),
            device: self.device.clone(),
        }
    }
}

fn rebuild<S: SecureElement>(element: &mut S, def: &CertDefinition) -> Result<BuiltCert, KitError> {
    let role = def.role;
    let fail = |err: KitError| {
        warn!("{} certificate rebuild failed: {err}", role.as_str());
        KitError::CertFailure
    };

    let mut raw = [0u8; COMPRESSED_CERT_LEN];
    element
        .read_slot(role.compressed_slot(), 0, &mut raw)
        .map_err(fail)?;
    let compressed = CompressedCert::from_bytes(&raw);
    if compressed.format != 0 {
        return Err(fail(KitError::BadParam));
    }
    let public_key = element.public_key(role.public_key_slot()).map_err(fail)?;

    let tbs = def.build_tbs(&compressed.enc_dates, &public_key).map_err(fail)?;
    let (issued, expires) = decode_dates(compressed.enc_dates).map_err(fail)?;
    let der = assemble(&tbs, &compressed.signature);

    Ok(BuiltCert {
        role,
        pem: pem_encode(&der),
        der,
        public_key,
        tbs_digest: Sha256::digest(&tbs).into(),
        signature: compressed.signature,
        issued,
        expires,
    })
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{testing::*, *};
    use crate::element::{shared, testing::FakeElement, Slot};

    fn builder(element: FakeElement) -> CertificateBuilder<FakeElement> {
        let (signer, device) = definitions();
        CertificateBuilder::new(shared(element), signer, device)
    }

    #[test]
    fn packed_dates_match_bit_layout() {
        let enc = encode_dates(issued_at(), 20).unwrap();
        // year 25, month 6, day 1, hour 10, 20 years
        let expected = (25u32 << 19) | (6 << 15) | (1 << 10) | (10 << 5) | 20;
        assert_eq!(u32::from_be_bytes([0, enc[0], enc[1], enc[2]]), expected);

        let (issued, expires) = decode_dates(enc).unwrap();
        assert_eq!(issued, issued_at());
        assert_eq!(expires.year(), 2045);
        assert_eq!(expires.month(), 6);
    }

    #[test]
    fn zero_expiry_is_rejected() {
        let enc = encode_dates(issued_at(), 1).unwrap();
        let without_expiry = [enc[0], enc[1], enc[2] & 0xE0];
        assert_eq!(decode_dates(without_expiry), Err(KitError::CertFailure));
    }

    #[test]
    fn template_offsets_point_at_placeholders() {
        let (_, device) = definitions();
        let t = &device.template;
        assert_eq!(t[0], 0x30);
        assert_eq!(t[device.serial_offset - 2..device.serial_offset], [0x02, 0x10]);
        assert_eq!(
            &t[device.issue_date_offset..device.issue_date_offset + 13],
            b"000101000000Z"
        );
        assert_eq!(t[device.public_key_offset - 1], 0x04);
        assert_eq!(device.public_key_offset + PUBLIC_KEY_LEN, t.len());
    }

    #[test]
    fn builds_chained_certificates() {
        let mut element = FakeElement::default();
        provision_certs(&mut element);

        let bundle = builder(element).build_device_and_signer_certs().unwrap();

        assert_eq!(bundle.device.public_key, crate::element::testing::key_for("device"));
        assert!(bundle.device.pem.starts_with("-----BEGIN CERTIFICATE-----\nMII"));
        assert!(bundle.device.pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(bundle
            .device
            .pem
            .lines()
            .all(|line| line.len() <= PEM_LINE_LEN));
        assert_eq!(bundle.device.der[0], 0x30);
        assert_eq!(usize::from(bundle.device.der[1] & 0x7F), 2);
        let declared = usize::from(u16::from_be_bytes([bundle.device.der[2], bundle.device.der[3]]));
        assert_eq!(declared + 4, bundle.device.der.len());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let mut element = FakeElement::default();
        provision_certs(&mut element);
        let builder = builder(element);

        let first = builder.build_device_and_signer_certs().unwrap();
        let second = builder.build_device_and_signer_certs().unwrap();

        assert_eq!(first.device.pem, second.device.pem);
        assert_eq!(first.signer.pem, second.signer.pem);
        assert_eq!(first, second);
    }

    #[test]
    fn broken_chain_is_cert_failure() {
        let mut element = FakeElement::default();
        provision_certs(&mut element);
        element.slots.get_mut(&Slot::DeviceCert).unwrap()[0] ^= 0x01;

        assert_eq!(
            builder(element).build_device_and_signer_certs(),
            Err(KitError::CertFailure)
        );
    }

    #[test]
    fn blank_slots_are_cert_failure() {
        assert_eq!(
            builder(FakeElement::default()).build_device_and_signer_certs(),
            Err(KitError::CertFailure)
        );
    }

    #[test]
    fn element_failure_is_cert_failure() {
        let mut element = FakeElement::default();
        provision_certs(&mut element);
        element.fail_io = true;

        assert_eq!(
            builder(element).build_device_and_signer_certs(),
            Err(KitError::CertFailure)
        );
    }

    #[test]
    fn validity_compares_calendar_dates() {
        let mut element = FakeElement::default();
        provision_certs(&mut element);
        let bundle = builder(element).build_device_and_signer_certs().unwrap();

        let at = |y, m, d, h| {
            NaiveDate::from_ymd_opt(y, m, d)
                .and_then(|date| date.and_hms_opt(h, 0, 0))
                .unwrap()
                .and_utc()
        };
        // Same calendar day as issuance counts even before the issue hour.
        assert!(bundle.valid_at(at(2025, 6, 1, 3)));
        assert!(!bundle.valid_at(at(2025, 5, 31, 23)));
        assert!(bundle.valid_at(at(2030, 1, 1, 0)));
        assert!(!bundle.valid_at(at(2045, 6, 2, 0)));
    }

    #[test]
    fn der_integers_are_minimal_and_positive() {
        assert_eq!(der_unsigned(&[0x00, 0x00, 0x7F]), vec![0x02, 0x01, 0x7F]);
        assert_eq!(der_unsigned(&[0x80, 0x01]), vec![0x02, 0x03, 0x00, 0x80, 0x01]);
        assert_eq!(der_unsigned(&[0x00, 0x00]), vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn pem_body_wraps_at_line_length() {
        let pem = pem_encode(&[0xA5; 100]);
        let lines: Vec<&str> = pem.lines().collect();

        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert_eq!(lines[1].len(), PEM_LINE_LEN);
        assert_eq!(lines[1..lines.len() - 1].concat(), "paWl".repeat(33) + "pQ==");
        assert!(pem_encode(b"M").contains("\nTQ==\n"));
    }
}
