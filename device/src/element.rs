use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use awskit_common::{
    certs::{encode_dates, CertDefinition, CompressedCert},
    element::{Digest, PublicKey, Signature, PUBLIC_KEY_LEN, SERIAL_NUMBER_LEN, SIGNATURE_LEN},
    CertRole, KitError, SecureElement, Slot,
};
use chrono::{NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{info, warn};

const CERT_VALIDITY_YEARS: u8 = 20;
const DATA_SLOTS: [Slot; 4] = [
    Slot::UserData,
    Slot::DeviceCert,
    Slot::SignerPublicKey,
    Slot::SignerCert,
];

pub fn cert_definitions() -> (CertDefinition, CertDefinition) {
    (
        CertDefinition::p256(CertRole::Signer, "AWS IoT Kit Root", "AWS IoT Kit Signer"),
        CertDefinition::p256(CertRole::Device, "AWS IoT Kit Signer", "AWS IoT Kit Device"),
    )
}

/// On-disk form of the element. Byte fields are hex.
#[derive(Debug, Serialize, Deserialize)]
struct ElementImage {
    serial: String,
    locked: bool,
    device_seed: String,
    slots: BTreeMap<u8, String>,
}

/// Simulated secure element kept in a JSON file. Keys are SHA-256
/// derivations of a seed and signatures are hash pairs, so nothing here is
/// cryptographically meaningful; it only has to be self-consistent.
pub struct FileSecureElement {
    path: PathBuf,
    serial: [u8; SERIAL_NUMBER_LEN],
    locked: bool,
    device_seed: [u8; 32],
    slots: BTreeMap<Slot, Vec<u8>>,
}

fn simulated_public_key(seed: &[u8; 32]) -> PublicKey {
    let mut key = [0u8; PUBLIC_KEY_LEN];
    key[..32].copy_from_slice(&Sha256::new().chain_update(seed).chain_update(b"x").finalize());
    key[32..].copy_from_slice(&Sha256::new().chain_update(seed).chain_update(b"y").finalize());
    key
}

fn simulated_signature(public_key: &PublicKey, digest: &Digest) -> Signature {
    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..32].copy_from_slice(
        &Sha256::new()
            .chain_update(public_key)
            .chain_update(digest)
            .finalize(),
    );
    signature[32..].copy_from_slice(
        &Sha256::new()
            .chain_update(digest)
            .chain_update(public_key)
            .finalize(),
    );
    signature
}

fn seed_for(entropy: &[u8; 32], label: &str) -> [u8; 32] {
    Sha256::new()
        .chain_update(entropy)
        .chain_update(label.as_bytes())
        .finalize()
        .into()
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> anyhow::Result<[u8; N]> {
    let bytes = hex::decode(value).with_context(|| format!("{what} is not hex"))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{what} must be {N} bytes"))
}

impl FileSecureElement {
    /// Loads the element image, personalizing a fresh one on first run.
    pub fn open(
        path: impl Into<PathBuf>,
        signer: &CertDefinition,
        device: &CertDefinition,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        match std::fs::read(&path) {
            Ok(raw) => {
                let image: ElementImage = serde_json::from_slice(&raw)
                    .with_context(|| format!("invalid element image {}", path.display()))?;
                Self::from_image(path, image)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let element = Self::personalize(path, signer, device, Utc::now().naive_utc())?;
                element
                    .save()
                    .with_context(|| format!("failed to write {}", element.path.display()))?;
                info!(
                    "personalized new secure element {} at {}",
                    hex::encode_upper(element.serial),
                    element.path.display()
                );
                Ok(element)
            }
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn from_image(path: PathBuf, image: ElementImage) -> anyhow::Result<Self> {
        let mut slots = BTreeMap::new();
        for slot in DATA_SLOTS {
            let data = match image.slots.get(&slot.id()) {
                Some(value) => {
                    let mut data = hex::decode(value)
                        .with_context(|| format!("slot {} is not hex", slot.id()))?;
                    data.resize(slot.capacity(), 0);
                    data
                }
                None => vec![0u8; slot.capacity()],
            };
            slots.insert(slot, data);
        }

        Ok(Self {
            path,
            serial: decode_fixed(&image.serial, "serial")?,
            locked: image.locked,
            device_seed: decode_fixed(&image.device_seed, "device seed")?,
            slots,
        })
    }

    /// Fresh serial and keys plus a signer/device certificate pair issued at
    /// `now` (truncated to the hour).
    fn personalize(
        path: PathBuf,
        signer_def: &CertDefinition,
        device_def: &CertDefinition,
        now: NaiveDateTime,
    ) -> anyhow::Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let entropy: [u8; 32] = Sha256::new()
            .chain_update(nanos.to_le_bytes())
            .chain_update(std::process::id().to_le_bytes())
            .chain_update(path.to_string_lossy().as_bytes())
            .finalize()
            .into();

        let mut serial = [0u8; SERIAL_NUMBER_LEN];
        serial[0] = 0x01;
        serial[1] = 0x23;
        serial[2..8].copy_from_slice(&entropy[..6]);
        serial[8] = 0xEE;

        let root_key = simulated_public_key(&seed_for(&entropy, "root"));
        let signer_key = simulated_public_key(&seed_for(&entropy, "signer"));
        let device_seed = seed_for(&entropy, "device");
        let device_key = simulated_public_key(&device_seed);

        let issued = now
            .with_minute(0)
            .and_then(|time| time.with_second(0))
            .and_then(|time| time.with_nanosecond(0))
            .context("invalid personalization time")?;
        let enc_dates = encode_dates(issued, CERT_VALIDITY_YEARS)?;

        let signer_tbs = signer_def.build_tbs(&enc_dates, &signer_key)?;
        let signer_cert = CompressedCert {
            signature: simulated_signature(&root_key, &Sha256::digest(&signer_tbs).into()),
            enc_dates,
            signer_id: [0x00, 0x01],
            template_id: 1,
            chain_id: 0,
            sn_source: 0xA,
            format: 0,
        };
        let device_tbs = device_def.build_tbs(&enc_dates, &device_key)?;
        let device_cert = CompressedCert {
            signature: simulated_signature(&signer_key, &Sha256::digest(&device_tbs).into()),
            template_id: 2,
            ..signer_cert
        };

        let mut slots: BTreeMap<Slot, Vec<u8>> = DATA_SLOTS
            .into_iter()
            .map(|slot| (slot, vec![0u8; slot.capacity()]))
            .collect();
        let signer_raw = signer_cert.to_bytes();
        let device_raw = device_cert.to_bytes();
        for (slot, data) in [
            (Slot::SignerPublicKey, signer_key.as_slice()),
            (Slot::SignerCert, signer_raw.as_slice()),
            (Slot::DeviceCert, device_raw.as_slice()),
        ] {
            if let Some(target) = slots.get_mut(&slot) {
                target[..data.len()].copy_from_slice(data);
            }
        }

        Ok(Self {
            path,
            serial,
            locked: true,
            device_seed,
            slots,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> std::io::Result<()> {
        let image = ElementImage {
            serial: hex::encode(self.serial),
            locked: self.locked,
            device_seed: hex::encode(self.device_seed),
            slots: self
                .slots
                .iter()
                .map(|(slot, data)| (slot.id(), hex::encode(data)))
                .collect(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&image).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, payload)
    }
}

impl SecureElement for FileSecureElement {
    fn zones_locked(&mut self) -> Result<bool, KitError> {
        Ok(self.locked)
    }

    fn serial_number(&mut self) -> Result<[u8; SERIAL_NUMBER_LEN], KitError> {
        Ok(self.serial)
    }

    fn read_slot(&mut self, slot: Slot, offset: usize, buf: &mut [u8]) -> Result<(), KitError> {
        let data = self.slots.get(&slot).ok_or(KitError::BadParam)?;
        let end = offset.checked_add(buf.len()).ok_or(KitError::BadParam)?;
        buf.copy_from_slice(data.get(offset..end).ok_or(KitError::BadParam)?);
        Ok(())
    }

    fn write_slot(&mut self, slot: Slot, offset: usize, data: &[u8]) -> Result<(), KitError> {
        let target = self.slots.get_mut(&slot).ok_or(KitError::BadParam)?;
        let end = offset.checked_add(data.len()).ok_or(KitError::BadParam)?;
        target
            .get_mut(offset..end)
            .ok_or(KitError::BadParam)?
            .copy_from_slice(data);
        self.save().map_err(|err| {
            warn!("failed to persist secure element image: {err}");
            KitError::CryptoFailure
        })
    }

    fn public_key(&mut self, slot: Slot) -> Result<PublicKey, KitError> {
        match slot {
            Slot::DeviceKey => Ok(simulated_public_key(&self.device_seed)),
            Slot::SignerPublicKey => {
                let mut key = [0u8; PUBLIC_KEY_LEN];
                self.read_slot(slot, 0, &mut key)?;
                Ok(key)
            }
            _ => Err(KitError::BadParam),
        }
    }

    fn sign(&mut self, slot: Slot, digest: &Digest) -> Result<Signature, KitError> {
        if slot != Slot::DeviceKey {
            return Err(KitError::BadParam);
        }
        Ok(simulated_signature(&simulated_public_key(&self.device_seed), digest))
    }

    fn verify(
        &mut self,
        public_key: &PublicKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, KitError> {
        Ok(simulated_signature(public_key, digest) == *signature)
    }

    fn ecdh(&mut self, slot: Slot, peer: &PublicKey) -> Result<[u8; 32], KitError> {
        if slot != Slot::DeviceKey {
            return Err(KitError::BadParam);
        }
        Ok(Sha256::new()
            .chain_update(self.device_seed)
            .chain_update(peer)
            .finalize()
            .into())
    }
}

#[cfg(test)]
mod tests {
    use awskit_common::{element::shared, CertificateBuilder};
    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("awskit-element-{}-{name}", std::process::id()))
            .join("element.json")
    }

    #[test]
    fn personalized_element_builds_a_valid_chain() {
        let path = scratch_path("chain");
        let _ = std::fs::remove_file(&path);
        let (signer, device) = cert_definitions();

        let element = FileSecureElement::open(&path, &signer, &device).unwrap();
        let bundle = CertificateBuilder::new(shared(element), signer, device)
            .build_device_and_signer_certs()
            .unwrap();

        assert!(bundle.valid_at(Utc::now()));
        assert!(bundle.device.pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn image_survives_reopen() {
        let path = scratch_path("reopen");
        let _ = std::fs::remove_file(&path);
        let (signer, device) = cert_definitions();

        let mut first = FileSecureElement::open(&path, &signer, &device).unwrap();
        first.write_slot(Slot::UserData, 4, b"kitnet").unwrap();
        let serial = first.serial_number().unwrap();

        let mut second = FileSecureElement::open(&path, &signer, &device).unwrap();
        let mut ssid = [0u8; 6];
        second.read_slot(Slot::UserData, 4, &mut ssid).unwrap();
        assert_eq!(&ssid, b"kitnet");
        assert_eq!(second.serial_number().unwrap(), serial);
        assert_eq!(second.serial_number().unwrap()[..2], [0x01, 0x23]);
        assert_eq!(
            second.public_key(Slot::DeviceKey).unwrap(),
            first.public_key(Slot::DeviceKey).unwrap()
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn device_key_signatures_verify() {
        let (signer, device) = cert_definitions();
        let mut element = FileSecureElement::personalize(
            scratch_path("sign"),
            &signer,
            &device,
            Utc::now().naive_utc(),
        )
        .unwrap();
        let digest = [7u8; 32];

        let signature = element.sign(Slot::DeviceKey, &digest).unwrap();
        let key = element.public_key(Slot::DeviceKey).unwrap();

        assert!(element.verify(&key, &digest, &signature).unwrap());
        assert!(!element.verify(&key, &[8u8; 32], &signature).unwrap());
        assert_eq!(element.sign(Slot::UserData, &digest), Err(KitError::BadParam));
    }
}
