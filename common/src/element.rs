use std::sync::{Arc, Mutex};

use crate::error::KitError;

pub const SERIAL_NUMBER_LEN: usize = 9;
pub const PUBLIC_KEY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

pub type PublicKey = [u8; PUBLIC_KEY_LEN];
pub type Signature = [u8; SIGNATURE_LEN];
pub type Digest = [u8; 32];

/// Secure-element data slots used by the kit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    DeviceKey,
    UserData,
    DeviceCert,
    SignerPublicKey,
    SignerCert,
}

impl Slot {
    /// Slot number on the ATECC508A.
    pub fn id(self) -> u8 {
        match self {
            Self::DeviceKey => 0,
            Self::UserData => 8,
            Self::DeviceCert => 10,
            Self::SignerPublicKey => 11,
            Self::SignerCert => 12,
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            Self::DeviceKey => 36,
            Self::UserData | Self::DeviceCert | Self::SignerPublicKey | Self::SignerCert => 416,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    Signer,
    Device,
}

impl CertRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signer => "signer",
            Self::Device => "device",
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Signer),
            1 => Some(Self::Device),
            _ => None,
        }
    }

    pub fn compressed_slot(self) -> Slot {
        match self {
            Self::Signer => Slot::SignerCert,
            Self::Device => Slot::DeviceCert,
        }
    }

    pub fn public_key_slot(self) -> Slot {
        match self {
            Self::Signer => Slot::SignerPublicKey,
            Self::Device => Slot::DeviceKey,
        }
    }
}

/// Driver for the secure element. The private key never leaves the part;
/// all key operations go through `sign` and `ecdh`.
pub trait SecureElement {
    /// Whether both the configuration and data zones are locked.
    fn zones_locked(&mut self) -> Result<bool, KitError>;
    fn serial_number(&mut self) -> Result<[u8; SERIAL_NUMBER_LEN], KitError>;
    fn read_slot(&mut self, slot: Slot, offset: usize, buf: &mut [u8]) -> Result<(), KitError>;
    fn write_slot(&mut self, slot: Slot, offset: usize, data: &[u8]) -> Result<(), KitError>;
    /// Derived from the private key for `Slot::DeviceKey`, stored otherwise.
    fn public_key(&mut self, slot: Slot) -> Result<PublicKey, KitError>;
    fn sign(&mut self, slot: Slot, digest: &Digest) -> Result<Signature, KitError>;
    fn verify(
        &mut self,
        public_key: &PublicKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, KitError>;
    fn ecdh(&mut self, slot: Slot, peer: &PublicKey) -> Result<[u8; 32], KitError>;
}

/// One transaction at a time: every user goes through this lock.
pub type SharedElement<S> = Arc<Mutex<S>>;

pub fn shared<S: SecureElement>(element: S) -> SharedElement<S> {
    Arc::new(Mutex::new(element))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use sha2::{Digest as _, Sha256};

    use super::*;

    pub const DEVICE_SERIAL: [u8; SERIAL_NUMBER_LEN] =
        [0x01, 0x23, 0x6e, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0xee];

    pub fn key_for(label: &str) -> PublicKey {
        let mut key = [0u8; PUBLIC_KEY_LEN];
        key[..32].copy_from_slice(&Sha256::digest(label.as_bytes()));
        key[32..].copy_from_slice(&Sha256::digest(format!("{label}/y").as_bytes()));
        key
    }

    pub fn fake_signature(public_key: &PublicKey, digest: &Digest) -> Signature {
        let mut signature = [0u8; SIGNATURE_LEN];
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hasher.update(digest);
        signature[..32].copy_from_slice(&hasher.finalize());
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(public_key);
        signature[32..].copy_from_slice(&hasher.finalize());
        signature
    }

    #[derive(Debug, Clone)]
    pub struct FakeElement {
        pub locked: bool,
        pub fail_io: bool,
        pub slots: BTreeMap<Slot, Vec<u8>>,
        pub writes: Vec<(Slot, usize, Vec<u8>)>,
    }

    impl Default for FakeElement {
        fn default() -> Self {
            let mut slots = BTreeMap::new();
            for slot in [
                Slot::UserData,
                Slot::DeviceCert,
                Slot::SignerPublicKey,
                Slot::SignerCert,
            ] {
                slots.insert(slot, vec![0u8; slot.capacity()]);
            }
            slots.insert(Slot::SignerPublicKey, {
                let mut data = vec![0u8; Slot::SignerPublicKey.capacity()];
                data[..PUBLIC_KEY_LEN].copy_from_slice(&key_for("signer"));
                data
            });
            Self {
                locked: true,
                fail_io: false,
                slots,
                writes: Vec::new(),
            }
        }
    }

    impl SecureElement for FakeElement {
        fn zones_locked(&mut self) -> Result<bool, KitError> {
            if self.fail_io {
                return Err(KitError::CryptoFailure);
            }
            Ok(self.locked)
        }

        fn serial_number(&mut self) -> Result<[u8; SERIAL_NUMBER_LEN], KitError> {
            if self.fail_io {
                return Err(KitError::CryptoFailure);
            }
            Ok(DEVICE_SERIAL)
        }

        fn read_slot(&mut self, slot: Slot, offset: usize, buf: &mut [u8]) -> Result<(), KitError> {
            if self.fail_io {
                return Err(KitError::CryptoFailure);
            }
            let data = self.slots.get(&slot).ok_or(KitError::BadParam)?;
            let source = data
                .get(offset..offset + buf.len())
                .ok_or(KitError::BadParam)?;
            buf.copy_from_slice(source);
            Ok(())
        }

        fn write_slot(&mut self, slot: Slot, offset: usize, data: &[u8]) -> Result<(), KitError> {
            if self.fail_io {
                return Err(KitError::CryptoFailure);
            }
            let target = self.slots.get_mut(&slot).ok_or(KitError::BadParam)?;
            target
                .get_mut(offset..offset + data.len())
                .ok_or(KitError::BadParam)?
                .copy_from_slice(data);
            self.writes.push((slot, offset, data.to_vec()));
            Ok(())
        }

        fn public_key(&mut self, slot: Slot) -> Result<PublicKey, KitError> {
            match slot {
                Slot::DeviceKey => Ok(key_for("device")),
                other => {
                    let mut key = [0u8; PUBLIC_KEY_LEN];
                    self.read_slot(other, 0, &mut key)?;
                    Ok(key)
                }
            }
        }

        fn sign(&mut self, slot: Slot, digest: &Digest) -> Result<Signature, KitError> {
            if slot != Slot::DeviceKey {
                return Err(KitError::BadParam);
            }
            Ok(fake_signature(&key_for("device"), digest))
        }

        fn verify(
            &mut self,
            public_key: &PublicKey,
            digest: &Digest,
            signature: &Signature,
        ) -> Result<bool, KitError> {
            Ok(fake_signature(public_key, digest) == *signature)
        }

        fn ecdh(&mut self, _slot: Slot, peer: &PublicKey) -> Result<[u8; 32], KitError> {
            let mut hasher = Sha256::new();
            hasher.update(key_for("device"));
            hasher.update(peer);
            Ok(hasher.finalize().into())
        }
    }
}
