//! Fixed-layout user data kept in the secure element's data zone.
//!
//! The byte layout is shared with the desktop provisioning tool and must not
//! move: each field is a little-endian `u32` length followed by a fixed-size
//! buffer, then a four-byte button block.

use std::sync::Arc;

use crate::{
    element::{SecureElement, SharedElement, Slot},
    error::KitError,
    shared::lock,
    types::BUTTON_COUNT,
};

pub const OFFSET_SSID_LEN: usize = 0;
pub const OFFSET_SSID: usize = 4;
pub const SSID_MAX: usize = 32;
pub const OFFSET_PSK_LEN: usize = 36;
pub const OFFSET_PSK: usize = 40;
pub const PSK_MAX: usize = 32;
pub const OFFSET_HOST_LEN: usize = 72;
pub const OFFSET_HOST: usize = 76;
pub const HOST_MAX: usize = 64;
pub const OFFSET_THING_LEN: usize = 140;
pub const OFFSET_THING: usize = 144;
pub const THING_MAX: usize = 32;
pub const OFFSET_BUTTON_STATE: usize = 176;
pub const BUTTON_STATE_LEN: usize = 4;
pub const USER_DATA_LEN: usize = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    WifiSsid,
    WifiPsk,
    BrokerHost,
    ThingName,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::WifiSsid,
        Field::WifiPsk,
        Field::BrokerHost,
        Field::ThingName,
    ];

    pub fn length_offset(self) -> usize {
        match self {
            Self::WifiSsid => OFFSET_SSID_LEN,
            Self::WifiPsk => OFFSET_PSK_LEN,
            Self::BrokerHost => OFFSET_HOST_LEN,
            Self::ThingName => OFFSET_THING_LEN,
        }
    }

    pub fn data_offset(self) -> usize {
        match self {
            Self::WifiSsid => OFFSET_SSID,
            Self::WifiPsk => OFFSET_PSK,
            Self::BrokerHost => OFFSET_HOST,
            Self::ThingName => OFFSET_THING,
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            Self::WifiSsid => SSID_MAX,
            Self::WifiPsk => PSK_MAX,
            Self::BrokerHost => HOST_MAX,
            Self::ThingName => THING_MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WifiSsid => "wifi ssid",
            Self::WifiPsk => "wifi psk",
            Self::BrokerHost => "broker host",
            Self::ThingName => "thing name",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct UserConfiguration {
    pub wifi_ssid: Vec<u8>,
    pub wifi_psk: Vec<u8>,
    pub broker_host: String,
    pub thing_name: String,
    pub button_state: [bool; BUTTON_COUNT],
}

impl std::fmt::Debug for UserConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfiguration")
            .field("wifi_ssid", &String::from_utf8_lossy(&self.wifi_ssid))
            .field("wifi_psk", &"<redacted>")
            .field("broker_host", &self.broker_host)
            .field("thing_name", &self.thing_name)
            .field("button_state", &self.button_state)
            .finish()
    }
}

/// Decodes and validates a raw user-data region.
pub fn decode(region: &[u8; USER_DATA_LEN]) -> Result<UserConfiguration, KitError> {
    let wifi_ssid = decode_field(region, Field::WifiSsid)?.to_vec();
    let wifi_psk = decode_field(region, Field::WifiPsk)?.to_vec();
    let broker_host =
        String::from_utf8_lossy(decode_field(region, Field::BrokerHost)?).into_owned();
    let thing_name =
        String::from_utf8_lossy(decode_field(region, Field::ThingName)?).into_owned();

    let mut button_state = [false; BUTTON_COUNT];
    for (index, state) in button_state.iter_mut().enumerate() {
        *state = region[OFFSET_BUTTON_STATE + index] == 1;
    }

    Ok(UserConfiguration {
        wifi_ssid,
        wifi_psk,
        broker_host,
        thing_name,
        button_state,
    })
}

fn decode_field(region: &[u8; USER_DATA_LEN], field: Field) -> Result<&[u8], KitError> {
    let at = field.length_offset();
    let len = u32::from_le_bytes([region[at], region[at + 1], region[at + 2], region[at + 3]]);
    let len = usize::try_from(len).map_err(|_| KitError::InvalidConfiguration)?;
    if len == 0 || len >= field.capacity() {
        return Err(KitError::InvalidConfiguration);
    }

    let data = &region[field.data_offset()..field.data_offset() + len];
    if data[0] == 0x00 || data[0] == 0xFF {
        return Err(KitError::InvalidConfiguration);
    }

    Ok(data)
}

/// Store over the user-data slot. Cloning shares the same element lock.
pub struct ConfigStore<S> {
    element: SharedElement<S>,
}

impl<S> Clone for ConfigStore<S> {
    fn clone(&self) -> Self {
        Self {
            element: Arc::clone(&self.element),
        }
    }
}

impl<S: SecureElement> ConfigStore<S> {
    pub fn new(element: SharedElement<S>) -> Self {
        Self { element }
    }

    pub fn read_all(&self) -> Result<UserConfiguration, KitError> {
        let mut region = [0u8; USER_DATA_LEN];
        lock(&self.element)
            .read_slot(Slot::UserData, 0, &mut region)
            .map_err(|_| KitError::CryptoFailure)?;
        decode(&region)
    }

    pub fn write_field(&self, offset: usize, bytes: &[u8]) -> Result<(), KitError> {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= USER_DATA_LEN => {}
            _ => return Err(KitError::BadParam),
        }
        lock(&self.element).write_slot(Slot::UserData, offset, bytes)
    }

    pub fn write_length(&self, offset: usize, len: u32) -> Result<(), KitError> {
        self.write_field(offset, &len.to_le_bytes())
    }

    /// Writes the length word, then the data.
    pub fn write_entry(&self, field: Field, value: &[u8]) -> Result<(), KitError> {
        if value.is_empty() || value.len() >= field.capacity() {
            return Err(KitError::BadParam);
        }
        let len = u32::try_from(value.len()).map_err(|_| KitError::BadParam)?;
        self.write_length(field.length_offset(), len)?;
        self.write_field(field.data_offset(), value)
    }

    pub fn save_button_state(&self, state: [bool; BUTTON_COUNT]) -> Result<(), KitError> {
        let mut block = [0u8; BUTTON_STATE_LEN];
        for (byte, pressed) in block.iter_mut().zip(state) {
            *byte = u8::from(pressed);
        }
        self.write_field(OFFSET_BUTTON_STATE, &block)
    }

    pub fn reset(&self) -> Result<(), KitError> {
        self.write_field(0, &[0u8; OFFSET_BUTTON_STATE])?;
        self.write_field(OFFSET_BUTTON_STATE, &[0u8; BUTTON_STATE_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{shared, testing::FakeElement};

    fn valid_region() -> [u8; USER_DATA_LEN] {
        let mut region = [0u8; USER_DATA_LEN];
        for (field, value) in [
            (Field::WifiSsid, "kitnet"),
            (Field::WifiPsk, "hunter22"),
            (Field::BrokerHost, "a1b2c3.iot.us-west-2.amazonaws.com"),
            (Field::ThingName, "kit-01"),
        ] {
            let len = field.length_offset();
            region[len..len + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
            let data = field.data_offset();
            region[data..data + value.len()].copy_from_slice(value.as_bytes());
        }
        region
    }

    fn set_len(region: &mut [u8; USER_DATA_LEN], field: Field, len: u32) {
        let at = field.length_offset();
        region[at..at + 4].copy_from_slice(&len.to_le_bytes());
    }

    #[test]
    fn decodes_valid_region() {
        let mut region = valid_region();
        region[OFFSET_BUTTON_STATE] = 1;
        region[OFFSET_BUTTON_STATE + 2] = 7;

        let config = decode(&region).unwrap();
        assert_eq!(config.wifi_ssid, b"kitnet");
        assert_eq!(config.wifi_psk, b"hunter22");
        assert_eq!(config.broker_host, "a1b2c3.iot.us-west-2.amazonaws.com");
        assert_eq!(config.thing_name, "kit-01");
        assert_eq!(config.button_state, [true, false, false]);
    }

    #[test]
    fn rejects_zero_and_oversized_lengths() {
        for field in Field::ALL {
            let mut region = valid_region();
            set_len(&mut region, field, 0);
            assert_eq!(decode(&region), Err(KitError::InvalidConfiguration));

            let mut region = valid_region();
            set_len(&mut region, field, field.capacity() as u32);
            assert_eq!(decode(&region), Err(KitError::InvalidConfiguration));

            let mut region = valid_region();
            set_len(&mut region, field, u32::MAX);
            assert_eq!(decode(&region), Err(KitError::InvalidConfiguration));
        }
    }

    #[test]
    fn rejects_sentinel_first_bytes() {
        for field in Field::ALL {
            for sentinel in [0x00, 0xFF] {
                let mut region = valid_region();
                region[field.data_offset()] = sentinel;
                assert_eq!(decode(&region), Err(KitError::InvalidConfiguration));
            }
        }
    }

    #[test]
    fn latin1_ssid_is_a_valid_configuration() {
        let mut region = valid_region();
        let ssid = [b'c', b'a', b'f', 0xE9];
        set_len(&mut region, Field::WifiSsid, ssid.len() as u32);
        region[OFFSET_SSID..OFFSET_SSID + ssid.len()].copy_from_slice(&ssid);

        let config = decode(&region).unwrap();
        assert_eq!(config.wifi_ssid, ssid);
        assert_eq!(config.thing_name, "kit-01");
    }

    #[test]
    fn longest_allowed_value_is_capacity_minus_one() {
        let mut region = valid_region();
        let name = "t".repeat(THING_MAX - 1);
        set_len(&mut region, Field::ThingName, name.len() as u32);
        region[OFFSET_THING..OFFSET_THING + name.len()].copy_from_slice(name.as_bytes());

        assert_eq!(decode(&region).unwrap().thing_name, name);
    }

    #[test]
    fn blank_region_is_unconfigured() {
        assert_eq!(
            decode(&[0u8; USER_DATA_LEN]),
            Err(KitError::InvalidConfiguration)
        );
        assert_eq!(
            decode(&[0xFFu8; USER_DATA_LEN]),
            Err(KitError::InvalidConfiguration)
        );
    }

    #[test]
    fn read_all_maps_io_failure_to_crypto_failure() {
        let element = shared(FakeElement {
            fail_io: true,
            ..FakeElement::default()
        });
        let store = ConfigStore::new(element);
        assert_eq!(store.read_all(), Err(KitError::CryptoFailure));
    }

    #[test]
    fn write_entry_writes_length_then_data() {
        let element = shared(FakeElement::default());
        let store = ConfigStore::new(element.clone());

        store.write_entry(Field::BrokerHost, b"broker.local").unwrap();

        let writes = element.lock().unwrap().writes.clone();
        assert_eq!(
            writes,
            vec![
                (Slot::UserData, OFFSET_HOST_LEN, 12u32.to_le_bytes().to_vec()),
                (Slot::UserData, OFFSET_HOST, b"broker.local".to_vec()),
            ]
        );
    }

    #[test]
    fn write_entry_rejects_values_that_fail_validation() {
        let store = ConfigStore::new(shared(FakeElement::default()));
        assert_eq!(store.write_entry(Field::WifiSsid, b""), Err(KitError::BadParam));
        assert_eq!(
            store.write_entry(Field::WifiSsid, &[b'a'; SSID_MAX]),
            Err(KitError::BadParam)
        );
    }

    #[test]
    fn write_field_is_bounds_checked() {
        let store = ConfigStore::new(shared(FakeElement::default()));
        assert_eq!(store.write_field(178, &[0; 4]), Err(KitError::BadParam));
        assert_eq!(store.write_field(usize::MAX, &[0; 1]), Err(KitError::BadParam));
    }

    #[test]
    fn provisioned_store_round_trips_and_resets() {
        let element = shared(FakeElement::default());
        let store = ConfigStore::new(element.clone());
        store.write_entry(Field::WifiSsid, b"kitnet").unwrap();
        store.write_entry(Field::WifiPsk, b"hunter22").unwrap();
        store.write_entry(Field::BrokerHost, b"broker.local").unwrap();
        store.write_entry(Field::ThingName, b"kit-01").unwrap();
        store.save_button_state([false, true, false]).unwrap();

        let config = store.read_all().unwrap();
        assert_eq!(config.thing_name, "kit-01");
        assert_eq!(config.button_state, [false, true, false]);

        element.lock().unwrap().writes.clear();
        store.reset().unwrap();

        let writes = element.lock().unwrap().writes.clone();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, 0);
        assert_eq!(writes[0].2.len(), OFFSET_BUTTON_STATE);
        assert_eq!(writes[1].1, OFFSET_BUTTON_STATE);
        assert_eq!(store.read_all(), Err(KitError::InvalidConfiguration));
    }

    #[test]
    fn debug_output_hides_psk() {
        let config = decode(&valid_region()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter22"));
        assert!(rendered.contains("kitnet"));
    }
}
