use serde::{Deserialize, Serialize};

pub const LED_COUNT: usize = 3;
pub const BUTTON_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorState {
    #[default]
    None,
    UnprovisionedCrypto,
    UnavailableWifi,
    TlsFailure,
    MqttFailure,
}

impl ErrorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::UnprovisionedCrypto => "UNPROVISIONED_CRYPTO",
            Self::UnavailableWifi => "UNAVAILABLE_WIFI",
            Self::TlsFailure => "TLS_FAILURE",
            Self::MqttFailure => "MQTT_FAILURE",
        }
    }

    /// LED index blinked while this error is active.
    pub fn indicator_led(self) -> Option<usize> {
        match self {
            Self::UnprovisionedCrypto => Some(0),
            Self::UnavailableWifi => Some(1),
            Self::MqttFailure => Some(2),
            Self::None | Self::TlsFailure => None,
        }
    }

    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::UnprovisionedCrypto => 1,
            Self::UnavailableWifi => 2,
            Self::TlsFailure => 3,
            Self::MqttFailure => 4,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::UnprovisionedCrypto,
            2 => Self::UnavailableWifi,
            3 => Self::TlsFailure,
            4 => Self::MqttFailure,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    InitKit,
    CheckKit,
    Provisioning,
    RunKit,
    Invalid,
}

impl MainState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitKit => "INIT_KIT",
            Self::CheckKit => "CHECK_KIT",
            Self::Provisioning => "PROVISIONING",
            Self::RunKit => "RUN_KIT",
            Self::Invalid => "INVALID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Invalid,
    InitMqttClient,
    MqttSubscribe,
    MqttPublish,
    MqttWaitMessage,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::InitMqttClient => "INIT_MQTT_CLIENT",
            Self::MqttSubscribe => "MQTT_SUBSCRIBE",
            Self::MqttPublish => "MQTT_PUBLISH",
            Self::MqttWaitMessage => "MQTT_WAIT_MESSAGE",
        }
    }

    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::InitMqttClient => 1,
            Self::MqttSubscribe => 2,
            Self::MqttPublish => 3,
            Self::MqttWaitMessage => 4,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::InitMqttClient,
            2 => Self::MqttSubscribe,
            3 => Self::MqttPublish,
            4 => Self::MqttWaitMessage,
            _ => Self::Invalid,
        }
    }
}

/// Events raised toward the main machine by provisioning and the user task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    RunMqttClient,
    QuitMqttClient,
    ResetUserData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedBank {
    pub state: [bool; LED_COUNT],
    pub desired: [bool; LED_COUNT],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonBank {
    pub state: [bool; BUTTON_COUNT],
    pub is_pressed: [bool; BUTTON_COUNT],
}

/// In-memory mirror of the shadow's LED and button sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub led: LedBank,
    pub button: ButtonBank,
}

impl DeviceState {
    /// Takes the first pending press edge, if any.
    pub fn take_pressed(&mut self) -> Option<usize> {
        let index = self.button.is_pressed.iter().position(|pressed| *pressed)?;
        self.button.is_pressed[index] = false;
        Some(index)
    }
}

/// Side effects the machines ask the board to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitAction {
    SetLed(usize, bool),
    AllLedsOn,
    AllLedsOff,
    Sleep(u64),
    Restart,
}

pub fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

pub fn up_down(pressed: bool) -> &'static str {
    if pressed {
        "down"
    } else {
        "up"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_state_raw_values_are_stable() {
        for state in [
            ErrorState::None,
            ErrorState::UnprovisionedCrypto,
            ErrorState::UnavailableWifi,
            ErrorState::TlsFailure,
            ErrorState::MqttFailure,
        ] {
            assert_eq!(ErrorState::from_raw(state.to_raw()), state);
        }
    }

    #[test]
    fn tls_failure_has_no_indicator() {
        assert_eq!(ErrorState::TlsFailure.indicator_led(), None);
        assert_eq!(ErrorState::MqttFailure.indicator_led(), Some(2));
    }

    #[test]
    fn take_pressed_returns_lowest_index_first() {
        let mut device = DeviceState::default();
        device.button.is_pressed = [false, true, true];

        assert_eq!(device.take_pressed(), Some(1));
        assert_eq!(device.take_pressed(), Some(2));
        assert_eq!(device.take_pressed(), None);
    }
}
