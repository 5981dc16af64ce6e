use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::KitError,
    topics::PAYLOAD_MAX,
    types::{on_off, up_down, DeviceState, KitAction, LED_COUNT},
};

const LED_KEYS: [&str; LED_COUNT] = ["led1", "led2", "led3"];

#[derive(Debug, Deserialize)]
struct DeltaMessage {
    state: Value,
}

#[derive(Debug, Serialize)]
struct ShadowReport<T> {
    state: Reported<T>,
}

#[derive(Debug, Serialize)]
struct Reported<T> {
    reported: T,
}

#[derive(Debug, Default, Serialize)]
struct LedReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    led1: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    led2: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    led3: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
struct ButtonReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    button1: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    button2: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    button3: Option<&'static str>,
}

impl LedReport {
    fn slot(&mut self, index: usize) -> Option<&mut Option<&'static str>> {
        match index {
            0 => Some(&mut self.led1),
            1 => Some(&mut self.led2),
            2 => Some(&mut self.led3),
            _ => None,
        }
    }
}

impl ButtonReport {
    fn slot(&mut self, index: usize) -> Option<&mut Option<&'static str>> {
        match index {
            0 => Some(&mut self.button1),
            1 => Some(&mut self.button2),
            2 => Some(&mut self.button3),
            _ => None,
        }
    }
}

fn encode<T: Serialize>(reported: T) -> Result<String, KitError> {
    let body = serde_json::to_string(&ShadowReport {
        state: Reported { reported },
    })
    .map_err(|_| KitError::BadParam)?;
    if body.len() >= PAYLOAD_MAX {
        return Err(KitError::BadParam);
    }
    Ok(body)
}

/// Applies a shadow delta to the LED mirror. Every LED named in the delta is
/// marked desired; `"on"`/`"off"` also drive the LED. Keys whose value is not
/// a string are skipped. Returns the LED actions.
pub fn apply_delta(device: &mut DeviceState, payload: &[u8]) -> Result<Vec<KitAction>, KitError> {
    let message: DeltaMessage = serde_json::from_slice(payload).map_err(|err| {
        debug!("ignoring malformed shadow delta: {err}");
        KitError::BadParam
    })?;

    let mut actions = Vec::new();
    for (index, key) in LED_KEYS.iter().enumerate() {
        let Some(raw) = message.state.get(key) else {
            continue;
        };
        let Some(value) = raw.as_str() else {
            debug!("{key} delta value {raw} is not a string; skipped");
            continue;
        };
        device.led.desired[index] = true;
        match value {
            "on" => {
                device.led.state[index] = true;
                actions.push(KitAction::SetLed(index, true));
            }
            "off" => {
                device.led.state[index] = false;
                actions.push(KitAction::SetLed(index, false));
            }
            other => debug!("{key} delta value `{other}` left unchanged"),
        }
    }
    Ok(actions)
}

/// Reports every desired LED and clears the desired flags. `None` when no
/// LED was desired.
pub fn take_led_report(device: &mut DeviceState) -> Result<Option<String>, KitError> {
    let mut report = LedReport::default();
    let mut any = false;
    for index in 0..LED_COUNT {
        if !device.led.desired[index] {
            continue;
        }
        if let Some(slot) = report.slot(index) {
            *slot = Some(on_off(device.led.state[index]));
            any = true;
        }
    }
    device.led.desired = [false; LED_COUNT];

    if !any {
        return Ok(None);
    }
    encode(report).map(Some)
}

pub fn button_report(index: usize, pressed: bool) -> Result<String, KitError> {
    let mut report = ButtonReport::default();
    *report.slot(index).ok_or(KitError::BadParam)? = Some(up_down(pressed));
    encode(report)
}

pub fn led_status(device: &DeviceState) -> Result<String, KitError> {
    let mut report = LedReport::default();
    for (index, on) in device.led.state.iter().enumerate() {
        if let Some(slot) = report.slot(index) {
            *slot = Some(on_off(*on));
        }
    }
    encode(report)
}

pub fn button_status(device: &DeviceState) -> Result<String, KitError> {
    let mut report = ButtonReport::default();
    for (index, pressed) in device.button.state.iter().enumerate() {
        if let Some(slot) = report.slot(index) {
            *slot = Some(up_down(*pressed));
        }
    }
    encode(report)
}
