use serde::{Deserialize, Serialize};

/// Timing and endpoint settings shared by every machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KitConfig {
    pub tick_ms: u64,
    pub wifi_connect_timeout_ms: u64,
    pub ntp_host: String,
    pub ntp_port: u16,
    pub ntp_timeout_ms: u64,
    pub broker_port: u16,
    pub dns_timeout_ms: u64,
    pub net_connect_timeout_ms: u64,
    pub tls_timeout_ms: u64,
    pub mqtt_command_timeout_ms: u64,
    pub keep_alive_secs: u16,
    pub retry_step_secs: u64,
    pub retry_ceiling_secs: u64,
    pub button_debounce_ms: u64,
    pub reset_hold_ms: u64,
    pub exception_blink_ms: u64,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            wifi_connect_timeout_ms: 10_000,
            ntp_host: "pool.ntp.org".to_string(),
            ntp_port: 123,
            ntp_timeout_ms: 5_000,
            broker_port: 8883,
            dns_timeout_ms: 5_000,
            net_connect_timeout_ms: 5_000,
            tls_timeout_ms: 5_000,
            mqtt_command_timeout_ms: 2_000,
            keep_alive_secs: 1_200,
            retry_step_secs: 2,
            retry_ceiling_secs: 120,
            button_debounce_ms: 900,
            reset_hold_ms: 3_000,
            exception_blink_ms: 1_000,
        }
    }
}

impl KitConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.tick_ms = self.tick_ms.clamp(10, 1_000);
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.clamp(1_000, 60_000);
        self.ntp_timeout_ms = self.ntp_timeout_ms.clamp(500, 30_000);
        self.dns_timeout_ms = self.dns_timeout_ms.clamp(500, 30_000);
        self.net_connect_timeout_ms = self.net_connect_timeout_ms.clamp(500, 30_000);
        self.tls_timeout_ms = self.tls_timeout_ms.clamp(500, 30_000);
        self.mqtt_command_timeout_ms = self.mqtt_command_timeout_ms.clamp(100, 30_000);
        self.button_debounce_ms = self.button_debounce_ms.clamp(50, 5_000);
        self.reset_hold_ms = self.reset_hold_ms.clamp(1_000, 30_000);
        self.exception_blink_ms = self.exception_blink_ms.clamp(100, 10_000);

        if self.ntp_host.trim().is_empty() {
            self.ntp_host = defaults.ntp_host;
        }
        if self.ntp_port == 0 {
            self.ntp_port = defaults.ntp_port;
        }
        if self.broker_port == 0 {
            self.broker_port = defaults.broker_port;
        }
        if self.keep_alive_secs == 0 {
            self.keep_alive_secs = defaults.keep_alive_secs;
        }
        if self.retry_step_secs == 0 {
            self.retry_step_secs = defaults.retry_step_secs;
        }
        if self.retry_ceiling_secs < self.retry_step_secs {
            self.retry_ceiling_secs = self.retry_step_secs;
        }
    }

    pub fn keep_alive_ms(&self) -> u64 {
        u64::from(self.keep_alive_secs) * 1_000
    }
}
