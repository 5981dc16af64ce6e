use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::{
    error::KitError,
    timer::{Clock, Countdown},
};

pub const NTP_PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 and 1970-01-01.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const NTP_CLIENT_REQUEST: u8 = 0x1B;
const NTP_MODE_SERVER: u8 = 4;
const EVENT_POLL_MS: u64 = 50;

/// Asynchronous link notifications produced by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Associated,
    AddressAssigned(Ipv4Addr),
    Disconnected,
}

pub trait Radio {
    /// Bus and driver plumbing only; no association.
    fn init(&mut self) -> Result<(), KitError>;
    /// Credentials are raw bytes; SSIDs need not be UTF-8.
    fn request_connect(&mut self, ssid: &[u8], psk: &[u8]) -> Result<(), KitError>;
    /// Pumps the driver for up to `wait_ms` and returns what it reported.
    fn poll_events(&mut self, wait_ms: u64) -> Vec<LinkEvent>;
    fn udp_exchange(
        &mut self,
        host: &str,
        port: u16,
        request: &[u8],
        timeout_ms: u64,
    ) -> Result<Vec<u8>, KitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Associating,
    Associated,
    Up(Ipv4Addr),
}

#[derive(Clone)]
struct Credentials {
    ssid: Vec<u8>,
    psk: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct TimeAnchor {
    wall: DateTime<Utc>,
    synced_at_ms: u64,
}

pub fn ntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = NTP_CLIENT_REQUEST;
    packet
}

/// Extracts the transmit timestamp from a server reply.
pub fn parse_ntp_response(reply: &[u8]) -> Result<DateTime<Utc>, KitError> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(KitError::TimeSyncFailure);
    }
    if reply[0] & 0x07 != NTP_MODE_SERVER {
        return Err(KitError::TimeSyncFailure);
    }
    // Stratum 0 is a kiss-of-death reply.
    if reply[1] == 0 {
        return Err(KitError::TimeSyncFailure);
    }

    let seconds = u64::from(u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]));
    let unix = seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or(KitError::TimeSyncFailure)?;
    let unix = i64::try_from(unix).map_err(|_| KitError::TimeSyncFailure)?;
    DateTime::from_timestamp(unix, 0).ok_or(KitError::TimeSyncFailure)
}

/// Owns the radio link and the wall-clock anchor used for certificate
/// date checks.
pub struct ConnectivityManager<R, C> {
    radio: R,
    clock: C,
    ntp_host: String,
    ntp_port: u16,
    credentials: Option<Credentials>,
    link: LinkState,
    time: Option<TimeAnchor>,
}

impl<R: Radio, C: Clock> ConnectivityManager<R, C> {
    pub fn new(radio: R, clock: C, ntp_host: impl Into<String>, ntp_port: u16) -> Self {
        Self {
            radio,
            clock,
            ntp_host: ntp_host.into(),
            ntp_port,
            credentials: None,
            link: LinkState::Down,
            time: None,
        }
    }

    pub fn init(&mut self) -> Result<(), KitError> {
        self.radio.init()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, LinkState::Up(_))
    }

    pub fn connect(&mut self, ssid: &[u8], psk: &[u8], timeout_ms: u64) -> Result<(), KitError> {
        let same_network = self
            .credentials
            .as_ref()
            .is_some_and(|creds| creds.ssid == ssid && creds.psk == psk);
        if self.is_connected() && same_network {
            return Ok(());
        }

        self.credentials = Some(Credentials {
            ssid: ssid.to_vec(),
            psk: psk.to_vec(),
        });
        let ssid_text = String::from_utf8_lossy(ssid);
        self.link = LinkState::Associating;
        if let Err(err) = self.radio.request_connect(ssid, psk) {
            warn!("wifi connect request for `{ssid_text}` failed: {err}");
            self.link = LinkState::Down;
            return Err(KitError::WifiFailure);
        }
        info!("wifi connecting to `{ssid_text}`");

        let deadline = Countdown::started(self.clock.now_ms(), timeout_ms);
        loop {
            let wait_ms = deadline.remaining_ms(self.clock.now_ms()).min(EVENT_POLL_MS);
            let events = self.radio.poll_events(wait_ms);
            for event in events {
                self.handle_event(event);
            }
            if let LinkState::Up(addr) = self.link {
                info!("wifi connected to `{ssid_text}` with address {addr}");
                return Ok(());
            }
            if deadline.expired(self.clock.now_ms()) {
                warn!("wifi association with `{ssid_text}` timed out after {timeout_ms} ms");
                return Err(KitError::WifiTimeout);
            }
        }
    }

    /// Drains pending driver events. A drop at any time re-requests the
    /// association with the stored credentials.
    pub fn service(&mut self) {
        for event in self.radio.poll_events(0) {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Associated => {
                if !self.is_connected() {
                    self.link = LinkState::Associated;
                }
            }
            LinkEvent::AddressAssigned(addr) => self.link = LinkState::Up(addr),
            LinkEvent::Disconnected => {
                let Some(creds) = self.credentials.clone() else {
                    self.link = LinkState::Down;
                    return;
                };
                warn!(
                    "wifi link dropped; reconnecting to `{}`",
                    String::from_utf8_lossy(&creds.ssid)
                );
                self.link = LinkState::Associating;
                if let Err(err) = self.radio.request_connect(&creds.ssid, &creds.psk) {
                    warn!("wifi reconnect request failed: {err}");
                    self.link = LinkState::Down;
                }
            }
        }
    }

    pub fn is_time_synced(&self) -> bool {
        self.time.is_some()
    }

    pub fn sync_time(&mut self, timeout_ms: u64) -> Result<(), KitError> {
        let request = ntp_request();
        let reply = self
            .radio
            .udp_exchange(&self.ntp_host, self.ntp_port, &request, timeout_ms)
            .map_err(|err| {
                warn!("ntp query to {}:{} failed: {err}", self.ntp_host, self.ntp_port);
                KitError::TimeSyncFailure
            })?;
        let wall = parse_ntp_response(&reply)?;
        debug!("ntp time {wall}");
        self.time = Some(TimeAnchor {
            wall,
            synced_at_ms: self.clock.now_ms(),
        });
        Ok(())
    }

    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        let anchor = self.time?;
        let elapsed_ms = self.clock.now_ms().saturating_sub(anchor.synced_at_ms);
        let elapsed = TimeDelta::try_milliseconds(i64::try_from(elapsed_ms).ok()?)?;
        anchor.wall.checked_add_signed(elapsed)
    }
}
