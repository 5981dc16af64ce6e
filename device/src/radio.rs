use std::{
    collections::VecDeque,
    net::{Ipv4Addr, UdpSocket},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use awskit_common::{KitError, LinkEvent, Radio};
use tracing::{debug, info, warn};

type EventQueue = Arc<Mutex<VecDeque<LinkEvent>>>;

fn push(queue: &EventQueue, event: LinkEvent) {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(event);
}

/// Workstation stand-in for the Wi-Fi module. The host is already online,
/// so association completes on the next poll; NTP goes out over a real UDP
/// socket.
#[derive(Default)]
pub struct HostRadio {
    events: EventQueue,
}

/// Lets the console simulate a dropped access point.
#[derive(Clone)]
pub struct RadioHandle {
    events: EventQueue,
}

impl RadioHandle {
    pub fn drop_link(&self) {
        push(&self.events, LinkEvent::Disconnected);
    }
}

impl HostRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> RadioHandle {
        RadioHandle {
            events: Arc::clone(&self.events),
        }
    }
}

impl Radio for HostRadio {
    fn init(&mut self) -> Result<(), KitError> {
        debug!("host radio ready");
        Ok(())
    }

    fn request_connect(&mut self, ssid: &[u8], _psk: &[u8]) -> Result<(), KitError> {
        info!(
            "associating with `{}` (simulated)",
            String::from_utf8_lossy(ssid)
        );
        push(&self.events, LinkEvent::Associated);
        push(&self.events, LinkEvent::AddressAssigned(Ipv4Addr::LOCALHOST));
        Ok(())
    }

    fn poll_events(&mut self, wait_ms: u64) -> Vec<LinkEvent> {
        let events: Vec<LinkEvent> = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if events.is_empty() && wait_ms > 0 {
            std::thread::sleep(Duration::from_millis(wait_ms));
        }
        events
    }

    fn udp_exchange(
        &mut self,
        host: &str,
        port: u16,
        request: &[u8],
        timeout_ms: u64,
    ) -> Result<Vec<u8>, KitError> {
        let timeout = Some(Duration::from_millis(timeout_ms.max(1)));
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|err| {
            warn!("udp bind failed: {err}");
            KitError::NetworkFailure
        })?;
        socket
            .set_read_timeout(timeout)
            .and_then(|()| socket.set_write_timeout(timeout))
            .and_then(|()| socket.connect((host, port)))
            .and_then(|()| socket.send(request))
            .map_err(|err| {
                warn!("udp send to {host}:{port} failed: {err}");
                KitError::NetworkFailure
            })?;

        let mut reply = [0u8; 128];
        let len = socket.recv(&mut reply).map_err(|err| {
            debug!("udp reply from {host}:{port} missing: {err}");
            KitError::NetworkFailure
        })?;
        Ok(reply[..len].to_vec())
    }
}
