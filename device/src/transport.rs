use std::{
    io::ErrorKind,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use awskit_common::{CertificateBundle, HandshakeCrypto, KitError, Transport};
use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

/// TCP reachability check plus a handshake that exercises the device key
/// once. The broker connection itself is owned by the MQTT link.
#[derive(Default)]
pub struct HostTransport {
    stream: Option<TcpStream>,
}

impl HostTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for HostTransport {
    fn resolve(&mut self, host: &str, port: u16, _timeout_ms: u64) -> Result<SocketAddr, KitError> {
        let mut addrs = (host, port).to_socket_addrs().map_err(|err| {
            warn!("dns lookup for {host} failed: {err}");
            KitError::DnsTimeout
        })?;
        addrs.next().ok_or(KitError::DnsTimeout)
    }

    fn open(&mut self, addr: SocketAddr, timeout_ms: u64) -> Result<(), KitError> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => Err(KitError::ConnectTimeout),
            Err(err) => {
                debug!("tcp connect to {addr} failed: {err}");
                Err(KitError::ConnectFailure)
            }
        }
    }

    fn handshake(
        &mut self,
        host: &str,
        certs: &CertificateBundle,
        crypto: &mut dyn HandshakeCrypto,
        _timeout_ms: u64,
    ) -> Result<(), KitError> {
        if self.stream.is_none() {
            return Err(KitError::TlsFailure);
        }
        // CertificateVerify stand-in: sign the transcript with the device key.
        let transcript: [u8; 32] = Sha256::new()
            .chain_update(host.as_bytes())
            .chain_update(&certs.device.der)
            .finalize()
            .into();
        let signature = crypto.sign(&transcript)?;
        if !crypto.verify(&certs.device.public_key, &transcript, &signature)? {
            warn!("device key does not match the device certificate");
            return Err(KitError::TlsFailure);
        }
        debug!("simulated handshake with {host} done; session stays plaintext");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
