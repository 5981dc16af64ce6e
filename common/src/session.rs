use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    certs::CertificateBundle,
    config::KitConfig,
    element::{Digest, PublicKey, SecureElement, SharedElement, Signature, Slot},
    error::{KitError, MqttOp},
    shared::lock,
};

/// Everything the client needs to bring up a broker session. Built by the
/// main machine and handed over on resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub client_id: String,
    pub broker_host: String,
    pub thing_name: String,
    pub certs: Arc<CertificateBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Blocking,
    NonBlocking,
}

/// Key operations the TLS engine calls back into during the handshake.
pub trait HandshakeCrypto {
    fn sign(&mut self, digest: &Digest) -> Result<Signature, KitError>;
    fn verify(
        &mut self,
        public_key: &PublicKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, KitError>;
    /// ECDH with the server's ephemeral key, computed inside the element.
    fn create_pms(&mut self, peer: &PublicKey) -> Result<[u8; 32], KitError>;
}

/// Secure-element backed handshake callbacks.
pub struct ElementCrypto<S> {
    element: SharedElement<S>,
}

impl<S> ElementCrypto<S> {
    pub fn new(element: SharedElement<S>) -> Self {
        Self { element }
    }
}

impl<S> Clone for ElementCrypto<S> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.element))
    }
}

impl<S: SecureElement> HandshakeCrypto for ElementCrypto<S> {
    fn sign(&mut self, digest: &Digest) -> Result<Signature, KitError> {
        lock(&self.element).sign(Slot::DeviceKey, digest)
    }

    fn verify(
        &mut self,
        public_key: &PublicKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, KitError> {
        lock(&self.element).verify(public_key, digest, signature)
    }

    fn create_pms(&mut self, peer: &PublicKey) -> Result<[u8; 32], KitError> {
        lock(&self.element).ecdh(Slot::DeviceKey, peer)
    }
}

/// Socket and TLS layer under the MQTT link.
pub trait Transport {
    fn resolve(&mut self, host: &str, port: u16, timeout_ms: u64) -> Result<SocketAddr, KitError>;
    fn open(&mut self, addr: SocketAddr, timeout_ms: u64) -> Result<(), KitError>;
    fn handshake(
        &mut self,
        host: &str,
        certs: &CertificateBundle,
        crypto: &mut dyn HandshakeCrypto,
        timeout_ms: u64,
    ) -> Result<(), KitError>;
    fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

/// MQTT codec over an established transport. All traffic is QoS 0.
pub trait MqttLink {
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        timeout_ms: u64,
    ) -> Result<(), KitError>;
    fn subscribe(&mut self, topic: &str, packet_id: u16, timeout_ms: u64) -> Result<(), KitError>;
    fn unsubscribe(&mut self, topic: &str, packet_id: u16, timeout_ms: u64) -> Result<(), KitError>;
    fn publish(&mut self, topic: &str, payload: &[u8], timeout_ms: u64) -> Result<(), KitError>;
    fn ping(&mut self, timeout_ms: u64) -> Result<(), KitError>;
    /// `Ok(None)` when nothing arrived before the timeout.
    fn wait_for_message(&mut self, timeout_ms: u64) -> Result<Option<InboundMessage>, KitError>;
    fn disconnect(&mut self) -> Result<(), KitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    ResolveHost,
    TcpConnect,
    TlsHandshake,
    MqttConnect,
}

/// Maps a CONNECT failure to its retry class. AWS IoT drops the connection
/// while just-in-time registration is still running, so a missing CONNACK
/// means "try again shortly".
pub fn classify_connect_failure(err: KitError) -> KitError {
    match err {
        KitError::NetworkFailure | KitError::CommandTimeout | KitError::ConnectFailure => {
            KitError::JitrRetry
        }
        KitError::TlsFailure => KitError::TlsFailure,
        KitError::ProtocolFailure(_) => err,
        _ => KitError::NetworkFailure,
    }
}

/// One broker session at a time: resolve, connect, handshake, CONNECT, then
/// the QoS 0 operations the client machine needs.
pub struct SessionController<T, M> {
    transport: T,
    link: M,
    timeouts: SessionTimeouts,
    endpoint: Option<Endpoint>,
    open: bool,
    packet_id: u16,
}

#[derive(Debug, Clone, Copy)]
struct SessionTimeouts {
    dns_ms: u64,
    connect_ms: u64,
    tls_ms: u64,
    command_ms: u64,
    keep_alive_secs: u16,
    broker_port: u16,
}

impl<T: Transport, M: MqttLink> SessionController<T, M> {
    pub fn new(transport: T, link: M, config: &KitConfig) -> Self {
        Self {
            transport,
            link,
            timeouts: SessionTimeouts {
                dns_ms: config.dns_timeout_ms,
                connect_ms: config.net_connect_timeout_ms,
                tls_ms: config.tls_timeout_ms,
                command_ms: config.mqtt_command_timeout_ms,
                keep_alive_secs: config.keep_alive_secs,
                broker_port: config.broker_port,
            },
            endpoint: None,
            open: false,
            packet_id: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn link(&self) -> &M {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut M {
        &mut self.link
    }

    /// Packet ids run 1..=65535 and wrap back to 1.
    pub fn next_packet_id(&mut self) -> u16 {
        self.packet_id = match self.packet_id {
            u16::MAX => 1,
            id => id + 1,
        };
        self.packet_id
    }

    pub fn establish(
        &mut self,
        profile: &SessionProfile,
        crypto: &mut dyn HandshakeCrypto,
    ) -> Result<(), KitError> {
        if self.open {
            self.teardown();
        }
        match self.run_steps(profile, crypto) {
            Ok(()) => {
                self.open = true;
                info!(
                    "mqtt session up with {} as `{}`",
                    profile.broker_host, profile.client_id
                );
                Ok(())
            }
            Err((step, err)) => {
                warn!("session setup failed at {step:?}: {err}");
                self.transport.close();
                self.endpoint = None;
                Err(err)
            }
        }
    }

    fn run_steps(
        &mut self,
        profile: &SessionProfile,
        crypto: &mut dyn HandshakeCrypto,
    ) -> Result<(), (SessionStep, KitError)> {
        let timeouts = self.timeouts;

        let addr = self
            .transport
            .resolve(&profile.broker_host, timeouts.broker_port, timeouts.dns_ms)
            .map_err(|_| (SessionStep::ResolveHost, KitError::DnsTimeout))?;
        debug!("resolved {} to {addr}", profile.broker_host);

        self.transport
            .open(addr, timeouts.connect_ms)
            .map_err(|err| {
                let err = match err {
                    KitError::ConnectTimeout => KitError::ConnectTimeout,
                    _ => KitError::ConnectFailure,
                };
                (SessionStep::TcpConnect, err)
            })?;

        self.transport
            .handshake(&profile.broker_host, &profile.certs, crypto, timeouts.tls_ms)
            .map_err(|_| (SessionStep::TlsHandshake, KitError::TlsFailure))?;

        let endpoint = Endpoint {
            host: profile.broker_host.clone(),
            addr,
        };
        let options = ConnectOptions {
            client_id: profile.client_id.clone(),
            keep_alive_secs: timeouts.keep_alive_secs,
            clean_session: true,
        };
        self.link
            .connect(&endpoint, &options, timeouts.command_ms)
            .map_err(|err| (SessionStep::MqttConnect, classify_connect_failure(err)))?;
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn settle(&self, op: MqttOp, mode: IoMode, result: Result<(), KitError>) -> Result<(), KitError> {
        match (mode, result) {
            (IoMode::NonBlocking, Err(KitError::CommandTimeout)) => {
                debug!("non-blocking mqtt {op} timed out; continuing");
                Ok(())
            }
            (_, result) => result,
        }
    }

    pub fn subscribe(&mut self, topic: &str) -> Result<(), KitError> {
        let packet_id = self.next_packet_id();
        let result = self.link.subscribe(topic, packet_id, self.timeouts.command_ms);
        self.settle(MqttOp::Subscribe, IoMode::Blocking, result)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), KitError> {
        let packet_id = self.next_packet_id();
        let result = self.link.unsubscribe(topic, packet_id, self.timeouts.command_ms);
        self.settle(MqttOp::Unsubscribe, IoMode::Blocking, result)
    }

    pub fn publish(&mut self, topic: &str, payload: &str, mode: IoMode) -> Result<(), KitError> {
        let result = self
            .link
            .publish(topic, payload.as_bytes(), self.timeouts.command_ms);
        self.settle(MqttOp::Publish, mode, result)
    }

    pub fn ping(&mut self) -> Result<(), KitError> {
        let result = self.link.ping(self.timeouts.command_ms);
        self.settle(MqttOp::Ping, IoMode::NonBlocking, result)
    }

    pub fn wait_for_message(&mut self) -> Result<Option<InboundMessage>, KitError> {
        self.link.wait_for_message(self.timeouts.command_ms)
    }

    /// MQTT DISCONNECT, then transport release.
    pub fn disconnect(&mut self) -> Result<(), KitError> {
        let result = self.link.disconnect();
        self.transport.close();
        self.open = false;
        self.endpoint = None;
        result
    }

    /// Drops the session without protocol courtesy.
    pub fn teardown(&mut self) {
        if self.open {
            debug!("tearing down mqtt session");
            if let Err(err) = self.link.disconnect() {
                debug!("disconnect during teardown failed: {err}");
            }
        }
        self.transport.close();
        self.open = false;
        self.endpoint = None;
    }
}
