use std::{collections::VecDeque, time::Duration};

use awskit_common::{ConnectOptions, Endpoint, InboundMessage, KitError, MqttLink, MqttOp};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS,
    SubscribeReasonCode,
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

/// Smallest keep-alive the broker link accepts.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug)]
enum Signal {
    Connected(ConnectReturnCode),
    Subscribed(bool),
    Unsubscribed,
    Pong,
    Message(InboundMessage),
    Failed(String),
}

async fn pump(mut eventloop: EventLoop, signals: UnboundedSender<Signal>) {
    loop {
        let signal = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => Signal::Connected(ack.code),
            Ok(Event::Incoming(Incoming::SubAck(ack))) => Signal::Subscribed(
                ack.return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            ),
            Ok(Event::Incoming(Incoming::UnsubAck(_))) => Signal::Unsubscribed,
            Ok(Event::Incoming(Incoming::PingResp)) => Signal::Pong,
            Ok(Event::Incoming(Incoming::Publish(message))) => Signal::Message(InboundMessage {
                topic: message.topic,
                payload: message.payload.to_vec(),
            }),
            Ok(_) => continue,
            Err(err) => {
                let _ = signals.send(Signal::Failed(err.to_string()));
                return;
            }
        };
        if signals.send(signal).is_err() {
            return;
        }
    }
}

/// Blocking [`MqttLink`] over a rumqttc event loop running on the tokio
/// runtime. The state machine thread blocks on a channel fed by the loop, so
/// calls must come from outside the runtime's async context.
pub struct RumqttLink {
    runtime: Handle,
    client: Option<AsyncClient>,
    signals: Option<UnboundedReceiver<Signal>>,
    poller: Option<JoinHandle<()>>,
    inbox: VecDeque<InboundMessage>,
}

impl RumqttLink {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            client: None,
            signals: None,
            poller: None,
            inbox: VecDeque::new(),
        }
    }

    fn client(&self) -> Result<&AsyncClient, KitError> {
        self.client.as_ref().ok_or(KitError::NetworkFailure)
    }

    fn shutdown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
        self.signals = None;
        self.inbox.clear();
    }

    /// Waits for the event loop until `deadline`. `Ok(None)` means the
    /// deadline passed; a closed channel is a dead loop.
    fn recv_until(&mut self, deadline: Instant) -> Result<Option<Signal>, KitError> {
        let Self {
            runtime, signals, ..
        } = self;
        let signals = signals.as_mut().ok_or(KitError::NetworkFailure)?;
        match runtime.block_on(timeout_at(deadline, signals.recv())) {
            Ok(Some(signal)) => Ok(Some(signal)),
            Ok(None) => Err(KitError::NetworkFailure),
            Err(_) => Ok(None),
        }
    }

    /// Next control signal, buffering publishes that arrive ahead of it.
    fn next_signal(&mut self, op: MqttOp, timeout_ms: u64) -> Result<Signal, KitError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.recv_until(deadline)? {
                Some(Signal::Message(message)) => self.inbox.push_back(message),
                Some(Signal::Failed(reason)) => {
                    warn!("mqtt {op} failed: {reason}");
                    return Err(KitError::NetworkFailure);
                }
                Some(signal) => return Ok(signal),
                None => return Err(KitError::CommandTimeout),
            }
        }
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MqttLink for RumqttLink {
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        timeout_ms: u64,
    ) -> Result<(), KitError> {
        self.shutdown();

        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            endpoint.host.clone(),
            endpoint.addr.port(),
        );
        mqtt.set_keep_alive(Duration::from_secs(
            u64::from(options.keep_alive_secs).max(MIN_KEEP_ALIVE_SECS),
        ));
        mqtt.set_clean_session(options.clean_session);

        let (client, eventloop) = AsyncClient::new(mqtt, 16);
        let (tx, rx) = mpsc::unbounded_channel();
        self.poller = Some(self.runtime.spawn(pump(eventloop, tx)));
        self.client = Some(client);
        self.signals = Some(rx);

        match self.next_signal(MqttOp::Connect, timeout_ms)? {
            Signal::Connected(ConnectReturnCode::Success) => {
                info!("mqtt session open as {}", options.client_id);
                Ok(())
            }
            Signal::Connected(code) => {
                warn!("broker refused connect: {code:?}");
                self.shutdown();
                Err(KitError::ProtocolFailure(MqttOp::Connect))
            }
            other => {
                debug!("unexpected {other:?} before connack");
                self.shutdown();
                Err(KitError::ProtocolFailure(MqttOp::Connect))
            }
        }
    }

    fn subscribe(&mut self, topic: &str, packet_id: u16, timeout_ms: u64) -> Result<(), KitError> {
        debug!("subscribe {topic} (local id {packet_id})");
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| {
                warn!("subscribe request rejected: {err}");
                KitError::NetworkFailure
            })?;
        match self.next_signal(MqttOp::Subscribe, timeout_ms)? {
            Signal::Subscribed(true) => Ok(()),
            _ => Err(KitError::ProtocolFailure(MqttOp::Subscribe)),
        }
    }

    fn unsubscribe(&mut self, topic: &str, packet_id: u16, timeout_ms: u64) -> Result<(), KitError> {
        debug!("unsubscribe {topic} (local id {packet_id})");
        self.client()?.try_unsubscribe(topic).map_err(|err| {
            warn!("unsubscribe request rejected: {err}");
            KitError::NetworkFailure
        })?;
        match self.next_signal(MqttOp::Unsubscribe, timeout_ms)? {
            Signal::Unsubscribed => Ok(()),
            _ => Err(KitError::ProtocolFailure(MqttOp::Unsubscribe)),
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _timeout_ms: u64) -> Result<(), KitError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| {
                warn!("publish to {topic} rejected: {err}");
                KitError::CommandTimeout
            })
    }

    // rumqttc sends PINGREQ on its own keep-alive schedule; only check
    // that the event loop is still alive.
    fn ping(&mut self, _timeout_ms: u64) -> Result<(), KitError> {
        match &self.poller {
            Some(poller) if !poller.is_finished() => Ok(()),
            _ => Err(KitError::NetworkFailure),
        }
    }

    fn wait_for_message(&mut self, timeout_ms: u64) -> Result<Option<InboundMessage>, KitError> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.recv_until(deadline)? {
                Some(Signal::Message(message)) => return Ok(Some(message)),
                Some(Signal::Failed(reason)) => {
                    warn!("mqtt receive failed: {reason}");
                    return Err(KitError::NetworkFailure);
                }
                Some(Signal::Pong) => debug!("pingresp"),
                Some(other) => debug!("ignoring {other:?} while idle"),
                None => return Ok(None),
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), KitError> {
        let result = match self.client() {
            Ok(client) => client.try_disconnect().map_err(|err| {
                warn!("disconnect request rejected: {err}");
                KitError::ProtocolFailure(MqttOp::Disconnect)
            }),
            Err(_) => Ok(()),
        };
        self.shutdown();
        result
    }
}
