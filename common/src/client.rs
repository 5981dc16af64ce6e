use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::{
    config::KitConfig,
    element::SecureElement,
    error::KitError,
    session::{ElementCrypto, IoMode, MqttLink, SessionController, SessionProfile, Transport},
    shadow,
    shared::KitShared,
    timer::Countdown,
    topics::{shadow_delta_topic, shadow_update_topic},
    types::{ClientState, ErrorState, KitAction, LED_COUNT},
    user_data::ConfigStore,
};

/// Requests from the main machine. The client owns the receiving end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Resume(SessionProfile),
    Quit,
}

#[derive(Debug, Clone)]
struct ShadowTopics {
    delta: String,
    update: String,
}

impl ShadowTopics {
    fn for_thing(thing_name: &str) -> Result<Self, KitError> {
        Ok(Self {
            delta: shadow_delta_topic(thing_name)?,
            update: shadow_update_topic(thing_name)?,
        })
    }
}

/// MQTT client machine. Parked until the main machine resumes it; parks
/// again after a quit or a fatal wait error.
pub struct ClientMachine<T, M, S> {
    session: SessionController<T, M>,
    crypto: ElementCrypto<S>,
    store: ConfigStore<S>,
    shared: KitShared<S>,
    commands: UnboundedReceiver<ClientCommand>,
    config: KitConfig,

    state: ClientState,
    parked: bool,
    quit_requested: bool,
    profile: Option<SessionProfile>,
    topics: Option<ShadowTopics>,

    // One error report per failure streak.
    error_raised: bool,
    retry_delay_secs: u64,
    keep_alive: Countdown,
}

impl<T: Transport, M: MqttLink, S: SecureElement> ClientMachine<T, M, S> {
    pub fn new(
        session: SessionController<T, M>,
        shared: &KitShared<S>,
        commands: UnboundedReceiver<ClientCommand>,
        config: &KitConfig,
    ) -> Self {
        shared.client_state.set(ClientState::InitMqttClient);
        Self {
            session,
            crypto: ElementCrypto::new(shared.element.clone()),
            store: ConfigStore::new(shared.element.clone()),
            shared: shared.clone(),
            commands,
            config: config.clone(),
            state: ClientState::InitMqttClient,
            parked: true,
            quit_requested: false,
            profile: None,
            topics: None,
            error_raised: false,
            retry_delay_secs: 0,
            keep_alive: Countdown::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn retry_delay_secs(&self) -> u64 {
        self.retry_delay_secs
    }

    pub fn session(&self) -> &SessionController<T, M> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionController<T, M> {
        &mut self.session
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<KitAction> {
        self.drain_commands();

        let mut actions = Vec::new();
        if self.parked {
            return actions;
        }

        match self.state {
            ClientState::InitMqttClient => self.init_client(now_ms, &mut actions),
            ClientState::MqttSubscribe => self.subscribe(),
            ClientState::MqttPublish => self.publish_status(),
            ClientState::MqttWaitMessage => self.wait_message(now_ms, &mut actions),
            ClientState::Invalid => self.parked = true,
        }
        actions
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(ClientCommand::Resume(profile)) => self.resume(profile),
                Ok(ClientCommand::Quit) => self.request_quit(),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn resume(&mut self, profile: SessionProfile) {
        info!(
            "client resumed for thing `{}` from {}",
            profile.thing_name,
            self.state.as_str()
        );
        self.session.teardown();
        self.profile = Some(profile);
        self.topics = None;
        self.quit_requested = false;
        self.retry_delay_secs = 0;
        self.error_raised = false;
        self.parked = false;
        self.transition(ClientState::InitMqttClient);
    }

    fn request_quit(&mut self) {
        if self.parked {
            debug!("quit ignored; client already parked");
            return;
        }
        if self.state == ClientState::MqttWaitMessage {
            self.quit_requested = true;
            return;
        }
        info!("quit while in {}; dropping session", self.state.as_str());
        self.session.teardown();
        self.transition(ClientState::InitMqttClient);
        self.parked = true;
    }

    fn transition(&mut self, next: ClientState) {
        if self.state != next {
            debug!("client {} -> {}", self.state.as_str(), next.as_str());
        }
        self.state = next;
        self.shared.client_state.set(next);
    }

    fn raise(&mut self, state: ErrorState) {
        if !self.error_raised {
            self.shared.errors.set(state);
            self.error_raised = true;
        }
    }

    fn settle(&mut self) {
        self.error_raised = false;
        self.shared.errors.clear();
    }

    fn init_client(&mut self, now_ms: u64, actions: &mut Vec<KitAction>) {
        let Some(profile) = self.profile.clone() else {
            warn!("client has no session profile; parking");
            self.parked = true;
            return;
        };

        let result = ShadowTopics::for_thing(&profile.thing_name).and_then(|topics| {
            self.session.establish(&profile, &mut self.crypto)?;
            Ok(topics)
        });

        match result {
            Ok(topics) => {
                self.topics = Some(topics);
                self.keep_alive.start(now_ms, self.config.keep_alive_ms());
                self.shared.device().led.state = [false; LED_COUNT];
                actions.push(KitAction::AllLedsOff);
                self.retry_delay_secs = 0;
                self.settle();
                self.transition(ClientState::MqttSubscribe);
            }
            Err(err) => {
                self.session.teardown();
                self.raise(match err {
                    KitError::TlsFailure => ErrorState::TlsFailure,
                    _ => ErrorState::MqttFailure,
                });

                self.retry_delay_secs += self.config.retry_step_secs;
                if self.retry_delay_secs >= self.config.retry_ceiling_secs {
                    warn!(
                        "mqtt session failed ({err}); retry delay reached {}s, restarting",
                        self.retry_delay_secs
                    );
                    self.parked = true;
                    actions.push(KitAction::Restart);
                } else {
                    info!(
                        "mqtt session failed ({err}); retrying in {}s",
                        self.retry_delay_secs
                    );
                    actions.push(KitAction::Sleep(self.retry_delay_secs * 1_000));
                }
            }
        }
    }

    fn subscribe(&mut self) {
        let Some(topic) = self.topics.as_ref().map(|topics| topics.delta.clone()) else {
            self.transition(ClientState::InitMqttClient);
            return;
        };
        match self.session.subscribe(&topic) {
            Ok(()) => {
                info!("subscribed to {topic}");
                self.settle();
                self.transition(ClientState::MqttPublish);
            }
            Err(err) => {
                warn!("subscribe to {topic} failed: {err}");
                self.raise(ErrorState::MqttFailure);
            }
        }
    }

    fn publish_status(&mut self) {
        let Some(topic) = self.topics.as_ref().map(|topics| topics.update.clone()) else {
            self.transition(ClientState::InitMqttClient);
            return;
        };
        let device = *self.shared.device();
        let result = shadow::led_status(&device)
            .and_then(|leds| self.session.publish(&topic, &leds, IoMode::Blocking))
            .and_then(|()| shadow::button_status(&device))
            .and_then(|buttons| self.session.publish(&topic, &buttons, IoMode::Blocking));

        match result {
            Ok(()) => {
                self.settle();
                self.transition(ClientState::MqttWaitMessage);
            }
            Err(err) => {
                warn!("status publish failed: {err}");
                self.raise(ErrorState::MqttFailure);
            }
        }
    }

    fn wait_message(&mut self, now_ms: u64, actions: &mut Vec<KitAction>) {
        let Some(topics) = self.topics.clone() else {
            self.transition(ClientState::InitMqttClient);
            return;
        };

        if self.quit_requested {
            self.quit_requested = false;
            self.quit(&topics);
            return;
        }

        if self.keep_alive.expired(now_ms) {
            if let Err(err) = self.session.ping() {
                debug!("keep-alive ping failed: {err}");
            }
            self.keep_alive.start(now_ms, self.config.keep_alive_ms());
        }

        match self.session.wait_for_message() {
            Ok(None) | Err(KitError::CommandTimeout) => {}
            Ok(Some(message)) if message.topic == topics.delta => {
                self.handle_delta(&topics, &message.payload, actions);
            }
            Ok(Some(message)) => debug!("ignoring message on {}", message.topic),
            Err(err) => {
                warn!("waiting for mqtt message failed: {err}");
                self.session.teardown();
                self.raise(ErrorState::MqttFailure);
                self.transition(ClientState::Invalid);
                self.parked = true;
                return;
            }
        }

        self.report_button_press(&topics);
    }

    fn quit(&mut self, topics: &ShadowTopics) {
        let result = self
            .session
            .unsubscribe(&topics.delta)
            .and_then(|()| self.session.disconnect());
        match result {
            Ok(()) => {
                info!("mqtt client stopped; waiting for resume");
                self.transition(ClientState::InitMqttClient);
            }
            Err(err) => {
                warn!("mqtt shutdown failed: {err}");
                self.session.teardown();
                self.raise(ErrorState::MqttFailure);
                self.transition(ClientState::Invalid);
            }
        }
        self.parked = true;
    }

    fn handle_delta(&mut self, topics: &ShadowTopics, payload: &[u8], actions: &mut Vec<KitAction>) {
        let report = {
            let mut device = self.shared.device();
            match shadow::apply_delta(&mut device, payload) {
                Ok(led_actions) => actions.extend(led_actions),
                Err(err) => {
                    debug!("shadow delta rejected: {err}");
                    return;
                }
            }
            shadow::take_led_report(&mut device)
        };

        match report {
            Ok(Some(report)) => {
                if let Err(err) = self.session.publish(&topics.update, &report, IoMode::Blocking) {
                    warn!("led report publish failed: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => warn!("led report could not be encoded: {err}"),
        }
    }

    fn report_button_press(&mut self, topics: &ShadowTopics) {
        let (index, pressed, state) = {
            let mut device = self.shared.device();
            let Some(index) = device.take_pressed() else {
                return;
            };
            device.button.state[index] = !device.button.state[index];
            (index, device.button.state[index], device.button.state)
        };

        if let Err(err) = self.store.save_button_state(state) {
            warn!("button state not persisted: {err}");
        }
        let result = shadow::button_report(index, pressed)
            .and_then(|report| self.session.publish(&topics.update, &report, IoMode::NonBlocking));
        if let Err(err) = result {
            warn!("button{} report failed: {err}", index + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        certs::{
            testing::{definitions, provision_certs},
            CertificateBuilder,
        },
        element::{shared, testing::FakeElement},
        error::MqttOp,
        session::{
            testing::{CallLog, FakeLink, FakeTransport},
            InboundMessage,
        },
        timer::{testing::FakeClock, Clock},
        user_data::OFFSET_BUTTON_STATE,
    };

    const DELTA: &str = "$aws/things/kit-01/shadow/update/delta";
    const UPDATE: &str = "$aws/things/kit-01/shadow/update";

    struct Harness {
        machine: ClientMachine<FakeTransport, FakeLink, FakeElement>,
        shared: KitShared<FakeElement>,
        commands: mpsc::UnboundedSender<ClientCommand>,
        log: CallLog,
        clock: FakeClock,
    }

    impl Harness {
        fn new(config: KitConfig) -> Self {
            let mut element = FakeElement::default();
            provision_certs(&mut element);
            let shared = KitShared::new(shared(element));
            let log = CallLog::default();
            let clock = FakeClock::default();
            let session = SessionController::new(
                FakeTransport::new(log.clone()),
                FakeLink::new(log.clone(), clock.clone()),
                &config,
            );
            let (commands, receiver) = mpsc::unbounded_channel();
            let machine = ClientMachine::new(session, &shared, receiver, &config);
            Self {
                machine,
                shared,
                commands,
                log,
                clock,
            }
        }

        fn profile(&self) -> SessionProfile {
            let (signer, device) = definitions();
            let certs = CertificateBuilder::new(self.shared.element.clone(), signer, device)
                .build_device_and_signer_certs()
                .unwrap();
            SessionProfile {
                client_id: "01236E1A2B3C4D5EEE".to_string(),
                broker_host: "broker.example".to_string(),
                thing_name: "kit-01".to_string(),
                certs: Arc::new(certs),
            }
        }

        fn resume(&self) {
            self.commands
                .send(ClientCommand::Resume(self.profile()))
                .unwrap();
        }

        fn tick(&mut self) -> Vec<KitAction> {
            let now = self.clock.now_ms();
            self.machine.tick(now)
        }

        fn link(&mut self) -> &mut FakeLink {
            self.machine.session_mut().link_mut()
        }

        /// Resume and run until the machine waits for messages.
        fn bring_up(&mut self) {
            self.resume();
            for _ in 0..3 {
                self.tick();
            }
            assert_eq!(self.machine.state(), ClientState::MqttWaitMessage);
            self.log.borrow_mut().clear();
        }
    }

    #[test]
    fn stays_parked_until_resumed() {
        let mut harness = Harness::new(KitConfig::default());
        assert!(harness.tick().is_empty());
        assert!(harness.log.borrow().is_empty());
        assert!(harness.machine.is_parked());
    }

    #[test]
    fn resume_runs_through_to_wait_message_with_two_status_publishes() {
        let mut harness = Harness::new(KitConfig::default());
        harness.shared.device().led.state = [true, false, true];
        harness.shared.device().button.state = [false, true, false];
        harness.shared.errors.set(ErrorState::UnavailableWifi);
        harness.resume();

        assert_eq!(harness.tick(), vec![KitAction::AllLedsOff]);
        assert_eq!(harness.machine.state(), ClientState::MqttSubscribe);
        assert_eq!(harness.shared.errors.get(), ErrorState::None);

        harness.tick();
        assert_eq!(harness.shared.client_state.get(), ClientState::MqttPublish);
        harness.tick();
        assert_eq!(harness.machine.state(), ClientState::MqttWaitMessage);

        assert_eq!(
            harness.link().published,
            vec![
                (
                    UPDATE.to_string(),
                    r#"{"state":{"reported":{"led1":"off","led2":"off","led3":"off"}}}"#.to_string()
                ),
                (
                    UPDATE.to_string(),
                    r#"{"state":{"reported":{"button1":"up","button2":"down","button3":"up"}}}"#
                        .to_string()
                ),
            ]
        );
        assert!(harness
            .log
            .borrow()
            .contains(&format!("subscribe {DELTA}")));
    }

    #[test]
    fn connect_failures_back_off_then_restart_on_sixtieth() {
        let mut harness = Harness::new(KitConfig::default());
        harness
            .machine
            .session_mut()
            .link_mut()
            .connect_results
            .extend(std::iter::repeat(Err(KitError::CommandTimeout)).take(60));
        harness.resume();

        for attempt in 1..60u64 {
            assert_eq!(harness.tick(), vec![KitAction::Sleep(attempt * 2 * 1_000)]);
        }
        assert_eq!(harness.shared.errors.get(), ErrorState::MqttFailure);
        assert_eq!(harness.tick(), vec![KitAction::Restart]);
        assert_eq!(harness.machine.retry_delay_secs(), 120);
        assert!(harness.tick().is_empty());
    }

    #[test]
    fn error_is_raised_once_per_failure_streak() {
        let mut harness = Harness::new(KitConfig::default());
        harness
            .link()
            .connect_results
            .extend([Err(KitError::TlsFailure), Err(KitError::NetworkFailure)]);
        harness.resume();

        harness.tick();
        assert_eq!(harness.shared.errors.get(), ErrorState::TlsFailure);
        // A later error in the same streak does not replace the first.
        harness.tick();
        assert_eq!(harness.shared.errors.get(), ErrorState::TlsFailure);

        harness.tick();
        assert_eq!(harness.shared.errors.get(), ErrorState::None);
        assert_eq!(harness.machine.retry_delay_secs(), 0);
    }

    #[test]
    fn subscribe_failure_retries_same_state() {
        let mut harness = Harness::new(KitConfig::default());
        harness.link().subscribe = Err(KitError::ProtocolFailure(MqttOp::Subscribe));
        harness.resume();
        harness.tick();

        harness.tick();
        harness.tick();
        assert_eq!(harness.machine.state(), ClientState::MqttSubscribe);
        assert_eq!(harness.shared.errors.get(), ErrorState::MqttFailure);

        harness.link().subscribe = Ok(());
        harness.tick();
        assert_eq!(harness.machine.state(), ClientState::MqttPublish);
        assert_eq!(harness.shared.errors.get(), ErrorState::None);
    }

    #[test]
    fn keep_alive_pings_once_per_window() {
        let mut harness = Harness::new(KitConfig {
            keep_alive_secs: 5,
            ..KitConfig::default()
        });
        harness.resume();
        // init, subscribe, publish, then seven idle waits of 2 s each
        for _ in 0..10 {
            harness.tick();
        }
        assert_eq!(harness.link().pings, vec![6_000, 12_000]);
    }

    #[test]
    fn keep_alive_window_restarts_after_ping_failure() {
        let mut harness = Harness::new(KitConfig {
            keep_alive_secs: 5,
            ..KitConfig::default()
        });
        harness.link().ping = Err(KitError::NetworkFailure);
        harness.resume();
        for _ in 0..10 {
            harness.tick();
        }
        assert_eq!(harness.link().pings, vec![6_000, 12_000]);
        assert_eq!(harness.machine.state(), ClientState::MqttWaitMessage);
    }

    #[test]
    fn delta_drives_leds_and_reports_desired_only() {
        let mut harness = Harness::new(KitConfig::default());
        harness.bring_up();
        harness.link().published.clear();
        harness.link().inbound.push_back(Ok(Some(InboundMessage {
            topic: DELTA.to_string(),
            payload: br#"{"state":{"led2":"on"},"version":7}"#.to_vec(),
        })));

        assert_eq!(harness.tick(), vec![KitAction::SetLed(1, true)]);
        assert_eq!(harness.shared.device().led.state, [false, true, false]);
        assert_eq!(harness.shared.device().led.desired, [false; LED_COUNT]);
        assert_eq!(
            harness.link().published,
            vec![(
                UPDATE.to_string(),
                r#"{"state":{"reported":{"led2":"on"}}}"#.to_string()
            )]
        );
    }

    #[test]
    fn button_press_toggles_persists_and_reports() {
        let mut harness = Harness::new(KitConfig::default());
        harness.bring_up();
        harness.link().published.clear();
        harness.shared.device().button.is_pressed[2] = true;

        harness.tick();

        assert_eq!(harness.shared.device().button.state, [false, false, true]);
        assert_eq!(
            harness.link().published,
            vec![(
                UPDATE.to_string(),
                r#"{"state":{"reported":{"button3":"down"}}}"#.to_string()
            )]
        );
        let element = harness.shared.element.lock().unwrap();
        let user_data = &element.slots[&crate::element::Slot::UserData];
        assert_eq!(
            &user_data[OFFSET_BUTTON_STATE..OFFSET_BUTTON_STATE + 4],
            &[0, 0, 1, 0]
        );
    }

    #[test]
    fn quit_unsubscribes_disconnects_and_closes_in_order() {
        let mut harness = Harness::new(KitConfig::default());
        harness.bring_up();
        harness.commands.send(ClientCommand::Quit).unwrap();

        harness.tick();

        assert_eq!(
            *harness.log.borrow(),
            vec![
                format!("unsubscribe {DELTA}"),
                "disconnect".to_string(),
                "close".to_string(),
            ]
        );
        assert_eq!(harness.machine.state(), ClientState::InitMqttClient);
        assert!(harness.machine.is_parked());

        harness.log.borrow_mut().clear();
        harness.tick();
        assert!(harness.log.borrow().is_empty());
    }

    #[test]
    fn failed_quit_raises_mqtt_failure_and_parks_invalid() {
        let mut harness = Harness::new(KitConfig::default());
        harness.bring_up();
        harness.link().unsubscribe = Err(KitError::ProtocolFailure(MqttOp::Unsubscribe));
        harness.commands.send(ClientCommand::Quit).unwrap();

        harness.tick();

        assert_eq!(harness.machine.state(), ClientState::Invalid);
        assert_eq!(harness.shared.errors.get(), ErrorState::MqttFailure);
        assert!(harness.machine.is_parked());
        assert_eq!(
            *harness.log.borrow(),
            vec![
                format!("unsubscribe {DELTA}"),
                "disconnect".to_string(),
                "close".to_string(),
            ]
        );
    }

    #[test]
    fn wait_error_parks_invalid_until_resumed() {
        let mut harness = Harness::new(KitConfig::default());
        harness.bring_up();
        harness
            .link()
            .inbound
            .push_back(Err(KitError::ProtocolFailure(MqttOp::Receive)));

        harness.tick();
        assert_eq!(harness.machine.state(), ClientState::Invalid);
        assert_eq!(harness.shared.client_state.get(), ClientState::Invalid);
        assert_eq!(harness.shared.errors.get(), ErrorState::MqttFailure);
        assert!(harness.tick().is_empty());

        harness.resume();
        assert_eq!(harness.tick(), vec![KitAction::AllLedsOff]);
        assert_eq!(harness.machine.state(), ClientState::MqttSubscribe);
    }
}
