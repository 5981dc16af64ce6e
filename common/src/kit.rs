use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    certs::CertificateBuilder,
    client::ClientCommand,
    config::KitConfig,
    element::SecureElement,
    error::KitError,
    network::{ConnectivityManager, Radio},
    session::SessionProfile,
    shared::{lock, KitShared},
    timer::Clock,
    types::{ErrorState, KitAction, MainState, Notification},
    user_data::ConfigStore,
};

/// Main provisioning machine: brings the kit from power-on to a running
/// MQTT client and falls back to provisioning when anything is missing.
pub struct MainMachine<R, C, S> {
    shared: KitShared<S>,
    store: ConfigStore<S>,
    network: ConnectivityManager<R, C>,
    certs: CertificateBuilder<S>,
    client: UnboundedSender<ClientCommand>,
    config: KitConfig,

    state: MainState,
    client_id: Option<String>,
}

impl<R: Radio, C: Clock, S: SecureElement> MainMachine<R, C, S> {
    pub fn new(
        shared: &KitShared<S>,
        network: ConnectivityManager<R, C>,
        certs: CertificateBuilder<S>,
        client: UnboundedSender<ClientCommand>,
        config: &KitConfig,
    ) -> Self {
        Self {
            shared: shared.clone(),
            store: ConfigStore::new(shared.element.clone()),
            network,
            certs,
            client,
            config: config.clone(),
            state: MainState::InitKit,
            client_id: None,
        }
    }

    pub fn state(&self) -> MainState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn network(&self) -> &ConnectivityManager<R, C> {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ConnectivityManager<R, C> {
        &mut self.network
    }

    pub fn tick(&mut self, _now_ms: u64) -> Vec<KitAction> {
        let mut actions = Vec::new();
        self.network.service();

        let notification = self.shared.notifications.send_replace(None);
        if notification == Some(Notification::ResetUserData) {
            self.reset_user_data(&mut actions);
            return actions;
        }

        match self.state {
            MainState::InitKit => {
                self.ignore(notification);
                self.init_kit();
            }
            MainState::CheckKit => {
                self.ignore(notification);
                if let Err(err) = self.check_kit(&mut actions) {
                    warn!("kit check failed: {err}; waiting for provisioning");
                    self.shared.errors.set(ErrorState::UnavailableWifi);
                    self.transition(MainState::Provisioning);
                }
            }
            MainState::Provisioning => match notification {
                Some(Notification::RunMqttClient) => {
                    if let Err(err) = self.check_kit(&mut actions) {
                        warn!("kit check after provisioning failed: {err}");
                        self.shared.errors.set(ErrorState::UnavailableWifi);
                    }
                }
                Some(Notification::QuitMqttClient) => self.quit_client(),
                _ => {}
            },
            MainState::RunKit => match notification {
                Some(Notification::QuitMqttClient) => {
                    self.quit_client();
                    self.transition(MainState::Provisioning);
                }
                other => self.ignore(other),
            },
            MainState::Invalid => {}
        }
        actions
    }

    fn transition(&mut self, next: MainState) {
        if self.state != next {
            info!("main {} -> {}", self.state.as_str(), next.as_str());
        }
        self.state = next;
    }

    fn ignore(&self, notification: Option<Notification>) {
        if let Some(notification) = notification {
            debug!("{notification:?} ignored in {}", self.state.as_str());
        }
    }

    fn init_kit(&mut self) {
        match self.bring_up_hardware() {
            Ok(client_id) => {
                info!("secure element ready; client id {client_id}");
                self.client_id = Some(client_id);
                self.transition(MainState::CheckKit);
            }
            Err(err) => {
                warn!("kit init failed: {err}");
                self.shared.errors.set(ErrorState::UnprovisionedCrypto);
                self.transition(MainState::Provisioning);
            }
        }
    }

    fn bring_up_hardware(&mut self) -> Result<String, KitError> {
        let client_id = self.read_client_id()?;
        self.network.init()?;
        Ok(client_id)
    }

    fn read_client_id(&self) -> Result<String, KitError> {
        let mut element = lock(&self.shared.element);
        if !element.zones_locked()? {
            return Err(KitError::CryptoFailure);
        }
        Ok(hex::encode_upper(element.serial_number()?))
    }

    /// Validates the stored configuration, connects, syncs time and rebuilds
    /// the certificates. On success the client is resumed and the kit runs.
    fn check_kit(&mut self, actions: &mut Vec<KitAction>) -> Result<(), KitError> {
        match self.prepare_session() {
            Ok(profile) => {
                self.shared.errors.clear();
                if self.client.send(ClientCommand::Resume(profile)).is_err() {
                    warn!("client task is gone; cannot resume it");
                }
                self.transition(MainState::RunKit);
                Ok(())
            }
            Err(KitError::TimeSyncFailure) => {
                warn!("time sync failed; restarting");
                actions.push(KitAction::Restart);
                self.transition(MainState::Invalid);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn prepare_session(&mut self) -> Result<SessionProfile, KitError> {
        let client_id = match &self.client_id {
            Some(client_id) => client_id.clone(),
            None => {
                let client_id = self.read_client_id()?;
                self.client_id = Some(client_id.clone());
                client_id
            }
        };

        let user = self.store.read_all()?;
        self.shared.device().button.state = user.button_state;

        self.network.connect(
            &user.wifi_ssid,
            &user.wifi_psk,
            self.config.wifi_connect_timeout_ms,
        )?;
        if !self.network.is_time_synced() {
            self.network.sync_time(self.config.ntp_timeout_ms)?;
        }

        let certs = self.certs.build_device_and_signer_certs()?;
        let now = self
            .network
            .current_time()
            .ok_or(KitError::TimeSyncFailure)?;
        if !certs.valid_at(now) {
            warn!(
                "device certificate not valid at {now} (issued {}, expires {})",
                certs.device.issued, certs.device.expires
            );
            return Err(KitError::CertFailure);
        }

        Ok(SessionProfile {
            client_id,
            broker_host: user.broker_host,
            thing_name: user.thing_name,
            certs: Arc::new(certs),
        })
    }

    fn quit_client(&mut self) {
        info!("stopping mqtt client");
        if self.client.send(ClientCommand::Quit).is_err() {
            warn!("client task is gone; nothing to stop");
        }
    }

    fn reset_user_data(&mut self, actions: &mut Vec<KitAction>) {
        warn!("factory reset requested; clearing user data");
        if let Err(err) = self.store.reset() {
            warn!("user data reset failed: {err}");
        }
        actions.push(KitAction::Restart);
        self.transition(MainState::Invalid);
    }
}
