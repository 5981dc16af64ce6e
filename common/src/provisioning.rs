use tracing::{debug, info, warn};

use crate::{
    certs::COMPRESSED_CERT_LEN,
    element::{CertRole, Digest, PublicKey, SecureElement, Slot, PUBLIC_KEY_LEN},
    error::KitError,
    shared::{lock, KitShared},
    topics::shadow_delta_topic,
    types::{ClientState, Notification},
    user_data::{ConfigStore, Field},
};

/// Leading status byte of every provisioning response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KitStatus {
    Success,
    UnknownCommand,
    InvalidParams,
    NoDevice,
}

impl KitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::UnknownCommand => 0xC0,
            Self::InvalidParams => 0xC3,
            Self::NoDevice => 0xC5,
        }
    }
}

impl From<KitError> for KitStatus {
    fn from(err: KitError) -> Self {
        match err {
            KitError::BadParam | KitError::InvalidConfiguration => Self::InvalidParams,
            _ => Self::NoDevice,
        }
    }
}

/// Parsed `aws:<name>(<hex>,<hex>...)` line.
#[derive(Debug, PartialEq, Eq)]
struct Command {
    name: String,
    args: Vec<Vec<u8>>,
}

fn parse_command(line: &str) -> Result<Command, KitStatus> {
    let line = line.trim();
    let (prefix, rest) = line.split_once(':').ok_or(KitStatus::UnknownCommand)?;
    if !prefix.eq_ignore_ascii_case("aws") {
        return Err(KitStatus::UnknownCommand);
    }

    let (name, args) = match rest.split_once('(') {
        Some((name, tail)) => {
            let inner = tail.strip_suffix(')').ok_or(KitStatus::InvalidParams)?;
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner
                    .split(',')
                    .map(|arg| hex::decode(arg.trim()).map_err(|_| KitStatus::InvalidParams))
                    .collect::<Result<Vec<_>, _>>()?
            };
            (name, args)
        }
        None => (rest, Vec::new()),
    };

    Ok(Command {
        name: name.trim().to_ascii_lowercase(),
        args,
    })
}

fn formatted(status: KitStatus, data: &[u8]) -> String {
    format!("{:02X}({})\n", status.code(), hex::encode_upper(data))
}

fn role_arg(arg: &[u8]) -> Result<CertRole, KitStatus> {
    match arg {
        [byte] => CertRole::from_byte(*byte).ok_or(KitStatus::InvalidParams),
        _ => Err(KitStatus::InvalidParams),
    }
}

fn fixed<const N: usize>(arg: &[u8]) -> Result<[u8; N], KitStatus> {
    arg.try_into().map_err(|_| KitStatus::InvalidParams)
}

/// Host-side provisioning protocol. Each line in produces one hex response
/// line out: the status byte followed by the data in parentheses.
pub struct ProvisioningHandler<S> {
    shared: KitShared<S>,
    store: ConfigStore<S>,
}

impl<S: SecureElement> ProvisioningHandler<S> {
    pub fn new(shared: &KitShared<S>) -> Self {
        Self {
            shared: shared.clone(),
            store: ConfigStore::new(shared.element.clone()),
        }
    }

    pub fn handle_line(&mut self, line: &str) -> String {
        match parse_command(line).and_then(|command| self.execute(&command)) {
            Ok(data) => formatted(KitStatus::Success, &data),
            Err(status) => {
                debug!("provisioning command `{}` failed: {status:?}", line.trim());
                formatted(status, &[])
            }
        }
    }

    fn execute(&mut self, command: &Command) -> Result<Vec<u8>, KitStatus> {
        let args = command.args.as_slice();
        match (command.name.as_str(), args) {
            ("sw", [ssid, psk]) => {
                self.store.write_entry(Field::WifiSsid, ssid)?;
                self.store.write_entry(Field::WifiPsk, psk)?;
                info!("wifi credentials stored");
                self.notify(Notification::RunMqttClient);
                Ok(Vec::new())
            }
            ("sh", [host, thing]) => {
                let thing_name = std::str::from_utf8(thing).map_err(|_| KitStatus::InvalidParams)?;
                shadow_delta_topic(thing_name)?;
                self.store.write_entry(Field::BrokerHost, host)?;
                self.store.write_entry(Field::ThingName, thing)?;
                info!("broker host and thing `{thing_name}` stored");
                Ok(Vec::new())
            }
            ("sc", [role, compressed]) => {
                let role = role_arg(role)?;
                let compressed: [u8; COMPRESSED_CERT_LEN] = fixed(compressed)?;
                lock(&self.shared.element).write_slot(role.compressed_slot(), 0, &compressed)?;
                info!("{} certificate stored", role.as_str());
                Ok(Vec::new())
            }
            ("i", [signer_key]) => {
                let signer_key: PublicKey = fixed(signer_key)?;
                lock(&self.shared.element).write_slot(Slot::SignerPublicKey, 0, &signer_key)?;
                info!("signer public key stored");
                if self.shared.client_state.get() == ClientState::MqttWaitMessage {
                    self.notify(Notification::QuitMqttClient);
                }
                Ok(Vec::new())
            }
            ("g", [role]) => {
                let role = role_arg(role)?;
                let mut compressed = [0u8; COMPRESSED_CERT_LEN];
                lock(&self.shared.element).read_slot(role.compressed_slot(), 0, &mut compressed)?;
                Ok(compressed.to_vec())
            }
            ("gr", []) => {
                let mut key = [0u8; PUBLIC_KEY_LEN];
                lock(&self.shared.element).read_slot(Slot::SignerPublicKey, 0, &mut key)?;
                Ok(key.to_vec())
            }
            ("p", [role]) => {
                let role = role_arg(role)?;
                let key = lock(&self.shared.element).public_key(role.public_key_slot())?;
                Ok(key.to_vec())
            }
            ("si", [digest]) => {
                let digest: Digest = fixed(digest)?;
                let signature = lock(&self.shared.element).sign(Slot::DeviceKey, &digest)?;
                Ok(signature.to_vec())
            }
            ("reset", []) => {
                warn!("factory reset requested over provisioning");
                self.notify(Notification::ResetUserData);
                Ok(Vec::new())
            }
            ("sw" | "sh" | "sc" | "i" | "g" | "gr" | "p" | "si" | "reset", _) => {
                Err(KitStatus::InvalidParams)
            }
            _ => Err(KitStatus::UnknownCommand),
        }
    }

    fn notify(&self, notification: Notification) {
        if let Some(replaced) = self.shared.notifications.send_replace(Some(notification)) {
            debug!("{replaced:?} replaced by {notification:?}");
        }
    }
}
