pub mod certs;
pub mod client;
pub mod config;
pub mod element;
pub mod error;
pub mod kit;
pub mod network;
pub mod provisioning;
pub mod session;
pub mod shadow;
pub mod shared;
pub mod timer;
pub mod topics;
pub mod types;
pub mod user;
pub mod user_data;

pub use certs::{CertDefinition, CertificateBuilder, CertificateBundle};
pub use client::{ClientCommand, ClientMachine};
pub use config::KitConfig;
pub use element::{CertRole, SecureElement, SharedElement, Slot};
pub use error::{KitError, MqttOp};
pub use kit::MainMachine;
pub use network::{ConnectivityManager, LinkEvent, Radio};
pub use provisioning::ProvisioningHandler;
pub use session::{
    ConnectOptions, ElementCrypto, Endpoint, HandshakeCrypto, InboundMessage, MqttLink,
    SessionController, SessionProfile, Transport,
};
pub use shared::{pending_slot, ClientStateCell, ErrorCell, KitShared, PendingSlot};
pub use timer::{monotonic_ms, Clock, Countdown, MonotonicClock};
pub use topics::*;
pub use types::{ClientState, DeviceState, ErrorState, KitAction, MainState, Notification};
pub use user::{ButtonDebouncer, UserTask};
pub use user_data::{ConfigStore, UserConfiguration};
