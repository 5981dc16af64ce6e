use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use tokio::sync::watch;

use crate::{
    element::SharedElement,
    types::{ClientState, DeviceState, ErrorState, Notification},
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single active exception. Written by the main and client machines,
/// read by the exception indicator.
#[derive(Debug, Clone, Default)]
pub struct ErrorCell(Arc<AtomicU8>);

impl ErrorCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ErrorState {
        ErrorState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Returns true when the stored value changed.
    pub fn set(&self, state: ErrorState) -> bool {
        self.0.swap(state.to_raw(), Ordering::AcqRel) != state.to_raw()
    }

    pub fn clear(&self) -> bool {
        self.set(ErrorState::None)
    }
}

/// Published client state, read by the button path and provisioning.
#[derive(Debug, Clone)]
pub struct ClientStateCell(Arc<AtomicU8>);

impl Default for ClientStateCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ClientState::InitMqttClient.to_raw())))
    }
}

impl ClientStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ClientState {
        ClientState::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ClientState) {
        self.0.store(state.to_raw(), Ordering::Release);
    }
}

/// Depth-one overwrite slot. `send_replace(Some(..))` posts and returns
/// whatever it displaced; `send_replace(None)` takes.
pub type PendingSlot<T> = Arc<watch::Sender<Option<T>>>;

pub fn pending_slot<T>() -> PendingSlot<T> {
    let (slot, _) = watch::channel(None);
    Arc::new(slot)
}

/// Handles every task holds on to.
pub struct KitShared<S> {
    pub element: SharedElement<S>,
    pub device: Arc<Mutex<DeviceState>>,
    pub errors: ErrorCell,
    pub client_state: ClientStateCell,
    pub notifications: PendingSlot<Notification>,
}

impl<S> KitShared<S> {
    pub fn new(element: SharedElement<S>) -> Self {
        Self {
            element,
            device: Arc::new(Mutex::new(DeviceState::default())),
            errors: ErrorCell::new(),
            client_state: ClientStateCell::new(),
            notifications: pending_slot(),
        }
    }

    pub fn device(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.device)
    }
}

impl<S> Clone for KitShared<S> {
    fn clone(&self) -> Self {
        Self {
            element: Arc::clone(&self.element),
            device: Arc::clone(&self.device),
            errors: self.errors.clone(),
            client_state: self.client_state.clone(),
            notifications: Arc::clone(&self.notifications),
        }
    }
}
