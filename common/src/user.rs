use tracing::{debug, info, warn};

use crate::{
    config::KitConfig,
    shared::{ClientStateCell, KitShared, PendingSlot},
    timer::Countdown,
    types::{ClientState, ErrorState, KitAction, Notification, BUTTON_COUNT},
};

/// Button entry point. Runs in the press handler, so it only filters and
/// posts; the user task does the rest.
pub struct ButtonDebouncer {
    client_state: ClientStateCell,
    presses: PendingSlot<usize>,
    debounce_ms: u64,
    last: Option<(usize, u64)>,
}

impl ButtonDebouncer {
    pub fn new(client_state: ClientStateCell, presses: PendingSlot<usize>, config: &KitConfig) -> Self {
        Self {
            client_state,
            presses,
            debounce_ms: config.button_debounce_ms,
            last: None,
        }
    }

    /// Returns true when the press was queued.
    pub fn on_press(&mut self, index: usize, now_ms: u64) -> bool {
        if index >= BUTTON_COUNT || self.client_state.get() != ClientState::MqttWaitMessage {
            return false;
        }
        if let Some((last_index, at_ms)) = self.last {
            if last_index == index && now_ms.saturating_sub(at_ms) < self.debounce_ms {
                return false;
            }
        }
        self.last = Some((index, now_ms));
        if let Some(dropped) = self.presses.send_replace(Some(index)) {
            debug!("button{} press overwritten before it was handled", dropped + 1);
        }
        true
    }
}

/// LEDs and buttons: forwards queued presses, watches SW0 for the
/// factory-reset hold and blinks the LED of the active exception.
pub struct UserTask<S> {
    shared: KitShared<S>,
    presses: PendingSlot<usize>,
    reset_hold_ms: u64,
    blink_ms: u64,

    hold_started_ms: Option<u64>,
    reset_sent: bool,

    shown: ErrorState,
    blink: Countdown,
    blink_on: bool,
}

impl<S> UserTask<S> {
    pub fn new(shared: &KitShared<S>, presses: PendingSlot<usize>, config: &KitConfig) -> Self {
        Self {
            shared: shared.clone(),
            presses,
            reset_hold_ms: config.reset_hold_ms,
            blink_ms: config.exception_blink_ms,
            hold_started_ms: None,
            reset_sent: false,
            shown: ErrorState::None,
            blink: Countdown::new(),
            blink_on: false,
        }
    }

    pub fn tick(&mut self, now_ms: u64, sw0_held: bool) -> Vec<KitAction> {
        let mut actions = Vec::new();

        if let Some(index) = self.presses.send_replace(None) {
            if let Some(pressed) = self.shared.device().button.is_pressed.get_mut(index) {
                *pressed = true;
            }
        }

        self.watch_reset_hold(now_ms, sw0_held, &mut actions);
        self.indicate_exception(now_ms, &mut actions);
        actions
    }

    fn watch_reset_hold(&mut self, now_ms: u64, held: bool, actions: &mut Vec<KitAction>) {
        if !held {
            self.hold_started_ms = None;
            self.reset_sent = false;
            return;
        }

        let started = *self.hold_started_ms.get_or_insert(now_ms);
        if !self.reset_sent && now_ms.saturating_sub(started) >= self.reset_hold_ms {
            info!("reset button held for {} ms; requesting factory reset", self.reset_hold_ms);
            actions.push(KitAction::AllLedsOn);
            let replaced = self
                .shared
                .notifications
                .send_replace(Some(Notification::ResetUserData));
            if replaced.is_some() {
                warn!("pending notification replaced by factory reset");
            }
            self.reset_sent = true;
        }
    }

    fn indicate_exception(&mut self, now_ms: u64, actions: &mut Vec<KitAction>) {
        let current = self.shared.errors.get();
        if current != self.shown {
            if let Some(led) = self.shown.indicator_led() {
                let on = self.shared.device().led.state[led];
                actions.push(KitAction::SetLed(led, on));
            }
            if current != ErrorState::None {
                info!("exception {}", current.as_str());
            }
            self.shown = current;
            self.blink_on = false;
            self.blink.stop();
        }

        let Some(led) = self.shown.indicator_led() else {
            return;
        };
        if self.blink.expired(now_ms) {
            self.blink_on = !self.blink_on;
            actions.push(KitAction::SetLed(led, self.blink_on));
            self.blink.start(now_ms, self.blink_ms);
        }
    }
}
