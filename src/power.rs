//! The power save state machine.
//!
//! The firmware asks for permission to sleep with a sleep event. If a power save mode is armed
//! and the link is idle, the driver answers with a sleep confirm and the link is asleep once
//! the firmware acknowledged it. Any activity of the card, or a command needing the link, wakes
//! it up again.

use core::cell::RefCell;

use bitfield_struct::bitfield;
use embassy_sync::{blocking_mutex, signal::Signal};
use embassy_time::{Duration, Instant};

use crate::{
    command::{
        HostSleepAction, HostSleepResponse, PowerSaveAction, PowerSaveKind, PowerSaveResponse,
    },
    event::{DriverEvent, EventDispatcher},
    DefaultRawMutex,
};

/// The power state of the link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    #[default]
    Awake,
    /// A sleep confirm was sent and the firmware hasn't answered yet.
    SleepRequested,
    Asleep,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
/// The power save modes armed in the firmware.
pub struct ArmedModes {
    pub ieee: bool,
    pub deep_sleep: bool,
    pub uap_inactivity: bool,
    #[bits(5)]
    pub __: u8,
}
impl ArmedModes {
    fn set(&mut self, kind: PowerSaveKind, armed: bool) {
        match kind {
            PowerSaveKind::Ieee => self.set_ieee(armed),
            PowerSaveKind::DeepSleep => self.set_deep_sleep(armed),
            PowerSaveKind::UapInactivity => self.set_uap_inactivity(armed),
        }
    }
    /// Arm or disarm every mode set in a power save bitmap.
    fn apply_bitmap(&mut self, bitmap: u16, armed: bool) {
        for kind in [
            PowerSaveKind::Ieee,
            PowerSaveKind::DeepSleep,
            PowerSaveKind::UapInactivity,
        ] {
            if bitmap & kind.bitmap() != 0 {
                self.set(kind, armed);
            }
        }
    }
    pub fn any(&self) -> bool {
        self.ieee() || self.deep_sleep() || self.uap_inactivity()
    }
}

/// What keeps the link from sleeping, besides a command in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkActivity {
    /// Frames are waiting to be read from the card or processed by the driver loop.
    pub rx_pending: bool,
    /// The firmware hasn't released the command port yet.
    pub command_port_busy: bool,
    /// Callers are waiting for the command lock.
    pub commands_queued: bool,
}
impl LinkActivity {
    pub const fn is_idle(&self) -> bool {
        !(self.rx_pending || self.command_port_busy || self.commands_queued)
    }
}

/// The outcome of [PowerSaveMachine::begin_sleep].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepDecision {
    /// The sleep confirm with the contained sequence number must be sent now.
    Confirm(u16),
    /// The link is busy. The check is repeated, once the current command completed.
    Deferred,
    /// No power save mode is armed.
    NotArmed,
    /// The link isn't awake.
    NotAwake,
}

struct PowerSaveState {
    state: PowerState,
    /// Commands claimed by callers, that haven't completed yet.
    pending_commands: u8,
    armed: ArmedModes,
    sleep_deferred: bool,
    sleep_confirm_sequence: Option<u16>,
    /// The sleep confirm counts as lost after this.
    sleep_confirm_deadline: Option<Instant>,
    /// The firmware reports a bogus bitmap in the sleep confirm response, so the mode is
    /// taken from the last enter or exit response instead.
    last_mode: Option<PowerSaveKind>,
    host_sleep_configured: bool,
    host_sleep_activated: bool,
    wake_requested: bool,
}

impl PowerSaveState {
    fn sleep_retry_due(&self) -> bool {
        self.pending_commands == 0
            && self.sleep_deferred
            && self.armed.any()
            && self.state == PowerState::Awake
    }
}

/// Tracks the power state and decides, when the link may sleep.
pub struct PowerSaveMachine {
    inner: blocking_mutex::Mutex<DefaultRawMutex, RefCell<PowerSaveState>>,
    state_changed: Signal<DefaultRawMutex, PowerState>,
    sleep_confirm_timeout: Duration,
}
impl PowerSaveMachine {
    /// Create the machine. A sleep confirm, that isn't answered within `sleep_confirm_timeout`,
    /// is treated like a refused one.
    pub const fn new(sleep_confirm_timeout: Duration) -> Self {
        Self {
            inner: blocking_mutex::Mutex::new(RefCell::new(PowerSaveState {
                state: PowerState::Awake,
                pending_commands: 0,
                armed: ArmedModes::new(),
                sleep_deferred: false,
                sleep_confirm_sequence: None,
                sleep_confirm_deadline: None,
                last_mode: None,
                host_sleep_configured: false,
                host_sleep_activated: false,
                wake_requested: false,
            })),
            state_changed: Signal::new(),
            sleep_confirm_timeout,
        }
    }
    fn with<R>(&self, f: impl FnOnce(&mut PowerSaveState) -> R) -> R {
        self.inner.lock(|inner| f(&mut inner.borrow_mut()))
    }
    fn transition(&self, inner: &mut PowerSaveState, state: PowerState) {
        if inner.state != state {
            debug!("Power state {:?} -> {:?}", inner.state, state);
            inner.state = state;
            self.state_changed.signal(state);
        }
    }

    pub fn state(&self) -> PowerState {
        self.with(|inner| inner.state)
    }
    pub fn armed_modes(&self) -> ArmedModes {
        self.with(|inner| inner.armed)
    }
    pub fn host_sleep_configured(&self) -> bool {
        self.with(|inner| inner.host_sleep_configured)
    }
    pub fn host_sleep_activated(&self) -> bool {
        self.with(|inner| inner.host_sleep_activated)
    }
    pub fn sleep_deferred(&self) -> bool {
        self.with(|inner| inner.sleep_deferred)
    }

    /// Mark a command as in flight. The link won't be put to sleep until it's released.
    pub fn claim_command(&self) -> PowerState {
        self.with(|inner| {
            inner.pending_commands = inner.pending_commands.saturating_add(1);
            inner.state
        })
    }
    /// Release a command claim.
    ///
    /// Returns `true`, if this was the last claim and a sleep request was deferred, so the
    /// check should be repeated.
    pub fn release_command(&self) -> bool {
        self.with(|inner| {
            inner.pending_commands = inner.pending_commands.saturating_sub(1);
            inner.sleep_retry_due()
        })
    }
    /// Check if a deferred sleep request should be retried now.
    pub fn sleep_retry_due(&self) -> bool {
        self.with(|inner| inner.sleep_retry_due())
    }
    /// Decide, whether a sleep confirm may be sent.
    ///
    /// `allocate_sequence_number` is only called, if the confirm is to be sent.
    pub fn begin_sleep(
        &self,
        activity: LinkActivity,
        allocate_sequence_number: impl FnOnce() -> u16,
    ) -> SleepDecision {
        self.with(|inner| {
            if inner.state != PowerState::Awake {
                return SleepDecision::NotAwake;
            }
            if !inner.armed.any() {
                return SleepDecision::NotArmed;
            }
            if inner.pending_commands != 0 || !activity.is_idle() {
                trace!("Deferring sleep confirm: {:?}", activity);
                inner.sleep_deferred = true;
                return SleepDecision::Deferred;
            }
            inner.sleep_deferred = false;
            let sequence_number = allocate_sequence_number();
            inner.sleep_confirm_sequence = Some(sequence_number);
            inner.sleep_confirm_deadline = Some(Instant::now() + self.sleep_confirm_timeout);
            self.transition(inner, PowerState::SleepRequested);
            SleepDecision::Confirm(sequence_number)
        })
    }
    /// Check if `sequence_number` belongs to the sleep confirm in flight.
    pub fn is_sleep_confirm(&self, sequence_number: u16) -> bool {
        self.with(|inner| {
            inner.state == PowerState::SleepRequested
                && inner.sleep_confirm_sequence == Some(sequence_number)
        })
    }
    /// When the sleep confirm in flight counts as lost.
    pub fn sleep_confirm_deadline(&self) -> Option<Instant> {
        self.with(|inner| {
            if inner.state == PowerState::SleepRequested {
                inner.sleep_confirm_deadline
            } else {
                None
            }
        })
    }
    /// Give up on a sleep confirm, that wasn't answered before its deadline.
    ///
    /// The link is awake again afterwards. Returns `true`, if the confirm expired.
    pub fn expire_sleep_confirm(&self, now: Instant, events: &EventDispatcher) -> bool {
        let expired = self.with(|inner| {
            let expired = inner.state == PowerState::SleepRequested
                && inner
                    .sleep_confirm_deadline
                    .is_some_and(|deadline| deadline <= now);
            if expired {
                inner.sleep_confirm_sequence = None;
                inner.sleep_confirm_deadline = None;
                self.transition(inner, PowerState::Awake);
            }
            expired
        });
        if expired {
            warn!("Sleep confirm wasn't answered.");
            events.publish(DriverEvent::SleepConfirmFailed { result: None });
        }
        expired
    }
    /// The sleep confirm couldn't be written.
    pub fn abort_sleep(&self) {
        self.with(|inner| {
            inner.sleep_confirm_sequence = None;
            inner.sleep_confirm_deadline = None;
            if inner.state == PowerState::SleepRequested {
                self.transition(inner, PowerState::Awake);
            }
        })
    }
    /// Process the firmware answer to the sleep confirm.
    pub fn on_sleep_confirm_response(&self, result: u16, events: &EventDispatcher) {
        let (event, host_sleep_activated) = self.with(|inner| {
            if inner.state != PowerState::SleepRequested {
                warn!("Sleep confirm response without a request.");
                return (None, false);
            }
            inner.sleep_confirm_sequence = None;
            inner.sleep_confirm_deadline = None;
            if result != 0 {
                warn!("Firmware refused sleep confirm with {}.", result);
                self.transition(inner, PowerState::Awake);
                return (
                    Some(DriverEvent::SleepConfirmFailed {
                        result: Some(result),
                    }),
                    false,
                );
            }
            self.transition(inner, PowerState::Asleep);
            let host_sleep_activated = inner.host_sleep_configured && !inner.host_sleep_activated;
            if host_sleep_activated {
                inner.host_sleep_activated = true;
            }
            (
                Some(DriverEvent::SleepConfirmed {
                    mode: inner.last_mode,
                }),
                host_sleep_activated,
            )
        });
        if let Some(event) = event {
            events.publish(event);
        }
        if host_sleep_activated {
            events.publish(DriverEvent::HostSleepActivated);
        }
    }
    /// The card showed activity or reported that it's awake.
    ///
    /// Returns `true`, if the link was asleep.
    pub fn on_awake(&self, events: &EventDispatcher) -> bool {
        let (woke, host_sleep_deactivated) = self.with(|inner| {
            if inner.state != PowerState::Asleep {
                return (false, false);
            }
            self.transition(inner, PowerState::Awake);
            (true, core::mem::take(&mut inner.host_sleep_activated))
        });
        if host_sleep_deactivated {
            events.publish(DriverEvent::HostSleepDeactivated);
        }
        woke
    }
    /// Note that a wake up is requested from the card.
    ///
    /// Returns `true`, if the request has to be written to the card, which is only the case
    /// once per sleep period.
    pub fn request_wake(&self) -> bool {
        self.with(|inner| {
            inner.state == PowerState::Asleep
                && !core::mem::replace(&mut inner.wake_requested, true)
        })
    }
    /// Check and clear, if a wake up was requested from the card.
    pub fn take_wake_request(&self) -> bool {
        self.with(|inner| core::mem::take(&mut inner.wake_requested))
    }
    /// Wait for the next state transition.
    pub async fn wait_for_change(&self) -> PowerState {
        self.state_changed.wait().await
    }
    pub fn reset_change_signal(&self) {
        self.state_changed.reset();
    }

    /// Process the response to an enter, exit or query power save command.
    pub fn on_power_save_response(&self, response: &PowerSaveResponse, events: &EventDispatcher) {
        let kind = PowerSaveKind::from_bitmap(response.bitmap);
        let event = self.with(|inner| match response.action {
            PowerSaveAction::EnableAutoPs => {
                inner.armed.apply_bitmap(response.bitmap, true);
                inner.last_mode = kind;
                kind.map(DriverEvent::PowerSaveEnabled)
            }
            PowerSaveAction::DisableAutoPs => {
                inner.armed.apply_bitmap(response.bitmap, false);
                inner.last_mode = kind;
                inner.sleep_deferred = false;
                self.transition(inner, PowerState::Awake);
                kind.map(DriverEvent::PowerSaveDisabled)
            }
            PowerSaveAction::GetPs => {
                inner.armed = ArmedModes::new();
                inner.armed.apply_bitmap(response.bitmap, true);
                None
            }
            _ => None,
        });
        if let Some(event) = event {
            events.publish(event);
        }
    }
    /// Process the response to a host sleep command.
    pub fn on_host_sleep_response(&self, response: &HostSleepResponse, events: &EventDispatcher) {
        let (event, deactivated) = self.with(|inner| match response.action {
            HostSleepAction::Configure if response.is_cancel() => {
                inner.host_sleep_configured = false;
                (
                    DriverEvent::HostSleepCancelled,
                    core::mem::take(&mut inner.host_sleep_activated),
                )
            }
            HostSleepAction::Configure => {
                inner.host_sleep_configured = true;
                (
                    DriverEvent::HostSleepConfigured {
                        conditions: response.conditions.unwrap_or_default(),
                    },
                    false,
                )
            }
            _ => {
                inner.host_sleep_activated = true;
                (DriverEvent::HostSleepActivated, false)
            }
        });
        if deactivated {
            events.publish(DriverEvent::HostSleepDeactivated);
        }
        events.publish(event);
    }
}
impl Default for PowerSaveMachine {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
