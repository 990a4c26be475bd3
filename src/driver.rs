//! The driver context.
//!
//! [WifiDriver] ties the transport, the correlator, the power save machine and the event
//! dispatcher together. It's driven by three kinds of tasks:
//! - The bus context, which calls [WifiDriver::poll_and_dispatch] for every card interrupt,
//!   either directly from the interrupt handler or through [WifiDriver::run_bus].
//! - The driver loop [WifiDriver::run], which processes command responses and events.
//! - Any number of callers, which send commands and data.

use core::cell::RefCell;

use embassy_sync::{blocking_mutex, mutex::Mutex};
use embassy_time::{with_deadline, with_timeout, Duration, Instant};

use crate::{
    bus::SdioBus,
    command::{
        CommandId, CommandRegistry, CommandResponse, FuncInit, FuncShutdown, GetHwSpec,
        HostCommand, HostSleepCfg, HostSleepConfig, HostSleepResponse, HwSpec, MacAddress,
        MacControl, PowerSaveKind, PowerSaveMode, PowerSaveResponse, ResponseHook, VersionExt,
        VersionString,
    },
    correlator::{encode_command, CommandStats, Correlator, ResponseDisposition},
    event::{DriverEvent, EventDispatcher, EventSubscriber},
    frame::{BssInfo, BUS_HEADER_LEN, COMMAND_HEADER_LEN},
    power::{ArmedModes, LinkActivity, PowerSaveMachine, PowerState, SleepDecision},
    regs::{CONFIGURATION_REG, HOST_POWER_UP},
    sync::{SignalQueue, WakeLock},
    transport::{BusMessage, MessageKind, MessageQueue, PollSummary, Transport, TransportStats},
    DefaultRawMutex, WifiError, WifiResult,
};

/// The amount of response hooks, including the built-in ones.
pub const MAX_RESPONSE_HOOKS: usize = 8;
/// Length of the sleep confirm frame.
const SLEEP_CONFIRM_LEN: usize = BUS_HEADER_LEN + COMMAND_HEADER_LEN + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Runtime configuration of the driver.
pub struct DriverConfig {
    /// How long a caller waits for a response.
    pub command_timeout: Duration,
    /// How long the card may take to wake up.
    pub wake_timeout: Duration,
    /// Consecutive timeouts, after which [DriverEvent::RecoveryRequired] is published.
    pub timeout_recovery_threshold: u32,
    /// How often the card status is polled for every firmware chunk.
    pub card_status_poll_tries: usize,
    /// How often the firmware status is polled after the download.
    pub firmware_ready_poll_tries: usize,
    /// Delay between two polls.
    pub poll_interval: Duration,
    /// The interface used for commands, that aren't bound to one.
    pub default_bss: BssInfo,
}
impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            wake_timeout: Duration::from_secs(1),
            timeout_recovery_threshold: 3,
            card_status_poll_tries: 100,
            firmware_ready_poll_tries: 300,
            poll_interval: Duration::from_millis(1),
            default_bss: BssInfo::default(),
        }
    }
}

/// Information about the adapter, collected from the firmware responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub mac_address: Option<[u8; 6]>,
    pub hw_spec: Option<HwSpec>,
    pub firmware_version: Option<VersionString>,
}

/// A snapshot of all driver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverStats {
    pub commands: CommandStats,
    pub transport: TransportStats,
    pub events_published: u32,
    pub malformed_events: u32,
}

/// Holds a command claim in the power save machine for the duration of a command.
struct CommandClaim<'d, 'a, B: SdioBus> {
    driver: &'d WifiDriver<'a, B>,
}
impl<'d, 'a, B: SdioBus> CommandClaim<'d, 'a, B> {
    fn new(driver: &'d WifiDriver<'a, B>) -> Self {
        driver.power.claim_command();
        Self { driver }
    }
}
impl<B: SdioBus> Drop for CommandClaim<'_, '_, B> {
    fn drop(&mut self) {
        if self.driver.power.release_command() {
            self.driver.retry_deferred_sleep();
        }
    }
}

/// The driver for an SDIO attached WiFi card.
pub struct WifiDriver<'a, B: SdioBus> {
    transport: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Transport<'a, B>>>,
    correlator: Correlator,
    queue: MessageQueue,
    interrupts: SignalQueue,
    wake_lock: WakeLock,
    /// Serializes callers waiting for the link to wake up.
    link_lock: Mutex<DefaultRawMutex, ()>,
    events: EventDispatcher,
    power: PowerSaveMachine,
    registry: CommandRegistry<Self, MAX_RESPONSE_HOOKS>,
    adapter: blocking_mutex::Mutex<DefaultRawMutex, RefCell<AdapterInfo>>,
    config: DriverConfig,
}
impl<'a, B: SdioBus> WifiDriver<'a, B> {
    /// Create the driver from a transport, that was already brought up.
    pub fn new(transport: Transport<'a, B>, config: DriverConfig) -> Self {
        let mut registry = CommandRegistry::new();
        // The registry starts out empty, so the built-in hooks always fit.
        let builtins: [(CommandId, ResponseHook<Self>); 5] = [
            (CommandId::GetHwSpec, Self::on_hw_spec),
            (CommandId::MacAddress, Self::on_mac_address),
            (CommandId::VersionExt, Self::on_version),
            (CommandId::PowerSaveModeEnh, Self::on_power_save),
            (CommandId::HostSleepCfgEnh, Self::on_host_sleep),
        ];
        for (id, hook) in builtins {
            let _ = registry.register(id, hook);
        }
        Self {
            transport: blocking_mutex::Mutex::new(RefCell::new(transport)),
            correlator: Correlator::new(config.command_timeout),
            queue: MessageQueue::new(),
            interrupts: SignalQueue::new(),
            wake_lock: WakeLock::new(),
            link_lock: Mutex::new(()),
            events: EventDispatcher::new(),
            power: PowerSaveMachine::new(config.command_timeout),
            registry,
            adapter: blocking_mutex::Mutex::new(RefCell::new(AdapterInfo::default())),
            config,
        }
    }
    /// Register a hook, that's called with every successful response to `id`.
    ///
    /// This replaces the built-in hook for that command, if there is one.
    pub fn register_response_hook(
        &mut self,
        id: CommandId,
        hook: ResponseHook<Self>,
    ) -> WifiResult<()> {
        self.registry.register(id, hook)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
    /// Run `f` with the transport locked.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut Transport<'a, B>) -> R) -> R {
        self.transport
            .lock(|transport| f(&mut transport.borrow_mut()))
    }
    /// Run `f` with exclusive access to the bus.
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.with_transport(|transport| f(transport.bus_mut()))
    }
    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }
    pub fn armed_power_save_modes(&self) -> ArmedModes {
        self.power.armed_modes()
    }
    pub fn host_sleep_configured(&self) -> bool {
        self.power.host_sleep_configured()
    }
    pub fn host_sleep_activated(&self) -> bool {
        self.power.host_sleep_activated()
    }
    /// Subscribe to [DriverEvent]s.
    pub fn subscribe(&self) -> WifiResult<EventSubscriber<'_>> {
        self.events.subscribe()
    }
    /// The wake lock held by the driver loop, while it processes a message.
    pub fn wake_lock(&self) -> &WakeLock {
        &self.wake_lock
    }
    pub fn stats(&self) -> DriverStats {
        DriverStats {
            commands: self.correlator.stats(),
            transport: self.with_transport(|transport| transport.stats()),
            events_published: self.events.published(),
            malformed_events: self.events.malformed(),
        }
    }
    pub fn adapter_info(&self) -> AdapterInfo {
        self.adapter.lock(|adapter| *adapter.borrow())
    }
    pub fn mac_address(&self) -> Option<[u8; 6]> {
        self.adapter_info().mac_address
    }
    pub fn hw_spec(&self) -> Option<HwSpec> {
        self.adapter_info().hw_spec
    }
    pub fn firmware_version(&self) -> Option<VersionString> {
        self.adapter_info().firmware_version
    }

    fn on_hw_spec(&self, response: &CommandResponse<'_>) {
        let Ok(hw_spec) = GetHwSpec.decode(response) else {
            warn!("Failed to decode the hardware spec.");
            return;
        };
        self.with_transport(|transport| transport.set_mp_end_port(hw_spec.mp_end_port));
        self.adapter
            .lock(|adapter| adapter.borrow_mut().hw_spec = Some(hw_spec));
    }
    fn on_mac_address(&self, response: &CommandResponse<'_>) {
        if let Ok(mac_address) = MacAddress::Get.decode(response) {
            self.adapter
                .lock(|adapter| adapter.borrow_mut().mac_address = Some(mac_address));
        }
    }
    fn on_version(&self, response: &CommandResponse<'_>) {
        if let Ok(version) = VersionExt::default().decode(response) {
            if let Some(version) = version.as_str() {
                info!("Firmware version: {}", version);
            }
            self.adapter
                .lock(|adapter| adapter.borrow_mut().firmware_version = Some(version));
        }
    }
    fn on_power_save(&self, response: &CommandResponse<'_>) {
        if let Ok(response) = PowerSaveResponse::parse(response) {
            self.power.on_power_save_response(&response, &self.events);
        }
    }
    fn on_host_sleep(&self, response: &CommandResponse<'_>) {
        if let Ok(response) = HostSleepResponse::parse(response) {
            self.power.on_host_sleep_response(&response, &self.events);
        }
    }

    /// Notify the bus task of a card interrupt. This is safe to call from an interrupt handler.
    pub fn on_interrupt(&self) {
        self.interrupts.put();
    }
    /// Process one card interrupt.
    ///
    /// Any interrupt means the card is awake.
    pub fn poll_and_dispatch(&self) -> PollSummary {
        let summary = self.with_transport(|transport| transport.poll_and_dispatch(&self.queue));
        if summary.interrupt {
            self.link_woke();
        }
        summary
    }
    /// The bus task. Polls the card for every interrupt signalled through
    /// [WifiDriver::on_interrupt].
    pub async fn run_bus(&self) -> ! {
        loop {
            self.interrupts.next().await;
            self.poll_and_dispatch();
        }
    }
    /// The driver loop.
    ///
    /// This has to run for commands to complete.
    pub async fn run(&self) -> ! {
        loop {
            let message = self.queue.receive().await;
            let _wake_lock = self.wake_lock.acquire();
            self.handle_message(&message);
            // Sleep may have been deferred for the messages, that were just processed.
            if self.queue.is_empty() && self.power.sleep_retry_due() {
                self.retry_deferred_sleep();
            }
        }
    }
    fn handle_message(&self, message: &BusMessage) {
        match message.kind {
            MessageKind::CommandResponse => {
                let _ = self.handle_response(message.frame());
            }
            MessageKind::Event => self.handle_event(message.frame()),
        }
    }
    /// Route a response to the power save machine or the correlator.
    ///
    /// Returns `None`, if the response wasn't handed to the correlator.
    fn handle_response(&self, frame: &[u8]) -> Option<ResponseDisposition> {
        if let Ok(response) = CommandResponse::parse(frame) {
            let header = response.header;
            if header.command_id() == CommandId::FuncShutdown.into_bits() {
                debug!("Dropping response to shutdown.");
                return None;
            }
            if header.command_id() == CommandId::PowerSaveModeEnh.into_bits()
                && self.power.is_sleep_confirm(header.sequence_number)
            {
                self.power
                    .on_sleep_confirm_response(header.result, &self.events);
                return None;
            }
        }
        Some(self.correlator.complete(frame, |response| {
            if response.header.result != 0 {
                return;
            }
            if let Some(hook) = self.registry.lookup(response.header.command_id()) {
                hook(self, response);
            }
        }))
    }
    fn handle_event(&self, frame: &[u8]) {
        match self.events.dispatch(frame) {
            Some(DriverEvent::PsSleep) => {
                if let Err(err) = self.check_sleep_condition() {
                    warn!("Sending sleep confirm failed: {:?}", err);
                }
            }
            Some(DriverEvent::PsAwake) => self.link_woke(),
            _ => {}
        }
    }
    /// Mark the link as awake and clear a pending wake request.
    fn link_woke(&self) {
        self.power.on_awake(&self.events);
        if self.power.take_wake_request()
            && self
                .with_transport(|transport| transport.write_register(CONFIGURATION_REG, 0))
                .is_err()
        {
            warn!("Failed to clear the wake up request.");
        }
    }
    /// Request a wake up from the card, unless that already happened.
    fn request_wake(&self) -> WifiResult<()> {
        if self.power.request_wake() {
            debug!("Waking up the card.");
            self.with_transport(|transport| {
                transport.write_register(CONFIGURATION_REG, HOST_POWER_UP)
            })
            .inspect_err(|_| {
                self.power.take_wake_request();
            })?;
        }
        Ok(())
    }
    /// Wait until the link is awake, waking the card if necessary.
    async fn wait_until_awake(&self) -> WifiResult<()> {
        let _link_guard = self.link_lock.lock().await;
        loop {
            self.power.reset_change_signal();
            match self.power.state() {
                PowerState::Awake => return Ok(()),
                PowerState::Asleep => {
                    self.request_wake()?;
                    if with_timeout(self.config.wake_timeout, self.power.wait_for_change())
                        .await
                        .is_err()
                    {
                        warn!("Card didn't wake up in time.");
                        // The next caller writes the wake up request again.
                        self.power.take_wake_request();
                        return Err(WifiError::WakeTimeout);
                    }
                }
                // The sleep confirm response decides, where this goes, unless it never
                // arrives.
                PowerState::SleepRequested => match self.power.sleep_confirm_deadline() {
                    Some(deadline) => {
                        if with_deadline(deadline, self.power.wait_for_change())
                            .await
                            .is_err()
                        {
                            self.power.expire_sleep_confirm(Instant::now(), &self.events);
                        }
                    }
                    None => {
                        self.power.wait_for_change().await;
                    }
                },
            }
        }
    }
    fn retry_deferred_sleep(&self) {
        debug!("Retrying deferred sleep confirm.");
        if self.check_sleep_condition().is_err() {
            warn!("Deferred sleep confirm failed.");
        }
    }
    /// Send the sleep confirm, if a power save mode is armed and the link is idle.
    ///
    /// If the link is busy, the check is repeated once the current command completed.
    pub fn check_sleep_condition(&self) -> WifiResult<SleepDecision> {
        self.with_transport(|transport| {
            let activity = LinkActivity {
                rx_pending: transport.read_bitmap() != 0
                    || !self.queue.is_empty()
                    || self.interrupts.is_pending(),
                command_port_busy: transport.command_port_busy(),
                commands_queued: self.correlator.callers() != 0,
            };
            let decision = self.power.begin_sleep(activity, || {
                self.correlator
                    .next_sequence_number(self.config.default_bss)
                    .into_bits()
            });
            if let SleepDecision::Confirm(sequence_number) = decision {
                let mut frame = [0u8; SLEEP_CONFIRM_LEN];
                let written =
                    encode_command(&PowerSaveMode::SleepConfirm, sequence_number, &mut frame)
                        .and_then(|length| transport.write_command(&frame[..length]));
                if let Err(err) = written {
                    self.power.abort_sleep();
                    return Err(err);
                }
                debug!("Sent sleep confirm.");
            }
            Ok(decision)
        })
    }

    /// Send `command` to the firmware and wait for the response.
    ///
    /// The link is woken up first, if it's asleep. Dropping the returned future cancels the
    /// command.
    pub async fn send_command<C: HostCommand + ?Sized>(
        &self,
        command: &mut C,
        bss: BssInfo,
    ) -> WifiResult<C::Response> {
        let _claim = CommandClaim::new(self);
        self.wait_until_awake().await?;
        let result = self
            .correlator
            .exchange(command, bss, |frame| {
                self.with_transport(|transport| transport.write_command(frame))
            })
            .await;
        if result.is_err() {
            let consecutive_timeouts = self.correlator.consecutive_timeouts();
            if consecutive_timeouts != 0
                && consecutive_timeouts == self.config.timeout_recovery_threshold
            {
                error!(
                    "{} consecutive command timeouts, recovery required.",
                    consecutive_timeouts
                );
                self.events.publish(DriverEvent::RecoveryRequired {
                    consecutive_timeouts,
                });
            }
        }
        result
    }
    /// Cancel the command in flight.
    ///
    /// Returns `false`, if there was none.
    pub fn cancel_command(&self) -> bool {
        self.correlator.cancel()
    }
    /// Transmit a data frame.
    ///
    /// This never waits. If the link is asleep, a wake up is requested and
    /// [WifiError::LinkAsleep] returned. The same happens while a sleep confirm is in flight,
    /// unless it already expired.
    pub fn write_data(&self, frame: &[u8], bss: BssInfo) -> WifiResult<u8> {
        match self.power.state() {
            PowerState::Awake => {}
            PowerState::Asleep => {
                self.request_wake()?;
                return Err(WifiError::LinkAsleep);
            }
            PowerState::SleepRequested => {
                if !self.power.expire_sleep_confirm(Instant::now(), &self.events) {
                    return Err(WifiError::LinkAsleep);
                }
            }
        }
        self.with_transport(|transport| transport.write_data(frame, bss))
    }

    /// Run the bring up command sequence and return what was learned about the adapter.
    pub async fn initialize_firmware(&self) -> WifiResult<AdapterInfo> {
        let bss = self.config.default_bss;
        trace!("Initializing firmware.");
        self.send_command(&mut FuncInit, bss).await?;
        self.send_command(&mut GetHwSpec, bss).await?;
        self.send_command(&mut VersionExt::default(), bss).await?;
        self.send_command(&mut MacAddress::Get, bss).await?;
        self.send_command(&mut MacControl::default(), bss).await?;
        Ok(self.adapter_info())
    }
    /// Shut the firmware down.
    ///
    /// Messages still queued for the driver loop and interrupts, that weren't polled yet, are
    /// dropped.
    pub async fn shutdown(&self) -> WifiResult<()> {
        self.send_command(&mut FuncShutdown, self.config.default_bss)
            .await?;
        while self.queue.try_receive().is_ok() {}
        self.interrupts.reset();
        Ok(())
    }

    async fn set_power_save(&self, mut mode: PowerSaveMode) -> WifiResult<()> {
        self.send_command(&mut mode, self.config.default_bss)
            .await
            .map(|_| ())
    }
    pub async fn enter_ieee_ps(&self) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::Enable(PowerSaveKind::Ieee))
            .await
    }
    pub async fn exit_ieee_ps(&self) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::Disable(PowerSaveKind::Ieee))
            .await
    }
    /// Let the card enter deep sleep, once it was idle for `idle_timeout_ms`.
    pub async fn enter_deep_sleep(&self, idle_timeout_ms: u16) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::EnableDeepSleep { idle_timeout_ms })
            .await
    }
    pub async fn exit_deep_sleep(&self) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::Disable(PowerSaveKind::DeepSleep))
            .await
    }
    pub async fn enter_uap_inactivity_ps(&self) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::Enable(PowerSaveKind::UapInactivity))
            .await
    }
    pub async fn exit_uap_inactivity_ps(&self) -> WifiResult<()> {
        self.set_power_save(PowerSaveMode::Disable(PowerSaveKind::UapInactivity))
            .await
    }
    pub async fn configure_host_sleep(&self, config: HostSleepConfig) -> WifiResult<()> {
        self.send_command(&mut HostSleepCfg::Configure(config), self.config.default_bss)
            .await
            .map(|_| ())
    }
    pub async fn cancel_host_sleep(&self) -> WifiResult<()> {
        self.send_command(&mut HostSleepCfg::Cancel, self.config.default_bss)
            .await
            .map(|_| ())
    }
    pub async fn activate_host_sleep(&self) -> WifiResult<()> {
        self.send_command(&mut HostSleepCfg::Activate, self.config.default_bss)
            .await
            .map(|_| ())
    }
}
