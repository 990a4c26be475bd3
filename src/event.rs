//! Asynchronous notifications.
//!
//! Events from the firmware are decoded into [DriverEvent]s and published, together with the
//! events the driver raises itself, on a publish/subscribe channel. Publishing never waits; if
//! a subscriber falls behind, it misses the oldest events.

use embassy_sync::pubsub::{PubSubChannel, Subscriber};
use macro_bits::serializable_enum;
use portable_atomic::{AtomicU32, Ordering};

use crate::{
    command::PowerSaveKind,
    frame::{BssInfo, EventCause, BUS_HEADER_LEN, EVENT_CAUSE_LEN},
    DefaultRawMutex, WifiError, WifiResult,
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// IDs of the events raised by the firmware.
    pub enum EventId: u16 {
        LinkLost => 0x0003,
        Deauthenticated => 0x0008,
        Disassociated => 0x0009,
        PsAwake => 0x000a,
        PsSleep => 0x000b,
        MicErrorMulticast => 0x000d,
        MicErrorUnicast => 0x000e,
        ChannelSwitch => 0x0015,
        PortRelease => 0x002b,
        MicroApStationDeauth => 0x002c,
        MicroApStationAssoc => 0x002d,
        MicroApBssStart => 0x002e,
        AddBa => 0x0033,
        DelBa => 0x0034,
        BaStreamTimeout => 0x0037,
        AmsduAggregationControl => 0x0042,
        MicroApBssIdle => 0x0043,
        MicroApBssActive => 0x0044,
        HostSleepActivationRequest => 0x0047,
        ChannelSwitchAnnouncement => 0x0050
    }
}

const OPAQUE_PAYLOAD_LEN: usize = 32;

/// An event payload, which is passed on without being decoded.
///
/// Payloads longer than the internal buffer are truncated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpaquePayload {
    len: u8,
    bytes: [u8; OPAQUE_PAYLOAD_LEN],
}
impl OpaquePayload {
    pub fn new(payload: &[u8]) -> Self {
        let len = payload.len().min(OPAQUE_PAYLOAD_LEN);
        let mut bytes = [0u8; OPAQUE_PAYLOAD_LEN];
        bytes[..len].copy_from_slice(&payload[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Which block ack event was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockAckEvent {
    Add,
    Delete,
    StreamTimeout,
}

/// Something the driver or the firmware wants the application to know about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverEvent {
    LinkLost {
        bss: BssInfo,
    },
    /// Zero as the reason means, the station left on its own.
    Deauthenticated {
        bss: BssInfo,
        reason: u16,
    },
    Disassociated {
        bss: BssInfo,
        reason: u16,
    },
    /// The data port was opened, after authentication completed.
    PortReleased {
        bss: BssInfo,
    },
    /// The firmware is awake.
    PsAwake,
    /// The firmware would like to sleep.
    PsSleep,
    MicError {
        bss: BssInfo,
        multicast: bool,
    },
    /// The firmware asks for host sleep to be activated.
    HostSleepActivationRequest,
    BlockAck {
        bss: BssInfo,
        kind: BlockAckEvent,
        payload: OpaquePayload,
    },
    AmsduAggregationControl {
        bss: BssInfo,
        payload: OpaquePayload,
    },
    ChannelSwitchAnnouncement {
        bss: BssInfo,
    },
    StationAssociated {
        bss: BssInfo,
        address: [u8; 6],
    },
    StationDeauthenticated {
        bss: BssInfo,
        address: [u8; 6],
        reason: u16,
    },
    BssStarted {
        bss: BssInfo,
    },
    BssIdle {
        bss: BssInfo,
    },
    BssActive {
        bss: BssInfo,
    },

    /// The firmware acknowledged the sleep confirm and is now asleep.
    SleepConfirmed {
        mode: Option<PowerSaveKind>,
    },
    /// The firmware refused the sleep confirm with `result`, or never answered it.
    SleepConfirmFailed {
        result: Option<u16>,
    },
    PowerSaveEnabled(PowerSaveKind),
    PowerSaveDisabled(PowerSaveKind),
    /// Host sleep was configured with the raw conditions.
    HostSleepConfigured {
        conditions: u32,
    },
    HostSleepCancelled,
    HostSleepActivated,
    HostSleepDeactivated,
    /// Too many commands in a row timed out. The card should be reset.
    RecoveryRequired {
        consecutive_timeouts: u32,
    },
    Unknown {
        id: u16,
        bss: BssInfo,
    },
}

/// Little endian field of an event payload, or zero if the payload is too short.
fn payload_u16(payload: &[u8], offset: usize) -> u16 {
    payload
        .get(offset..offset + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
        .unwrap_or_default()
}
fn payload_address(payload: &[u8], offset: usize) -> WifiResult<[u8; 6]> {
    let mut address = [0u8; 6];
    address.copy_from_slice(
        payload
            .get(offset..offset + 6)
            .ok_or(WifiError::InvalidResponse)?,
    );
    Ok(address)
}

impl DriverEvent {
    /// Decode an event frame, starting at the bus header.
    pub fn decode(frame: &[u8]) -> WifiResult<Self> {
        let cause = frame
            .get(BUS_HEADER_LEN..BUS_HEADER_LEN + EVENT_CAUSE_LEN)
            .ok_or(WifiError::BufferTooSmall)?;
        let cause = EventCause::from_bits(u32::from_le_bytes([
            cause[0], cause[1], cause[2], cause[3],
        ]));
        let payload = &frame[BUS_HEADER_LEN + EVENT_CAUSE_LEN..];
        let bss = cause.bss();
        Ok(match EventId::from_bits(cause.id()) {
            EventId::LinkLost => Self::LinkLost { bss },
            EventId::Deauthenticated => Self::Deauthenticated {
                bss,
                reason: payload_u16(payload, 0),
            },
            EventId::Disassociated => Self::Disassociated {
                bss,
                reason: payload_u16(payload, 0),
            },
            EventId::PortRelease => Self::PortReleased { bss },
            EventId::PsAwake => Self::PsAwake,
            EventId::PsSleep => Self::PsSleep,
            EventId::MicErrorMulticast => Self::MicError {
                bss,
                multicast: true,
            },
            EventId::MicErrorUnicast => Self::MicError {
                bss,
                multicast: false,
            },
            EventId::HostSleepActivationRequest => Self::HostSleepActivationRequest,
            EventId::AddBa => Self::BlockAck {
                bss,
                kind: BlockAckEvent::Add,
                payload: OpaquePayload::new(payload),
            },
            EventId::DelBa => Self::BlockAck {
                bss,
                kind: BlockAckEvent::Delete,
                payload: OpaquePayload::new(payload),
            },
            EventId::BaStreamTimeout => Self::BlockAck {
                bss,
                kind: BlockAckEvent::StreamTimeout,
                payload: OpaquePayload::new(payload),
            },
            EventId::AmsduAggregationControl => Self::AmsduAggregationControl {
                bss,
                payload: OpaquePayload::new(payload),
            },
            EventId::ChannelSwitchAnnouncement | EventId::ChannelSwitch => {
                Self::ChannelSwitchAnnouncement { bss }
            }
            EventId::MicroApStationAssoc => Self::StationAssociated {
                bss,
                address: payload_address(payload, 2)?,
            },
            EventId::MicroApStationDeauth => Self::StationDeauthenticated {
                bss,
                address: payload_address(payload, 2)?,
                reason: payload_u16(payload, 0),
            },
            EventId::MicroApBssStart => Self::BssStarted { bss },
            EventId::MicroApBssIdle => Self::BssIdle { bss },
            EventId::MicroApBssActive => Self::BssActive { bss },
            id => Self::Unknown {
                id: id.into_bits(),
                bss,
            },
        })
    }
}

pub const EVENT_QUEUE_DEPTH: usize = 8;
pub const MAX_EVENT_SUBSCRIBERS: usize = 4;
const MAX_EVENT_PUBLISHERS: usize = 1;

pub type EventChannel = PubSubChannel<
    DefaultRawMutex,
    DriverEvent,
    EVENT_QUEUE_DEPTH,
    MAX_EVENT_SUBSCRIBERS,
    MAX_EVENT_PUBLISHERS,
>;
/// Receives [DriverEvent]s. Obtained from [EventDispatcher::subscribe].
pub type EventSubscriber<'a> = Subscriber<
    'a,
    DefaultRawMutex,
    DriverEvent,
    EVENT_QUEUE_DEPTH,
    MAX_EVENT_SUBSCRIBERS,
    MAX_EVENT_PUBLISHERS,
>;

/// Routes events to all subscribers.
pub struct EventDispatcher {
    channel: EventChannel,
    published: AtomicU32,
    malformed: AtomicU32,
}
impl EventDispatcher {
    pub const fn new() -> Self {
        Self {
            channel: PubSubChannel::new(),
            published: AtomicU32::new(0),
            malformed: AtomicU32::new(0),
        }
    }
    /// Publish an event, overwriting the oldest one if the queue is full.
    pub fn publish(&self, event: DriverEvent) {
        trace!("Publishing {:?}", event);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.channel.immediate_publisher().publish_immediate(event);
    }
    /// Decode and publish an event frame.
    ///
    /// The decoded event is returned, so the driver can act on it as well.
    pub fn dispatch(&self, frame: &[u8]) -> Option<DriverEvent> {
        match DriverEvent::decode(frame) {
            Ok(event) => {
                if let DriverEvent::Unknown { id, .. } = event {
                    debug!("Received unknown event {:x}.", id);
                }
                self.publish(event);
                Some(event)
            }
            Err(_) => {
                warn!("Dropping malformed event.");
                self.malformed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
    /// Register a new subscriber.
    ///
    /// Fails with [WifiError::ResourceExhausted], if all subscriber slots are taken.
    pub fn subscribe(&self) -> WifiResult<EventSubscriber<'_>> {
        self.channel
            .subscriber()
            .map_err(|_| WifiError::ResourceExhausted)
    }
    /// The amount of events published so far.
    pub fn published(&self) -> u32 {
        self.published.load(Ordering::Relaxed)
    }
    pub fn malformed(&self) -> u32 {
        self.malformed.load(Ordering::Relaxed)
    }
}
impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
