//! # `sdio-wifi-hal`
//! This is an async driver for the control plane of SDIO attached WiFi cards of the
//! 88W8801 family. It's independent of the host controller, which is reached through the
//! [SdioBus] trait.
//! ## Overview
//! The card is driven through three channels, which share a single bus.
//!
//! ### Commands
//! The firmware processes one command at a time. A command is serialized into the single
//! command buffer, tagged with a sequence number and written to the command port. The caller
//! then waits for the response, which is validated against the outstanding command by the
//! driver loop. If no response arrives in time, the command is abandoned and a late response
//! is dropped. Typed commands implement [HostCommand].
//!
//! ### Events
//! Unsolicited notifications of the firmware, like a lost link or a station joining the micro
//! AP, are decoded into [DriverEvent]s and published to all subscribers. Publishing never
//! blocks. If a subscriber lags behind, it misses the oldest events.
//!
//! ### Data
//! Data frames are written to one of the data ports, which are picked in round robin order
//! from those the firmware marked as free. Received data frames are handed to the
//! [DataInput] straight from the bus context.
//!
//! ### Power save
//! Once a power save mode is armed, the firmware asks for permission to sleep. The driver
//! confirms, if the link is idle, and wakes the card up again when it's needed.
//!
//! ## Tasks
//! The bus context calls [WifiDriver::poll_and_dispatch] for every card interrupt, which
//! moves frames off the card without blocking. The driver loop [WifiDriver::run] processes
//! responses and events and has to be running for commands to complete.

#![cfg_attr(not(test), no_std)]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

mod bus;
mod command;
mod correlator;
mod driver;
mod error;
mod event;
mod firmware;
mod frame;
#[cfg(test)]
mod mock;
mod power;
mod regs;
mod sync;
mod transport;

pub use bus::{BusError, SdioBus};
pub use command::*;
pub use correlator::{BufferState, CommandStats, ResponseDisposition};
pub use driver::*;
pub use error::{ProtocolError, WifiError, WifiResult};
pub use event::{
    BlockAckEvent, DriverEvent, EventId, EventSubscriber, OpaquePayload, EVENT_QUEUE_DEPTH,
    MAX_EVENT_SUBSCRIBERS,
};
pub use firmware::{DecompressProgress, Decompressor, FirmwareSource, FIRMWARE_MAGIC};
pub use frame::{BssInfo, BssType, SequenceNumber, MAX_FRAME_LEN};
pub use power::{ArmedModes, PowerState, SleepDecision};
pub use sync::WakeLock;
pub use transport::{DataInput, PollSummary, Transport, TransportStats, TX_DESCRIPTOR_LEN};

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "critical_section"))] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
