//! Framing shared by commands, events and data.
//!
//! Every frame on the bus starts with a [BusHeader]. Commands and their responses follow it with
//! a [CommandHeader], events with an [EventCause].

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::{WifiError, WifiResult};

/// Length of the [BusHeader].
pub const BUS_HEADER_LEN: usize = 4;
/// Length of the [CommandHeader].
pub const COMMAND_HEADER_LEN: usize = 8;
/// Length of the event cause following the bus header.
pub const EVENT_CAUSE_LEN: usize = 4;
/// The largest frame exchanged with the card.
pub const MAX_FRAME_LEN: usize = 2048;

/// Set in the command field of every response.
pub const RESPONSE_BIT: u16 = 0x8000;
/// Masks the command ID out of the command field.
pub const COMMAND_ID_MASK: u16 = 0x0fff;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The payload type of a frame on the bus.
    pub enum FrameType: u16 {
        Data => 0,
        Command => 1,
        Event => 3
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The role of a virtual interface.
    pub enum BssType: u8 {
        #[default]
        Station => 0,
        MicroAp => 1,
        WifiDirect => 2
    }
}

/// Identifies a virtual interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BssInfo {
    pub bss_type: BssType,
    pub bss_num: u8,
}
impl BssInfo {
    pub const fn new(bss_type: BssType, bss_num: u8) -> Self {
        Self { bss_type, bss_num }
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash)]
/// The sequence number of a command.
///
/// Besides the counter, this carries the virtual interface the command is for, which is how
/// responses are multiplexed.
pub struct SequenceNumber {
    pub counter: u8,
    #[bits(4)]
    pub bss_num: u8,
    #[bits(4)]
    pub bss_type: u8,
}
impl SequenceNumber {
    pub const fn for_bss(counter: u8, bss: BssInfo) -> Self {
        Self::new()
            .with_counter(counter)
            .with_bss_num(bss.bss_num & 0x0f)
            .with_bss_type(bss.bss_type.into_bits() & 0x0f)
    }
    pub fn bss(&self) -> BssInfo {
        BssInfo {
            bss_type: BssType::from_bits(self.bss_type()),
            bss_num: self.bss_num(),
        }
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// The first word of every event.
pub struct EventCause {
    pub id: u16,
    pub bss_num: u8,
    pub bss_type: u8,
}
impl EventCause {
    pub fn bss(&self) -> BssInfo {
        BssInfo {
            bss_type: BssType::from_bits(self.bss_type()),
            bss_num: self.bss_num(),
        }
    }
}

/// The header in front of every frame on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusHeader {
    /// Length of the frame including this header.
    pub length: u16,
    pub frame_type: FrameType,
}
impl BusHeader {
    pub fn read(buffer: &[u8]) -> WifiResult<Self> {
        let header = buffer
            .get(..BUS_HEADER_LEN)
            .ok_or(WifiError::BufferTooSmall)?;
        Ok(Self {
            length: u16::from_le_bytes([header[0], header[1]]),
            frame_type: FrameType::from_bits(u16::from_le_bytes([header[2], header[3]])),
        })
    }
    pub fn write(&self, buffer: &mut [u8]) -> WifiResult<()> {
        let header = buffer
            .get_mut(..BUS_HEADER_LEN)
            .ok_or(WifiError::BufferTooSmall)?;
        header[..2].copy_from_slice(&self.length.to_le_bytes());
        header[2..].copy_from_slice(&self.frame_type.into_bits().to_le_bytes());
        Ok(())
    }
}

/// The header of a command or response, which follows the [BusHeader].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandHeader {
    /// The raw command field, including the response bit.
    pub command: u16,
    /// Length of this header and the payload.
    pub size: u16,
    pub sequence_number: u16,
    pub result: u16,
}
impl CommandHeader {
    pub fn read(buffer: &[u8]) -> WifiResult<Self> {
        let header = buffer
            .get(..COMMAND_HEADER_LEN)
            .ok_or(WifiError::BufferTooSmall)?;
        let field = |offset: usize| u16::from_le_bytes([header[offset], header[offset + 1]]);
        Ok(Self {
            command: field(0),
            size: field(2),
            sequence_number: field(4),
            result: field(6),
        })
    }
    pub fn write(&self, buffer: &mut [u8]) -> WifiResult<()> {
        let header = buffer
            .get_mut(..COMMAND_HEADER_LEN)
            .ok_or(WifiError::BufferTooSmall)?;
        header[0..2].copy_from_slice(&self.command.to_le_bytes());
        header[2..4].copy_from_slice(&self.size.to_le_bytes());
        header[4..6].copy_from_slice(&self.sequence_number.to_le_bytes());
        header[6..8].copy_from_slice(&self.result.to_le_bytes());
        Ok(())
    }
    /// The command ID with the response bit masked off.
    pub const fn command_id(&self) -> u16 {
        self.command & COMMAND_ID_MASK
    }
    pub const fn is_response(&self) -> bool {
        self.command & RESPONSE_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_layout() {
        let seq = SequenceNumber::for_bss(0x42, BssInfo::new(BssType::MicroAp, 3));
        assert_eq!(seq.into_bits(), 0x1342);
        assert_eq!(seq.bss(), BssInfo::new(BssType::MicroAp, 3));
    }
    #[test]
    fn event_cause_layout() {
        let cause = EventCause::from_bits(0x0102_0008);
        assert_eq!(cause.id(), 0x0008);
        assert_eq!(cause.bss_num(), 0x02);
        assert_eq!(cause.bss(), BssInfo::new(BssType::MicroAp, 2));
    }
    #[test]
    fn command_header() {
        let raw = [0x03, 0x80, 0x10, 0x00, 0x07, 0x00, 0x00, 0x00];
        let header = CommandHeader::read(&raw).unwrap();
        assert!(header.is_response());
        assert_eq!(header.command_id(), 0x0003);
        assert_eq!(header.size, 0x10);
        assert_eq!(header.sequence_number, 7);
        assert!(CommandHeader::read(&raw[..4]).is_err());
    }
    #[test]
    fn bus_header() {
        let mut buffer = [0u8; 4];
        BusHeader {
            length: 0x20,
            frame_type: FrameType::Event,
        }
        .write(&mut buffer)
        .unwrap();
        assert_eq!(buffer, [0x20, 0x00, 0x03, 0x00]);
        assert_eq!(BusHeader::read(&buffer).unwrap().frame_type, FrameType::Event);
    }
}
