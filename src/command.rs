//! Typed host commands.
//!
//! Each command the driver knows about implements [HostCommand], which encodes the payload
//! following the [CommandHeader](crate::frame::CommandHeader) and decodes the payload of the
//! response. Commands whose payload layout isn't modelled here can be sent as a [RawCommand].

use bitfield_struct::bitfield;
use macro_bits::{bit, serializable_enum};

use crate::{
    frame::{CommandHeader, BUS_HEADER_LEN, COMMAND_HEADER_LEN},
    WifiError, WifiResult,
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// IDs of the host commands understood by the firmware.
    pub enum CommandId: u16 {
        GetHwSpec => 0x0003,
        MacRegisterAccess => 0x0019,
        RfChannel => 0x001d,
        MacControl => 0x0028,
        MacAddress => 0x004d,
        ConfigData => 0x008f,
        VersionExt => 0x0097,
        FuncInit => 0x00a9,
        FuncShutdown => 0x00aa,
        PowerSaveModeEnh => 0x00e4,
        HostSleepCfgEnh => 0x00e5,
        ChannelTrpcConfig => 0x00fb,
        EdMacMode => 0x0124
    }
}
impl CommandId {
    /// Check if the firmware answers this command.
    ///
    /// Shutdown is sent without waiting, since the firmware may not be around to respond.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::FuncShutdown)
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The generic action field most commands start with.
    pub enum Action: u16 {
        #[default]
        Get => 0,
        Set => 1
    }
}

/// A validated response, borrowed from the command buffer.
#[derive(Clone, Copy, Debug)]
pub struct CommandResponse<'a> {
    pub header: CommandHeader,
    pub payload: &'a [u8],
}
impl<'a> CommandResponse<'a> {
    /// Parse a complete frame, starting at the bus header.
    pub fn parse(frame: &'a [u8]) -> WifiResult<Self> {
        let command = frame.get(BUS_HEADER_LEN..).ok_or(WifiError::BufferTooSmall)?;
        let header = CommandHeader::read(command)?;
        let size = header.size as usize;
        if size < COMMAND_HEADER_LEN || size > command.len() {
            return Err(WifiError::InvalidResponse);
        }
        Ok(Self {
            header,
            payload: &command[COMMAND_HEADER_LEN..size],
        })
    }
    pub fn reader(&self) -> PayloadReader<'a> {
        PayloadReader::new(self.payload)
    }
}

/// Little endian cursor over a response payload.
pub struct PayloadReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}
impl<'a> PayloadReader<'a> {
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }
    pub fn bytes(&mut self, length: usize) -> WifiResult<&'a [u8]> {
        let bytes = self
            .buffer
            .get(self.offset..self.offset + length)
            .ok_or(WifiError::InvalidResponse)?;
        self.offset += length;
        Ok(bytes)
    }
    pub fn array<const N: usize>(&mut self) -> WifiResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.bytes(N)?);
        Ok(array)
    }
    pub fn u8(&mut self) -> WifiResult<u8> {
        Ok(self.bytes(1)?[0])
    }
    pub fn u16(&mut self) -> WifiResult<u16> {
        self.array().map(u16::from_le_bytes)
    }
    pub fn u32(&mut self) -> WifiResult<u32> {
        self.array().map(u32::from_le_bytes)
    }
    pub fn skip(&mut self, length: usize) -> WifiResult<()> {
        self.bytes(length).map(|_| ())
    }
    /// Everything that hasn't been read yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.buffer.get(self.offset..).unwrap_or_default()
    }
}

/// Little endian cursor for encoding a command payload.
pub struct PayloadWriter<'a> {
    buffer: &'a mut [u8],
    offset: usize,
}
impl<'a> PayloadWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, offset: 0 }
    }
    pub fn put_slice(&mut self, bytes: &[u8]) -> WifiResult<&mut Self> {
        self.buffer
            .get_mut(self.offset..self.offset + bytes.len())
            .ok_or(WifiError::BufferTooSmall)?
            .copy_from_slice(bytes);
        self.offset += bytes.len();
        Ok(self)
    }
    pub fn put_u8(&mut self, value: u8) -> WifiResult<&mut Self> {
        self.put_slice(&[value])
    }
    pub fn put_u16(&mut self, value: u16) -> WifiResult<&mut Self> {
        self.put_slice(&value.to_le_bytes())
    }
    pub fn put_u32(&mut self, value: u32) -> WifiResult<&mut Self> {
        self.put_slice(&value.to_le_bytes())
    }
    /// Append `length` zero bytes.
    pub fn put_zeros(&mut self, length: usize) -> WifiResult<&mut Self> {
        self.buffer
            .get_mut(self.offset..self.offset + length)
            .ok_or(WifiError::BufferTooSmall)?
            .fill(0);
        self.offset += length;
        Ok(self)
    }
    /// The amount of bytes written.
    pub const fn len(&self) -> usize {
        self.offset
    }
    pub const fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

/// A command that can be sent to the firmware.
pub trait HostCommand {
    /// What the decoded response yields.
    type Response;

    fn id(&self) -> CommandId;
    /// Encode the payload into `payload` and return its length.
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize>;
    /// Decode the response.
    ///
    /// This is only called for responses, that passed validation and carry a zero result code.
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<Self::Response>;
}

/// Initializes the firmware after download.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FuncInit;
impl HostCommand for FuncInit {
    type Response = ();
    fn id(&self) -> CommandId {
        CommandId::FuncInit
    }
    fn encode(&self, _payload: &mut [u8]) -> WifiResult<usize> {
        Ok(0)
    }
    fn decode(&mut self, _response: &CommandResponse<'_>) -> WifiResult<()> {
        Ok(())
    }
}

/// Shuts the firmware down. This is never answered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FuncShutdown;
impl HostCommand for FuncShutdown {
    type Response = ();
    fn id(&self) -> CommandId {
        CommandId::FuncShutdown
    }
    fn encode(&self, _payload: &mut [u8]) -> WifiResult<usize> {
        Ok(0)
    }
    fn decode(&mut self, _response: &CommandResponse<'_>) -> WifiResult<()> {
        Ok(())
    }
}

/// Hardware capabilities reported by the firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwSpec {
    pub hw_if_version: u16,
    pub version: u16,
    pub multicast_address_count: u16,
    pub permanent_address: [u8; 6],
    pub region_code: u16,
    pub antenna_count: u16,
    pub firmware_release: u32,
    pub firmware_capabilities: u32,
    pub ht_capabilities: u32,
    pub mcs_support: u8,
    /// The last data port the firmware uses.
    pub mp_end_port: u16,
    pub management_buffer_count: u16,
}

/// Query the hardware specification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetHwSpec;
impl GetHwSpec {
    const PAYLOAD_LEN: usize = 47;
}
impl HostCommand for GetHwSpec {
    type Response = HwSpec;
    fn id(&self) -> CommandId {
        CommandId::GetHwSpec
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        writer.put_zeros(Self::PAYLOAD_LEN)?;
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<HwSpec> {
        let mut reader = response.reader();
        let hw_if_version = reader.u16()?;
        let version = reader.u16()?;
        reader.skip(2)?;
        let multicast_address_count = reader.u16()?;
        let permanent_address = reader.array()?;
        let region_code = reader.u16()?;
        let antenna_count = reader.u16()?;
        let firmware_release = reader.u32()?;
        reader.skip(12)?;
        Ok(HwSpec {
            hw_if_version,
            version,
            multicast_address_count,
            permanent_address,
            region_code,
            antenna_count,
            firmware_release,
            firmware_capabilities: reader.u32()?,
            ht_capabilities: reader.u32()?,
            mcs_support: reader.u8()?,
            mp_end_port: reader.u16()?,
            management_buffer_count: reader.u16()?,
        })
    }
}

/// Read or set the MAC address of the station interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacAddress {
    Get,
    Set([u8; 6]),
}
impl HostCommand for MacAddress {
    type Response = [u8; 6];
    fn id(&self) -> CommandId {
        CommandId::MacAddress
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        match self {
            Self::Get => writer.put_u16(Action::Get.into_bits())?.put_zeros(6)?,
            Self::Set(address) => writer.put_u16(Action::Set.into_bits())?.put_slice(address)?,
        };
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<[u8; 6]> {
        let mut reader = response.reader();
        reader.skip(2)?;
        reader.array()
    }
}

const VERSION_STRING_LEN: usize = 128;

/// A NUL terminated version string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionString {
    bytes: [u8; VERSION_STRING_LEN],
    len: usize,
}
impl VersionString {
    pub const MAX_LEN: usize = VERSION_STRING_LEN;

    pub const fn empty() -> Self {
        Self {
            bytes: [0; Self::MAX_LEN],
            len: 0,
        }
    }
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(bytes.len())
            .min(Self::MAX_LEN);
        let mut temp = Self::empty();
        temp.bytes[..len].copy_from_slice(&bytes[..len]);
        temp.len = len;
        temp
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
    /// The version as a string, if it's valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_bytes()).ok()
    }
}
impl Default for VersionString {
    fn default() -> Self {
        Self::empty()
    }
}

/// Query the extended firmware version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionExt {
    /// Which version string to return. Zero is the firmware version.
    pub selector: u8,
}
impl HostCommand for VersionExt {
    type Response = VersionString;
    fn id(&self) -> CommandId {
        CommandId::VersionExt
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        writer
            .put_u8(self.selector)?
            .put_zeros(VersionString::MAX_LEN)?;
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<VersionString> {
        let mut reader = response.reader();
        reader.skip(1)?;
        Ok(VersionString::from_bytes(reader.remaining()))
    }
}

/// Configure which frames the MAC passes up and whether RX and TX are enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacControl {
    pub action: u16,
}
impl MacControl {
    pub const RX_ON: u16 = bit!(0);
    pub const TX_ON: u16 = bit!(1);
    pub const WEP_ENABLE: u16 = bit!(3);
    pub const ETHERNET_II: u16 = bit!(4);
    pub const PROMISCUOUS: u16 = bit!(7);
    pub const ALL_MULTICAST: u16 = bit!(8);
}
impl Default for MacControl {
    fn default() -> Self {
        Self {
            action: Self::RX_ON | Self::TX_ON | Self::ETHERNET_II,
        }
    }
}
impl HostCommand for MacControl {
    type Response = ();
    fn id(&self) -> CommandId {
        CommandId::MacControl
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        writer.put_u16(self.action)?.put_u16(0)?;
        Ok(writer.len())
    }
    fn decode(&mut self, _response: &CommandResponse<'_>) -> WifiResult<()> {
        Ok(())
    }
}

/// The channel the radio is tuned to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RfChannelInfo {
    pub channel: u16,
    pub rf_type: u16,
}

/// Read or set the RF channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RfChannel {
    Get,
    Set(u16),
}
impl HostCommand for RfChannel {
    type Response = RfChannelInfo;
    fn id(&self) -> CommandId {
        CommandId::RfChannel
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let (action, channel) = match self {
            Self::Get => (Action::Get, 0),
            Self::Set(channel) => (Action::Set, *channel),
        };
        let mut writer = PayloadWriter::new(payload);
        writer
            .put_u16(action.into_bits())?
            .put_u16(channel)?
            .put_u16(0)?
            .put_zeros(34)?;
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<RfChannelInfo> {
        let mut reader = response.reader();
        reader.skip(2)?;
        Ok(RfChannelInfo {
            channel: reader.u16()?,
            rf_type: reader.u16()?,
        })
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Action of the enhanced power save command.
    pub enum PowerSaveAction: u16 {
        GetPs => 0x0000,
        SleepConfirm => 0x0005,
        DisableAutoPs => 0x00fe,
        EnableAutoPs => 0x00ff
    }
}

/// A power save mode, that can be armed in the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSaveKind {
    /// IEEE 802.11 power save of the station.
    Ieee,
    /// Deep sleep of the whole card.
    DeepSleep,
    /// Inactivity based power save of the micro AP.
    UapInactivity,
}
impl PowerSaveKind {
    pub const fn bitmap(&self) -> u16 {
        match self {
            Self::DeepSleep => bit!(0),
            Self::Ieee => bit!(4),
            Self::UapInactivity => bit!(8),
        }
    }
    /// Classify a power save bitmap returned by the firmware.
    pub const fn from_bitmap(bitmap: u16) -> Option<Self> {
        if bitmap & Self::Ieee.bitmap() != 0 {
            Some(Self::Ieee)
        } else if bitmap & Self::DeepSleep.bitmap() != 0 {
            Some(Self::DeepSleep)
        } else if bitmap & Self::UapInactivity.bitmap() != 0 {
            Some(Self::UapInactivity)
        } else {
            None
        }
    }
}

/// TLV carrying the deep sleep inactivity timeout.
const TLV_TYPE_AUTO_DS_PARAM: u16 = 0x0171;
/// Deep sleep timeout used, when none is specified.
pub const DEFAULT_DEEP_SLEEP_TIMEOUT_MS: u16 = 1000;

/// The enhanced power save mode command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerSaveMode {
    Enable(PowerSaveKind),
    /// Enable deep sleep after the card has been idle for the given time.
    EnableDeepSleep { idle_timeout_ms: u16 },
    Disable(PowerSaveKind),
    Get,
    /// Confirm a sleep request of the firmware.
    SleepConfirm,
}
/// The decoded response to a [PowerSaveMode] command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerSaveResponse {
    pub action: PowerSaveAction,
    pub bitmap: u16,
}
impl PowerSaveResponse {
    pub fn parse(response: &CommandResponse<'_>) -> WifiResult<Self> {
        let mut reader = response.reader();
        let action = PowerSaveAction::from_bits(reader.u16()?);
        // The sleep confirm response only carries the response control field.
        let bitmap = if action == PowerSaveAction::SleepConfirm {
            0
        } else {
            reader.u16()?
        };
        Ok(Self { action, bitmap })
    }
}
impl HostCommand for PowerSaveMode {
    type Response = PowerSaveResponse;
    fn id(&self) -> CommandId {
        CommandId::PowerSaveModeEnh
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        match self {
            Self::Enable(kind) => {
                writer
                    .put_u16(PowerSaveAction::EnableAutoPs.into_bits())?
                    .put_u16(kind.bitmap())?;
                if *kind == PowerSaveKind::DeepSleep {
                    writer
                        .put_u16(TLV_TYPE_AUTO_DS_PARAM)?
                        .put_u16(2)?
                        .put_u16(DEFAULT_DEEP_SLEEP_TIMEOUT_MS)?;
                }
            }
            Self::EnableDeepSleep { idle_timeout_ms } => {
                writer
                    .put_u16(PowerSaveAction::EnableAutoPs.into_bits())?
                    .put_u16(PowerSaveKind::DeepSleep.bitmap())?
                    .put_u16(TLV_TYPE_AUTO_DS_PARAM)?
                    .put_u16(2)?
                    .put_u16(*idle_timeout_ms)?;
            }
            Self::Disable(kind) => {
                writer
                    .put_u16(PowerSaveAction::DisableAutoPs.into_bits())?
                    .put_u16(kind.bitmap())?;
            }
            Self::Get => {
                writer
                    .put_u16(PowerSaveAction::GetPs.into_bits())?
                    .put_u16(0)?;
            }
            Self::SleepConfirm => {
                writer
                    .put_u16(PowerSaveAction::SleepConfirm.into_bits())?
                    .put_u16(1)?;
            }
        }
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<PowerSaveResponse> {
        PowerSaveResponse::parse(response)
    }
}

/// Condition value, that cancels host sleep.
pub const HOST_SLEEP_CANCEL: u32 = 0xffff_ffff;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// Traffic that wakes the host, while host sleep is active.
pub struct HostSleepConditions {
    pub broadcast: bool,
    pub unicast: bool,
    pub mac_event: bool,
    pub multicast: bool,
    #[bits(28)]
    pub __: u32,
}

/// How the card wakes the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeSource {
    /// Toggle a GPIO and wait `gap_ms` before sending traffic.
    Gpio { pin: u8, gap_ms: u8 },
    /// Signal the wake up on the bus interface.
    Interface,
}
impl WakeSource {
    const INTERFACE: u8 = 0xff;

    const fn gpio_and_gap(&self) -> (u8, u8) {
        match self {
            Self::Gpio { pin, gap_ms } => (*pin, *gap_ms),
            Self::Interface => (Self::INTERFACE, 0),
        }
    }
}

/// Host sleep configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostSleepConfig {
    pub conditions: HostSleepConditions,
    pub wake_source: WakeSource,
}
impl Default for HostSleepConfig {
    fn default() -> Self {
        Self {
            conditions: HostSleepConditions::new()
                .with_broadcast(true)
                .with_unicast(true)
                .with_mac_event(true),
            wake_source: WakeSource::Interface,
        }
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub enum HostSleepAction: u16 {
        Configure => 0x0001,
        Activate => 0x0002
    }
}

/// The enhanced host sleep configuration command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSleepCfg {
    Configure(HostSleepConfig),
    Cancel,
    Activate,
}
/// The decoded response to a [HostSleepCfg] command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostSleepResponse {
    pub action: HostSleepAction,
    /// The raw conditions for a configure response.
    pub conditions: Option<u32>,
}
impl HostSleepResponse {
    pub fn parse(response: &CommandResponse<'_>) -> WifiResult<Self> {
        let mut reader = response.reader();
        let action = HostSleepAction::from_bits(reader.u16()?);
        let conditions = if action == HostSleepAction::Configure {
            Some(reader.u32()?)
        } else {
            None
        };
        Ok(Self { action, conditions })
    }
    /// Check if this response cancelled host sleep.
    pub fn is_cancel(&self) -> bool {
        self.conditions == Some(HOST_SLEEP_CANCEL)
    }
}
impl HostCommand for HostSleepCfg {
    type Response = HostSleepResponse;
    fn id(&self) -> CommandId {
        CommandId::HostSleepCfgEnh
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        match self {
            Self::Configure(config) => {
                let (gpio, gap) = config.wake_source.gpio_and_gap();
                writer
                    .put_u16(HostSleepAction::Configure.into_bits())?
                    .put_u32(config.conditions.into_bits())?
                    .put_u8(gpio)?
                    .put_u8(gap)?;
            }
            Self::Cancel => {
                writer
                    .put_u16(HostSleepAction::Configure.into_bits())?
                    .put_u32(HOST_SLEEP_CANCEL)?
                    .put_u8(WakeSource::INTERFACE)?
                    .put_u8(0)?;
            }
            Self::Activate => {
                writer
                    .put_u16(HostSleepAction::Activate.into_bits())?
                    .put_u16(1)?;
            }
        }
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<HostSleepResponse> {
        HostSleepResponse::parse(response)
    }
}

/// A command with an opaque payload.
///
/// The response payload is copied into `sink` and the amount of copied bytes is returned.
pub struct RawCommand<'a> {
    pub id: u16,
    pub payload: &'a [u8],
    pub sink: &'a mut [u8],
}
impl HostCommand for RawCommand<'_> {
    type Response = usize;
    fn id(&self) -> CommandId {
        CommandId::from_bits(self.id)
    }
    fn encode(&self, payload: &mut [u8]) -> WifiResult<usize> {
        let mut writer = PayloadWriter::new(payload);
        writer.put_slice(self.payload)?;
        Ok(writer.len())
    }
    fn decode(&mut self, response: &CommandResponse<'_>) -> WifiResult<usize> {
        let sink = self
            .sink
            .get_mut(..response.payload.len())
            .ok_or(WifiError::BufferTooSmall)?;
        sink.copy_from_slice(response.payload);
        Ok(response.payload.len())
    }
}

/// Called with every validated response to the command it was registered for.
pub type ResponseHook<C> = fn(&C, &CommandResponse<'_>);

/// Maps command IDs to response hooks.
///
/// The hooks are looked up by the driver loop, before the waiting caller is released.
pub struct CommandRegistry<C, const N: usize> {
    hooks: [Option<(u16, ResponseHook<C>)>; N],
}
impl<C, const N: usize> CommandRegistry<C, N> {
    pub const fn new() -> Self {
        Self { hooks: [None; N] }
    }
    /// Register a hook, replacing any previous hook for the same command.
    pub fn register(&mut self, id: CommandId, hook: ResponseHook<C>) -> WifiResult<()> {
        let id = id.into_bits();
        let slot = match self
            .hooks
            .iter()
            .position(|entry| matches!(entry, Some((registered, _)) if *registered == id))
        {
            Some(index) => index,
            None => self
                .hooks
                .iter()
                .position(Option::is_none)
                .ok_or(WifiError::ResourceExhausted)?,
        };
        self.hooks[slot] = Some((id, hook));
        Ok(())
    }
    pub fn lookup(&self, id: u16) -> Option<ResponseHook<C>> {
        self.hooks
            .iter()
            .flatten()
            .find(|(registered, _)| *registered == id)
            .map(|(_, hook)| *hook)
    }
}
impl<C, const N: usize> Default for CommandRegistry<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BusHeader, FrameType};

    fn response_frame(id: CommandId, payload: &[u8], buffer: &mut [u8]) -> usize {
        let len = BUS_HEADER_LEN + COMMAND_HEADER_LEN + payload.len();
        BusHeader {
            length: len as u16,
            frame_type: FrameType::Command,
        }
        .write(buffer)
        .unwrap();
        CommandHeader {
            command: id.into_bits() | crate::frame::RESPONSE_BIT,
            size: (COMMAND_HEADER_LEN + payload.len()) as u16,
            sequence_number: 1,
            result: 0,
        }
        .write(&mut buffer[BUS_HEADER_LEN..])
        .unwrap();
        buffer[BUS_HEADER_LEN + COMMAND_HEADER_LEN..len].copy_from_slice(payload);
        len
    }

    #[test]
    fn hw_spec_decode() {
        let mut payload = [0u8; 47];
        payload[0..2].copy_from_slice(&0x0002u16.to_le_bytes());
        payload[8..14].copy_from_slice(&[0x00, 0x50, 0x43, 0x01, 0x02, 0x03]);
        payload[14..16].copy_from_slice(&0x0010u16.to_le_bytes());
        payload[18..22].copy_from_slice(&0x0501_0203u32.to_le_bytes());
        payload[43..45].copy_from_slice(&10u16.to_le_bytes());
        let mut buffer = [0u8; 128];
        let len = response_frame(CommandId::GetHwSpec, &payload, &mut buffer);
        let response = CommandResponse::parse(&buffer[..len]).unwrap();
        let hw_spec = GetHwSpec.decode(&response).unwrap();
        assert_eq!(hw_spec.hw_if_version, 2);
        assert_eq!(hw_spec.permanent_address, [0x00, 0x50, 0x43, 0x01, 0x02, 0x03]);
        assert_eq!(hw_spec.region_code, 0x10);
        assert_eq!(hw_spec.firmware_release, 0x0501_0203);
        assert_eq!(hw_spec.mp_end_port, 10);
    }
    #[test]
    fn truncated_response_is_rejected() {
        let mut buffer = [0u8; 64];
        let len = response_frame(CommandId::GetHwSpec, &[0; 10], &mut buffer);
        let response = CommandResponse::parse(&buffer[..len]).unwrap();
        assert_eq!(GetHwSpec.decode(&response), Err(WifiError::InvalidResponse));
    }
    #[test]
    fn bogus_size_is_rejected() {
        let mut buffer = [0u8; 64];
        let len = response_frame(CommandId::FuncInit, &[], &mut buffer);
        buffer[BUS_HEADER_LEN + 2] = 0x40;
        assert!(CommandResponse::parse(&buffer[..len]).is_err());
    }
    #[test]
    fn power_save_encoding() {
        let mut payload = [0u8; 16];
        let len = PowerSaveMode::Enable(PowerSaveKind::Ieee)
            .encode(&mut payload)
            .unwrap();
        assert_eq!(&payload[..len], &[0xff, 0x00, 0x10, 0x00]);
        let len = PowerSaveMode::EnableDeepSleep {
            idle_timeout_ms: 500,
        }
        .encode(&mut payload)
        .unwrap();
        assert_eq!(
            &payload[..len],
            &[0xff, 0x00, 0x01, 0x00, 0x71, 0x01, 0x02, 0x00, 0xf4, 0x01]
        );
        let len = PowerSaveMode::SleepConfirm.encode(&mut payload).unwrap();
        assert_eq!(&payload[..len], &[0x05, 0x00, 0x01, 0x00]);
        assert_eq!(PowerSaveKind::from_bitmap(0x0010), Some(PowerSaveKind::Ieee));
        assert_eq!(PowerSaveKind::from_bitmap(0x0000), None);
    }
    #[test]
    fn host_sleep_encoding() {
        let mut payload = [0u8; 16];
        let config = HostSleepConfig {
            conditions: HostSleepConditions::new().with_unicast(true),
            wake_source: WakeSource::Gpio { pin: 16, gap_ms: 20 },
        };
        let len = HostSleepCfg::Configure(config)
            .encode(&mut payload)
            .unwrap();
        assert_eq!(&payload[..len], &[0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 16, 20]);
        let len = HostSleepCfg::Cancel.encode(&mut payload).unwrap();
        assert_eq!(&payload[2..6], &[0xff; 4]);
        assert_eq!(len, 8);

        let mut buffer = [0u8; 64];
        let len = response_frame(
            CommandId::HostSleepCfgEnh,
            &[0x01, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00],
            &mut buffer,
        );
        let response = CommandResponse::parse(&buffer[..len]).unwrap();
        assert!(HostSleepResponse::parse(&response).unwrap().is_cancel());
    }
    #[test]
    fn raw_command_sink() {
        let mut buffer = [0u8; 64];
        let len = response_frame(CommandId::ConfigData, &[1, 2, 3], &mut buffer);
        let response = CommandResponse::parse(&buffer[..len]).unwrap();
        let mut sink = [0u8; 2];
        let mut command = RawCommand {
            id: 0x8f,
            payload: &[],
            sink: &mut sink,
        };
        assert_eq!(command.decode(&response), Err(WifiError::BufferTooSmall));
        let mut sink = [0u8; 8];
        let mut command = RawCommand {
            id: 0x8f,
            payload: &[],
            sink: &mut sink,
        };
        assert_eq!(command.decode(&response), Ok(3));
        assert_eq!(&sink[..3], &[1, 2, 3]);
    }
    #[test]
    fn registry() {
        fn first(counter: &core::cell::Cell<u8>, _: &CommandResponse<'_>) {
            counter.set(1);
        }
        fn second(counter: &core::cell::Cell<u8>, _: &CommandResponse<'_>) {
            counter.set(2);
        }
        let mut registry = CommandRegistry::<core::cell::Cell<u8>, 2>::new();
        registry.register(CommandId::GetHwSpec, first).unwrap();
        registry.register(CommandId::GetHwSpec, second).unwrap();
        registry.register(CommandId::MacAddress, first).unwrap();
        assert_eq!(
            registry.register(CommandId::VersionExt, first),
            Err(WifiError::ResourceExhausted)
        );
        assert!(registry.lookup(CommandId::RfChannel.into_bits()).is_none());

        let counter = core::cell::Cell::new(0);
        let mut buffer = [0u8; 16];
        let len = response_frame(CommandId::GetHwSpec, &[], &mut buffer);
        let response = CommandResponse::parse(&buffer[..len]).unwrap();
        registry.lookup(0x0003).unwrap()(&counter, &response);
        assert_eq!(counter.get(), 2);
    }
}
