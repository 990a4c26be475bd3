//! The multi-port bus transport.
//!
//! The card exposes sixteen ports. Port zero carries commands and their responses, while the
//! remaining ports up to `mp_end_port` carry data. Which ports hold a frame for the host and
//! which ports may be written to is reported in the read and write bitmaps, which are part of
//! the multi-port register block read on every interrupt.

use embassy_sync::channel::Channel;

use crate::{
    bus::SdioBus,
    firmware::{self, Decompressor, FirmwareSource},
    frame::{BssInfo, BssType, BusHeader, FrameType, BUS_HEADER_LEN, MAX_FRAME_LEN},
    regs::*,
    DefaultRawMutex, DriverConfig, WifiError, WifiResult,
};

/// Length of the descriptor in front of every transmitted data frame.
pub const TX_DESCRIPTOR_LEN: usize = 22;
/// Packet type of a plain 802.3 frame.
const TX_PACKET_TYPE_ETHERNET: u16 = 0;

/// Receives data frames from the bus context.
///
/// This is called with the bus state locked, so it should only copy the frame somewhere and
/// return.
pub trait DataInput {
    /// `frame` starts at the receive descriptor, which precedes the actual frame.
    fn receive(&self, bss: BssInfo, frame: &[u8]);
}

/// What a [BusMessage] carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    CommandResponse,
    Event,
}

/// A frame handed from the bus context to the driver loop.
pub struct BusMessage {
    pub kind: MessageKind,
    length: usize,
    buffer: [u8; MAX_FRAME_LEN],
}
impl BusMessage {
    pub fn new(kind: MessageKind, frame: &[u8]) -> WifiResult<Self> {
        let mut buffer = [0u8; MAX_FRAME_LEN];
        buffer
            .get_mut(..frame.len())
            .ok_or(WifiError::BufferTooSmall)?
            .copy_from_slice(frame);
        Ok(Self {
            kind,
            length: frame.len(),
            buffer,
        })
    }
    /// The complete frame, including the bus header.
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

pub const MESSAGE_QUEUE_DEPTH: usize = 4;
/// The bounded queue between the bus context and the driver loop.
pub type MessageQueue = Channel<DefaultRawMutex, BusMessage, MESSAGE_QUEUE_DEPTH>;

/// Counters maintained by the bus context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportStats {
    pub interrupts: u32,
    pub frames_received: u32,
    /// Frames dropped, because the driver queue was full.
    pub frames_dropped: u32,
    pub unknown_frames: u32,
    pub malformed_frames: u32,
    pub bus_errors: u32,
    pub data_frames_sent: u32,
}

/// What a single call to [Transport::poll_and_dispatch] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollSummary {
    /// The card had an interrupt pending.
    pub interrupt: bool,
    /// Frames read from the card.
    pub frames: usize,
}

/// State of the bus and its ports.
pub struct Transport<'a, B: SdioBus> {
    bus: B,
    io_port: u32,
    mp_regs: MpRegs,
    read_bitmap: u16,
    write_bitmap: u16,
    write_cursor: u8,
    read_cursor: u8,
    mp_end_port: u8,
    command_port_busy: bool,
    data_input: Option<&'a (dyn DataInput + Sync)>,
    stats: TransportStats,
    scratch: [u8; SCRATCH_LEN],
}
impl<'a, B: SdioBus> Transport<'a, B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            io_port: 0,
            mp_regs: MpRegs::new(),
            read_bitmap: 0,
            write_bitmap: 0,
            write_cursor: 1,
            read_cursor: 1,
            mp_end_port: MAX_PORT,
            command_port_busy: false,
            data_input: None,
            stats: TransportStats::default(),
            scratch: [0; SCRATCH_LEN],
        }
    }
    /// Set the callback data frames are delivered to.
    pub fn set_data_input(&mut self, data_input: &'a (dyn DataInput + Sync)) {
        self.data_input = Some(data_input);
    }
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
    pub fn io_port(&self) -> u32 {
        self.io_port
    }
    pub fn read_bitmap(&self) -> u16 {
        self.read_bitmap
    }
    pub fn write_bitmap(&self) -> u16 {
        self.write_bitmap
    }
    /// Check if the command port hasn't been released by the firmware yet.
    pub fn command_port_busy(&self) -> bool {
        self.command_port_busy
    }
    pub fn mp_end_port(&self) -> u8 {
        self.mp_end_port
    }
    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub(crate) fn read_register(&mut self, address: u32) -> WifiResult<u8> {
        self.bus.read_register(address).map_err(|err| {
            self.stats.bus_errors += 1;
            WifiError::from(err)
        })
    }
    pub(crate) fn write_register(&mut self, address: u32, value: u8) -> WifiResult<()> {
        self.bus.write_register(address, value).map_err(|err| {
            self.stats.bus_errors += 1;
            WifiError::from(err)
        })
    }
    /// Read a 16 bit value split over two consecutive registers.
    pub(crate) fn read_register_pair(&mut self, low: u32, high: u32) -> WifiResult<u16> {
        Ok(u16::from_le_bytes([
            self.read_register(low)?,
            self.read_register(high)?,
        ]))
    }
    /// Let `fill` write up to `length` bytes into the staging buffer and write them to
    /// `address`, padded to whole blocks.
    ///
    /// `fill` returns how many bytes it actually wrote. Nothing is written, if that's zero.
    pub(crate) fn write_in_place(
        &mut self,
        address: u32,
        length: usize,
        fill: impl FnOnce(&mut [u8]) -> WifiResult<usize>,
    ) -> WifiResult<usize> {
        let staging = self
            .scratch
            .get_mut(..length)
            .ok_or(WifiError::BufferTooSmall)?;
        let length = fill(staging)?.min(length);
        if length == 0 {
            return Ok(0);
        }
        let shape = TransferShape::for_length(length);
        self.scratch[length..shape.total_length()].fill(0);
        self.write_scratch(address, shape)?;
        Ok(length)
    }
    /// Write `frame` to `address`, padded to whole blocks.
    pub(crate) fn write_frame(&mut self, address: u32, frame: &[u8]) -> WifiResult<()> {
        self.write_in_place(address, frame.len(), |staging| {
            staging.copy_from_slice(frame);
            Ok(frame.len())
        })
        .map(|_| ())
    }
    fn write_scratch(&mut self, address: u32, shape: TransferShape) -> WifiResult<()> {
        self.bus
            .write_blocks(
                address,
                shape.block_count,
                shape.block_size,
                &self.scratch[..shape.total_length()],
            )
            .map_err(|err| {
                self.stats.bus_errors += 1;
                WifiError::from(err)
            })
    }

    /// Read the base address of the data ports.
    fn read_io_port(&mut self) -> WifiResult<u32> {
        let mut io_port = 0u32;
        for (shift, register) in [IO_PORT_0_REG, IO_PORT_1_REG, IO_PORT_2_REG]
            .into_iter()
            .enumerate()
        {
            io_port |= (self.read_register(register)? as u32) << (shift * 8);
        }
        Ok(io_port)
    }
    /// Make the interrupt status read-to-clear and let the card re-arm its interrupts.
    fn configure_interrupts(&mut self) -> WifiResult<()> {
        self.write_register(HOST_INT_RSR_REG, HOST_INT_RSR_MASK)?;
        let misc = self.read_register(CARD_MISC_CFG_REG)?;
        self.write_register(CARD_MISC_CFG_REG, misc | AUTO_RE_ENABLE_INT)
    }
    /// Read the firmware status word.
    pub(crate) fn firmware_status(&mut self) -> WifiResult<u16> {
        self.read_register_pair(CARD_FW_STATUS0_REG, CARD_FW_STATUS1_REG)
    }
    /// Bring up the card.
    ///
    /// This downloads the firmware, unless it's already running, and enables the card
    /// interrupts. A failure here is fatal and the transport can't be used.
    pub async fn bring_up<F: FirmwareSource + ?Sized>(
        &mut self,
        firmware: &mut F,
        decompressor: Option<&mut dyn Decompressor>,
        config: &DriverConfig,
    ) -> WifiResult<()> {
        trace!("Reading IO port.");
        self.io_port = self.read_io_port()?;
        trace!("IO port is at {:x}.", self.io_port);
        trace!("Configuring host interrupts.");
        self.configure_interrupts()?;
        if self.firmware_status()? == FIRMWARE_READY {
            info!("Firmware is already running, skipping download.");
        } else {
            firmware::download(self, firmware, decompressor, config).await?;
        }
        trace!("Enabling card interrupts.");
        self.write_register(HOST_INT_MASK_REG, HOST_INT_ENABLE)?;
        self.write_cursor = 1;
        self.read_cursor = 1;
        Ok(())
    }
    /// Limit the data ports to `1..mp_end_port`.
    pub fn set_mp_end_port(&mut self, mp_end_port: u16) {
        if (2..=MAX_PORT as u16).contains(&mp_end_port) {
            debug!("Data ports end at {}.", mp_end_port);
            self.mp_end_port = mp_end_port as u8;
            if self.write_cursor >= self.mp_end_port {
                self.write_cursor = 1;
            }
        } else {
            warn!("Ignoring invalid end port {}.", mp_end_port);
        }
    }

    /// Write a command to the command port.
    ///
    /// `frame` must already carry the bus and command headers.
    pub fn write_command(&mut self, frame: &[u8]) -> WifiResult<()> {
        self.write_frame(self.io_port + CTRL_PORT as u32, frame)?;
        self.command_port_busy = true;
        Ok(())
    }
    /// Pick the next free data port in round robin order and mark it as used.
    fn next_write_port(&mut self) -> Option<u8> {
        let data_ports = self.mp_end_port - 1;
        for _ in 0..data_ports {
            let port = self.write_cursor;
            self.write_cursor = if port + 1 >= self.mp_end_port {
                1
            } else {
                port + 1
            };
            if self.write_bitmap & (1 << port) != 0 {
                self.write_bitmap &= !(1 << port);
                return Some(port);
            }
        }
        None
    }
    /// Transmit a data frame for the virtual interface `bss`.
    ///
    /// This never waits for a port. If none is free, [WifiError::ResourceExhausted] is returned
    /// and the caller should retry after the next interrupt.
    pub fn write_data(&mut self, frame: &[u8], bss: BssInfo) -> WifiResult<u8> {
        let length = BUS_HEADER_LEN + TX_DESCRIPTOR_LEN + frame.len();
        if length > MAX_FRAME_LEN {
            return Err(WifiError::BufferTooSmall);
        }
        let Some(port) = self.next_write_port() else {
            trace!("No data port available.");
            return Err(WifiError::ResourceExhausted);
        };
        let shape = TransferShape::for_length(length);
        BusHeader {
            length: length as u16,
            frame_type: FrameType::Data,
        }
        .write(&mut self.scratch)?;
        let descriptor = &mut self.scratch[BUS_HEADER_LEN..BUS_HEADER_LEN + TX_DESCRIPTOR_LEN];
        descriptor.fill(0);
        descriptor[0] = bss.bss_type.into_bits();
        descriptor[1] = bss.bss_num;
        descriptor[2..4].copy_from_slice(&(frame.len() as u16).to_le_bytes());
        descriptor[4..6].copy_from_slice(&(TX_DESCRIPTOR_LEN as u16).to_le_bytes());
        descriptor[6..8].copy_from_slice(&TX_PACKET_TYPE_ETHERNET.to_le_bytes());
        self.scratch[BUS_HEADER_LEN + TX_DESCRIPTOR_LEN..length].copy_from_slice(frame);
        self.scratch[length..shape.total_length()].fill(0);
        match self.write_scratch(self.io_port + port as u32, shape) {
            Ok(()) => {
                self.stats.data_frames_sent += 1;
                trace!("Wrote {} bytes to port {}.", length, port);
                Ok(port)
            }
            Err(_) => {
                warn!("Writing data to port {} failed.", port);
                Err(WifiError::Congested)
            }
        }
    }

    /// Pick the next port holding a frame, control port first, and clear its bit.
    fn next_read_port(&mut self) -> Option<u8> {
        if self.read_bitmap & CTRL_PORT_MASK != 0 {
            self.read_bitmap &= !CTRL_PORT_MASK;
            return Some(CTRL_PORT);
        }
        if self.read_bitmap & DATA_PORT_MASK == 0 {
            return None;
        }
        for _ in 1..MAX_PORT {
            let port = self.read_cursor;
            self.read_cursor = if port + 1 >= MAX_PORT { 1 } else { port + 1 };
            if self.read_bitmap & (1 << port) != 0 {
                self.read_bitmap &= !(1 << port);
                return Some(port);
            }
        }
        None
    }
    /// Read the multi-port register block in one transfer.
    fn read_mp_regs(&mut self) -> WifiResult<()> {
        self.bus
            .read_blocks(MP_REGS_ADDRESS, 1, MAX_MP_REGS as u32, &mut self.mp_regs.0)
            .map_err(|err| {
                self.stats.bus_errors += 1;
                WifiError::from(err)
            })
    }
    /// Process one interrupt of the card.
    ///
    /// This is meant to be called from the bus context. It never blocks and never fails;
    /// errors are logged and counted. Command responses and events are pushed onto `queue`, data
    /// frames are handed to the [DataInput]. If the card has no interrupt pending, nothing is
    /// touched.
    pub fn poll_and_dispatch(&mut self, queue: &MessageQueue) -> PollSummary {
        if self.bus.set_card_interrupt(false).is_err() {
            self.stats.bus_errors += 1;
        }
        let summary = self.process_interrupt(queue);
        if self.bus.set_card_interrupt(true).is_err() {
            self.stats.bus_errors += 1;
            error!("Failed to unmask the card interrupt.");
        }
        summary
    }
    fn process_interrupt(&mut self, queue: &MessageQueue) -> PollSummary {
        let mut summary = PollSummary::default();
        if self.read_mp_regs().is_err() {
            error!("Failed to read the multi-port registers.");
            return summary;
        }
        let status = self.mp_regs.host_int_status();
        if status.into_bits() == 0 {
            return summary;
        }
        summary.interrupt = true;
        self.stats.interrupts += 1;

        if status.download() {
            self.write_bitmap = self.mp_regs.write_bitmap();
            trace!("Write bitmap: {:x}", self.write_bitmap);
        }
        // The firmware doesn't raise a download interrupt, if only the command port was freed.
        if self.command_port_busy {
            self.write_bitmap |= self.mp_regs.0[WR_BITMAP_L] as u16 & CTRL_PORT_MASK;
            if self.write_bitmap & CTRL_PORT_MASK != 0 {
                self.command_port_busy = false;
            }
        }
        if status.upload() {
            self.read_bitmap = self.mp_regs.read_bitmap();
            trace!("Read bitmap: {:x}", self.read_bitmap);
            while let Some(port) = self.next_read_port() {
                let length = self.mp_regs.read_length(port) as usize;
                if self.read_port(port, length, queue).is_ok() {
                    summary.frames += 1;
                }
            }
        }
        summary
    }
    fn read_port(&mut self, port: u8, length: usize, queue: &MessageQueue) -> WifiResult<()> {
        if length < BUS_HEADER_LEN || length > MAX_FRAME_LEN {
            error!("Port {} reported invalid length {}.", port, length);
            self.stats.malformed_frames += 1;
            return Err(WifiError::BufferTooSmall);
        }
        let shape = TransferShape::for_length(length);
        self.bus
            .read_blocks(
                self.io_port + port as u32,
                shape.block_count,
                shape.block_size,
                &mut self.scratch[..shape.total_length()],
            )
            .map_err(|err| {
                self.stats.bus_errors += 1;
                error!("Reading port {} failed.", port);
                WifiError::from(err)
            })?;
        self.stats.frames_received += 1;
        let header = BusHeader::read(&self.scratch)?;
        let frame_length = header.length as usize;
        if frame_length < BUS_HEADER_LEN || frame_length > length {
            warn!("Dropping frame with bogus length {} from port {}.", frame_length, port);
            self.stats.malformed_frames += 1;
            return Err(WifiError::InvalidResponse);
        }
        let frame = &self.scratch[..frame_length];
        match header.frame_type {
            FrameType::Data => {
                if let Some(data_input) = self.data_input {
                    let payload = &frame[BUS_HEADER_LEN..];
                    let bss = BssInfo::new(
                        BssType::from_bits(payload.first().copied().unwrap_or_default()),
                        payload.get(1).copied().unwrap_or_default(),
                    );
                    data_input.receive(bss, payload);
                }
            }
            FrameType::Command => {
                Self::enqueue(&mut self.stats, queue, MessageKind::CommandResponse, frame)
            }
            FrameType::Event => Self::enqueue(&mut self.stats, queue, MessageKind::Event, frame),
            _ => {
                warn!(
                    "Dropping frame of unknown type {} from port {}.",
                    header.frame_type.into_bits(),
                    port
                );
                self.stats.unknown_frames += 1;
            }
        }
        Ok(())
    }
    fn enqueue(
        stats: &mut TransportStats,
        queue: &MessageQueue,
        kind: MessageKind,
        frame: &[u8],
    ) {
        let Ok(message) = BusMessage::new(kind, frame) else {
            stats.malformed_frames += 1;
            return;
        };
        if queue.try_send(message).is_err() {
            warn!("Driver queue full, dropping {:?}.", kind);
            stats.frames_dropped += 1;
        }
    }
}
impl<B: SdioBus> Drop for Transport<'_, B> {
    fn drop(&mut self) {
        // Keep the card from interrupting a host, that's no longer listening.
        let _ = self.bus.write_register(HOST_INT_MASK_REG, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FirmwareSim, MockBus, IO_PORT};

    fn transport(sim: &FirmwareSim) -> Transport<'static, MockBus> {
        let mut transport = Transport::new(sim.bus());
        transport.io_port = IO_PORT;
        transport
    }

    #[test]
    fn poll_without_interrupt_is_a_noop() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        transport.write_bitmap = 0x0006;
        transport.read_bitmap = 0x0000;
        sim.with(|state| {
            // Bits set, but no interrupt pending.
            state.set_write_bitmap(0xffff);
        });
        for _ in 0..3 {
            assert_eq!(transport.poll_and_dispatch(&queue), PollSummary::default());
        }
        assert_eq!(transport.write_bitmap(), 0x0006);
        assert_eq!(transport.read_bitmap(), 0x0000);
        assert!(queue.is_empty());
        assert_eq!(transport.stats().interrupts, 0);
    }
    #[test]
    fn data_ports_round_robin() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        // Ports 1, 2 and 4 are free.
        sim.with(|state| state.raise_download(0b0001_0110));
        transport.poll_and_dispatch(&queue);
        assert_eq!(transport.write_bitmap(), 0b0001_0110);

        let bss = BssInfo::default();
        assert_eq!(transport.write_data(&[0xaa; 64], bss), Ok(1));
        assert_eq!(transport.write_data(&[0xaa; 64], bss), Ok(2));
        // Port 3 is skipped, since its bit is clear.
        assert_eq!(transport.write_data(&[0xaa; 64], bss), Ok(4));
        assert_eq!(
            transport.write_data(&[0xaa; 64], bss),
            Err(WifiError::ResourceExhausted)
        );
        assert_eq!(transport.write_bitmap(), 0);

        sim.with(|state| {
            let written = state.data_writes();
            assert_eq!(written.len(), 3);
            let (address, frame) = &written[2];
            assert_eq!(*address, IO_PORT + 4);
            assert_eq!(frame.len(), 256);
            assert_eq!(&frame[..4], &[90, 0, 0, 0]);
            assert_eq!(&frame[6..8], &[64, 0]);
            assert_eq!(&frame[8..10], &[22, 0]);
        });
        // The firmware frees port 3 only, and the cursor resumes after port 4.
        sim.with(|state| state.raise_download(0b0000_1000));
        transport.poll_and_dispatch(&queue);
        assert_eq!(transport.write_data(&[0; 8], bss), Ok(3));
    }
    #[test]
    fn no_port_available_does_not_block() {
        let sim = FirmwareSim::new();
        let mut transport = transport(&sim);
        assert_eq!(
            transport.write_data(&[0; 8], BssInfo::default()),
            Err(WifiError::ResourceExhausted)
        );
        sim.with(|state| assert!(state.data_writes().is_empty()));
    }
    #[test]
    fn data_ports_respect_end_port() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        transport.set_mp_end_port(3);
        sim.with(|state| state.raise_download(0xfffe));
        transport.poll_and_dispatch(&queue);
        let bss = BssInfo::default();
        assert_eq!(transport.write_data(&[0; 8], bss), Ok(1));
        assert_eq!(transport.write_data(&[0; 8], bss), Ok(2));
        assert_eq!(
            transport.write_data(&[0; 8], bss),
            Err(WifiError::ResourceExhausted)
        );
    }
    #[test]
    fn data_write_failure_is_congestion() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        sim.with(|state| state.raise_download(0x0002));
        transport.poll_and_dispatch(&queue);
        sim.with(|state| state.fail_writes = true);
        assert_eq!(
            transport.write_data(&[0; 8], BssInfo::default()),
            Err(WifiError::Congested)
        );
    }
    #[test]
    fn command_port_released_by_write_bitmap() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        transport.write_command(&[0; 12]).unwrap();
        assert!(transport.command_port_busy());
        sim.with(|state| {
            let (address, frame) = state.command_writes().pop().unwrap();
            assert_eq!(address, IO_PORT);
            assert_eq!(frame.len(), 256);
            state.raise_upload_only(0x0001);
        });
        transport.poll_and_dispatch(&queue);
        assert!(!transport.command_port_busy());
    }
    #[test]
    fn frames_are_routed_by_type() {
        struct Collector(std::sync::Mutex<std::vec::Vec<(BssInfo, usize)>>);
        impl DataInput for Collector {
            fn receive(&self, bss: BssInfo, frame: &[u8]) {
                self.0.lock().unwrap().push((bss, frame.len()));
            }
        }
        static COLLECTOR: std::sync::LazyLock<Collector> =
            std::sync::LazyLock::new(|| Collector(std::sync::Mutex::new(std::vec::Vec::new())));

        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        transport.set_data_input(&*COLLECTOR);
        sim.with(|state| {
            state.push_frame(0, FirmwareSim::event_frame(0x0003, 0, &[]));
            state.push_frame(5, FirmwareSim::data_frame(BssType::MicroAp, 1, &[0x42; 100]));
            state.push_frame(2, FirmwareSim::raw_frame(0x7, &[0; 8]));
        });
        let summary = transport.poll_and_dispatch(&queue);
        assert!(summary.interrupt);
        assert_eq!(summary.frames, 3);
        assert_eq!(transport.stats().unknown_frames, 1);

        let message = queue.try_receive().unwrap();
        assert_eq!(message.kind, MessageKind::Event);
        assert!(queue.try_receive().is_err());
        assert_eq!(
            COLLECTOR.0.lock().unwrap().as_slice(),
            &[(BssInfo::new(BssType::MicroAp, 1), TX_DESCRIPTOR_LEN + 100)]
        );
        assert_eq!(transport.read_bitmap(), 0);
    }
    #[test]
    fn full_queue_drops_frames() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        sim.with(|state| {
            for port in 1..=(MESSAGE_QUEUE_DEPTH as u8 + 1) {
                state.push_frame(port, FirmwareSim::event_frame(0x0004, 0, &[]));
            }
        });
        transport.poll_and_dispatch(&queue);
        assert_eq!(transport.stats().frames_dropped, 1);
        assert!(queue.is_full());
    }
    #[test]
    fn bus_error_is_recorded() {
        let sim = FirmwareSim::new();
        let queue = MessageQueue::new();
        let mut transport = transport(&sim);
        sim.with(|state| state.fail_reads = true);
        assert_eq!(transport.poll_and_dispatch(&queue), PollSummary::default());
        assert_eq!(transport.stats().bus_errors, 1);
    }
}
