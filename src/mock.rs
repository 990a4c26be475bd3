//! A simulated card for tests.
//!
//! [FirmwareSim] holds the state of the card, [MockBus] is the [SdioBus] handed to the
//! transport. Both share the same state, so tests can inspect and drive the card while the
//! transport owns the bus.

use std::{
    boxed::Box,
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    vec::Vec,
};

use crate::{
    bus::{BusError, SdioBus},
    frame::{BssType, BusHeader, CommandHeader, FrameType, BUS_HEADER_LEN, RESPONSE_BIT},
    regs::*,
    transport::TX_DESCRIPTOR_LEN,
};

/// Base address of the ports of the simulated card.
pub const IO_PORT: u32 = 0x0001_0000;
const EVENT_PS_AWAKE: u16 = 0x000a;

/// Produces the response frame for a command, if the firmware should answer it.
pub type Responder = Box<dyn FnMut(&CommandHeader, &[u8]) -> Option<Vec<u8>> + Send>;

pub struct SimState {
    registers: HashMap<u32, u8>,
    register_writes: Vec<(u32, u8)>,
    mp_regs: [u8; MAX_MP_REGS],
    backlog: VecDeque<(u8, Vec<u8>)>,
    ports: [Option<Vec<u8>>; MAX_PORT as usize],
    writes: Vec<(u32, Vec<u8>)>,
    firmware_chunks: Vec<Vec<u8>>,
    downloading: bool,
    chunk_request: u16,
    irq_pending: bool,
    responder: Option<Responder>,
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Keep the firmware status registers cleared.
    pub firmware_stays_down: bool,
    /// Answer a wake up request with an awake event.
    pub wake_on_power_up: bool,
}
impl SimState {
    fn new() -> Self {
        let mut registers = HashMap::new();
        for (shift, register) in [IO_PORT_0_REG, IO_PORT_1_REG, IO_PORT_2_REG]
            .into_iter()
            .enumerate()
        {
            registers.insert(register, (IO_PORT >> (shift * 8)) as u8);
        }
        Self {
            registers,
            register_writes: Vec::new(),
            mp_regs: [0; MAX_MP_REGS],
            backlog: VecDeque::new(),
            ports: Default::default(),
            writes: Vec::new(),
            firmware_chunks: Vec::new(),
            downloading: false,
            chunk_request: 0,
            irq_pending: false,
            responder: None,
            fail_reads: false,
            fail_writes: false,
            firmware_stays_down: false,
            wake_on_power_up: true,
        }
    }

    /// Pretend the firmware isn't running and request chunks of `chunk` bytes.
    pub fn expect_firmware(&mut self, chunk: u16) {
        self.downloading = true;
        self.chunk_request = chunk;
    }
    pub fn firmware_chunks(&self) -> &[Vec<u8>] {
        &self.firmware_chunks
    }
    /// The last value written to `address`.
    pub fn register(&self, address: u32) -> u8 {
        self.registers.get(&address).copied().unwrap_or_default()
    }
    pub fn register_writes(&self) -> &[(u32, u8)] {
        &self.register_writes
    }
    pub fn respond_with(
        &mut self,
        responder: impl FnMut(&CommandHeader, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) {
        self.responder = Some(Box::new(responder));
    }

    fn set_bitmap(&mut self, low: usize, high: usize, bitmap: u16) {
        let [l, h] = bitmap.to_le_bytes();
        self.mp_regs[low] = l;
        self.mp_regs[high] = h;
    }
    fn bitmap(&self, low: usize, high: usize) -> u16 {
        u16::from_le_bytes([self.mp_regs[low], self.mp_regs[high]])
    }
    fn raise(&mut self, status: HostIntStatus) {
        self.mp_regs[HOST_INT_STATUS] |= status.into_bits();
        self.irq_pending = true;
    }

    /// Set the write bitmap without raising an interrupt.
    pub fn set_write_bitmap(&mut self, bitmap: u16) {
        self.set_bitmap(WR_BITMAP_L, WR_BITMAP_U, bitmap);
    }
    /// Free the ports in `bitmap` and raise a download interrupt.
    pub fn raise_download(&mut self, bitmap: u16) {
        self.set_write_bitmap(bitmap);
        self.raise(HostIntStatus::new().with_download(true));
    }
    /// Set the write bitmap, but only raise an upload interrupt.
    pub fn raise_upload_only(&mut self, write_bitmap: u16) {
        self.set_write_bitmap(write_bitmap);
        self.raise(HostIntStatus::new().with_upload(true));
    }
    /// Queue `frame` for the host on `port`.
    pub fn push_frame(&mut self, port: u8, frame: Vec<u8>) {
        if self.ports[port as usize].is_some() {
            self.backlog.push_back((port, frame));
            return;
        }
        let length_offset = RD_LEN_P0_L + port as usize * 2;
        let [l, h] = (frame.len() as u16).to_le_bytes();
        self.mp_regs[length_offset] = l;
        self.mp_regs[length_offset + 1] = h;
        self.ports[port as usize] = Some(frame);
        let read_bitmap = self.bitmap(RD_BITMAP_L, RD_BITMAP_U) | (1 << port);
        self.set_bitmap(RD_BITMAP_L, RD_BITMAP_U, read_bitmap);
        self.raise(HostIntStatus::new().with_upload(true));
    }
    /// Check and clear, if the card asserted its interrupt.
    pub fn take_irq(&mut self) -> bool {
        core::mem::take(&mut self.irq_pending)
    }
    /// Everything written to the data ports.
    pub fn data_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.writes
            .iter()
            .filter(|(address, _)| *address != IO_PORT)
            .cloned()
            .collect()
    }
    /// Everything written to the command port.
    pub fn command_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.writes
            .iter()
            .filter(|(address, _)| *address == IO_PORT)
            .cloned()
            .collect()
    }
    /// The command headers of all commands received so far.
    pub fn commands(&self) -> Vec<CommandHeader> {
        self.command_writes()
            .iter()
            .filter_map(|(_, frame)| CommandHeader::read(&frame[BUS_HEADER_LEN..]).ok())
            .collect()
    }

    fn firmware_status(&self) -> u16 {
        if self.firmware_stays_down || (self.downloading && self.firmware_chunks.is_empty()) {
            0
        } else {
            FIRMWARE_READY
        }
    }
    fn read_port(&mut self, port: u8, buffer: &mut [u8]) -> Result<(), BusError> {
        let frame = self.ports[port as usize]
            .take()
            .ok_or(BusError::Controller)?;
        buffer.fill(0);
        buffer[..frame.len()].copy_from_slice(&frame);
        let read_bitmap = self.bitmap(RD_BITMAP_L, RD_BITMAP_U) & !(1 << port);
        self.set_bitmap(RD_BITMAP_L, RD_BITMAP_U, read_bitmap);
        if let Some(index) = self.backlog.iter().position(|(queued, _)| *queued == port) {
            if let Some((port, frame)) = self.backlog.remove(index) {
                self.push_frame(port, frame);
            }
        }
        Ok(())
    }
    fn receive_command(&mut self, frame: &[u8]) {
        // The command port is busy, until the response has been queued.
        let write_bitmap = self.bitmap(WR_BITMAP_L, WR_BITMAP_U) & !(CTRL_PORT_MASK);
        self.set_write_bitmap(write_bitmap);
        let Ok(header) = CommandHeader::read(&frame[BUS_HEADER_LEN..]) else {
            return;
        };
        let size = (header.size as usize).min(frame.len() - BUS_HEADER_LEN);
        let payload = frame[BUS_HEADER_LEN..BUS_HEADER_LEN + size]
            .get(crate::frame::COMMAND_HEADER_LEN..)
            .unwrap_or_default()
            .to_vec();
        let response = self
            .responder
            .as_mut()
            .and_then(|responder| responder(&header, &payload));
        if let Some(response) = response {
            self.set_write_bitmap(write_bitmap | CTRL_PORT_MASK);
            self.push_frame(CTRL_PORT, response);
        }
    }
}

/// The simulated card.
#[derive(Clone)]
pub struct FirmwareSim {
    state: Arc<Mutex<SimState>>,
}
impl FirmwareSim {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }
    pub fn bus(&self) -> MockBus {
        MockBus {
            state: self.state.clone(),
        }
    }
    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn frame(frame_type: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(BUS_HEADER_LEN + body.len());
        frame.extend_from_slice(&((BUS_HEADER_LEN + body.len()) as u16).to_le_bytes());
        frame.extend_from_slice(&frame_type.to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }
    /// A frame of arbitrary type.
    pub fn raw_frame(frame_type: u16, payload: &[u8]) -> Vec<u8> {
        Self::frame(frame_type, payload)
    }
    pub fn event_frame(id: u16, bss_num: u8, payload: &[u8]) -> Vec<u8> {
        let cause = id as u32 | ((bss_num as u32) << 16);
        let mut body = cause.to_le_bytes().to_vec();
        body.extend_from_slice(payload);
        Self::frame(FrameType::Event.into_bits(), &body)
    }
    /// A received data frame, including its receive descriptor.
    pub fn data_frame(bss_type: BssType, bss_num: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = std::vec![0u8; TX_DESCRIPTOR_LEN];
        body[0] = bss_type.into_bits();
        body[1] = bss_num;
        body[2..4].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        body[4..6].copy_from_slice(&(TX_DESCRIPTOR_LEN as u16).to_le_bytes());
        body.extend_from_slice(payload);
        Self::frame(FrameType::Data.into_bits(), &body)
    }
    /// A response to command `id`.
    pub fn response_frame(id: u16, sequence_number: u16, result: u16, payload: &[u8]) -> Vec<u8> {
        let mut body = std::vec![0u8; crate::frame::COMMAND_HEADER_LEN];
        CommandHeader {
            command: id | RESPONSE_BIT,
            size: (crate::frame::COMMAND_HEADER_LEN + payload.len()) as u16,
            sequence_number,
            result,
        }
        .write(&mut body)
        .unwrap();
        body.extend_from_slice(payload);
        Self::frame(FrameType::Command.into_bits(), &body)
    }
}

/// The bus end of the [FirmwareSim].
pub struct MockBus {
    state: Arc<Mutex<SimState>>,
}
impl SdioBus for MockBus {
    fn read_register(&mut self, address: u32) -> Result<u8, BusError> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(BusError::Controller);
        }
        let [status_low, status_high] = state.firmware_status().to_le_bytes();
        let [chunk_low, chunk_high] = state.chunk_request.to_le_bytes();
        Ok(match address {
            CARD_TO_HOST_EVENT_REG if state.downloading => CardStatus::new()
                .with_download_card_ready(true)
                .with_card_io_ready(true)
                .into_bits(),
            READ_BASE_0_REG if state.downloading => chunk_low,
            READ_BASE_1_REG if state.downloading => chunk_high,
            CARD_FW_STATUS0_REG => status_low,
            CARD_FW_STATUS1_REG => status_high,
            _ => state.register(address),
        })
    }
    fn write_register(&mut self, address: u32, value: u8) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(BusError::Controller);
        }
        state.registers.insert(address, value);
        state.register_writes.push((address, value));
        match (address, value) {
            (HOST_INT_MASK_REG, HOST_INT_ENABLE) => state.downloading = false,
            (CONFIGURATION_REG, HOST_POWER_UP) if state.wake_on_power_up => {
                let frame = FirmwareSim::event_frame(EVENT_PS_AWAKE, 0, &[]);
                state.push_frame(CTRL_PORT, frame);
            }
            _ => {}
        }
        Ok(())
    }
    fn read_blocks(
        &mut self,
        address: u32,
        block_count: u32,
        block_size: u32,
        buffer: &mut [u8],
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(BusError::Controller);
        }
        let buffer = &mut buffer[..(block_count * block_size) as usize];
        if address == MP_REGS_ADDRESS {
            buffer.copy_from_slice(&state.mp_regs[..buffer.len()]);
            // Read to clear.
            state.mp_regs[HOST_INT_STATUS] = 0;
            return Ok(());
        }
        let port = address
            .checked_sub(IO_PORT)
            .filter(|port| *port < MAX_PORT as u32)
            .ok_or(BusError::Controller)?;
        state.read_port(port as u8, buffer)
    }
    fn write_blocks(
        &mut self,
        address: u32,
        block_count: u32,
        block_size: u32,
        buffer: &[u8],
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(BusError::Controller);
        }
        let frame = buffer[..(block_count * block_size) as usize].to_vec();
        if address == IO_PORT && state.downloading {
            state.firmware_chunks.push(frame);
            return Ok(());
        }
        state.writes.push((address, frame.clone()));
        if address == IO_PORT
            && BusHeader::read(&frame).is_ok_and(|header| header.frame_type == FrameType::Command)
        {
            state.receive_command(&frame);
        }
        Ok(())
    }
}
