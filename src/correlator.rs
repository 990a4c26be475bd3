//! Command/response correlation.
//!
//! The firmware processes one command at a time. The [Correlator] owns the single command
//! buffer, serializes callers on the command lock and matches every response against the
//! outstanding command, before the waiting caller is released.

use core::cell::RefCell;

use embassy_sync::{blocking_mutex, mutex::Mutex};
use embassy_time::{with_timeout, Duration};
use portable_atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::{
    command::{CommandResponse, HostCommand},
    frame::{
        BssInfo, BusHeader, CommandHeader, FrameType, SequenceNumber, BUS_HEADER_LEN,
        COMMAND_HEADER_LEN, COMMAND_ID_MASK, MAX_FRAME_LEN,
    },
    sync::{CommandCompletion, CommandSignal},
    DefaultRawMutex, ProtocolError, WifiError, WifiResult,
};

/// Where the command buffer is in its cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferState {
    #[default]
    Idle,
    /// The command was written and a response is expected.
    Sent,
    /// The response is in the buffer.
    Responded,
    TimedOut,
    Cancelled,
}

/// What became of a response handed to [Correlator::complete].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseDisposition {
    /// The response was matched and the caller released.
    Delivered,
    /// The response was for a command, that already timed out or was cancelled.
    Late,
    /// No command was outstanding.
    Unsolicited,
    /// The response violated the protocol and the outstanding command was abandoned.
    Rejected(ProtocolError),
}

/// A snapshot of the correlator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStats {
    pub sent: u32,
    pub responses: u32,
    pub timeouts: u32,
    pub protocol_errors: u32,
    pub late_responses: u32,
    pub consecutive_timeouts: u32,
}

struct Counters {
    sent: AtomicU32,
    responses: AtomicU32,
    timeouts: AtomicU32,
    protocol_errors: AtomicU32,
    late_responses: AtomicU32,
    consecutive_timeouts: AtomicU32,
}
impl Counters {
    const fn new() -> Self {
        Self {
            sent: AtomicU32::new(0),
            responses: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            protocol_errors: AtomicU32::new(0),
            late_responses: AtomicU32::new(0),
            consecutive_timeouts: AtomicU32::new(0),
        }
    }
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Write `command` including its bus and command headers into `buffer`.
///
/// Returns the length of the frame.
pub(crate) fn encode_command<C: HostCommand + ?Sized>(
    command: &C,
    sequence_number: u16,
    buffer: &mut [u8],
) -> WifiResult<usize> {
    const PAYLOAD_OFFSET: usize = BUS_HEADER_LEN + COMMAND_HEADER_LEN;
    let payload_length = command.encode(
        buffer
            .get_mut(PAYLOAD_OFFSET..)
            .ok_or(WifiError::BufferTooSmall)?,
    )?;
    let length = PAYLOAD_OFFSET + payload_length;
    BusHeader {
        length: length as u16,
        frame_type: FrameType::Command,
    }
    .write(buffer)?;
    CommandHeader {
        command: command.id().into_bits(),
        size: (COMMAND_HEADER_LEN + payload_length) as u16,
        sequence_number,
        result: 0,
    }
    .write(&mut buffer[BUS_HEADER_LEN..])?;
    Ok(length)
}

/// The buffer holding the command in flight and, once it arrived, its response.
struct CommandBuffer {
    state: BufferState,
    command_id: u16,
    sequence_number: u16,
    length: usize,
    data: [u8; MAX_FRAME_LEN],
    last_error: Option<ProtocolError>,
    /// Sequence number of the last command, that was given up on.
    abandoned: Option<u16>,
}
impl CommandBuffer {
    const fn new() -> Self {
        Self {
            state: BufferState::Idle,
            command_id: 0,
            sequence_number: 0,
            length: 0,
            data: [0; MAX_FRAME_LEN],
            last_error: None,
            abandoned: None,
        }
    }
    fn frame(&self) -> &[u8] {
        &self.data[..self.length]
    }
    /// Serialize `command` with its headers into the buffer.
    fn format<C: HostCommand + ?Sized>(
        &mut self,
        command: &C,
        sequence_number: SequenceNumber,
    ) -> WifiResult<()> {
        let sequence_number = sequence_number.into_bits();
        self.length = encode_command(command, sequence_number, &mut self.data)?;
        self.command_id = command.id().into_bits() & COMMAND_ID_MASK;
        self.sequence_number = sequence_number;
        self.last_error = None;
        self.state = BufferState::Sent;
        Ok(())
    }
    fn abandon(&mut self, state: BufferState) {
        self.state = state;
        self.abandoned = Some(self.sequence_number);
    }
    /// Check `response` against the outstanding command and store it, if it matches.
    fn accept(&mut self, frame: &[u8]) -> ResponseDisposition {
        let header = match CommandResponse::parse(frame) {
            Ok(response) => response.header,
            Err(_) if self.state == BufferState::Sent => {
                return self.reject(ProtocolError::MalformedResponse)
            }
            Err(_) => return ResponseDisposition::Unsolicited,
        };
        if self.abandoned == Some(header.sequence_number)
            && (self.state != BufferState::Sent || header.sequence_number != self.sequence_number)
        {
            return ResponseDisposition::Late;
        }
        if self.state != BufferState::Sent {
            return ResponseDisposition::Unsolicited;
        }
        if !header.is_response() {
            return self.reject(ProtocolError::MissingReplyBit);
        }
        if header.sequence_number != self.sequence_number {
            return self.reject(ProtocolError::SequenceMismatch {
                expected: self.sequence_number,
                received: header.sequence_number,
            });
        }
        if header.command_id() != self.command_id {
            return self.reject(ProtocolError::CommandMismatch {
                expected: self.command_id,
                received: header.command_id(),
            });
        }
        let Some(data) = self.data.get_mut(..frame.len()) else {
            return self.reject(ProtocolError::MalformedResponse);
        };
        data.copy_from_slice(frame);
        self.length = frame.len();
        self.state = BufferState::Responded;
        ResponseDisposition::Delivered
    }
    fn reject(&mut self, error: ProtocolError) -> ResponseDisposition {
        self.last_error = Some(error);
        self.abandon(BufferState::Idle);
        ResponseDisposition::Rejected(error)
    }
}

/// Marks the command as cancelled, if the caller stops waiting before it was resolved.
struct CancelOnDrop<'a> {
    correlator: &'a Correlator,
    sequence_number: u16,
}
impl CancelOnDrop<'_> {
    async fn wait_for_completion(&self) -> Option<CommandCompletion> {
        with_timeout(self.correlator.timeout, self.correlator.signal.wait())
            .await
            .ok()
    }
}
impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.correlator.buffer.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.state == BufferState::Sent && buffer.sequence_number == self.sequence_number
            {
                debug!("Command {:x} abandoned by its caller.", buffer.command_id);
                buffer.abandon(BufferState::Cancelled);
            }
        });
    }
}

/// Releases its slot in the caller count once dropped.
struct QueuedCaller<'a>(&'a AtomicUsize);
impl Drop for QueuedCaller<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serializes commands and matches their responses.
pub struct Correlator {
    command_lock: Mutex<DefaultRawMutex, ()>,
    buffer: blocking_mutex::Mutex<DefaultRawMutex, RefCell<CommandBuffer>>,
    signal: CommandSignal,
    sequence_counter: AtomicU8,
    callers: AtomicUsize,
    counters: Counters,
    timeout: Duration,
}
impl Correlator {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            command_lock: Mutex::new(()),
            buffer: blocking_mutex::Mutex::new(RefCell::new(CommandBuffer::new())),
            signal: CommandSignal::new(),
            sequence_counter: AtomicU8::new(0),
            callers: AtomicUsize::new(0),
            counters: Counters::new(),
            timeout,
        }
    }
    /// The next sequence number for `bss`.
    ///
    /// This is also used for frames, that bypass the command buffer, so the counter is shared.
    pub fn next_sequence_number(&self, bss: BssInfo) -> SequenceNumber {
        let counter = self
            .sequence_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        SequenceNumber::for_bss(counter, bss)
    }
    /// The state of the command buffer.
    pub fn buffer_state(&self) -> BufferState {
        self.buffer.lock(|buffer| buffer.borrow().state)
    }
    /// Check if a command has been written and awaits its response.
    pub fn is_outstanding(&self) -> bool {
        self.buffer_state() == BufferState::Sent
    }
    /// The amount of callers currently in [Correlator::exchange], including the one with a
    /// command in flight.
    pub fn callers(&self) -> usize {
        self.callers.load(Ordering::Relaxed)
    }
    pub fn consecutive_timeouts(&self) -> u32 {
        self.counters.consecutive_timeouts.load(Ordering::Relaxed)
    }
    pub fn stats(&self) -> CommandStats {
        let counters = &self.counters;
        CommandStats {
            sent: counters.sent.load(Ordering::Relaxed),
            responses: counters.responses.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
            late_responses: counters.late_responses.load(Ordering::Relaxed),
            consecutive_timeouts: counters.consecutive_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Send `command` and wait for its response.
    ///
    /// The formatted frame, including the bus header, is handed to `write`, which is expected to
    /// put it on the command port. Commands the firmware never answers are decoded from an empty
    /// response, as soon as the write succeeded.
    pub async fn exchange<C: HostCommand + ?Sized>(
        &self,
        command: &mut C,
        bss: BssInfo,
        write: impl FnOnce(&[u8]) -> WifiResult<()>,
    ) -> WifiResult<C::Response> {
        self.callers.fetch_add(1, Ordering::Relaxed);
        let _queued_caller = QueuedCaller(&self.callers);
        let _command_guard = self.command_lock.lock().await;

        let id = command.id();
        let sequence_number = self.next_sequence_number(bss);
        self.signal.reset();
        self.buffer.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            buffer.format(&*command, sequence_number)?;
            write(buffer.frame()).map_err(|err| {
                error!("Writing command {:x} failed: {:?}", id.into_bits(), err);
                buffer.state = BufferState::Idle;
                WifiError::Protocol(ProtocolError::WriteFailed)
            })
        })?;
        Counters::bump(&self.counters.sent);
        trace!(
            "Sent command {:x} with sequence number {:x}.",
            id.into_bits(),
            sequence_number.into_bits()
        );

        if !id.expects_response() {
            let header = self.buffer.lock(|buffer| {
                let mut buffer = buffer.borrow_mut();
                buffer.state = BufferState::Idle;
                CommandResponse::parse(buffer.frame()).map(|response| response.header)
            })?;
            return command.decode(&CommandResponse {
                header,
                payload: &[],
            });
        }

        let cancel_on_drop = CancelOnDrop {
            correlator: self,
            sequence_number: sequence_number.into_bits(),
        };
        let completion = match cancel_on_drop.wait_for_completion().await {
            Some(completion) => completion,
            None => match self.resolve_timeout() {
                Some(completion) => completion,
                None => {
                    warn!("Command {:x} timed out.", id.into_bits());
                    Counters::bump(&self.counters.timeouts);
                    Counters::bump(&self.counters.consecutive_timeouts);
                    return Err(WifiError::Timeout);
                }
            },
        };
        match completion {
            CommandCompletion::Responded => self.buffer.lock(|buffer| {
                let mut buffer = buffer.borrow_mut();
                let result = CommandResponse::parse(buffer.frame()).and_then(|response| {
                    match response.header.result {
                        0 => command.decode(&response),
                        result => {
                            debug!("Command {:x} failed with {}.", id.into_bits(), result);
                            Err(WifiError::CommandFailed { result })
                        }
                    }
                });
                buffer.state = BufferState::Idle;
                result
            }),
            CommandCompletion::Rejected => Err(WifiError::Protocol(
                self.buffer
                    .lock(|buffer| buffer.borrow_mut().last_error.take())
                    .unwrap_or(ProtocolError::MalformedResponse),
            )),
            CommandCompletion::Cancelled => Err(WifiError::Cancelled),
        }
    }
    /// Give up on the outstanding command after the timeout elapsed.
    ///
    /// If the command was resolved in the meantime, that completion is returned instead.
    fn resolve_timeout(&self) -> Option<CommandCompletion> {
        self.buffer.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            match buffer.state {
                BufferState::Sent => {
                    buffer.abandon(BufferState::TimedOut);
                    None
                }
                BufferState::Responded => Some(CommandCompletion::Responded),
                BufferState::Cancelled => Some(CommandCompletion::Cancelled),
                _ => Some(CommandCompletion::Rejected),
            }
        })
    }

    /// Hand a response frame, starting at the bus header, to the correlator.
    ///
    /// `on_response` is called with validated responses, before the waiting caller is released.
    pub fn complete(
        &self,
        frame: &[u8],
        on_response: impl FnOnce(&CommandResponse<'_>),
    ) -> ResponseDisposition {
        let disposition = self.buffer.lock(|buffer| buffer.borrow_mut().accept(frame));
        match disposition {
            ResponseDisposition::Delivered => {
                Counters::bump(&self.counters.responses);
                self.counters
                    .consecutive_timeouts
                    .store(0, Ordering::Relaxed);
                if let Ok(response) = CommandResponse::parse(frame) {
                    on_response(&response);
                }
                self.signal.signal(CommandCompletion::Responded);
            }
            ResponseDisposition::Rejected(error) => {
                error!("Protocol violation: {:?}", error);
                Counters::bump(&self.counters.protocol_errors);
                self.signal.signal(CommandCompletion::Rejected);
            }
            ResponseDisposition::Late => {
                warn!("Dropping late response.");
                Counters::bump(&self.counters.late_responses);
            }
            ResponseDisposition::Unsolicited => {
                warn!("Dropping unsolicited response.");
            }
        }
        disposition
    }
    /// Cancel the outstanding command.
    ///
    /// The waiting caller returns [WifiError::Cancelled] and a late response will be dropped.
    /// Returns `false`, if no command was outstanding.
    pub fn cancel(&self) -> bool {
        let cancelled = self.buffer.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.state == BufferState::Sent {
                buffer.abandon(BufferState::Cancelled);
                true
            } else {
                false
            }
        });
        if cancelled {
            self.signal.signal(CommandCompletion::Cancelled);
        }
        cancelled
    }
}
