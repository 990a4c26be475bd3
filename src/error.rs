use crate::bus::BusError;

/// Why a command exchange was rejected as a protocol violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The response didn't have the reply bit set in its command field.
    MissingReplyBit,
    /// The response carried a sequence number other than the outstanding one.
    SequenceMismatch { expected: u16, received: u16 },
    /// The response was for a different command.
    CommandMismatch { expected: u16, received: u16 },
    /// The frame was too short to hold a command header, or its size field was bogus.
    MalformedResponse,
    /// Writing the command to the command port failed.
    WriteFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WifiError {
    /// A register or block transfer on the bus failed.
    BusIo,
    /// The firmware violated the command protocol.
    Protocol(ProtocolError),
    /// No response arrived within the command timeout.
    Timeout,
    /// The card didn't wake up in time.
    WakeTimeout,
    /// The firmware didn't report readiness after download.
    FirmwareNotReady,
    /// The image doesn't start with the firmware magic.
    FirmwareNotDetected,
    /// The card requested an invalid chunk, or didn't request one in time.
    FirmwareDownloadFailed,
    /// The image is compressed and couldn't be decompressed.
    DecompressionFailed,
    /// No data port is free right now.
    ResourceExhausted,
    /// Writing a data frame failed. Retrying later may succeed.
    Congested,
    /// The link is asleep. A wake up has been requested.
    LinkAsleep,
    /// The firmware rejected the command with a non-zero result code.
    CommandFailed { result: u16 },
    /// The command was cancelled before a response arrived.
    Cancelled,
    /// A buffer was too small for the frame or payload.
    BufferTooSmall,
    /// The response payload couldn't be decoded.
    InvalidResponse,
}
impl From<BusError> for WifiError {
    fn from(_: BusError) -> Self {
        Self::BusIo
    }
}
impl From<ProtocolError> for WifiError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

pub type WifiResult<T> = Result<T, WifiError>;
