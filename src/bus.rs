//! The raw bus capability the driver is built on.
//!
//! The card is reached through function 1 of an SDIO style bus. Single registers are accessed
//! with direct (CMD52 style) transfers, while frames and the multi-port register block are moved
//! with block (CMD53 style) transfers. Everything above this trait is independent of the host
//! controller.

/// A failed bus transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// The host controller reported an error.
    Controller,
    /// The card didn't answer.
    Timeout,
    /// The CRC of the transfer didn't match.
    Crc,
}

/// Access to function 1 of the card.
///
/// Implementations are called from the bus context with the bus state locked, so they must not
/// block for longer than a single transfer takes.
pub trait SdioBus {
    /// Read a single register.
    fn read_register(&mut self, address: u32) -> Result<u8, BusError>;
    /// Write a single register.
    fn write_register(&mut self, address: u32, value: u8) -> Result<(), BusError>;
    /// Read `block_count` blocks of `block_size` bytes from `address` into `buffer`.
    ///
    /// `buffer` is at least `block_count * block_size` bytes long.
    fn read_blocks(
        &mut self,
        address: u32,
        block_count: u32,
        block_size: u32,
        buffer: &mut [u8],
    ) -> Result<(), BusError>;
    /// Write `block_count` blocks of `block_size` bytes from `buffer` to `address`.
    fn write_blocks(
        &mut self,
        address: u32,
        block_count: u32,
        block_size: u32,
        buffer: &[u8],
    ) -> Result<(), BusError>;
    /// Mask or unmask the card interrupt at the host controller.
    ///
    /// The interrupt is masked while it's being serviced and unmasked once the card has been
    /// re-armed.
    fn set_card_interrupt(&mut self, _enabled: bool) -> Result<(), BusError> {
        Ok(())
    }
}
