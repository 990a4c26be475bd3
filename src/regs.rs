//! Function 1 register map of the card.

use bitfield_struct::bitfield;

/// Host configuration register, used to wake the card.
pub const CONFIGURATION_REG: u32 = 0x00;
/// Written to [CONFIGURATION_REG] to request a wake up.
pub const HOST_POWER_UP: u8 = 0x02;

pub const HOST_INT_RSR_REG: u32 = 0x01;
/// Makes all host interrupt status bits read-to-clear.
pub const HOST_INT_RSR_MASK: u8 = 0x3f;
pub const HOST_INT_MASK_REG: u32 = 0x02;
/// Upload and download ready interrupts.
pub const HOST_INT_ENABLE: u8 = 0x03;

pub const CARD_TO_HOST_EVENT_REG: u32 = 0x30;
pub const READ_BASE_0_REG: u32 = 0x40;
pub const READ_BASE_1_REG: u32 = 0x41;
pub const CARD_FW_STATUS0_REG: u32 = 0x60;
pub const CARD_FW_STATUS1_REG: u32 = 0x61;
pub const CARD_MISC_CFG_REG: u32 = 0x6c;
/// Re-arm upload and download interrupts automatically.
pub const AUTO_RE_ENABLE_INT: u8 = 0x10;
pub const IO_PORT_0_REG: u32 = 0x78;
pub const IO_PORT_1_REG: u32 = 0x79;
pub const IO_PORT_2_REG: u32 = 0x7a;
pub const FN1_BLOCK_SIZE_0: u32 = 0x110;
pub const FN1_BLOCK_SIZE_1: u32 = 0x111;

/// Value of the firmware status registers, once the firmware is up.
pub const FIRMWARE_READY: u16 = 0xfedc;

/// Address of the multi-port register block.
pub const MP_REGS_ADDRESS: u32 = 0x00;
/// Size of the multi-port register block.
pub const MAX_MP_REGS: usize = 64;

// Offsets into the multi-port register block.
pub const HOST_INT_STATUS: usize = 0x03;
pub const RD_BITMAP_L: usize = 0x04;
pub const RD_BITMAP_U: usize = 0x05;
pub const WR_BITMAP_L: usize = 0x06;
pub const WR_BITMAP_U: usize = 0x07;
pub const RD_LEN_P0_L: usize = 0x08;
pub const RD_LEN_P0_U: usize = 0x09;

/// Block size used for all transfers on function 1.
pub const BLOCK_SIZE: usize = 256;
/// The largest chunk the card may request during firmware download.
pub const WLAN_UPLD_SIZE: usize = 2312;
/// Size of the staging buffer for block transfers.
pub const SCRATCH_LEN: usize = WLAN_UPLD_SIZE.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

pub const MAX_PORT: u8 = 16;
pub const CTRL_PORT: u8 = 0;
pub const CTRL_PORT_MASK: u16 = 0x0001;
pub const DATA_PORT_MASK: u16 = 0xfffe;

#[bitfield(u8)]
/// The interrupt status byte of the multi-port register block.
pub struct HostIntStatus {
    /// The card has frames for the host.
    pub upload: bool,
    /// The card has freed write ports.
    pub download: bool,
    #[bits(6)]
    pub __: u8,
}

#[bitfield(u8)]
/// Contents of [CARD_TO_HOST_EVENT_REG].
pub struct CardStatus {
    pub download_card_ready: bool,
    pub upload_card_ready: bool,
    #[bits(1)]
    pub __reserved_0: u8,
    pub card_io_ready: bool,
    #[bits(4)]
    pub __reserved_1: u8,
}
impl CardStatus {
    /// Check if the card accepts the next firmware chunk.
    pub const fn ready_for_download(&self) -> bool {
        self.download_card_ready() && self.card_io_ready()
    }
}

/// A snapshot of the multi-port register block, read in a single transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpRegs(pub [u8; MAX_MP_REGS]);
impl MpRegs {
    pub const fn new() -> Self {
        Self([0; MAX_MP_REGS])
    }
    pub const fn host_int_status(&self) -> HostIntStatus {
        HostIntStatus::from_bits(self.0[HOST_INT_STATUS])
    }
    /// Ports holding a frame for the host.
    pub const fn read_bitmap(&self) -> u16 {
        u16::from_le_bytes([self.0[RD_BITMAP_L], self.0[RD_BITMAP_U]])
    }
    /// Ports the host may write to.
    pub const fn write_bitmap(&self) -> u16 {
        u16::from_le_bytes([self.0[WR_BITMAP_L], self.0[WR_BITMAP_U]])
    }
    /// Length of the frame waiting on `port`.
    pub const fn read_length(&self, port: u8) -> u16 {
        let offset = port as usize * 2;
        u16::from_le_bytes([self.0[RD_LEN_P0_L + offset], self.0[RD_LEN_P0_U + offset]])
    }
}
impl Default for MpRegs {
    fn default() -> Self {
        Self::new()
    }
}

/// How a transfer of a given length is split into blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferShape {
    pub block_count: u32,
    pub block_size: u32,
}
impl TransferShape {
    /// The smallest shape covering `length` bytes.
    ///
    /// Anything above two blocks is sent as multiple blocks, shorter transfers as a single
    /// block rounded up to the block size.
    pub const fn for_length(length: usize) -> Self {
        let blocks = if length == 0 {
            1
        } else {
            length.div_ceil(BLOCK_SIZE)
        };
        if length > 2 * BLOCK_SIZE {
            Self {
                block_count: blocks as u32,
                block_size: BLOCK_SIZE as u32,
            }
        } else {
            Self {
                block_count: 1,
                block_size: (blocks * BLOCK_SIZE) as u32,
            }
        }
    }
    /// The amount of bytes actually moved on the bus.
    pub const fn total_length(&self) -> usize {
        self.block_count as usize * self.block_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_shape() {
        assert_eq!(
            TransferShape::for_length(12),
            TransferShape {
                block_count: 1,
                block_size: 256
            }
        );
        assert_eq!(
            TransferShape::for_length(300),
            TransferShape {
                block_count: 1,
                block_size: 512
            }
        );
        assert_eq!(
            TransferShape::for_length(513),
            TransferShape {
                block_count: 3,
                block_size: 256
            }
        );
        assert_eq!(TransferShape::for_length(2048).total_length(), 2048);
    }
    #[test]
    fn mp_regs_fields() {
        let mut regs = MpRegs::new();
        regs.0[HOST_INT_STATUS] = 0x01;
        regs.0[RD_BITMAP_L] = 0x05;
        regs.0[WR_BITMAP_U] = 0x80;
        regs.0[RD_LEN_P0_L + 4] = 0x40;
        regs.0[RD_LEN_P0_U + 4] = 0x01;
        assert!(regs.host_int_status().upload());
        assert!(!regs.host_int_status().download());
        assert_eq!(regs.read_bitmap(), 0x0005);
        assert_eq!(regs.write_bitmap(), 0x8000);
        assert_eq!(regs.read_length(2), 0x0140);
    }
    #[test]
    fn card_status() {
        assert!(CardStatus::from_bits(0x09).ready_for_download());
        assert!(!CardStatus::from_bits(0x01).ready_for_download());
    }
}
