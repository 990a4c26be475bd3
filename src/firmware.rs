//! Firmware download.
//!
//! A firmware image starts with an eight byte header, consisting of the magic `WLFW` and the
//! length of the image body. The body is either the raw firmware or an XZ stream, which is
//! inflated on the fly by a [Decompressor]. The card pulls the image in chunks, the size of
//! which it announces in the read base registers.

use embassy_time::{Instant, Timer};

use crate::{bus::SdioBus, regs::*, transport::Transport, DriverConfig, WifiError, WifiResult};

/// Magic number at the start of every firmware image.
pub const FIRMWARE_MAGIC: u32 = u32::from_le_bytes(*b"WLFW");
const FIRMWARE_HEADER_LEN: usize = 8;
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
/// Size of the chunks compressed input is read in.
const COMPRESSED_INPUT_LEN: usize = 256;

/// Where the firmware image is read from.
///
/// This is implemented for byte slices. Images in external flash can be read through an
/// implementation wrapping the flash driver.
pub trait FirmwareSource {
    /// Length of the complete image including its header.
    fn len(&self) -> usize;
    /// Fill `buffer` with the image contents starting at `offset`.
    fn read(&mut self, offset: usize, buffer: &mut [u8]) -> WifiResult<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl FirmwareSource for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
    fn read(&mut self, offset: usize, buffer: &mut [u8]) -> WifiResult<()> {
        buffer.copy_from_slice(
            self.get(offset..offset + buffer.len())
                .ok_or(WifiError::BufferTooSmall)?,
        );
        Ok(())
    }
}

/// Progress of a single [Decompressor::decompress] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecompressProgress {
    /// Input bytes consumed.
    pub consumed: usize,
    /// Output bytes produced.
    pub produced: usize,
    /// The end of the stream was reached.
    pub finished: bool,
}

/// A streaming decompressor for compressed firmware images.
pub trait Decompressor {
    /// Prepare for a new stream.
    fn reset(&mut self);
    /// Decompress as much of `input` into `output` as possible.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> WifiResult<DecompressProgress>;
}

/// The body of the image, following the header.
struct ImageBody<'f, F: ?Sized> {
    source: &'f mut F,
    length: usize,
}
impl<F: FirmwareSource + ?Sized> ImageBody<'_, F> {
    fn read(&mut self, offset: usize, buffer: &mut [u8]) -> WifiResult<()> {
        self.source
            .read(FIRMWARE_HEADER_LEN + offset, buffer)
            .map_err(|_| WifiError::FirmwareDownloadFailed)
    }
    /// Fill `buffer` with the bytes following `offset` and advance it. Returns the amount read,
    /// which is only short at the end of the image.
    fn read_next(&mut self, offset: &mut usize, buffer: &mut [u8]) -> WifiResult<usize> {
        let length = buffer.len().min(self.length - *offset);
        if length != 0 {
            self.read(*offset, &mut buffer[..length])?;
            *offset += length;
        }
        Ok(length)
    }
}

/// Validate the header and return the length of the body.
fn parse_header<F: FirmwareSource + ?Sized>(source: &mut F) -> WifiResult<usize> {
    let mut header = [0u8; FIRMWARE_HEADER_LEN];
    if source.len() < FIRMWARE_HEADER_LEN || source.read(0, &mut header).is_err() {
        return Err(WifiError::FirmwareNotDetected);
    }
    let [magic @ .., _, _, _, _] = header;
    let [_, _, _, _, length @ ..] = header;
    if u32::from_le_bytes(magic) != FIRMWARE_MAGIC {
        error!("WLAN firmware not detected.");
        return Err(WifiError::FirmwareNotDetected);
    }
    let length = u32::from_le_bytes(length) as usize;
    if length > source.len() - FIRMWARE_HEADER_LEN {
        error!("Firmware header claims {} bytes, but the image is shorter.", length);
        return Err(WifiError::FirmwareNotDetected);
    }
    Ok(length)
}

/// Wait for the card to request the next chunk and return its length.
async fn next_chunk_length<B: SdioBus>(
    transport: &mut Transport<'_, B>,
    config: &DriverConfig,
) -> WifiResult<usize> {
    for _ in 0..config.card_status_poll_tries {
        let status = CardStatus::from_bits(transport.read_register(CARD_TO_HOST_EVENT_REG)?);
        if status.ready_for_download() {
            let length = transport.read_register_pair(READ_BASE_0_REG, READ_BASE_1_REG)? as usize;
            if length > WLAN_UPLD_SIZE {
                error!("Card requested invalid chunk length {}.", length);
                return Err(WifiError::FirmwareDownloadFailed);
            }
            if length != 0 {
                return Ok(length);
            }
        }
        Timer::after(config.poll_interval).await;
    }
    error!("Card didn't request the next firmware chunk.");
    Err(WifiError::FirmwareDownloadFailed)
}

async fn download_raw<B: SdioBus, F: FirmwareSource + ?Sized>(
    transport: &mut Transport<'_, B>,
    image: &mut ImageBody<'_, F>,
    config: &DriverConfig,
) -> WifiResult<()> {
    let io_port = transport.io_port();
    let mut offset = 0;
    while offset < image.length {
        let requested = next_chunk_length(transport, config).await?;
        let length = requested.min(image.length - offset);
        transport.write_in_place(io_port, length, |chunk| {
            image.read(offset, chunk)?;
            Ok(chunk.len())
        })?;
        offset += length;
    }
    Ok(())
}

async fn download_compressed<B: SdioBus, F: FirmwareSource + ?Sized>(
    transport: &mut Transport<'_, B>,
    image: &mut ImageBody<'_, F>,
    decompressor: &mut dyn Decompressor,
    config: &DriverConfig,
) -> WifiResult<()> {
    let io_port = transport.io_port();
    let mut input = [0u8; COMPRESSED_INPUT_LEN];
    let mut input_start = 0;
    let mut input_end = 0;
    let mut read_offset = 0;
    let mut finished = false;
    decompressor.reset();

    while !finished {
        let requested = next_chunk_length(transport, config).await?;
        transport.write_in_place(io_port, requested, |chunk| {
            let mut produced = 0;
            while produced < chunk.len() {
                if input_start == input_end {
                    input_start = 0;
                    input_end = image.read_next(&mut read_offset, &mut input)?;
                }
                let progress = decompressor
                    .decompress(&input[input_start..input_end], &mut chunk[produced..])
                    .map_err(|_| WifiError::DecompressionFailed)?;
                input_start += progress.consumed;
                produced += progress.produced;
                if progress.finished {
                    finished = true;
                    break;
                }
                if progress.consumed == 0 && progress.produced == 0 {
                    // The decompressor needs more than what's left of the input window.
                    input.copy_within(input_start..input_end, 0);
                    input_end -= input_start;
                    input_start = 0;
                    let read = image.read_next(&mut read_offset, &mut input[input_end..])?;
                    if read == 0 {
                        error!("Compressed firmware image is truncated.");
                        return Err(WifiError::DecompressionFailed);
                    }
                    input_end += read;
                }
            }
            Ok(produced)
        })?;
    }
    debug!("Decompression successful.");
    Ok(())
}

/// Wait for the firmware to report, that it's running.
async fn wait_for_ready<B: SdioBus>(
    transport: &mut Transport<'_, B>,
    config: &DriverConfig,
) -> WifiResult<()> {
    for _ in 0..config.firmware_ready_poll_tries {
        if let Ok(FIRMWARE_READY) = transport.firmware_status() {
            return Ok(());
        }
        Timer::after(config.poll_interval).await;
    }
    error!("Firmware ready registers not set.");
    Err(WifiError::FirmwareNotReady)
}

/// Download the firmware image to the card and wait for it to come up.
pub(crate) async fn download<B: SdioBus, F: FirmwareSource + ?Sized>(
    transport: &mut Transport<'_, B>,
    firmware: &mut F,
    decompressor: Option<&mut dyn Decompressor>,
    config: &DriverConfig,
) -> WifiResult<()> {
    trace!("Setting firmware download block size.");
    transport.write_register(FN1_BLOCK_SIZE_0, 0)?;
    transport.write_register(FN1_BLOCK_SIZE_1, 1)?;

    let length = parse_header(firmware)?;
    let mut image = ImageBody {
        source: firmware,
        length,
    };
    let mut magic = [0u8; XZ_MAGIC.len()];
    let compressed = length >= XZ_MAGIC.len() && {
        image.read(0, &mut magic)?;
        magic == XZ_MAGIC
    };

    let start_time = Instant::now();
    if compressed {
        let Some(decompressor) = decompressor else {
            error!("Firmware image is compressed, but no decompressor was provided.");
            return Err(WifiError::DecompressionFailed);
        };
        debug!("XZ compressed image found, length: {}", length);
        download_compressed(transport, &mut image, decompressor, config).await?;
    } else {
        debug!("Uncompressed image found, length: {}", length);
        download_raw(transport, &mut image, config).await?;
    }
    wait_for_ready(transport, config).await?;
    info!(
        "Firmware download complete. Took {} ms",
        start_time.elapsed().as_millis()
    );
    Ok(())
}
