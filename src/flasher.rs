// Copyright 2022 Stephen Checkoway
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::borrow::Cow;
use std::cmp::min;
use std::io::Write;
use std::rc::Rc;
use std::thread::sleep;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;

use crate::chip::Chip;
use crate::command::Command;
use crate::connection::Connection;
use crate::error::RomError;
use crate::event::{Event, EventObserver};
use crate::interface::{Interface, SerialInterface};
use crate::{from_le, Error, Result};

// Register probed to identify the connected chip.
const CHIP_MAGIC_REG: u32 = 0x40001000;

/// Default block size for flash streaming.
pub const FLASH_WRITE_SIZE: u32 = 0x400;

const MAX_RAM_BLOCK_SIZE: u32 = 0x1800;

// Flash geometry reported through SPI_SET_PARAMS.
const FLASH_BLOCK_SIZE: u32 = 0x10000;
const FLASH_SECTOR_SIZE: u32 = 0x1000;
const FLASH_PAGE_SIZE: u32 = 0x100;
const FLASH_STATUS_MASK: u32 = 0xFFFF;

// Assumed capacity when the JEDEC probe fails.
const DEFAULT_FLASH_SIZE: u32 = 0x40_0000;

const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);

// JEDEC read-identification opcode.
const CMD_READ_ID: u8 = 0x9F;

const PADDING_PATTERN: u8 = 0xFF;

// SPI_CMD_REG and SPI_USER_REG bits, identical across the supported
// targets.
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;

// Digest accumulated while streaming a flash image, for the post-write
// verification against the target.
struct ImageDigest {
    address: u32,
    size: u32,
    context: md5::Context,
}

impl ImageDigest {
    fn new(address: u32, size: u32) -> Self {
        ImageDigest {
            address,
            size,
            context: md5::Context::new(),
        }
    }
}

/// A session with a single target: synchronization, chip identification,
/// flash and RAM downloads, digest verification.
pub struct Flasher<I> {
    connection: Connection<I>,
    chip: Option<Chip>,
    flash_size: Option<u32>,
    write_size: u32,
    sequence: u32,
    digest: Option<ImageDigest>,
}

impl Flasher<SerialInterface> {
    /// Open `path` at the loader's initial baud rate.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Flasher::new(SerialInterface::open(path, 115_200)?))
    }
}

impl<I: Interface> Flasher<I> {
    pub fn new(interface: I) -> Self {
        Flasher {
            connection: Connection::new(interface),
            chip: None,
            flash_size: None,
            write_size: 0,
            sequence: 0,
            digest: None,
        }
    }

    pub fn add_observer<O>(&mut self, observer: O)
    where
        O: Into<Rc<dyn EventObserver + 'static>>,
    {
        self.connection.add_observer(observer);
    }

    pub fn remove_observer<O>(&mut self, observer: O)
    where
        O: AsRef<Rc<dyn EventObserver + 'static>>,
    {
        self.connection.remove_observer(observer);
    }

    /// The detected chip.
    pub fn chip(&self) -> Result<Chip> {
        self.chip
            .ok_or(Error::InvalidParam("no chip detected; connect first"))
    }

    pub fn set_chip(&mut self, chip: Chip) {
        self.chip = Some(chip);
        self.connection.set_status_len(chip.status_len());
    }

    /// Strap the target into its bootloader and synchronize with it,
    /// spending up to `attempts` sync probes with a short pause after each
    /// timed-out one. On success the chip is identified and its flash
    /// attached.
    pub fn connect(&mut self, attempts: usize) -> Result<()> {
        self.connection.trace(Event::Reset);
        self.connection.interface_mut().enter_bootloader()?;
        self.connection.discard_input();

        let mut synced = false;
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(SYNC_RETRY_DELAY);
            }
            match self.connection.sync() {
                Ok(()) => {
                    synced = true;
                    break;
                }
                Err(Error::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
        if !synced {
            return Err(Error::Timeout);
        }

        let chip = self.detect_chip()?;
        self.attach(chip)
    }

    /// Identify the connected chip from its magic register.
    pub fn detect_chip(&mut self) -> Result<Chip> {
        let magic = self.read_reg(CHIP_MAGIC_REG)?;
        let chip = Chip::try_from_magic(magic).ok_or(Error::UnsupportedChip(magic))?;
        self.set_chip(chip);
        Ok(chip)
    }

    // The ESP8266 ROM has no SPI_ATTACH; a zeroed FLASH_BEGIN puts its
    // flash driver into a known state instead.
    fn attach(&mut self, chip: Chip) -> Result<()> {
        if chip == Chip::Esp8266 {
            self.connection.exchange(Command::FlashBegin {
                erase_size: 0,
                num_packets: 0,
                packet_size: 0,
                flash_offset: 0,
                encrypted: None,
            })?;
        } else {
            self.connection.exchange(Command::SpiAttach {
                pins: chip.spi_pins(),
                rom_only: 0,
            })?;
        }
        Ok(())
    }

    /// Reset the target out of the loader and drop all session state.
    pub fn reset(&mut self) -> Result<()> {
        self.connection.trace(Event::Reset);
        self.connection.interface_mut().reset_target()?;
        self.connection.forget_target();
        self.chip = None;
        self.flash_size = None;
        self.write_size = 0;
        self.sequence = 0;
        self.digest = None;
        Ok(())
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        let response = self.connection.exchange(Command::ReadReg { address })?;
        Ok(response.value)
    }

    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        self.connection.exchange(Command::WriteReg {
            address,
            value,
            mask,
            delay_us,
        })?;
        Ok(())
    }

    /// Issue an opcode directly to the external flash through the target's
    /// SPI controller. `tx` is limited to 64 bytes and `rx_bits` to one
    /// data word; the received word is returned.
    pub fn spi_command(&mut self, opcode: u8, tx: &[u8], rx_bits: u32) -> Result<u32> {
        if tx.len() > 64 {
            return Err(Error::InvalidParam("SPI write data is limited to 64 bytes"));
        }
        if rx_bits > 32 {
            return Err(Error::InvalidParam("SPI read length is limited to 32 bits"));
        }
        let chip = self.chip()?;
        let regs = chip.spi_regs();
        let tx_bits = tx.len() as u32 * 8;

        let saved_usr = self.read_reg(regs.usr)?;
        let saved_usr2 = self.read_reg(regs.usr2)?;

        if chip == Chip::Esp8266 {
            // Transfer lengths live in USR1 on this controller.
            let miso_mask = if rx_bits > 0 { (rx_bits - 1) << 8 } else { 0 };
            let mosi_mask = if tx_bits > 0 { (tx_bits - 1) << 17 } else { 0 };
            self.write_reg(regs.usr1, miso_mask | mosi_mask, 0xFFFFFFFF, 0)?;
        } else {
            if tx_bits > 0 {
                self.write_reg(regs.mosi_dlen, tx_bits - 1, 0xFFFFFFFF, 0)?;
            }
            if rx_bits > 0 {
                self.write_reg(regs.miso_dlen, rx_bits - 1, 0xFFFFFFFF, 0)?;
            }
        }

        let mut usr = SPI_USR_COMMAND;
        if rx_bits > 0 {
            usr |= SPI_USR_MISO;
        }
        if tx_bits > 0 {
            usr |= SPI_USR_MOSI;
        }
        self.write_reg(regs.usr, usr, 0xFFFFFFFF, 0)?;
        self.write_reg(regs.usr2, (7 << 28) | opcode as u32, 0xFFFFFFFF, 0)?;

        if tx.is_empty() {
            self.write_reg(regs.w0, 0, 0xFFFFFFFF, 0)?;
        } else {
            for (pos, word) in tx.chunks(4).enumerate() {
                self.write_reg(regs.w(pos), from_le(word), 0xFFFFFFFF, 0)?;
            }
        }
        self.write_reg(regs.cmd, SPI_CMD_USR, 0xFFFFFFFF, 0)?;

        // Every poll is a full serial round trip, which already dwarfs the
        // transaction itself; keep the loop bounded instead of deadlined.
        let mut completed = false;
        for _ in 0..10 {
            if self.read_reg(regs.cmd)? & SPI_CMD_USR == 0 {
                completed = true;
                break;
            }
        }
        if !completed {
            return Err(Error::Timeout);
        }

        let value = self.read_reg(regs.w0)?;
        self.write_reg(regs.usr, saved_usr, 0xFFFFFFFF, 0)?;
        self.write_reg(regs.usr2, saved_usr2, 0xFFFFFFFF, 0)?;
        Ok(value)
    }

    /// JEDEC identification word of the external flash: manufacturer,
    /// device type and capacity in the low 24 bits.
    pub fn flash_id(&mut self) -> Result<u32> {
        self.spi_command(CMD_READ_ID, &[], 24)
    }

    /// Capacity of the external flash in bytes, probing the part on first
    /// use.
    pub fn flash_size(&mut self) -> Result<u32> {
        if let Some(size) = self.flash_size {
            return Ok(size);
        }
        let id = self.flash_id()?;
        let capacity = (id >> 16) as u8;
        if !(0x12..=0x18).contains(&capacity) {
            return Err(Error::UnsupportedChip(id));
        }
        let size = 1u32 << capacity;
        self.flash_size = Some(size);
        Ok(size)
    }

    /// Start a raw flash stream: `image_size` bytes at `offset`, streamed
    /// in `block_size` chunks.
    pub fn flash_begin(&mut self, offset: u32, image_size: u32, block_size: u32) -> Result<()> {
        self.begin_stream(offset, image_size, image_size, block_size, false)
    }

    /// Start a deflate flash stream: `image_size` is the uncompressed
    /// image, `compressed_size` the zlib stream that goes over the wire.
    pub fn flash_defl_begin(
        &mut self,
        offset: u32,
        image_size: u32,
        compressed_size: u32,
        block_size: u32,
    ) -> Result<()> {
        let chip = self.chip()?;
        if !chip.supports_compression() {
            return Err(Error::UnsupportedFunc {
                chip,
                what: "compressed flashing",
            });
        }
        self.begin_stream(offset, image_size, compressed_size, block_size, true)
    }

    fn begin_stream(
        &mut self,
        offset: u32,
        image_size: u32,
        wire_size: u32,
        block_size: u32,
        compressed: bool,
    ) -> Result<()> {
        let chip = self.chip()?;
        if block_size == 0 {
            return Err(Error::InvalidParam("block size must be nonzero"));
        }

        let num_packets = (wire_size + block_size - 1) / block_size;
        // The device erases whole blocks regardless of how much of the last
        // one the image covers.
        let erase_size = ((image_size + block_size - 1) / block_size) * block_size;

        match self.flash_size() {
            Ok(flash_size) => {
                if offset as u64 + image_size as u64 > flash_size as u64 {
                    return Err(Error::ImageSize {
                        offset,
                        image_size,
                        flash_size,
                    });
                }
            }
            Err(err) => debug!("flash size detection failed ({err}); skipping the bounds check"),
        }

        if chip != Chip::Esp8266 {
            self.connection.exchange(Command::SpiSetParams {
                id: 0,
                total_size: self.flash_size.unwrap_or(DEFAULT_FLASH_SIZE),
                block_size: FLASH_BLOCK_SIZE,
                sector_size: FLASH_SECTOR_SIZE,
                page_size: FLASH_PAGE_SIZE,
                status_mask: FLASH_STATUS_MASK,
            })?;
        }

        self.digest = Some(ImageDigest::new(offset, image_size));
        let encrypted = if chip.begin_takes_encrypted() {
            Some(0)
        } else {
            None
        };
        let begin = if compressed {
            Command::FlashDeflBegin {
                erase_size,
                num_packets,
                packet_size: block_size,
                flash_offset: offset,
                encrypted,
            }
        } else {
            Command::FlashBegin {
                erase_size,
                num_packets,
                packet_size: block_size,
                flash_offset: offset,
                encrypted,
            }
        };
        self.connection.exchange(begin)?;

        self.sequence = 0;
        self.write_size = block_size;
        Ok(())
    }

    /// Write one block of a raw stream. `data` must not exceed the block
    /// size agreed at [`Flasher::flash_begin`]; a short final block goes
    /// out padded to the full size.
    pub fn flash_write(&mut self, data: &[u8]) -> Result<()> {
        let block = self.padded_block(data)?;
        if let Some(digest) = self.digest.as_mut() {
            let digest_len = (data.len() + 3) & !3;
            digest.context.consume(&block[..digest_len]);
        }
        let cmd = Command::FlashData {
            data_size: data.len() as u32,
            sequence: self.sequence,
        };
        self.connection.exchange_with_data(cmd, &block)?;
        self.sequence += 1;
        Ok(())
    }

    /// Write one block of a deflate stream. Compressed blocks go out
    /// unpadded.
    pub fn flash_defl_write(&mut self, data: &[u8]) -> Result<()> {
        self.check_block_size(data)?;
        if let Some(digest) = self.digest.as_mut() {
            let tail = ((data.len() + 3) & !3) - data.len();
            digest.context.consume(data);
            digest.context.consume(&[PADDING_PATTERN; 3][..tail]);
        }
        let cmd = Command::FlashDeflData {
            data_size: data.len() as u32,
            sequence: self.sequence,
        };
        self.connection.exchange_with_data(cmd, data)?;
        self.sequence += 1;
        Ok(())
    }

    /// End a raw stream. With `reboot` the target leaves the loader and
    /// boots the flashed image.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        self.connection.exchange(Command::FlashEnd {
            stay_in_loader: u32::from(!reboot),
        })?;
        self.end_stream();
        Ok(())
    }

    /// End a deflate stream.
    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<()> {
        self.connection.exchange(Command::FlashDeflEnd {
            stay_in_loader: u32::from(!reboot),
        })?;
        self.end_stream();
        Ok(())
    }

    /// Ask the target for the MD5 of the region written by the last flash
    /// stream and compare it against the digest accumulated locally.
    pub fn verify_flash(&mut self) -> Result<()> {
        let chip = self.chip()?;
        if !chip.supports_flash_md5() {
            return Err(Error::UnsupportedFunc {
                chip,
                what: "flash digest verification",
            });
        }
        let digest = self
            .digest
            .take()
            .ok_or(Error::InvalidParam("nothing has been flashed"))?;
        let local = format!("{:x}", digest.context.compute());

        let response = self.connection.exchange(Command::SpiFlashMd5 {
            address: digest.address,
            size: digest.size,
        })?;
        // The ROM renders the digest as hex characters; other loader
        // revisions reply with the 16 raw bytes.
        let data = response.data;
        let remote: Cow<[u8]> = if data.len() >= 32 {
            Cow::Borrowed(&data[..32])
        } else if data.len() >= 16 {
            let mut hex = Vec::with_capacity(32);
            for byte in &data[..16] {
                hex.extend_from_slice(format!("{byte:02x}").as_bytes());
            }
            Cow::Owned(hex)
        } else {
            return Err(Error::InvalidResponse(RomError::InvalidResponse));
        };
        if remote.as_ref() != local.as_bytes() {
            return Err(Error::InvalidMd5);
        }
        Ok(())
    }

    /// Start a RAM download of `total_size` bytes at `offset`.
    pub fn mem_begin(&mut self, offset: u32, total_size: u32, block_size: u32) -> Result<()> {
        self.chip()?;
        if block_size == 0 {
            return Err(Error::InvalidParam("block size must be nonzero"));
        }
        self.connection.exchange(Command::MemBegin {
            total_size,
            num_packets: (total_size + block_size - 1) / block_size,
            packet_size: block_size,
            mem_offset: offset,
        })?;
        self.sequence = 0;
        self.write_size = block_size;
        Ok(())
    }

    /// Write one block of a RAM download.
    pub fn mem_write(&mut self, data: &[u8]) -> Result<()> {
        let block = self.padded_block(data)?;
        let cmd = Command::MemData {
            data_size: data.len() as u32,
            sequence: self.sequence,
        };
        self.connection.exchange_with_data(cmd, &block)?;
        self.sequence += 1;
        Ok(())
    }

    /// End a RAM download. With an entry point the loader jumps there; it
    /// may start executing before its reply makes it out, so a timed-out
    /// reply is not an error in that case.
    pub fn mem_finish(&mut self, entry: Option<u32>) -> Result<()> {
        let result = self.connection.exchange(Command::MemEnd {
            stay_in_loader: u32::from(entry.is_none()),
            entry_point: entry.unwrap_or(0),
        });
        self.end_stream();
        match result {
            Err(Error::Timeout) if entry.is_some() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Negotiate a new transfer rate with the loader. The local port keeps
    /// its rate; call [`Flasher::set_baud_rate`] once this returns.
    pub fn change_baud_rate(&mut self, new_rate: u32) -> Result<()> {
        let chip = self.chip()?;
        if !chip.supports_baud_change() {
            return Err(Error::UnsupportedFunc {
                chip,
                what: "baud rate changes",
            });
        }
        // The ROM loader expects zero for the prior rate.
        self.connection.exchange(Command::ChangeBaudRate {
            new_rate,
            old_rate: 0,
        })?;
        Ok(())
    }

    /// Retune the local side of the link.
    pub fn set_baud_rate(&mut self, rate: u32) -> Result<()> {
        self.connection.discard_input();
        self.connection.interface_mut().set_baud_rate(rate)
    }

    /// Flash `data` at `offset` in default-size blocks and verify the
    /// written region on targets that can report a digest.
    pub fn write_flash(&mut self, offset: u32, data: &[u8], reboot: bool) -> Result<()> {
        self.flash_begin(offset, data.len() as u32, FLASH_WRITE_SIZE)?;
        for block in data.chunks(FLASH_WRITE_SIZE as usize) {
            self.flash_write(block)?;
        }
        self.flash_finish(reboot)?;
        if self.chip()?.supports_flash_md5() {
            self.verify_flash()?;
        }
        Ok(())
    }

    /// Compress `data` and flash it through the deflate path.
    pub fn write_flash_deflated(&mut self, offset: u32, data: &[u8], reboot: bool) -> Result<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        self.flash_defl_begin(
            offset,
            data.len() as u32,
            compressed.len() as u32,
            FLASH_WRITE_SIZE,
        )?;
        for block in compressed.chunks(FLASH_WRITE_SIZE as usize) {
            self.flash_defl_write(block)?;
        }
        self.flash_defl_finish(reboot)
    }

    /// Load `data` into RAM at `addr`; with `entry` the loader jumps there
    /// once the transfer ends.
    pub fn write_ram(&mut self, addr: u32, data: &[u8], entry: Option<u32>) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParam("empty image"));
        }
        let block_size = min(data.len() as u32, MAX_RAM_BLOCK_SIZE);
        self.mem_begin(addr, data.len() as u32, block_size)?;
        for block in data.chunks(block_size as usize) {
            self.mem_write(block)?;
        }
        self.mem_finish(entry)
    }

    fn check_block_size(&self, data: &[u8]) -> Result<()> {
        if self.write_size == 0 {
            return Err(Error::InvalidParam("no stream in progress"));
        }
        if data.len() > self.write_size as usize {
            return Err(Error::InvalidParam("block exceeds the agreed write size"));
        }
        Ok(())
    }

    fn padded_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.check_block_size(data)?;
        let mut block = Vec::with_capacity(self.write_size as usize);
        block.extend_from_slice(data);
        block.resize(self.write_size as usize, PADDING_PATTERN);
        Ok(block)
    }

    fn end_stream(&mut self) {
        self.write_size = 0;
        self.sequence = 0;
    }
}
