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

use std::cmp::max;
use std::io::Cursor;
use std::time::Duration;

use binrw::{binwrite, BinWrite};

use crate::from_le32;
use crate::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
// Erasing is by far the slowest flash operation; scale the deadline with
// the region being erased.
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
// A compressed block may inflate into many sectors; the expansion factor
// is unknown when the deadline is armed.
const FLASH_DEFL_DATA_TIMEOUT: Duration = Duration::from_secs(10);

const CHECKSUM_SEED: u8 = 0xEF;

/// XOR fold over a raw data payload, as placed in the request header of the
/// `*_DATA` commands.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    let mut state = CHECKSUM_SEED;
    for byte in data {
        state ^= *byte;
    }
    state
}

/// Parameter blocks of the loader commands, in wire layout (little endian).
///
/// The raw bytes of the `*_DATA` commands are not part of the parameter
/// block; the engine appends them to the frame unserialized. `Option` fields
/// serialize only when present, which is how the `encrypted` word of the
/// `*_BEGIN` commands appears on the ROMs that take it and stays off the
/// wire everywhere else.
#[derive(Debug, Clone)]
#[binwrite]
#[bw(little)]
pub enum Command {
    FlashBegin {
        erase_size: u32,
        num_packets: u32,
        packet_size: u32,
        flash_offset: u32,
        encrypted: Option<u32>,
    },
    FlashData {
        data_size: u32,
        #[bw(pad_after = 8)]
        sequence: u32,
    },
    FlashEnd {
        stay_in_loader: u32,
    },
    MemBegin {
        total_size: u32,
        num_packets: u32,
        packet_size: u32,
        mem_offset: u32,
    },
    MemEnd {
        stay_in_loader: u32,
        entry_point: u32,
    },
    MemData {
        data_size: u32,
        #[bw(pad_after = 8)]
        sequence: u32,
    },
    #[bw(magic = b"\x07\x07\x12 UUUUUUUUUUUUUUUUUUUUUUUUUUUUUUUU")]
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        id: u32,
        total_size: u32,
        block_size: u32,
        sector_size: u32,
        page_size: u32,
        status_mask: u32,
    },
    SpiAttach {
        pins: u32,
        rom_only: u32,
    },
    ChangeBaudRate {
        new_rate: u32,
        old_rate: u32,
    },
    FlashDeflBegin {
        erase_size: u32,
        num_packets: u32,
        packet_size: u32,
        flash_offset: u32,
        encrypted: Option<u32>,
    },
    FlashDeflData {
        data_size: u32,
        #[bw(pad_after = 8)]
        sequence: u32,
    },
    FlashDeflEnd {
        stay_in_loader: u32,
    },
    SpiFlashMd5 {
        address: u32,
        #[bw(pad_after = 8)]
        size: u32,
    },
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::FlashBegin { .. } => 0x02,
            Command::FlashData { .. } => 0x03,
            Command::FlashEnd { .. } => 0x04,
            Command::MemBegin { .. } => 0x05,
            Command::MemEnd { .. } => 0x06,
            Command::MemData { .. } => 0x07,
            Command::Sync => 0x08,
            Command::WriteReg { .. } => 0x09,
            Command::ReadReg { .. } => 0x0A,
            Command::SpiSetParams { .. } => 0x0B,
            Command::SpiAttach { .. } => 0x0D,
            Command::ChangeBaudRate { .. } => 0x0F,
            Command::FlashDeflBegin { .. } => 0x10,
            Command::FlashDeflData { .. } => 0x11,
            Command::FlashDeflEnd { .. } => 0x12,
            Command::SpiFlashMd5 { .. } => 0x13,
        }
    }

    pub fn name_from_code(code: u8) -> &'static str {
        match code {
            0x02 => "FlashBegin",
            0x03 => "FlashData",
            0x04 => "FlashEnd",
            0x05 => "MemBegin",
            0x06 => "MemEnd",
            0x07 => "MemData",
            0x08 => "Sync",
            0x09 => "WriteReg",
            0x0A => "ReadReg",
            0x0B => "SpiSetParams",
            0x0D => "SpiAttach",
            0x0F => "ChangeBaudRate",
            0x10 => "FlashDeflBegin",
            0x11 => "FlashDeflData",
            0x12 => "FlashDeflEnd",
            0x13 => "SpiFlashMd5",
            _ => "Unknown",
        }
    }

    /// Whether the command carries raw data bytes whose checksum goes into
    /// the request header. Every other command sends a zero checksum.
    pub(crate) fn is_data(&self) -> bool {
        matches!(
            self,
            Command::FlashData { .. } | Command::FlashDeflData { .. } | Command::MemData { .. }
        )
    }

    /// Deadline to arm for this command and its reply.
    pub fn timeout(&self) -> Duration {
        match self {
            Command::Sync => SYNC_TIMEOUT,
            Command::MemEnd { .. } => MEM_END_TIMEOUT,
            Command::FlashBegin { erase_size, .. } | Command::FlashDeflBegin { erase_size, .. } => {
                timeout_for_size(ERASE_REGION_TIMEOUT_PER_MB, *erase_size)
            }
            Command::FlashDeflData { .. } | Command::FlashDeflEnd { .. } => {
                FLASH_DEFL_DATA_TIMEOUT
            }
            Command::SpiFlashMd5 { size, .. } => timeout_for_size(MD5_TIMEOUT_PER_MB, *size),
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Serialize the parameter block.
    pub(crate) fn params(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(40));
        self.write_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

fn timeout_for_size(timeout_per_mb: Duration, size: u32) -> Duration {
    let mb = size as f64 / 1_000_000.0;
    max(
        DEFAULT_TIMEOUT,
        Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
    )
}

/// Direction byte of every response frame.
pub(crate) const DIRECTION_RESPONSE: u8 = 0x01;

const HEADER_LEN: usize = 8;

/// A parsed response frame.
///
/// The `{failed, error}` status tail terminates the frame; depending on the
/// ROM revision it is two or four bytes long, so it is located from the end
/// of the frame rather than at a fixed offset from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    pub data: Vec<u8>,
    pub failed: u8,
    pub error: u8,
}

impl Response {
    /// Parse a reassembled frame; `None` if it cannot be a response (wrong
    /// direction byte or too short for a header and a status tail).
    pub fn parse(frame: &[u8], status_len: usize) -> Option<Response> {
        if frame.len() < HEADER_LEN + status_len || frame[0] != DIRECTION_RESPONSE {
            return None;
        }
        let body = &frame[HEADER_LEN..];
        let status = body.len() - status_len;
        Some(Response {
            op: frame[1],
            value: from_le32(&frame[4..8]),
            data: body[..status].to_vec(),
            failed: body[status],
            error: body[status + 1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_an_xor_fold_seeded_with_0xef() {
        assert_eq!(checksum(&[]), 0xEF);
        assert_eq!(checksum(&[0xEF]), 0x00);
        assert_eq!(checksum(&[0x01, 0x02, 0x04]), 0xEF ^ 0x07);

        // Folding a buffer with itself cancels out to the seed.
        let data: Vec<u8> = (0..=255).collect();
        let doubled: Vec<u8> = data.iter().chain(data.iter()).copied().collect();
        assert_eq!(checksum(&doubled), 0xEF);
    }

    #[test]
    fn sync_payload_is_the_fixed_probe_pattern() {
        let params = Command::Sync.params().unwrap();
        assert_eq!(params.len(), 36);
        assert_eq!(&params[..4], &[0x07, 0x07, 0x12, 0x20]);
        assert!(params[4..].iter().all(|&byte| byte == 0x55));
    }

    #[test]
    fn begin_grows_by_one_word_when_encryption_is_supported() {
        let without = Command::FlashBegin {
            erase_size: 0x1000,
            num_packets: 4,
            packet_size: 0x400,
            flash_offset: 0x10000,
            encrypted: None,
        };
        let with = Command::FlashBegin {
            erase_size: 0x1000,
            num_packets: 4,
            packet_size: 0x400,
            flash_offset: 0x10000,
            encrypted: Some(0),
        };
        let without = without.params().unwrap();
        let with = with.params().unwrap();
        assert_eq!(without.len(), 16);
        assert_eq!(with.len(), 20);
        assert_eq!(&with[..16], &without[..]);
        assert_eq!(&with[16..], &[0, 0, 0, 0]);

        assert_eq!(&without[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&without[4..8], &4u32.to_le_bytes());
        assert_eq!(&without[8..12], &0x400u32.to_le_bytes());
        assert_eq!(&without[12..16], &0x10000u32.to_le_bytes());
    }

    #[test]
    fn data_commands_carry_two_reserved_words() {
        let params = Command::FlashData {
            data_size: 400,
            sequence: 7,
        }
        .params()
        .unwrap();
        assert_eq!(params.len(), 16);
        assert_eq!(&params[0..4], &400u32.to_le_bytes());
        assert_eq!(&params[4..8], &7u32.to_le_bytes());
        assert_eq!(&params[8..16], &[0u8; 8]);
    }

    #[test]
    fn md5_request_pads_to_four_words() {
        let params = Command::SpiFlashMd5 {
            address: 0x1000,
            size: 0x2000,
        }
        .params()
        .unwrap();
        assert_eq!(params.len(), 16);
        assert_eq!(&params[8..16], &[0u8; 8]);
    }

    #[test]
    fn erase_deadline_scales_with_the_region() {
        let small = Command::FlashBegin {
            erase_size: 0x400,
            num_packets: 1,
            packet_size: 0x400,
            flash_offset: 0,
            encrypted: None,
        };
        assert_eq!(small.timeout(), DEFAULT_TIMEOUT);

        let large = Command::FlashBegin {
            erase_size: 4_000_000,
            num_packets: 4096,
            packet_size: 0x400,
            flash_offset: 0,
            encrypted: None,
        };
        assert_eq!(large.timeout(), Duration::from_secs(120));

        let md5 = Command::SpiFlashMd5 {
            address: 0,
            size: 8_000_000,
        };
        assert_eq!(md5.timeout(), Duration::from_secs(64));
    }

    #[test]
    fn response_status_tail_is_located_from_the_end() {
        // 8-byte header, 2-byte tail.
        let frame = [1, 0x0A, 2, 0, 0x78, 0x56, 0x34, 0x12, 0, 0];
        let response = Response::parse(&frame, 2).unwrap();
        assert_eq!(response.op, 0x0A);
        assert_eq!(response.value, 0x12345678);
        assert!(response.data.is_empty());
        assert_eq!(response.failed, 0);

        // 4-byte tail with a failure status.
        let frame = [1, 0x02, 4, 0, 0, 0, 0, 0, 1, 0x08, 0, 0];
        let response = Response::parse(&frame, 4).unwrap();
        assert_eq!(response.failed, 1);
        assert_eq!(response.error, 0x08);

        // Requests are not responses.
        let frame = [0, 0x0A, 2, 0, 0, 0, 0, 0, 0, 0];
        assert!(Response::parse(&frame, 2).is_none());

        // Too short to hold a status tail.
        assert!(Response::parse(&[1, 0x0A, 0, 0, 0, 0, 0, 0, 0], 2).is_none());
    }
}
