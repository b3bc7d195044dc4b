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

use std::io;

use crate::chip::Chip;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by a loader session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The armed deadline elapsed before the target answered.
    #[error("timed out waiting for the target")]
    Timeout,

    /// The target answered with its failure flag set, or with a reply that
    /// does not parse.
    #[error("target reported: {0}")]
    InvalidResponse(RomError),

    /// The digest reported by the target does not match the bytes that were
    /// streamed to it.
    #[error("flash digest does not match the written image")]
    InvalidMd5,

    /// A caller precondition was violated.
    #[error("invalid argument: {0}")]
    InvalidParam(&'static str),

    /// The image does not fit in the probed flash.
    #[error("image of {image_size} bytes at {offset:#x} does not fit in {flash_size} bytes of flash")]
    ImageSize {
        offset: u32,
        image_size: u32,
        flash_size: u32,
    },

    /// The chip-detection magic or the JEDEC capacity byte is not one we
    /// know.
    #[error("unrecognized device id {0:#010x}")]
    UnsupportedChip(u32),

    /// The current target's ROM does not implement the requested operation.
    #[error("{chip} does not support {what}")]
    UnsupportedFunc { chip: Chip, what: &'static str },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("failed to encode command: {0}")]
    Encode(#[from] binrw::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(err)
        }
    }
}

/// Error byte carried in the status tail of a failed response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RomError {
    #[error("received message is invalid")]
    InvalidMessage,

    #[error("failed to act on received message")]
    CommandFailed,

    #[error("invalid CRC in message")]
    InvalidCrc,

    #[error("flash write error")]
    FlashWriteError,

    #[error("flash read error")]
    FlashReadError,

    #[error("flash read length error")]
    FlashReadLengthError,

    #[error("deflate error")]
    DeflateError,

    /// Not a ROM code: the reply itself was malformed.
    #[error("malformed response")]
    InvalidResponse,

    #[error("unknown error code {0:#04x}")]
    Other(u8),
}

impl From<u8> for RomError {
    fn from(value: u8) -> Self {
        match value {
            0x05 => RomError::InvalidMessage,
            0x06 => RomError::CommandFailed,
            0x07 => RomError::InvalidCrc,
            0x08 => RomError::FlashWriteError,
            0x09 => RomError::FlashReadError,
            0x0A => RomError::FlashReadLengthError,
            0x0B => RomError::DeflateError,
            other => RomError::Other(other),
        }
    }
}
