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

//! Host-side driver for the serial ROM bootloader of the ESP8266 and the
//! ESP32 family.
//!
//! [`Flasher`] owns a session with a single target: it synchronizes with the
//! loader, identifies the chip, streams images into RAM or SPI flash (raw or
//! zlib-compressed) and verifies the written region against an MD5 digest
//! computed while streaming. The wire dialogue itself lives in
//! [`Connection`], the framing and payload layouts in [`Command`].
//!
//! The transport is abstracted behind the [`Interface`] trait;
//! [`SerialInterface`] is the production implementation over a serial port
//! with the usual RTS/DTR boot straps.

mod chip;
mod command;
mod connection;
mod error;
pub mod event;
mod flasher;
mod interface;

pub use chip::{Chip, SpiRegs};
pub use command::{Command, Response};
pub use connection::Connection;
pub use error::{Error, Result, RomError};
pub use flasher::{Flasher, FLASH_WRITE_SIZE};
pub use interface::{Interface, SerialInterface};

#[inline]
fn from_le32(data: &[u8]) -> u32 {
    let data: [u8; 4] = [data[0], data[1], data[2], data[3]];
    u32::from_le_bytes(data)
}

#[inline]
fn from_le(data: &[u8]) -> u32 {
    assert!(data.len() <= 4);
    let mut le_data = [0u8; 4];
    le_data[..data.len()].copy_from_slice(data);
    u32::from_le_bytes(le_data)
}
