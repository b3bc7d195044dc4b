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

/// Addresses of the SPI-controller registers used to talk to the external
/// flash through the loader's register read/write commands.
pub struct SpiRegs {
    pub cmd: u32,
    pub usr: u32,
    pub usr1: u32,
    pub usr2: u32,
    pub mosi_dlen: u32,
    pub miso_dlen: u32,
    pub w0: u32,
}

impl SpiRegs {
    /// Address of data register `W{index}`.
    #[inline]
    pub fn w(&self, index: usize) -> u32 {
        assert!(index < 16, "SPI data register {index} is out of range");
        self.w0 + (index as u32) * 4
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Chip {
    Esp8266,
    Esp32,
    Esp32S2,
    Esp32S3,
    Esp32C3,
}

impl Chip {
    /// Identify a chip from the value of its magic register.
    pub fn try_from_magic(magic: u32) -> Option<Self> {
        match magic {
            0xFFF0C101 => Some(Chip::Esp8266),
            0x00F01D83 => Some(Chip::Esp32),
            0x000007C6 => Some(Chip::Esp32S2),
            0x6921506F | 0x1B31506F => Some(Chip::Esp32C3),
            0x00000009 => Some(Chip::Esp32S3),
            _ => None,
        }
    }

    pub fn spi_regs(self) -> SpiRegs {
        match self {
            // SPI0
            Chip::Esp8266 => SpiRegs {
                cmd: 0x60000200,
                usr: 0x6000021C,
                usr1: 0x60000220,
                usr2: 0x60000224,
                mosi_dlen: 0,
                miso_dlen: 0,
                w0: 0x60000240,
            },
            // SPI1
            Chip::Esp32 => SpiRegs {
                cmd: 0x3FF42000,
                usr: 0x3FF4201C,
                usr1: 0x3FF42020,
                usr2: 0x3FF42024,
                mosi_dlen: 0x3FF42028,
                miso_dlen: 0x3FF4202C,
                w0: 0x3FF42080,
            },
            // SPI1 (PeriBUS1). The technical reference manual and the
            // ESP-IDF headers both show W0 at offset 0x98; the working
            // offset is 0x58.
            Chip::Esp32S2 => SpiRegs {
                cmd: 0x3F402000,
                usr: 0x3F402018,
                usr1: 0x3F40201C,
                usr2: 0x3F402020,
                mosi_dlen: 0x3F402024,
                miso_dlen: 0x3F402028,
                w0: 0x3F402058,
            },
            // SPI1 on the ESP32-C3; the same registers work on the ESP32-S3.
            Chip::Esp32S3 | Chip::Esp32C3 => SpiRegs {
                cmd: 0x60002000,
                usr: 0x60002018,
                usr1: 0x6000201C,
                usr2: 0x60002020,
                mosi_dlen: 0x60002024,
                miso_dlen: 0x60002028,
                w0: 0x60002058,
            },
        }
    }

    /// Length of the status tail terminating every response from this ROM.
    pub fn status_len(self) -> usize {
        match self {
            Chip::Esp8266 | Chip::Esp32 => 2,
            _ => 4,
        }
    }

    /// Whether the `FLASH_BEGIN`/`FLASH_DEFL_BEGIN` payload carries the
    /// trailing `encrypted` word on this ROM.
    pub fn begin_takes_encrypted(self) -> bool {
        !matches!(self, Chip::Esp8266 | Chip::Esp32)
    }

    /// Whether the ROM implements the `FLASH_DEFL_*` commands.
    pub fn supports_compression(self) -> bool {
        self != Chip::Esp8266
    }

    /// Whether the ROM can report an MD5 over a flash region.
    pub fn supports_flash_md5(self) -> bool {
        self != Chip::Esp8266
    }

    /// Whether the ROM accepts `CHANGE_BAUDRATE`.
    pub fn supports_baud_change(self) -> bool {
        self != Chip::Esp8266
    }

    /// Board-level pin-mux word sent with `SPI_ATTACH`; zero selects the
    /// ROM's default flash pin assignment.
    pub fn spi_pins(self) -> u32 {
        0
    }
}

impl TryFrom<&str> for Chip {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "esp8266" => Chip::Esp8266,
            "esp32" => Chip::Esp32,
            "esp32s2" => Chip::Esp32S2,
            "esp32s3" => Chip::Esp32S3,
            "esp32c3" => Chip::Esp32C3,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for Chip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Chip::Esp8266 => "ESP8266",
            Chip::Esp32 => "ESP32",
            Chip::Esp32S2 => "ESP32-S2",
            Chip::Esp32S3 => "ESP32-S3",
            Chip::Esp32C3 => "ESP32-C3",
        })
    }
}
