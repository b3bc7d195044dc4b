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
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::Result;

// Bound on a single blocking read; the armed deadline governs the exchange
// as a whole.
const SERIAL_CHUNK_TIMEOUT: Duration = Duration::from_millis(10);
// A full-size frame takes ~100 ms to drain at the loader's initial rate.
const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// The byte transport a session drives.
///
/// Reads must honor the most recently armed deadline: once it has passed,
/// they fail with [`io::ErrorKind::TimedOut`]. The deadline is absolute and
/// does not stack; arming replaces the previous value.
pub trait Interface: Read + Write {
    /// Strap the target into its serial bootloader.
    fn enter_bootloader(&mut self) -> Result<()>;

    /// Reset the target and let it boot normally.
    fn reset_target(&mut self) -> Result<()>;

    /// Arm the read deadline `timeout` from now.
    fn arm_timeout(&mut self, timeout: Duration);

    /// Retune the local side of the link. The target's rate is negotiated
    /// separately, over the wire.
    fn set_baud_rate(&mut self, rate: u32) -> Result<()>;
}

/// Serial-port transport with the conventional reset wiring: /RTS drives the
/// chip-enable strap and /DTR the boot-select strap (GPIO0).
pub struct SerialInterface {
    port: Box<dyn SerialPort>,
    deadline: Instant,
}

impl SerialInterface {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self::from_port(serialport::new(path, baud_rate).open()?))
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        SerialInterface {
            port,
            deadline: Instant::now(),
        }
    }

    fn strap(&mut self, enter_bootloader: bool) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;

        self.port.write_request_to_send(true)?;
        self.port.write_data_terminal_ready(false)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.clear(serialport::ClearBuffer::All)?;

        self.port.write_data_terminal_ready(enter_bootloader)?;
        self.port.write_request_to_send(false)?;
        std::thread::sleep(Duration::from_millis(500));
        self.port.write_data_terminal_ready(false)?;

        Ok(())
    }
}

impl Interface for SerialInterface {
    fn enter_bootloader(&mut self) -> Result<()> {
        self.strap(true)
    }

    fn reset_target(&mut self) -> Result<()> {
        self.strap(false)
    }

    fn arm_timeout(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<()> {
        self.port.set_baud_rate(rate)?;
        Ok(())
    }
}

impl Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let remaining = max(SERIAL_CHUNK_TIMEOUT, self.deadline - now);
        self.port.set_timeout(remaining).map_err(io::Error::from)?;
        self.port.read(buf)
    }
}

impl Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port
            .set_timeout(SERIAL_WRITE_TIMEOUT)
            .map_err(io::Error::from)?;
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
