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
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::rc::Rc;

use log::debug;

use self::encoder::SlipEncoder;
use crate::command::{self, Command, Response};
use crate::error::RomError;
use crate::event::{Event, EventObserver, EventProvider};
use crate::interface::Interface;
use crate::{Error, Result};

/// The ROM emits up to this many replies to a single sync probe.
const SYNC_REPLY_COUNT: usize = 8;

/// Status-tail length assumed until a chip has been identified. The ROMs
/// with the longer tail pad it with zeros, so a pre-detection reply still
/// parses as unfailed.
const DEFAULT_STATUS_LEN: usize = 2;

/// The request/response engine: one SLIP-framed command out, matching
/// replies in, under the deadline the command arms.
pub struct Connection<I> {
    serial: BufReader<I>,
    status_len: usize,
    events: EventProvider,
}

impl<I: Interface> Connection<I> {
    pub fn new(interface: I) -> Self {
        Connection {
            serial: BufReader::new(interface),
            status_len: DEFAULT_STATUS_LEN,
            events: EventProvider::new(),
        }
    }

    pub fn add_observer<O>(&mut self, observer: O)
    where
        O: Into<Rc<dyn EventObserver + 'static>>,
    {
        self.events.add_observer(observer.into());
    }

    pub fn remove_observer<O>(&mut self, observer: O)
    where
        O: AsRef<Rc<dyn EventObserver + 'static>>,
    {
        self.events.remove_observer(observer.as_ref());
    }

    /// Length of the status tail the current target terminates its
    /// responses with.
    pub fn set_status_len(&mut self, status_len: usize) {
        self.status_len = status_len;
    }

    pub fn interface_mut(&mut self) -> &mut I {
        self.serial.get_mut()
    }

    /// Drop any buffered input, e.g. boot noise after a reset.
    pub fn discard_input(&mut self) {
        let buffered = self.serial.buffer().len();
        self.serial.consume(buffered);
    }

    /// Forget the detected target along with anything still buffered.
    pub(crate) fn forget_target(&mut self) {
        self.discard_input();
        self.status_len = DEFAULT_STATUS_LEN;
    }

    #[inline]
    pub(crate) fn trace(&self, event: Event) {
        self.events.send_event(event);
    }

    /// Send `cmd` and return the first matching reply.
    pub fn exchange(&mut self, cmd: Command) -> Result<Response> {
        self.request(cmd, &[], 1)
    }

    /// Send `cmd` followed by `data` and return the first matching reply.
    ///
    /// The parameter block and the raw data are framed as a single SLIP
    /// packet but streamed out as two buffers, so block-sized payloads are
    /// never copied into a scratch frame.
    pub fn exchange_with_data(&mut self, cmd: Command, data: &[u8]) -> Result<Response> {
        self.request(cmd, data, 1)
    }

    /// Probe the loader. One probe can provoke up to eight replies; success
    /// once one of them parses clean, but the rest are drained so they do
    /// not linger as stale input for the next command.
    pub fn sync(&mut self) -> Result<()> {
        self.request(Command::Sync, &[], SYNC_REPLY_COUNT)?;
        Ok(())
    }

    fn request(&mut self, cmd: Command, data: &[u8], expected_replies: usize) -> Result<Response> {
        let op = cmd.code();
        self.serial.get_mut().arm_timeout(cmd.timeout());
        self.send(&cmd, data)?;

        let mut reply = None;
        for _ in 0..expected_replies {
            match self.read_response(op) {
                Ok(response) => {
                    if reply.is_none() {
                        reply = Some(response);
                    }
                }
                Err(Error::Timeout) if reply.is_some() => break,
                Err(err) => {
                    if err.is_timeout() {
                        self.trace(Event::CommandTimeout(op));
                    }
                    return Err(err);
                }
            }
        }
        reply.ok_or(Error::Timeout)
    }

    fn send(&mut self, cmd: &Command, data: &[u8]) -> Result<()> {
        let params = cmd.params()?;
        let size = u16::try_from(params.len() + data.len())
            .map_err(|_| Error::InvalidParam("command payload exceeds a frame"))?;
        let checksum = if cmd.is_data() {
            command::checksum(data) as u32
        } else {
            0
        };

        /*
         * A command is one SLIP frame with an 8-byte header and a payload.
         * Header
         *   0: Direction, always 0x00
         *   1: Command identifier
         * 2-3: Payload length in little endian
         * 4-7: Checksum, nonzero only for the *Data commands
         *
         * Followed by the parameter block and any raw data.
         */
        let mut header = [0u8; 8];
        header[1] = cmd.code();
        header[2..4].copy_from_slice(&size.to_le_bytes());
        header[4..8].copy_from_slice(&checksum.to_le_bytes());

        self.trace(Event::Command(cmd.clone(), Cow::Borrowed(data)));

        let mut writer = BufWriter::new(self.serial.get_mut());
        let mut encoder = SlipEncoder::new(&mut writer)?;
        encoder.write_all(&header)?;
        encoder.write_all(&params)?;
        encoder.write_all(data)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut frame: Vec<u8> = Vec::new();
        let mut decoder = slip_codec::SlipDecoder::new();

        decoder
            .decode(&mut self.serial, &mut frame)
            .map_err(|err| Error::from(io::Error::from(err)))?;
        self.trace(Event::SlipRead(Cow::from(&frame)));
        Ok(frame)
    }

    // Read frames until one parses as a response to `op`. Anything else is
    // traced and dropped: stale replies from earlier retries, target noise,
    // frames going the wrong direction.
    fn read_response(&mut self, op: u8) -> Result<Response> {
        loop {
            let frame = self.read_packet()?;
            match Response::parse(&frame, self.status_len) {
                None => self.trace(Event::InvalidFrame(Cow::from(frame))),
                Some(response) => {
                    self.trace(Event::Response(
                        response.op,
                        response.failed,
                        response.error,
                        response.value,
                        Cow::from(&response.data),
                    ));
                    if response.op != op {
                        continue;
                    }
                    if response.failed != 0 {
                        let error = RomError::from(response.error);
                        debug!("{} failed: {error}", Command::name_from_code(op));
                        return Err(Error::InvalidResponse(error));
                    }
                    return Ok(response);
                }
            }
        }
    }
}

mod encoder {
    use std::io::{Result, Write};

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    /// Streaming SLIP encoder: everything written between `new` and
    /// `finish` becomes one delimited frame.
    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        pub fn new(writer: &'a mut W) -> Result<Self> {
            writer.write_all(&[END])?;
            Ok(Self { writer })
        }

        pub fn finish(self) -> Result<()> {
            self.writer.write_all(&[END])
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            for value in buf {
                match *value {
                    END => self.writer.write_all(&[ESC, ESC_END])?,
                    ESC => self.writer.write_all(&[ESC, ESC_ESC])?,
                    _ => self.writer.write_all(std::slice::from_ref(value))?,
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<()> {
            self.writer.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::encoder::SlipEncoder;

    fn slip_round_trip(data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        let mut encoder = SlipEncoder::new(&mut encoded).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();

        let mut decoder = slip_codec::SlipDecoder::new();
        let mut decoded = Vec::new();
        decoder
            .decode(&mut Cursor::new(encoded), &mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn encoding_escapes_the_frame_delimiters() {
        let mut encoded = Vec::new();
        let mut encoder = SlipEncoder::new(&mut encoded).unwrap();
        encoder.write_all(&[0x01, 0xC0, 0xDB, 0x02]).unwrap();
        encoder.finish().unwrap();
        assert_eq!(
            encoded,
            [0xC0, 0x01, 0xDB, 0xDC, 0xDB, 0xDD, 0x02, 0xC0]
        );
    }

    #[test]
    fn any_byte_sequence_survives_a_round_trip() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        assert_eq!(slip_round_trip(&all_bytes), all_bytes);

        let tricky: &[u8] = &[0xC0, 0xC0, 0xDB, 0xDC, 0xDD, 0xDB, 0xC0];
        assert_eq!(slip_round_trip(tricky), tricky);

        // A frame split across write calls is still one frame.
        let mut encoded = Vec::new();
        let mut encoder = SlipEncoder::new(&mut encoded).unwrap();
        encoder.write_all(&[0xAA; 8]).unwrap();
        encoder.write_all(&[0xC0]).unwrap();
        encoder.write_all(&[0xBB; 8]).unwrap();
        encoder.finish().unwrap();
        let mut decoder = slip_codec::SlipDecoder::new();
        let mut decoded = Vec::new();
        decoder
            .decode(&mut Cursor::new(encoded), &mut decoded)
            .unwrap();
        let mut expected = vec![0xAA; 8];
        expected.push(0xC0);
        expected.extend_from_slice(&[0xBB; 8]);
        assert_eq!(decoded, expected);
    }
}
