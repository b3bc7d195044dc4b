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

//! Wire-level observability. Observers registered with the session are
//! notified synchronously of every command, frame and response; with none
//! registered the engine runs silent.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;

use crate::command::Command;
use crate::error::RomError;

#[derive(Debug, Clone)]
pub enum Event<'a> {
    /// The target was strapped into or out of the loader.
    Reset,
    /// A command went out, together with its raw data payload.
    Command(Command, Cow<'a, [u8]>),
    /// The deadline elapsed with no reply to the command with this opcode.
    CommandTimeout(u8),
    /// A SLIP frame was reassembled from the port.
    SlipRead(Cow<'a, [u8]>),
    /// A response frame parsed: opcode, failed flag, error byte, value, body.
    Response(u8, u8, u8, u32, Cow<'a, [u8]>),
    /// A frame that does not parse as a response.
    InvalidFrame(Cow<'a, [u8]>),
}

impl Event<'_> {
    pub fn into_owned(self) -> Event<'static> {
        use Event::*;
        match self {
            Reset => Reset,
            Command(cmd, data) => Command(cmd, Cow::Owned(data.into_owned())),
            CommandTimeout(op) => CommandTimeout(op),
            SlipRead(data) => SlipRead(Cow::Owned(data.into_owned())),
            Response(op, failed, error, value, data) => {
                Response(op, failed, error, value, Cow::Owned(data.into_owned()))
            }
            InvalidFrame(data) => InvalidFrame(Cow::Owned(data.into_owned())),
        }
    }
}

fn write_bytes(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    const SHOWN: usize = 16;
    for byte in data.iter().take(SHOWN) {
        write!(f, " {byte:02X}")?;
    }
    if data.len() > SHOWN {
        write!(f, " .. ({} bytes)", data.len())?;
    }
    Ok(())
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Reset => f.write_str("reset"),
            Event::Command(cmd, data) => {
                write!(f, "command {cmd:X?}")?;
                if !data.is_empty() {
                    write!(f, " data")?;
                    write_bytes(f, data)?;
                }
                Ok(())
            }
            Event::CommandTimeout(op) => {
                write!(
                    f,
                    "timeout waiting for {} ({op:#04X})",
                    Command::name_from_code(*op)
                )
            }
            Event::SlipRead(data) => {
                write!(f, "frame in")?;
                write_bytes(f, data)
            }
            Event::Response(op, failed, error, value, data) => {
                write!(
                    f,
                    "response {} ({op:#04X}) value={value:#010X}",
                    Command::name_from_code(*op)
                )?;
                if *failed != 0 {
                    write!(f, " error={}", RomError::from(*error))?;
                }
                if !data.is_empty() {
                    write!(f, " data")?;
                    write_bytes(f, data)?;
                }
                Ok(())
            }
            Event::InvalidFrame(data) => {
                write!(f, "unparseable frame")?;
                write_bytes(f, data)
            }
        }
    }
}

pub trait EventObserver {
    fn notify(&self, timestamp: Instant, event: &Event<'_>);
}

pub(crate) struct EventProvider {
    observers: RefCell<Vec<Rc<dyn EventObserver>>>,
}

impl EventProvider {
    pub fn new() -> Self {
        Self {
            observers: RefCell::new(Vec::new()),
        }
    }

    pub fn add_observer(&mut self, observer: Rc<dyn EventObserver + 'static>) {
        self.observers.borrow_mut().push(observer);
    }

    pub fn remove_observer(&mut self, observer: &Rc<dyn EventObserver + 'static>) {
        // `Rc::ptr_eq` cannot compare two `Rc<dyn Trait>`s; strip the vtable
        // off both pointers and compare the data addresses.
        let observer_addr = &**observer as *const dyn EventObserver as *const u8;
        let mut observers = self.observers.borrow_mut();
        if let Some(idx) = observers
            .iter()
            .position(|obs| observer_addr == &**obs as *const dyn EventObserver as *const u8)
        {
            observers.remove(idx);
        }
    }

    pub fn send_event(&self, event: Event) {
        let now = Instant::now();
        for observer in self.observers.borrow().iter() {
            observer.notify(now, &event);
        }
    }
}

#[derive(Debug, Default)]
pub struct EventCollectorObserver(RefCell<Vec<(Instant, Event<'static>)>>);

impl EventObserver for EventCollectorObserver {
    fn notify(&self, timestamp: Instant, event: &Event<'_>) {
        self.0
            .borrow_mut()
            .push((timestamp, event.clone().into_owned()))
    }
}

/// Records every event, for inspection once the session is done with the
/// observer.
pub struct EventCollector {
    observer: Rc<EventCollectorObserver>,
}

impl EventCollector {
    pub fn new() -> Self {
        EventCollector {
            observer: Rc::new(EventCollectorObserver::default()),
        }
    }

    pub fn observer(&self) -> Rc<EventCollectorObserver> {
        Rc::clone(&self.observer)
    }

    pub fn collect(self) -> Vec<(Instant, Event<'static>)> {
        Rc::try_unwrap(self.observer)
            .expect("collector observer is still registered")
            .0
            .into_inner()
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&EventCollector> for Rc<dyn EventObserver> {
    fn from(collector: &EventCollector) -> Self {
        collector.observer()
    }
}

pub struct EventTracerObserver<W, F> {
    writer: RefCell<W>,
    filter: F,
    last: Cell<Option<Instant>>,
}

impl<W, F> EventObserver for EventTracerObserver<W, F>
where
    W: io::Write,
    F: Fn(&Event) -> bool,
{
    fn notify(&self, timestamp: Instant, event: &Event<'_>) {
        if (self.filter)(event) {
            let delta =
                (timestamp - self.last.replace(Some(timestamp)).unwrap_or(timestamp)).as_secs_f32();
            let _ = writeln!(self.writer.borrow_mut(), "+{delta:.3} {event}");
        }
    }
}

/// Writes a line per event, prefixed with the delta time since the previous
/// one. The filter picks which events are written.
pub struct EventTracer<W, F> {
    observer: Rc<EventTracerObserver<W, F>>,
}

impl<W, F> EventTracer<W, F>
where
    W: io::Write,
    F: Fn(&Event) -> bool,
{
    pub fn new(writer: W, filter: F) -> Self {
        EventTracer {
            observer: Rc::new(EventTracerObserver {
                writer: RefCell::new(writer),
                filter,
                last: Cell::new(None),
            }),
        }
    }

    pub fn observer(&self) -> Rc<EventTracerObserver<W, F>> {
        Rc::clone(&self.observer)
    }
}

impl<W, F> From<EventTracer<W, F>> for Rc<dyn EventObserver>
where
    W: io::Write + 'static,
    F: Fn(&Event) -> bool + 'static,
{
    fn from(tracer: EventTracer<W, F>) -> Self {
        tracer.observer
    }
}
