//! In-memory stand-ins for the serial port and the flasher firmware, used by tests.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::checksum;
use crate::protocol::*;

/// Request as decoded by the simulated firmware
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub opcode: u8,
    pub address: Option<u32>,
    pub length: Option<u16>,
}

/// Emulates the flasher firmware in front of a flash chip
pub struct SimDevice {
    pub flash: Vec<u8>,
    pub serial: Vec<u8>,
    pub firmware: &'static str,
    pub halted: bool,
    /// Status returned for write requests
    pub write_status: u8,
    pub requests: Vec<Request>,
    /// Drop the channel once this many reply bytes have been delivered
    pub drop_after: Option<usize>,
    delivered: usize,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl SimDevice {
    pub fn new(size: usize) -> Self {
        Self {
            flash: vec![0xFF; size],
            serial: vec![0xE4, 0x68, 0x38, 0x1C, 0x3B, 0x4A, 0x2D, 0x27],
            firmware: "iCE40 flasher v1.2",
            halted: false,
            write_status: STATUS_OK,
            requests: vec![],
            drop_after: None,
            delivered: 0,
            rx: vec![],
            tx: VecDeque::new(),
        }
    }

    fn reply(&mut self, data: &[u8]) {
        self.tx.push_back(data.len() as u8);
        self.tx.extend(data.iter());
    }

    fn header(&self) -> (u32, u16) {
        let a = u32::from_be_bytes([self.rx[1], self.rx[2], self.rx[3], self.rx[4]]);
        let l = u16::from_be_bytes([self.rx[5], self.rx[6]]);
        (a, l)
    }

    /// Handle the buffered request once it is complete
    fn process(&mut self) {
        let opcode = self.rx[0];

        let needed = match opcode {
            b'r' | b't' => 7,
            b'w' if self.rx.len() >= 7 => 7 + self.header().1 as usize,
            b'w' => 7,
            _ => 1,
        };
        if self.rx.len() < needed {
            return;
        }

        let (address, length) = match opcode {
            b'r' | b't' | b'w' => {
                let (a, l) = self.header();
                (Some(a), Some(l))
            }
            _ => (None, None),
        };
        self.requests.push(Request { opcode, address, length });

        match opcode {
            b'!' => {
                let f = self.firmware.as_bytes().to_vec();
                self.reply(&f);
            }
            b'h' => {
                self.halted = true;
                self.reply(&[STATUS_HALTED]);
            }
            b'g' => {
                self.halted = false;
                self.reply(&[STATUS_STARTED]);
            }
            b'c' => {
                let v = if self.halted { CDONE_INACTIVE } else { CDONE_ACTIVE };
                self.reply(&[v]);
            }
            b'e' => {
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.reply(&[STATUS_OK]);
            }
            b's' => {
                let s = self.serial.clone();
                self.reply(&s);
            }
            b'r' => {
                // Flash data is returned raw, without a length prefix
                let (a, l) = (address.unwrap() as usize, length.unwrap() as usize);
                let data = self.flash[a..a + l].to_vec();
                self.tx.extend(data.iter());
            }
            b'w' => {
                let a = address.unwrap() as usize;
                let data = self.rx[7..].to_vec();
                if self.write_status == STATUS_OK {
                    self.flash[a..a + data.len()].copy_from_slice(&data);
                }
                let s = self.write_status;
                self.reply(&[s]);
            }
            b't' => {
                let (a, l) = (address.unwrap() as usize, length.unwrap() as usize);
                let crc = checksum(&self.flash[a..a + l]);
                self.reply(&crc.to_be_bytes());
            }
            _ => (),
        }

        self.rx.clear();
    }
}

impl Write<u8> for SimDevice {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.rx.push(word);
        self.process();
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SimDevice {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if Some(self.delivered) == self.drop_after {
            return Err(nb::Error::Other(ErrorKind::BrokenPipe));
        }

        let v = self.tx.pop_front().ok_or(nb::Error::WouldBlock)?;
        self.delivered += 1;
        Ok(v)
    }
}

/// Port replaying a fixed reply and capturing everything sent
pub struct ScriptPort {
    pub sent: Vec<u8>,
    reply: VecDeque<u8>,
    /// Report end of stream rather than blocking once the reply is consumed
    closed: bool,
}

impl ScriptPort {
    pub fn new(reply: &[u8]) -> Self {
        Self {
            sent: vec![],
            reply: reply.iter().cloned().collect(),
            closed: false,
        }
    }

    pub fn closing(reply: &[u8]) -> Self {
        Self {
            closed: true,
            ..Self::new(reply)
        }
    }
}

impl Write<u8> for ScriptPort {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.sent.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for ScriptPort {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        match self.reply.pop_front() {
            Some(v) => Ok(v),
            None if self.closed => Err(nb::Error::Other(ErrorKind::UnexpectedEof)),
            None => Err(nb::Error::WouldBlock),
        }
    }
}

/// Port that never answers, blocking in each `read` like a tty with a timeout
pub struct SlowPort {
    pub block: Duration,
    pub reads: usize,
}

impl Write<u8> for SlowPort {
    type Error = ErrorKind;

    fn write(&mut self, _word: u8) -> nb::Result<(), Self::Error> {
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SlowPort {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.reads += 1;
        thread::sleep(self.block);
        Err(nb::Error::WouldBlock)
    }
}

/// Delay that returns immediately, recording each requested period
#[derive(Default)]
pub struct NoopDelay {
    pub calls: Vec<u32>,
}

impl DelayMs<u32> for NoopDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls.push(ms);
    }
}
