//! iCE40 configuration flash loader.
//!
//! Drives the serial flasher firmware sitting between the host and the
//! SPI configuration flash of an iCE40 FPGA. Every operation is a strictly
//! synchronous sequence of request / response round-trips, any failure
//! aborts the operation.

use core::fmt::Debug;
use core::marker::PhantomData;
use std::io;
use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;
use protocol::{Command, Frame, MAX_CHUNK, WRITE_SETTLE_MS, STATUS_HALTED, STATUS_STARTED, STATUS_OK};
pub use protocol::CdoneStatus;

#[cfg(test)]
mod sim;

/// Byte channel to the flasher firmware
pub trait Channel<E>: Write<u8, Error=E> + Read<u8, Error=E> {}

impl <T, E> Channel<E> for T where T: Write<u8, Error=E> + Read<u8, Error=E> {}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout awaiting device response")]
    ResponseTimeout,

    #[error("unexpected {command} response 0x{received:02x} (expected 0x{expected:02x})")]
    UnexpectedResponse { command: Command, expected: u8, received: u8 },

    #[error("invalid {command} response 0x{received:02x}")]
    InvalidResponse { command: Command, received: u8 },

    #[error("unexpected {command} response length {received} (expected {expected})")]
    UnexpectedLength { command: Command, expected: usize, received: usize },

    #[error("verification failed, file crc 0x{local:08x} flash crc 0x{device:08x}")]
    VerifyMismatch { local: u32, device: u32 },

    #[error("request of {length} bytes exceeds protocol limit of {limit} bytes")]
    TooLarge { length: usize, limit: usize },

    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError: Debug> Error<SerialError> {
    fn io(e: io::Error) -> Self {
        Self::Io(e.kind())
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each byte of a device response
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for device responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            poll_delay_ms: 1,
        }
    }
}

/// CRC-32 (IEEE) as computed by the device firmware
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: Channel<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self{options, port, delay, _err: PhantomData}
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Fetch the firmware identity string
    pub fn firmware_version(&mut self) -> Result<String, Error<E>> {
        let resp = self.transact(&Frame::command(Command::Firmware))?;
        let version = String::from_utf8_lossy(&resp).into_owned();

        debug!("Firmware version: {}", version);

        Ok(version)
    }

    /// Read the unique serial number of the flash chip
    pub fn chip_serial(&mut self) -> Result<Vec<u8>, Error<E>> {
        let serial = self.transact(&Frame::command(Command::ChipSerial))?;

        debug!("Flash serial: {:02x?}", serial);

        Ok(serial)
    }

    /// Hold the FPGA in reset
    pub fn halt(&mut self) -> Result<(), Error<E>> {
        debug!("Halting FPGA");
        self.status_cmd(Command::Halt, STATUS_HALTED)
    }

    /// Release the FPGA to configure from flash
    pub fn start(&mut self) -> Result<(), Error<E>> {
        debug!("Starting FPGA");
        self.status_cmd(Command::Start, STATUS_STARTED)
    }

    /// Erase the whole flash chip
    pub fn erase(&mut self) -> Result<(), Error<E>> {
        info!("Erasing flash");
        self.status_cmd(Command::Erase, STATUS_OK)
    }

    /// Fetch the state of the CDONE pin
    pub fn cdone(&mut self) -> Result<CdoneStatus, Error<E>> {
        let resp = self.transact(&Frame::command(Command::Cdone))?;
        let v = Self::single(Command::Cdone, &resp)?;

        match CdoneStatus::from_marker(v) {
            Some(s) => {
                debug!("CDONE: {:?}", s);
                Ok(s)
            },
            None => Err(Error::InvalidResponse{ command: Command::Cdone, received: v }),
        }
    }

    /// Read `length` bytes of flash from address zero into `sink`,
    /// reporting the running byte count to `progress` after each chunk
    pub fn read_flash<W, F>(&mut self, length: u16, sink: &mut W, mut progress: F)
    -> Result<usize, Error<E>>
    where
        W: io::Write,
        F: FnMut(usize),
    {
        let mut buff = [0u8; MAX_CHUNK];
        let mut address = 0u32;
        let mut remaining = length as usize;

        info!("Reading {} bytes from flash", length);

        while remaining > 0 {
            let n = remaining.min(MAX_CHUNK);

            self.read_chunk(address, &mut buff[..n])?;
            sink.write_all(&buff[..n]).map_err(Error::io)?;

            address += n as u32;
            remaining -= n;

            progress(address as usize);
        }

        Ok(length as usize)
    }

    /// Read a single chunk of up to `MAX_CHUNK` bytes from `address`
    pub fn read_chunk(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        if data.len() > MAX_CHUNK {
            return Err(Error::TooLarge{ length: data.len(), limit: MAX_CHUNK });
        }

        debug!("Read {} bytes at 0x{:08x}", data.len(), address);

        let frame = Frame::region(Command::ReadFlash, address, data.len() as u16);
        self.send(&frame.to_bytes())?;

        // Flash data is returned raw, the length is already known from the request
        for d in data.iter_mut() {
            *d = self.read_byte()?;
        }

        Ok(())
    }

    /// Write `source` to flash from address zero until it is exhausted,
    /// returning the number of bytes written
    pub fn write_flash<R, F>(&mut self, source: &mut R, mut progress: F)
    -> Result<usize, Error<E>>
    where
        R: io::Read,
        F: FnMut(usize),
    {
        let mut buff = [0u8; MAX_CHUNK];
        let mut address = 0u32;

        loop {
            let n = fill_chunk(source, &mut buff).map_err(Error::io)?;
            if n == 0 {
                break;
            }

            self.write_chunk(address, &buff[..n])?;

            address += n as u32;
            progress(address as usize);

            // A short chunk means the source hit end of input
            if n < MAX_CHUNK {
                break;
            }
        }

        info!("Wrote {} bytes to flash", address);

        Ok(address as usize)
    }

    /// Write a single chunk of up to `MAX_CHUNK` bytes at `address`
    pub fn write_chunk(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.len() > MAX_CHUNK {
            return Err(Error::TooLarge{ length: data.len(), limit: MAX_CHUNK });
        }

        debug!("Write {} bytes at 0x{:08x}", data.len(), address);

        let frame = Frame::region(Command::WriteFlash, address, data.len() as u16).with_data(data);
        self.send(&frame.to_bytes())?;

        // Allow the firmware to finish programming the page before polling
        self.delay.delay_ms(WRITE_SETTLE_MS);

        let resp = self.response()?;
        Self::status(Command::WriteFlash, &resp, STATUS_OK)
    }

    /// Fetch the device computed CRC32 of a flash region
    pub fn flash_crc(&mut self, address: u32, length: u16) -> Result<u32, Error<E>> {
        let resp = self.transact(&Frame::region(Command::VerifyCrc, address, length))?;

        if resp.len() != 4 {
            return Err(Error::UnexpectedLength{ command: Command::VerifyCrc, expected: 4, received: resp.len() });
        }

        Ok(u32::from_be_bytes([resp[0], resp[1], resp[2], resp[3]]))
    }

    /// Check flash contents from address zero against `source`,
    /// returning the matching CRC32
    pub fn verify<R: io::Read>(&mut self, source: &mut R) -> Result<u32, Error<E>> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buff = [0u8; 1024];
        let mut length = 0;

        loop {
            let n = match source.read(&mut buff) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(e)),
            };
            hasher.update(&buff[..n]);
            length += n;
        }

        let local = hasher.finalize();

        if length > u16::MAX as usize {
            return Err(Error::TooLarge{ length, limit: u16::MAX as usize });
        }

        info!("Verifying {} bytes (crc 0x{:08x})", length, local);

        let device = self.flash_crc(0, length as u16)?;
        if device != local {
            return Err(Error::VerifyMismatch{ local, device });
        }

        Ok(local)
    }

    /// Execute a single round-trip, returning the response payload
    pub fn transact(&mut self, frame: &Frame) -> Result<Vec<u8>, Error<E>> {
        self.send(&frame.to_bytes())?;
        self.response()
    }

    /// Read a length prefixed response
    pub fn response(&mut self) -> Result<Vec<u8>, Error<E>> {
        let len = self.read_byte()? as usize;

        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(self.read_byte()?);
        }

        trace!("Response: {:02x?}", data);

        Ok(data)
    }

    fn status_cmd(&mut self, command: Command, expected: u8) -> Result<(), Error<E>> {
        let resp = self.transact(&Frame::command(command))?;
        Self::status(command, &resp, expected)
    }

    fn status(command: Command, resp: &[u8], expected: u8) -> Result<(), Error<E>> {
        match Self::single(command, resp)? {
            v if v == expected => Ok(()),
            v => {
                debug!("Received unexpected {} status: 0x{:x}", command, v);
                Err(Error::UnexpectedResponse{ command, expected, received: v })
            }
        }
    }

    fn single(command: Command, resp: &[u8]) -> Result<u8, Error<E>> {
        match resp {
            [v] => Ok(*v),
            _ => Err(Error::UnexpectedLength{ command, expected: 1, received: resp.len() }),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        trace!("Request: {:02x?}", data);

        for d in data {
            block!(self.port.write(*d))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let timeout = Duration::from_millis(self.options.response_timeout_ms as u64);
        let start = Instant::now();
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            // Ports may block inside `read`, so bound wall time as well as polls
            if t > self.options.response_timeout_ms || start.elapsed() > timeout {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout)
            }
        }
    }
}

/// Fill `buff` from `source`, returning fewer bytes only at end of input
fn fill_chunk<R: io::Read>(source: &mut R, buff: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;

    while n < buff.len() {
        match source.read(&mut buff[n..]) {
            Ok(0) => break,
            Ok(v) => n += v,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}
