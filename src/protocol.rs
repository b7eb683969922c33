//! Wire protocol of the iCE40 flasher firmware.
//!
//! Requests are a single opcode byte, optionally followed by a big-endian
//! 32-bit flash address, a big-endian 16-bit length and raw data. Every
//! reply is a single length byte followed by exactly that many payload bytes.

use core::fmt;

/// Maximum number of bytes moved by a single read or write round-trip
pub const MAX_CHUNK: usize = 256;

/// Delay between sending a write frame and reading its status (ms).
/// The firmware is busy programming the flash page until then.
pub const WRITE_SETTLE_MS: u32 = 3;

/// Halt acknowledgement
pub const STATUS_HALTED: u8 = b'R';
/// Start acknowledgement
pub const STATUS_STARTED: u8 = b'r';
/// Erase / write success
pub const STATUS_OK: u8 = b'O';

/// CDONE low, the FPGA is not configured
pub const CDONE_INACTIVE: u8 = b'c';
/// CDONE high, the FPGA is configured and running
pub const CDONE_ACTIVE: u8 = b'C';

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch the firmware identity string
    Firmware = b'!' as isize,

    /// Hold the iCE40 in reset, releasing the SPI bus to the programmer
    Halt = b'h' as isize,

    /// Release the iCE40 from reset so it configures from flash
    Start = b'g' as isize,

    /// Query the state of the CDONE pin
    Cdone = b'c' as isize,

    /// Erase the whole flash chip
    Erase = b'e' as isize,

    /// Read the unique serial number of the flash chip
    ChipSerial = b's' as isize,

    /// Reads up to 256 bytes of flash starting from the supplied address
    ReadFlash = b'r' as isize,

    /// Writes up to 256 bytes of flash starting from the supplied address
    WriteFlash = b'w' as isize,

    /// Computes a CRC32 over a flash region on the device
    VerifyCrc = b't' as isize,
}

impl Command {
    /// Byte sent on the wire for this command
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Firmware => "firmware",
            Command::Halt => "halt",
            Command::Start => "start",
            Command::Cdone => "cdone",
            Command::Erase => "erase",
            Command::ChipSerial => "chip serial",
            Command::ReadFlash => "read flash",
            Command::WriteFlash => "write flash",
            Command::VerifyCrc => "verify crc",
        };
        f.write_str(name)
    }
}

/// State of the iCE40 CDONE pin
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CdoneStatus {
    Inactive,
    Active,
}

impl CdoneStatus {
    pub fn from_marker(v: u8) -> Option<Self> {
        match v {
            CDONE_INACTIVE => Some(Self::Inactive),
            CDONE_ACTIVE => Some(Self::Active),
            _ => None,
        }
    }
}

impl fmt::Display for CdoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdoneStatus::Inactive => f.write_str("STOPPED"),
            CdoneStatus::Active => f.write_str("ACTIVE"),
        }
    }
}

/// Outgoing request frame
#[derive(Debug, PartialEq, Clone)]
pub struct Frame<'a> {
    pub command: Command,
    pub address: Option<u32>,
    pub length: Option<u16>,
    pub data: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Opcode only frame
    pub fn command(command: Command) -> Self {
        Self {
            command,
            address: None,
            length: None,
            data: &[],
        }
    }

    /// Opcode followed by a flash address and length
    pub fn region(command: Command, address: u32, length: u16) -> Self {
        Self {
            command,
            address: Some(address),
            length: Some(length),
            data: &[],
        }
    }

    /// Attach raw data following the header
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    /// Serialise the frame into the bytes sent to the device
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.command, self.address, self.length, self.data)
    }
}

/// Encode a request. No length prefix is added, only replies are framed.
pub fn encode(command: Command, address: Option<u32>, length: Option<u16>, data: &[u8]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(1 + 4 + 2 + data.len());

    buff.push(command.opcode());
    if let Some(a) = address {
        buff.extend_from_slice(&a.to_be_bytes());
    }
    if let Some(l) = length {
        buff.extend_from_slice(&l.to_be_bytes());
    }
    buff.extend_from_slice(data);

    buff
}
