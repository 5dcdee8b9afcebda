//! ECU record model and fixed-size record encoding

use std::fmt;

use crc::{Crc, CRC_16_IBM_3740};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one persisted ECU record
pub const RECORD_LEN: usize = 16;

/// Format version stored in the first byte of a persisted record
const RECORD_FORMAT: u8 = 1;

/// Length of the record report an ECU sends for request-all
pub const REPORT_LEN: usize = 9;

const RECORD_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const FLAG_SECURE: u8 = 0x01;

/// ECU identity: its index in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EcuId(pub u8);

impl EcuId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for EcuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Communication protocol of an ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Can,
    CanFd,
    Lin,
    Ethernet,
}

/// Operational status of an ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcuStatus {
    Normal,
    Sleeping,
    Updating,
    Corrupted,
    Unresponsive,
    Fault,
}

/// Byte order an ECU uses for multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    #[default]
    Big,
}

impl Endianness {
    /// Read a u32 in this byte order
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        }
    }
}

macro_rules! byte_enum {
    ($ty:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl From<$ty> for u8 {
            fn from(v: $ty) -> u8 {
                match v {
                    $($ty::$variant => $value),+
                }
            }
        }

        impl TryFrom<u8> for $ty {
            type Error = RecordError;

            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($value => Ok($ty::$variant),)+
                    other => Err(RecordError::InvalidField {
                        field: stringify!($ty),
                        value: other,
                    }),
                }
            }
        }
    };
}

byte_enum!(Protocol {
    Can = 0,
    CanFd = 1,
    Lin = 2,
    Ethernet = 3,
});

byte_enum!(EcuStatus {
    Normal = 0,
    Sleeping = 1,
    Updating = 2,
    Corrupted = 3,
    Unresponsive = 4,
    Fault = 5,
});

byte_enum!(Endianness {
    Little = 0,
    Big = 1,
});

/// Record decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record length {0} does not match expected length")]
    Length(usize),

    #[error("Unsupported record format {0}")]
    Format(u8),

    #[error("Record checksum mismatch")]
    Checksum,

    #[error("Invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
}

/// State the gateway keeps for one ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuRecord {
    pub protocol: Protocol,
    /// Physical interface index the ECU is reachable on
    pub interface: u8,
    pub status: EcuStatus,
    pub endianness: Endianness,
    pub secure_capable: bool,
    pub firmware_version: u32,
}

impl EcuRecord {
    pub fn new(protocol: Protocol, interface: u8) -> Self {
        Self {
            protocol,
            interface,
            status: EcuStatus::Normal,
            endianness: Endianness::default(),
            secure_capable: false,
            firmware_version: 0,
        }
    }

    /// Encode into the fixed-size persisted layout
    ///
    /// ```text
    /// [0] format  [1] protocol  [2] interface  [3] status  [4] endianness
    /// [5] flags   [6..10] firmware version (BE)  [10..14] zero  [14..16] CRC-16 (BE)
    /// ```
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = RECORD_FORMAT;
        out[1] = self.protocol.into();
        out[2] = self.interface;
        out[3] = self.status.into();
        out[4] = self.endianness.into();
        out[5] = if self.secure_capable { FLAG_SECURE } else { 0 };
        out[6..10].copy_from_slice(&self.firmware_version.to_be_bytes());
        let crc = RECORD_CRC.checksum(&out[..14]);
        out[14..16].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decode a persisted record, verifying format and checksum
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != RECORD_LEN {
            return Err(RecordError::Length(bytes.len()));
        }
        if bytes[0] != RECORD_FORMAT {
            return Err(RecordError::Format(bytes[0]));
        }
        let stored = u16::from_be_bytes([bytes[14], bytes[15]]);
        if RECORD_CRC.checksum(&bytes[..14]) != stored {
            return Err(RecordError::Checksum);
        }
        Ok(Self {
            protocol: Protocol::try_from(bytes[1])?,
            interface: bytes[2],
            status: EcuStatus::try_from(bytes[3])?,
            endianness: Endianness::try_from(bytes[4])?,
            secure_capable: bytes[5] & FLAG_SECURE != 0,
            firmware_version: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }

    /// Parse the full-record report an ECU returns for request-all
    ///
    /// Layout: protocol, interface, status, endianness, flags, then the
    /// firmware version in the byte order the report itself declares.
    pub fn from_report(payload: &[u8]) -> Result<Self, RecordError> {
        if payload.len() < REPORT_LEN {
            return Err(RecordError::Length(payload.len()));
        }
        let endianness = Endianness::try_from(payload[3])?;
        Ok(Self {
            protocol: Protocol::try_from(payload[0])?,
            interface: payload[1],
            status: EcuStatus::try_from(payload[2])?,
            endianness,
            secure_capable: payload[4] & FLAG_SECURE != 0,
            firmware_version: endianness.read_u32([payload[5], payload[6], payload[7], payload[8]]),
        })
    }

    /// Build the request-all report for this record (used by ECU simulators)
    pub fn to_report(&self) -> [u8; REPORT_LEN] {
        let mut out = [0u8; REPORT_LEN];
        out[0] = self.protocol.into();
        out[1] = self.interface;
        out[2] = self.status.into();
        out[3] = self.endianness.into();
        out[4] = if self.secure_capable { FLAG_SECURE } else { 0 };
        out[5..9].copy_from_slice(&self.endianness.write_u32(self.firmware_version));
        out
    }

    /// Apply a request-id report: protocol, interface, endianness/secure flags
    pub fn apply_identity(&mut self, payload: &[u8]) -> Result<(), RecordError> {
        if payload.len() < 3 {
            return Err(RecordError::Length(payload.len()));
        }
        self.protocol = Protocol::try_from(payload[0])?;
        self.interface = payload[1];
        self.endianness = if payload[2] & 0x02 != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        };
        self.secure_capable = payload[2] & FLAG_SECURE != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EcuRecord {
        EcuRecord {
            protocol: Protocol::CanFd,
            interface: 2,
            status: EcuStatus::Sleeping,
            endianness: Endianness::Little,
            secure_capable: true,
            firmware_version: 0x0102_0304,
        }
    }

    #[test]
    fn test_record_write_read_is_identical() {
        let rec = sample();
        let decoded = EcuRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_record_checksum_detects_corruption() {
        let mut bytes = sample().encode();
        bytes[3] ^= 0x01;
        assert_eq!(EcuRecord::decode(&bytes), Err(RecordError::Checksum));
    }

    #[test]
    fn test_record_rejects_wrong_length_and_format() {
        assert_eq!(EcuRecord::decode(&[1u8; 4]), Err(RecordError::Length(4)));
        let mut bytes = sample().encode();
        bytes[0] = 9;
        assert_eq!(EcuRecord::decode(&bytes), Err(RecordError::Format(9)));
    }

    #[test]
    fn test_report_uses_declared_byte_order() {
        let rec = sample();
        let report = rec.to_report();
        assert_eq!(&report[5..9], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(EcuRecord::from_report(&report).unwrap(), rec);
    }

    #[test]
    fn test_identity_report() {
        let mut rec = EcuRecord::new(Protocol::Can, 0);
        rec.apply_identity(&[3, 1, 0x03]).unwrap();
        assert_eq!(rec.protocol, Protocol::Ethernet);
        assert_eq!(rec.interface, 1);
        assert_eq!(rec.endianness, Endianness::Big);
        assert!(rec.secure_capable);
    }
}
