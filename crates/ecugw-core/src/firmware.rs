//! Firmware image framing and handshake constants

use thiserror::Error;

use crate::ecu::EcuId;

/// Plaintext bytes carried per chunk frame
pub const CHUNK_SIZE: usize = 48;

/// Challenge trailer appended to each chunk in secure mode
pub const TRAILER_SIZE: usize = 16;

/// Encrypted chunk frame size in secure mode
pub const SECURE_FRAME_SIZE: usize = CHUNK_SIZE + TRAILER_SIZE;

/// Size of the random challenge an ECU returns for BEGIN-secure
pub const CHALLENGE_SIZE: usize = 16;

/// Length of an encoded [`FirmwareHeader`]
pub const HEADER_LEN: usize = 26;

/// Header opcode for a full-image update
pub const HEADER_OPCODE_UPDATE: u8 = 0x01;

/// Single-byte handshake codes exchanged with the target ECU
pub mod handshake {
    pub const RESET_CMD: u8 = 0xA0;
    pub const RESET_ACK: u8 = 0xA1;
    pub const BEGIN_NONSECURE: u8 = 0xB0;
    pub const BEGIN_SECURE: u8 = 0xB1;
    /// Sentinel an ECU answers BEGIN-nonsecure with
    pub const BEGIN_ACK: u8 = 0xBA;
    pub const FRAME_ACK: u8 = 0xC1;
    pub const END_CMD: u8 = 0xE0;
    pub const END_ACK: u8 = 0xE1;
    /// Explicit negative acknowledge, valid at any step
    pub const NACK: u8 = 0x15;
}

/// Firmware-category id sub-types
pub mod subtype {
    /// Gateway -> ECU handshake byte
    pub const CONTROL: u8 = 0x00;
    /// Gateway -> ECU chunk frame
    pub const CHUNK: u8 = 0x01;
    /// ECU -> gateway response
    pub const RESPONSE: u8 = 0x80;
}

/// Header decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header length {0}, expected 26")]
    Length(usize),

    #[error("Unsupported header opcode 0x{0:02X}")]
    Opcode(u8),
}

/// Header record stored alongside a firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub opcode: u8,
    pub version: u32,
    /// Image length in bytes
    pub length: u32,
    pub target: EcuId,
    /// CMAC over the image under the update key
    pub tag: [u8; 16],
}

impl FirmwareHeader {
    /// `[opcode][version BE][length BE][target][tag x16]`
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.opcode;
        out[1..5].copy_from_slice(&self.version.to_be_bytes());
        out[5..9].copy_from_slice(&self.length.to_be_bytes());
        out[9] = self.target.0;
        out[10..26].copy_from_slice(&self.tag);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() != HEADER_LEN {
            return Err(HeaderError::Length(bytes.len()));
        }
        if bytes[0] != HEADER_OPCODE_UPDATE {
            return Err(HeaderError::Opcode(bytes[0]));
        }
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&bytes[10..26]);
        Ok(Self {
            opcode: bytes[0],
            version: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            length: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
            target: EcuId(bytes[9]),
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FirmwareHeader {
            opcode: HEADER_OPCODE_UPDATE,
            version: 0x0002_0001,
            length: 4096,
            target: EcuId(3),
            tag: [0xAB; 16],
        };
        let bytes = header.encode();
        assert_eq!(&bytes[1..5], &[0x00, 0x02, 0x00, 0x01]);
        assert_eq!(bytes[9], 3);
        assert_eq!(FirmwareHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_opcode() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = 0x7F;
        assert_eq!(FirmwareHeader::decode(&bytes), Err(HeaderError::Opcode(0x7F)));
        assert_eq!(FirmwareHeader::decode(&bytes[..3]), Err(HeaderError::Length(3)));
    }
}
