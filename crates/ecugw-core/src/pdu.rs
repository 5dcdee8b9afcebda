//! PDU envelope and 29-bit identifier codec
//!
//! Every frame that enters the gateway is decoded into a [`Pdu`]. The id
//! carries a one-hot category field, and for command and firmware messages
//! the target ECU and an opcode/sub-type:
//!
//! ```text
//!  28   27 26 25 24 23      16 15       8 7        0
//! ┌───────┬──┬──┬──┬──────────┬──────────┬──────────┐
//! │ 0 0   │FW│CM│DT│ reserved │  ECU id  │  opcode  │   command / firmware
//! └───────┴──┴──┴──┴──────────┴──────────┴──────────┘
//! ┌───────┬──┬──┬──┬────────────────────────────────┐
//! │ 0 0   │ 0│ 0│ 1│        routing table index     │   data
//! └───────┴──┴──┴──┴────────────────────────────────┘
//! ```
//!
//! A `Pdu` is deliberately not `Clone`: it is created once by the receive
//! path, moved into exactly one consumer and dropped there.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::ecu::EcuId;

/// Maximum payload carried by one envelope (CAN FD frame)
pub const MAX_PAYLOAD: usize = 64;

/// Mask of a 29-bit extended CAN identifier
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

const DATA_BIT: u32 = 1 << 24;
const COMMAND_BIT: u32 = 1 << 25;
const FIRMWARE_BIT: u32 = 1 << 26;
const CATEGORY_MASK: u32 = DATA_BIT | COMMAND_BIT | FIRMWARE_BIT;
const INDEX_MASK: u32 = 0x00FF_FFFF;
const RESERVED_MASK: u32 = 0x00FF_0000;
const ECU_SHIFT: u32 = 8;

/// Message category encoded in the id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Data,
    Command,
    Firmware,
}

/// Gateway command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandOpcode {
    RequestAll = 1,
    RequestId = 2,
    RequestFirmwareVersion = 3,
    RequestStatus = 4,
    Reset = 5,
    Sleep = 6,
}

impl TryFrom<u8> for CommandOpcode {
    type Error = PduError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RequestAll),
            2 => Ok(Self::RequestId),
            3 => Ok(Self::RequestFirmwareVersion),
            4 => Ok(Self::RequestStatus),
            5 => Ok(Self::Reset),
            6 => Ok(Self::Sleep),
            other => Err(PduError::UnknownOpcode(other)),
        }
    }
}

impl From<CommandOpcode> for u8 {
    fn from(op: CommandOpcode) -> Self {
        op as u8
    }
}

/// Decoded view of a [`PduId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Data message, routed through the routing table
    Data { index: usize },
    /// Command/response for the gateway controller
    Command { ecu: EcuId, opcode: u8 },
    /// Firmware update traffic for an active session
    Firmware { ecu: EcuId, subtype: u8 },
}

/// PDU errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("Payload too large: {len} bytes (max 64)")]
    PayloadTooLarge { len: usize },

    #[error("Malformed identifier 0x{0:08X}")]
    MalformedId(u32),

    #[error("Data index {0} does not fit the identifier")]
    IndexOutOfRange(u32),

    #[error("Unknown command opcode {0}")]
    UnknownOpcode(u8),
}

/// 29-bit message identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PduId(u32);

impl PduId {
    /// Wrap a raw identifier without validation
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Data message id for a routing table index
    pub fn data(index: u32) -> Result<Self, PduError> {
        if index > INDEX_MASK {
            return Err(PduError::IndexOutOfRange(index));
        }
        Ok(Self(DATA_BIT | index))
    }

    /// Command message id for an ECU and opcode
    pub fn command(ecu: EcuId, opcode: u8) -> Self {
        Self(COMMAND_BIT | (u32::from(ecu.0) << ECU_SHIFT) | u32::from(opcode))
    }

    /// Firmware message id for an ECU and sub-type
    pub fn firmware(ecu: EcuId, subtype: u8) -> Self {
        Self(FIRMWARE_BIT | (u32::from(ecu.0) << ECU_SHIFT) | u32::from(subtype))
    }

    /// Category, if exactly one category bit is set and no bits above it
    pub fn category(self) -> Option<Category> {
        if self.0 & !(CATEGORY_MASK | INDEX_MASK) != 0 {
            return None;
        }
        match self.0 & CATEGORY_MASK {
            DATA_BIT => Some(Category::Data),
            COMMAND_BIT => Some(Category::Command),
            FIRMWARE_BIT => Some(Category::Firmware),
            _ => None,
        }
    }

    /// Decode the id into its routing-relevant parts
    pub fn kind(self) -> Result<MessageKind, PduError> {
        let category = self.category().ok_or(PduError::MalformedId(self.0))?;
        let masked = self.0 & !CATEGORY_MASK;
        match category {
            Category::Data => Ok(MessageKind::Data {
                index: masked as usize,
            }),
            Category::Command | Category::Firmware => {
                if masked & RESERVED_MASK != 0 {
                    return Err(PduError::MalformedId(self.0));
                }
                let ecu = EcuId(((masked >> ECU_SHIFT) & 0xFF) as u8);
                let low = (masked & 0xFF) as u8;
                if category == Category::Command {
                    Ok(MessageKind::Command { ecu, opcode: low })
                } else {
                    Ok(MessageKind::Firmware { ecu, subtype: low })
                }
            }
        }
    }
}

impl fmt::Debug for PduId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PduId(0x{:08X})", self.0)
    }
}

impl fmt::Display for PduId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Message envelope: typed id plus an owned payload
#[derive(Debug)]
pub struct Pdu {
    id: PduId,
    interface: u8,
    payload: Bytes,
    received_at: Instant,
}

impl Pdu {
    /// Create an envelope for a locally generated message
    pub fn new(id: PduId, payload: impl Into<Bytes>) -> Result<Self, PduError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(PduError::PayloadTooLarge { len: payload.len() });
        }
        Ok(Self {
            id,
            interface: 0,
            payload,
            received_at: Instant::now(),
        })
    }

    /// Decode a raw frame from a physical interface
    ///
    /// Rejects ids without a valid category so that nothing undecodable
    /// enters the router queue.
    pub fn from_frame(interface: u8, raw_id: u32, data: &[u8]) -> Result<Self, PduError> {
        let id = PduId::from_raw(raw_id & EXTENDED_ID_MASK);
        if id.category().is_none() {
            return Err(PduError::MalformedId(raw_id));
        }
        let mut pdu = Self::new(id, Bytes::copy_from_slice(data))?;
        pdu.interface = interface;
        Ok(pdu)
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn id(&self) -> PduId {
        self.id
    }

    /// Physical interface the envelope arrived on
    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Consume the envelope, keeping only the payload buffer
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
