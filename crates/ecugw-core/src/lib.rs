//! ecugw-core - Core types for the ECU gateway
//!
//! This crate defines the data model shared by the routing engine, the
//! firmware update sessions and the secure-element key service:
//!
//! - [`Pdu`] / [`PduId`]: the single-owner message envelope and its 29-bit id codec
//! - [`EcuRecord`] / [`EcuRegistry`]: per-ECU state with fixed-size persistence
//! - [`RoutingTable`]: dense data-message routing descriptors
//! - [`Storage`] / [`Console`]: the narrow collaborator interfaces the core consumes
//! - [`GatewayError`]: the shared error taxonomy

pub mod console;
pub mod ecu;
pub mod error;
pub mod firmware;
pub mod pdu;
pub mod registry;
pub mod routing;
pub mod storage;

pub use console::{Console, MemoryConsole, TracingConsole};
pub use ecu::{
    EcuId, EcuRecord, EcuStatus, Endianness, Protocol, RecordError, RECORD_LEN, REPORT_LEN,
};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use firmware::{
    FirmwareHeader, HeaderError, CHALLENGE_SIZE, CHUNK_SIZE, HEADER_LEN, SECURE_FRAME_SIZE,
    TRAILER_SIZE,
};
pub use pdu::{Category, CommandOpcode, MessageKind, Pdu, PduError, PduId, MAX_PAYLOAD};
pub use registry::{EcuRegistry, LoadSummary};
pub use routing::{RouteEntry, RoutingTable};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
