//! ecugw-she - SHE (Secure Hardware Extension) key management
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     KeyService                        │
//! │  load_key / set_auth_key / erase_keys / encrypt ...   │
//! │  one command in flight (token), cancel on timeout     │
//! │                                                      │
//! │  ┌───────────────┐      ┌──────────────────────────┐ │
//! │  │ messages      │      │ slot counters (mirror)   │ │
//! │  │ M1..M5, KDF   │      │ anti-replay check        │ │
//! │  └───────────────┘      └──────────────────────────┘ │
//! │                     │                                │
//! │             ┌───────┴────────┐                       │
//! │             │ SecureElement  │                       │
//! │             │ (HSM / emul.)  │                       │
//! │             └────────────────┘                       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Secure-element commands are slow and must not be issued from
//! time-critical paths; use [`KeyService::start`] and poll the returned
//! [`PendingCommand`] when the caller cannot block.

pub mod crypto;
pub mod element;
pub mod emulator;
pub mod error;
pub mod messages;
pub mod service;
pub mod slot;

pub use element::{SecureElement, SheCommand, SheResponse};
pub use emulator::SoftSecureElement;
pub use error::{KeyServiceError, SheError};
pub use messages::{compute_m1m2m3, compute_m4m5, M1M2M3, M4M5, COUNTER_MAX};
pub use service::{KeyService, PendingCommand, DEFAULT_COMMAND_TIMEOUT};
pub use slot::{Key128, KeyFlags, KeySlot, Uid, UID_LEN};
