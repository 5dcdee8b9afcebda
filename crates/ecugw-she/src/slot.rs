//! Key slots, key material and key protection flags

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the secure element's unique identifier
pub const UID_LEN: usize = 15;

/// Secure element unique identifier
pub type Uid = [u8; UID_LEN];

/// Number of numbered user key slots
pub const USER_SLOTS: u8 = 10;

/// SHE key slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySlot {
    /// MASTER_ECU_KEY, the authorization key for all updates
    Master,
    BootMacKey,
    /// KEY_1 .. KEY_10
    User(u8),
    /// Volatile RAM key, loaded in plain text
    Ram,
}

impl KeySlot {
    /// SHE key id (4 bits); `None` for a user slot outside 1..=10
    pub fn id(self) -> Option<u8> {
        match self {
            KeySlot::Master => Some(0x1),
            KeySlot::BootMacKey => Some(0x2),
            KeySlot::User(n) if self.valid() => Some(0x3 + n),
            KeySlot::User(_) => None,
            KeySlot::Ram => Some(0xE),
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x1 => Some(KeySlot::Master),
            0x2 => Some(KeySlot::BootMacKey),
            0x4..=0xD => Some(KeySlot::User(id - 0x3)),
            0xE => Some(KeySlot::Ram),
            _ => None,
        }
    }

    /// Whether the slot is loaded through the authenticated M1..M3 protocol
    pub fn is_protected(self) -> bool {
        self.valid() && !matches!(self, KeySlot::Ram)
    }

    fn valid(self) -> bool {
        match self {
            KeySlot::User(n) => (1..=USER_SLOTS).contains(&n),
            _ => true,
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySlot::Master => write!(f, "master"),
            KeySlot::BootMacKey => write!(f, "boot_mac_key"),
            KeySlot::User(n) => write!(f, "key_{}", n),
            KeySlot::Ram => write!(f, "ram"),
        }
    }
}

impl FromStr for KeySlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slot = match s.to_ascii_lowercase().as_str() {
            "master" | "master_ecu_key" => KeySlot::Master,
            "boot_mac_key" => KeySlot::BootMacKey,
            "ram" | "ram_key" => KeySlot::Ram,
            other => {
                let n = other
                    .strip_prefix("key_")
                    .and_then(|n| n.parse::<u8>().ok())
                    .ok_or_else(|| format!("Unknown key slot: {}", s))?;
                KeySlot::User(n)
            }
        };
        if slot.valid() {
            Ok(slot)
        } else {
            Err(format!("Key slot out of range: {}", s))
        }
    }
}

impl TryFrom<String> for KeySlot {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySlot> for String {
    fn from(slot: KeySlot) -> Self {
        slot.to_string()
    }
}

/// 128-bit key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key128([u8; 16]);

impl Key128 {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The all-zero key used as prior key when bootstrapping
    pub fn zero() -> Self {
        Self([0u8; 16])
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("Invalid key hex: {}", e))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("Key must be 16 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Key128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key128(..)")
    }
}

/// SHE key protection flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFlags {
    pub write_protection: bool,
    pub boot_protection: bool,
    pub debugger_protection: bool,
    /// Key may only be used for MAC operations
    pub key_usage: bool,
    pub wildcard: bool,
}

impl KeyFlags {
    /// 5-bit field as packed into M2
    pub fn bits(self) -> u8 {
        (u8::from(self.write_protection) << 4)
            | (u8::from(self.boot_protection) << 3)
            | (u8::from(self.debugger_protection) << 2)
            | (u8::from(self.key_usage) << 1)
            | u8::from(self.wildcard)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            write_protection: bits & 0x10 != 0,
            boot_protection: bits & 0x08 != 0,
            debugger_protection: bits & 0x04 != 0,
            key_usage: bits & 0x02 != 0,
            wildcard: bits & 0x01 != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ids() {
        assert_eq!(KeySlot::Master.id(), Some(1));
        assert_eq!(KeySlot::User(1).id(), Some(4));
        assert_eq!(KeySlot::User(10).id(), Some(0xD));
        assert_eq!(KeySlot::User(11).id(), None);
        assert_eq!(KeySlot::User(u8::MAX).id(), None);
        assert!(!KeySlot::User(0).is_protected());
        assert_eq!(KeySlot::from_id(0x4), Some(KeySlot::User(1)));
        assert_eq!(KeySlot::from_id(0x0), None);
    }

    #[test]
    fn test_slot_names() {
        assert_eq!("key_3".parse::<KeySlot>(), Ok(KeySlot::User(3)));
        assert_eq!("MASTER".parse::<KeySlot>(), Ok(KeySlot::Master));
        assert!("key_11".parse::<KeySlot>().is_err());
        assert!("key_0".parse::<KeySlot>().is_err());
        assert_eq!(KeySlot::User(7).to_string(), "key_7");
    }

    #[test]
    fn test_flag_bits() {
        let flags = KeyFlags {
            write_protection: true,
            key_usage: true,
            ..Default::default()
        };
        assert_eq!(flags.bits(), 0b1_0010);
        assert_eq!(KeyFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_key_hex() {
        let key = Key128::from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key.as_bytes()[15], 0x0f);
        assert!(Key128::from_hex("0001").is_err());
        assert_eq!(format!("{:?}", key), "Key128(..)");
    }
}
