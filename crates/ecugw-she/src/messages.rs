//! SHE key update messages M1..M5
//!
//! ```text
//! M1 = UID(120) | KeyID(4) | AuthID(4)
//! M2 = CBC(K1, 0, Counter(28) | Flags(5) | 0(95) | NewKey(128))
//! M3 = CMAC(K2, M1 | M2)
//! M4 = M1 | ECB(K3, Counter(28) | 1 | 0(99))
//! M5 = CMAC(K4, M4)
//! ```
//!
//! K1/K2 are derived from the authorizing key, K3/K4 from the new key.

use crate::crypto::{self, KEY_UPDATE_ENC_C, KEY_UPDATE_MAC_C};
use crate::error::SheError;
use crate::slot::{KeyFlags, KeySlot, Uid, UID_LEN};

/// Largest value the 28-bit update counter can hold
pub const COUNTER_MAX: u32 = 0x0FFF_FFFF;

/// Messages the key owner sends to the secure element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M1M2M3 {
    pub m1: [u8; 16],
    pub m2: [u8; 32],
    pub m3: [u8; 16],
}

/// Verification messages returned by the secure element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M4M5 {
    pub m4: [u8; 32],
    pub m5: [u8; 16],
}

/// Fields recovered from a decrypted M2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M2Payload {
    pub counter: u32,
    pub flags: KeyFlags,
    pub new_key: [u8; 16],
}

pub fn pack_m1(uid: &Uid, key_id: u8, auth_id: u8) -> [u8; 16] {
    let mut m1 = [0u8; 16];
    m1[..UID_LEN].copy_from_slice(uid);
    m1[UID_LEN] = (key_id << 4) | (auth_id & 0x0F);
    m1
}

/// Split M1 into UID, key id and auth id
pub fn unpack_m1(m1: &[u8; 16]) -> (Uid, u8, u8) {
    let mut uid = [0u8; UID_LEN];
    uid.copy_from_slice(&m1[..UID_LEN]);
    (uid, m1[UID_LEN] >> 4, m1[UID_LEN] & 0x0F)
}

fn slot_id(slot: KeySlot) -> Result<u8, SheError> {
    slot.id().ok_or(SheError::KeyInvalid)
}

fn check_counter(counter: u32) -> Result<(), SheError> {
    if counter > COUNTER_MAX {
        return Err(SheError::KeyUpdateError);
    }
    Ok(())
}

/// Build M1..M3 for loading `new_key` into `key` authorized by `auth`
pub fn compute_m1m2m3(
    auth_key: &[u8; 16],
    auth: KeySlot,
    key: KeySlot,
    new_key: &[u8; 16],
    counter: u32,
    flags: KeyFlags,
    uid: &Uid,
) -> Result<M1M2M3, SheError> {
    check_counter(counter)?;
    let k1 = crypto::derive_key(auth_key, &KEY_UPDATE_ENC_C);
    let k2 = crypto::derive_key(auth_key, &KEY_UPDATE_MAC_C);

    let m1 = pack_m1(uid, slot_id(key)?, slot_id(auth)?);

    let flags = flags.bits();
    let mut plain = [0u8; 32];
    plain[..4].copy_from_slice(&((counter << 4) | u32::from(flags >> 1)).to_be_bytes());
    plain[4] = (flags & 0x01) << 7;
    plain[16..].copy_from_slice(new_key);
    let mut m2 = [0u8; 32];
    m2.copy_from_slice(&crypto::cbc_encrypt(&k1, &[0u8; 16], &plain)?);

    let mut mac_input = [0u8; 48];
    mac_input[..16].copy_from_slice(&m1);
    mac_input[16..].copy_from_slice(&m2);
    let m3 = crypto::cmac(&k2, &mac_input);

    Ok(M1M2M3 { m1, m2, m3 })
}

/// Verify M3 and decrypt M2 with the authorizing key
pub fn open_m2(auth_key: &[u8; 16], msgs: &M1M2M3) -> Result<M2Payload, SheError> {
    let k1 = crypto::derive_key(auth_key, &KEY_UPDATE_ENC_C);
    let k2 = crypto::derive_key(auth_key, &KEY_UPDATE_MAC_C);

    let mut mac_input = [0u8; 48];
    mac_input[..16].copy_from_slice(&msgs.m1);
    mac_input[16..].copy_from_slice(&msgs.m2);
    if !crypto::cmac_verify(&k2, &mac_input, &msgs.m3) {
        return Err(SheError::KeyUpdateError);
    }

    let plain = crypto::cbc_decrypt(&k1, &[0u8; 16], &msgs.m2)?;
    let head = u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let flags = (((head & 0x0F) as u8) << 1) | (plain[4] >> 7);
    let mut new_key = [0u8; 16];
    new_key.copy_from_slice(&plain[16..32]);
    Ok(M2Payload {
        counter: head >> 4,
        flags: KeyFlags::from_bits(flags),
        new_key,
    })
}

/// Build the M4/M5 pair proving `new_key` was stored under `key`
pub fn compute_m4m5(
    auth: KeySlot,
    key: KeySlot,
    new_key: &[u8; 16],
    counter: u32,
    uid: &Uid,
) -> Result<M4M5, SheError> {
    check_counter(counter)?;
    let k3 = crypto::derive_key(new_key, &KEY_UPDATE_ENC_C);
    let k4 = crypto::derive_key(new_key, &KEY_UPDATE_MAC_C);

    let mut verifier = [0u8; 16];
    verifier[..4].copy_from_slice(&((counter << 4) | 0x8).to_be_bytes());
    crypto::encrypt_block(&k3, &mut verifier);

    let mut m4 = [0u8; 32];
    m4[..16].copy_from_slice(&pack_m1(uid, slot_id(key)?, slot_id(auth)?));
    m4[16..].copy_from_slice(&verifier);
    let m5 = crypto::cmac(&k4, &m4);
    Ok(M4M5 { m4, m5 })
}
