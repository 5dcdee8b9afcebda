//! AES-128 primitives and the SHE key derivation function
//!
//! These are the building blocks both the key service (to construct
//! M1..M5) and the software secure element (to check them) are made of.

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecrypt, BlockDecryptMut,
    BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::SheError;

/// AES block size
pub const BLOCK_LEN: usize = 16;

/// Derivation constant for the M2 encryption key (K1)
pub const KEY_UPDATE_ENC_C: [u8; 16] = [
    0x01, 0x01, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xB0,
];

/// Derivation constant for the M3/M5 MAC key (K2)
pub const KEY_UPDATE_MAC_C: [u8; 16] = [
    0x01, 0x02, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xB0,
];

/// Derivation constant for the debug (erase) authorization key
pub const DEBUG_KEY_C: [u8; 16] = [
    0x01, 0x03, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xB0,
];

fn check_blocks(len: usize) -> Result<(), SheError> {
    if len == 0 || len % BLOCK_LEN != 0 {
        return Err(SheError::InvalidLength(len));
    }
    Ok(())
}

fn to_array(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[..16]);
    out
}

/// Encrypt a single block in place
pub fn encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

pub fn ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SheError> {
    check_blocks(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

pub fn ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SheError> {
    check_blocks(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SheError> {
    check_blocks(data.len())?;
    let mut out = data.to_vec();
    let len = out.len();
    cbc::Encryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .encrypt_padded_mut::<NoPadding>(&mut out, len)
        .map_err(|_| SheError::InvalidLength(len))?;
    Ok(out)
}

pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SheError> {
    check_blocks(data.len())?;
    let mut out = data.to_vec();
    let len = out.len();
    cbc::Decryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .decrypt_padded_mut::<NoPadding>(&mut out)
        .map_err(|_| SheError::InvalidLength(len))?;
    Ok(out)
}

/// AES-CMAC over `data`
pub fn cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    Mac::update(&mut mac, data);
    to_array(&mac.finalize().into_bytes())
}

/// Constant-time CMAC verification
pub fn cmac_verify(key: &[u8; 16], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    Mac::update(&mut mac, data);
    mac.verify_slice(tag).is_ok()
}

/// Miyaguchi-Preneel compression over whole 16-byte blocks
///
/// `out_i = E(out_{i-1}, x_i) ^ out_{i-1} ^ x_i` with `out_0 = 0`. Input
/// that is not block aligned is rejected; SHE never pads here.
pub fn mp_compress(input: &[u8]) -> Result<[u8; 16], SheError> {
    check_blocks(input.len())?;
    let mut out = [0u8; 16];
    for chunk in input.chunks_exact(BLOCK_LEN) {
        let x = to_array(chunk);
        let mut enc = x;
        encrypt_block(&out, &mut enc);
        for i in 0..BLOCK_LEN {
            out[i] ^= enc[i] ^ x[i];
        }
    }
    Ok(out)
}

/// SHE KDF: `MP(key || constant)`
pub fn derive_key(key: &[u8; 16], constant: &[u8; 16]) -> [u8; 16] {
    let mut input = [0u8; 32];
    input[..16].copy_from_slice(key);
    input[16..].copy_from_slice(constant);
    // Two full blocks, cannot fail the length check
    mp_compress(&input).unwrap_or_default()
}
