//! Software secure element
//!
//! Behaves like a SHE module for the commands the gateway uses: it keeps
//! key slots with counters and protection flags, checks M3 against the
//! authorizing key, answers with M4/M5, and supports the debug
//! challenge/authorize erase sequence. Used by the daemon when no
//! hardware module is present and by the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, warn};

use crate::crypto::{self, DEBUG_KEY_C};
use crate::element::{SecureElement, SheCommand, SheResponse};
use crate::error::SheError;
use crate::messages::{self, M1M2M3};
use crate::slot::{Key128, KeyFlags, KeySlot, Uid};

struct StoredKey {
    key: Key128,
    counter: u32,
    flags: KeyFlags,
}

#[derive(Default)]
struct ElementState {
    slots: HashMap<KeySlot, StoredKey>,
    ram: Option<Key128>,
    challenge: Option<[u8; 16]>,
}

/// In-process SHE emulation
pub struct SoftSecureElement {
    uid: Uid,
    latency: Duration,
    state: Mutex<ElementState>,
    cancels: AtomicUsize,
}

impl SoftSecureElement {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            latency: Duration::ZERO,
            state: Mutex::new(ElementState::default()),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Delay applied to every command before it is processed
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Number of cancel requests received
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Counter accepted for a slot, `None` if empty
    pub fn slot_counter(&self, slot: KeySlot) -> Option<u32> {
        self.state.lock().slots.get(&slot).map(|s| s.counter)
    }

    fn cipher_key(&self, state: &ElementState, slot: KeySlot) -> Result<[u8; 16], SheError> {
        match slot {
            KeySlot::Ram => state
                .ram
                .as_ref()
                .map(|k| *k.as_bytes())
                .ok_or(SheError::KeyEmpty),
            KeySlot::Master | KeySlot::BootMacKey => Err(SheError::KeyInvalid),
            KeySlot::User(_) => {
                let stored = state.slots.get(&slot).ok_or(SheError::KeyEmpty)?;
                if stored.flags.key_usage {
                    return Err(SheError::KeyInvalid);
                }
                Ok(*stored.key.as_bytes())
            }
        }
    }

    fn mac_key(&self, state: &ElementState, slot: KeySlot) -> Result<[u8; 16], SheError> {
        match slot {
            KeySlot::Ram => state
                .ram
                .as_ref()
                .map(|k| *k.as_bytes())
                .ok_or(SheError::KeyEmpty),
            KeySlot::Master => Err(SheError::KeyInvalid),
            _ => state
                .slots
                .get(&slot)
                .map(|s| *s.key.as_bytes())
                .ok_or(SheError::KeyEmpty),
        }
    }

    /// Key used to authorize updates; an empty slot authorizes with zeros
    fn auth_key(state: &ElementState, slot: KeySlot) -> [u8; 16] {
        state
            .slots
            .get(&slot)
            .map(|s| *s.key.as_bytes())
            .unwrap_or([0u8; 16])
    }

    fn load_key(&self, state: &mut ElementState, msgs: M1M2M3) -> Result<SheResponse, SheError> {
        let (uid, key_id, auth_id) = messages::unpack_m1(&msgs.m1);
        let key = KeySlot::from_id(key_id).ok_or(SheError::KeyInvalid)?;
        let auth = KeySlot::from_id(auth_id).ok_or(SheError::KeyInvalid)?;
        if key == KeySlot::Ram || auth == KeySlot::Ram {
            return Err(SheError::KeyInvalid);
        }
        // Only the master key or the slot's own key may authorize
        if auth != KeySlot::Master && auth != key {
            return Err(SheError::KeyNotAvailable);
        }

        let existing = state.slots.get(&key);
        let wildcard_ok = uid == [0u8; 15] && existing.map_or(false, |s| s.flags.wildcard);
        if uid != self.uid && !wildcard_ok {
            return Err(SheError::KeyUpdateError);
        }

        let payload = messages::open_m2(&Self::auth_key(state, auth), &msgs)?;
        if let Some(stored) = existing {
            if stored.flags.write_protection {
                return Err(SheError::KeyWriteProtected);
            }
            if payload.counter <= stored.counter {
                return Err(SheError::KeyUpdateError);
            }
        }

        let verify = messages::compute_m4m5(auth, key, &payload.new_key, payload.counter, &self.uid)?;
        state.slots.insert(
            key,
            StoredKey {
                key: Key128::new(payload.new_key),
                counter: payload.counter,
                flags: payload.flags,
            },
        );
        debug!(slot = %key, counter = payload.counter, "Emulated key slot written");
        Ok(SheResponse::KeyLoaded {
            m4: verify.m4,
            m5: verify.m5,
        })
    }

    fn debug_authorize(
        &self,
        state: &mut ElementState,
        auth: [u8; 16],
    ) -> Result<SheResponse, SheError> {
        let challenge = state.challenge.take().ok_or(SheError::SequenceError)?;
        if state.slots.values().any(|s| s.flags.debugger_protection) {
            return Err(SheError::NoDebugging);
        }
        let debug_key = crypto::derive_key(&Self::auth_key(state, KeySlot::Master), &DEBUG_KEY_C);
        let mut input = [0u8; 31];
        input[..16].copy_from_slice(&challenge);
        input[16..].copy_from_slice(&self.uid);
        if !crypto::cmac_verify(&debug_key, &input, &auth) {
            return Err(SheError::NoDebugging);
        }
        warn!("Emulated secure element erased all keys");
        state.slots.clear();
        state.ram = None;
        Ok(SheResponse::Done)
    }

    fn process(&self, command: SheCommand) -> Result<SheResponse, SheError> {
        let mut state = self.state.lock();
        match command {
            SheCommand::EncryptEcb { slot, data } => {
                let key = self.cipher_key(&state, slot)?;
                crypto::ecb_encrypt(&key, &data).map(SheResponse::Data)
            }
            SheCommand::DecryptEcb { slot, data } => {
                let key = self.cipher_key(&state, slot)?;
                crypto::ecb_decrypt(&key, &data).map(SheResponse::Data)
            }
            SheCommand::EncryptCbc { slot, iv, data } => {
                let key = self.cipher_key(&state, slot)?;
                crypto::cbc_encrypt(&key, &iv, &data).map(SheResponse::Data)
            }
            SheCommand::DecryptCbc { slot, iv, data } => {
                let key = self.cipher_key(&state, slot)?;
                crypto::cbc_decrypt(&key, &iv, &data).map(SheResponse::Data)
            }
            SheCommand::GenerateMac { slot, data } => {
                let key = self.mac_key(&state, slot)?;
                Ok(SheResponse::Mac(crypto::cmac(&key, &data)))
            }
            SheCommand::VerifyMac { slot, data, mac } => {
                let key = self.mac_key(&state, slot)?;
                Ok(SheResponse::Verified(crypto::cmac_verify(&key, &data, &mac)))
            }
            SheCommand::Random => {
                let mut out = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut out);
                Ok(SheResponse::Random(out))
            }
            SheCommand::LoadKey { m1, m2, m3 } => self.load_key(&mut state, M1M2M3 { m1, m2, m3 }),
            SheCommand::LoadPlainKey { key } => {
                state.ram = Some(Key128::new(key));
                Ok(SheResponse::Done)
            }
            SheCommand::GetId { challenge } => {
                let status = 0u8;
                let mac = match state.slots.get(&KeySlot::Master) {
                    Some(master) => {
                        let mut input = [0u8; 32];
                        input[..16].copy_from_slice(&challenge);
                        input[16..31].copy_from_slice(&self.uid);
                        input[31] = status;
                        crypto::cmac(master.key.as_bytes(), &input)
                    }
                    None => [0u8; 16],
                };
                Ok(SheResponse::Id {
                    uid: self.uid,
                    status,
                    mac,
                })
            }
            SheCommand::DebugChallenge => {
                let mut challenge = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut challenge);
                state.challenge = Some(challenge);
                Ok(SheResponse::Challenge(challenge))
            }
            SheCommand::DebugAuthorize { auth } => self.debug_authorize(&mut state, auth),
        }
    }
}

#[async_trait]
impl SecureElement for SoftSecureElement {
    async fn execute(&self, command: SheCommand) -> Result<SheResponse, SheError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.process(command)
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        // A half-finished debug sequence must be restarted
        self.state.lock().challenge = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::compute_m1m2m3;

    const UID: Uid = [0xA5; 15];

    fn load(
        element: &SoftSecureElement,
        auth_key: &[u8; 16],
        slot: KeySlot,
        key: [u8; 16],
        counter: u32,
        flags: KeyFlags,
    ) -> Result<SheResponse, SheError> {
        let msgs =
            compute_m1m2m3(auth_key, KeySlot::Master, slot, &key, counter, flags, &UID).unwrap();
        element.process(SheCommand::LoadKey {
            m1: msgs.m1,
            m2: msgs.m2,
            m3: msgs.m3,
        })
    }

    #[test]
    fn test_bootstrap_master_with_zero_key() {
        let element = SoftSecureElement::new(UID);
        let master = [0x11; 16];
        let resp = load(&element, &[0; 16], KeySlot::Master, master, 1, KeyFlags::default());
        let expected = messages::compute_m4m5(KeySlot::Master, KeySlot::Master, &master, 1, &UID)
            .unwrap();
        assert_eq!(
            resp.unwrap(),
            SheResponse::KeyLoaded {
                m4: expected.m4,
                m5: expected.m5
            }
        );
        assert_eq!(element.slot_counter(KeySlot::Master), Some(1));
    }

    #[test]
    fn test_rejects_wrong_auth_and_replay() {
        let element = SoftSecureElement::new(UID);
        let master = [0x11; 16];
        load(&element, &[0; 16], KeySlot::Master, master, 1, KeyFlags::default()).unwrap();

        let bad = load(&element, &[0; 16], KeySlot::User(1), [2; 16], 1, KeyFlags::default());
        assert_eq!(bad, Err(SheError::KeyUpdateError));

        load(&element, &master, KeySlot::User(1), [2; 16], 5, KeyFlags::default()).unwrap();
        let replay = load(&element, &master, KeySlot::User(1), [3; 16], 5, KeyFlags::default());
        assert_eq!(replay, Err(SheError::KeyUpdateError));
    }

    #[test]
    fn test_write_protected_slot() {
        let element = SoftSecureElement::new(UID);
        let master = [0x11; 16];
        load(&element, &[0; 16], KeySlot::Master, master, 1, KeyFlags::default()).unwrap();
        let protect = KeyFlags {
            write_protection: true,
            ..Default::default()
        };
        load(&element, &master, KeySlot::User(2), [2; 16], 1, protect).unwrap();
        assert_eq!(
            load(&element, &master, KeySlot::User(2), [3; 16], 2, KeyFlags::default()),
            Err(SheError::KeyWriteProtected)
        );
    }

    #[test]
    fn test_mac_only_key_cannot_encrypt() {
        let element = SoftSecureElement::new(UID);
        let master = [0x11; 16];
        load(&element, &[0; 16], KeySlot::Master, master, 1, KeyFlags::default()).unwrap();
        let mac_only = KeyFlags {
            key_usage: true,
            ..Default::default()
        };
        load(&element, &master, KeySlot::User(3), [3; 16], 1, mac_only).unwrap();
        assert_eq!(
            element.process(SheCommand::EncryptEcb {
                slot: KeySlot::User(3),
                data: vec![0; 16]
            }),
            Err(SheError::KeyInvalid)
        );
        assert!(element
            .process(SheCommand::GenerateMac {
                slot: KeySlot::User(3),
                data: vec![1, 2, 3]
            })
            .is_ok());
    }

    #[test]
    fn test_empty_slot() {
        let element = SoftSecureElement::new(UID);
        assert_eq!(
            element.process(SheCommand::EncryptEcb {
                slot: KeySlot::User(4),
                data: vec![0; 16]
            }),
            Err(SheError::KeyEmpty)
        );
        assert_eq!(
            element.process(SheCommand::DebugAuthorize { auth: [0; 16] }),
            Err(SheError::SequenceError)
        );
    }
}
