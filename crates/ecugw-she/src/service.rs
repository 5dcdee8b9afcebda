//! Key management service
//!
//! Serializes access to the secure element: exactly one command is in
//! flight at a time, enforced by owning the single permit of a semaphore.
//! A command that exceeds the command timeout is cancelled on the element
//! before the permit is released, so the next caller always finds the
//! element idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::crypto::{self, DEBUG_KEY_C};
use crate::element::{SecureElement, SheCommand, SheResponse};
use crate::error::KeyServiceError;
use crate::messages::{self, COUNTER_MAX};
use crate::slot::{Key128, KeyFlags, KeySlot, Uid};

/// Default secure element command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// What the service knows about a provisioned slot
struct SlotRecord {
    counter: u32,
    key: Option<Key128>,
}

/// Handle to a command started with [`KeyService::start`]
pub struct PendingCommand {
    name: &'static str,
    rx: oneshot::Receiver<Result<SheResponse, KeyServiceError>>,
}

impl PendingCommand {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking check for completion
    pub fn poll(&mut self) -> Option<Result<SheResponse, KeyServiceError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(KeyServiceError::Closed)),
        }
    }

    /// Wait for completion
    pub async fn wait(self) -> Result<SheResponse, KeyServiceError> {
        self.rx.await.unwrap_or(Err(KeyServiceError::Closed))
    }
}

/// SHE key service
#[derive(Clone)]
pub struct KeyService {
    element: Arc<dyn SecureElement>,
    token: Arc<Semaphore>,
    timeout: Duration,
    slots: Arc<Mutex<HashMap<KeySlot, SlotRecord>>>,
    uid: Arc<Mutex<Option<Uid>>>,
}

impl KeyService {
    pub fn new(element: Arc<dyn SecureElement>, timeout: Duration) -> Self {
        Self {
            element,
            token: Arc::new(Semaphore::new(1)),
            timeout,
            slots: Arc::new(Mutex::new(HashMap::new())),
            uid: Arc::new(Mutex::new(None)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Counter last accepted for a slot
    pub fn slot_counter(&self, slot: KeySlot) -> Option<u32> {
        self.slots.lock().get(&slot).map(|r| r.counter)
    }

    /// Record a slot that was provisioned outside this service instance
    pub fn restore_slot(&self, slot: KeySlot, key: Option<Key128>, counter: u32) {
        self.slots.lock().insert(slot, SlotRecord { counter, key });
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, KeyServiceError> {
        match tokio::time::timeout(self.timeout, self.token.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(KeyServiceError::Closed),
            Err(_) => Err(KeyServiceError::Busy),
        }
    }

    /// Run one command; the caller must hold the token
    async fn run_locked(&self, command: SheCommand) -> Result<SheResponse, KeyServiceError> {
        let name = command.name();
        debug!(command = name, "Secure element command");
        match tokio::time::timeout(self.timeout, self.element.execute(command)).await {
            Ok(result) => result.map_err(KeyServiceError::from),
            Err(_) => {
                warn!(command = name, timeout = ?self.timeout, "Secure element command timed out, cancelling");
                self.element.cancel().await;
                Err(KeyServiceError::Timeout(self.timeout))
            }
        }
    }

    /// Blocking call: waits for the element to become free, then runs
    /// the command to completion or timeout
    pub async fn execute(&self, command: SheCommand) -> Result<SheResponse, KeyServiceError> {
        let _permit = self.acquire().await?;
        self.run_locked(command).await
    }

    /// Start a command without waiting for it
    ///
    /// Fails with [`KeyServiceError::Busy`] if another command is in flight.
    pub fn start(&self, command: SheCommand) -> Result<PendingCommand, KeyServiceError> {
        let permit = self
            .token
            .clone()
            .try_acquire_owned()
            .map_err(|_| KeyServiceError::Busy)?;
        let name = command.name();
        let (tx, rx) = oneshot::channel();
        let service = self.clone();
        tokio::spawn(async move {
            let result = service.run_locked(command).await;
            drop(permit);
            let _ = tx.send(result);
        });
        Ok(PendingCommand { name, rx })
    }

    async fn uid_locked(&self) -> Result<Uid, KeyServiceError> {
        if let Some(uid) = *self.uid.lock() {
            return Ok(uid);
        }
        match self.run_locked(SheCommand::GetId { challenge: [0u8; 16] }).await? {
            SheResponse::Id { uid, .. } => {
                *self.uid.lock() = Some(uid);
                Ok(uid)
            }
            _ => Err(KeyServiceError::UnexpectedResponse("GET_ID")),
        }
    }

    /// Device UID (cached after the first query)
    pub async fn get_uid(&self) -> Result<Uid, KeyServiceError> {
        let _permit = self.acquire().await?;
        self.uid_locked().await
    }

    pub async fn random(&self) -> Result<[u8; 16], KeyServiceError> {
        match self.execute(SheCommand::Random).await? {
            SheResponse::Random(bytes) => Ok(bytes),
            _ => Err(KeyServiceError::UnexpectedResponse("RND")),
        }
    }

    async fn data_command(&self, command: SheCommand) -> Result<Vec<u8>, KeyServiceError> {
        let name = command.name();
        match self.execute(command).await? {
            SheResponse::Data(data) => Ok(data),
            _ => Err(KeyServiceError::UnexpectedResponse(name)),
        }
    }

    pub async fn encrypt_ecb(&self, slot: KeySlot, data: &[u8]) -> Result<Vec<u8>, KeyServiceError> {
        self.data_command(SheCommand::EncryptEcb {
            slot,
            data: data.to_vec(),
        })
        .await
    }

    pub async fn decrypt_ecb(&self, slot: KeySlot, data: &[u8]) -> Result<Vec<u8>, KeyServiceError> {
        self.data_command(SheCommand::DecryptEcb {
            slot,
            data: data.to_vec(),
        })
        .await
    }

    pub async fn encrypt_cbc(
        &self,
        slot: KeySlot,
        iv: [u8; 16],
        data: &[u8],
    ) -> Result<Vec<u8>, KeyServiceError> {
        self.data_command(SheCommand::EncryptCbc {
            slot,
            iv,
            data: data.to_vec(),
        })
        .await
    }

    pub async fn decrypt_cbc(
        &self,
        slot: KeySlot,
        iv: [u8; 16],
        data: &[u8],
    ) -> Result<Vec<u8>, KeyServiceError> {
        self.data_command(SheCommand::DecryptCbc {
            slot,
            iv,
            data: data.to_vec(),
        })
        .await
    }

    pub async fn generate_mac(&self, slot: KeySlot, data: &[u8]) -> Result<[u8; 16], KeyServiceError> {
        match self
            .execute(SheCommand::GenerateMac {
                slot,
                data: data.to_vec(),
            })
            .await?
        {
            SheResponse::Mac(mac) => Ok(mac),
            _ => Err(KeyServiceError::UnexpectedResponse("GENERATE_MAC")),
        }
    }

    pub async fn verify_mac(
        &self,
        slot: KeySlot,
        data: &[u8],
        mac: &[u8; 16],
    ) -> Result<bool, KeyServiceError> {
        match self
            .execute(SheCommand::VerifyMac {
                slot,
                data: data.to_vec(),
                mac: *mac,
            })
            .await?
        {
            SheResponse::Verified(ok) => Ok(ok),
            _ => Err(KeyServiceError::UnexpectedResponse("VERIFY_MAC")),
        }
    }

    /// Load a key into the volatile RAM slot (no authorization, no counter)
    pub async fn load_plain_ram_key(&self, key: &Key128) -> Result<(), KeyServiceError> {
        match self
            .execute(SheCommand::LoadPlainKey { key: *key.as_bytes() })
            .await?
        {
            SheResponse::Done => Ok(()),
            _ => Err(KeyServiceError::UnexpectedResponse("LOAD_PLAIN_KEY")),
        }
    }

    /// Provision `key` into `slot` with default flags
    pub async fn load_key(
        &self,
        slot: KeySlot,
        key: &Key128,
        counter: u32,
    ) -> Result<(), KeyServiceError> {
        self.load_key_with_flags(slot, key, counter, KeyFlags::default())
            .await
    }

    /// Provision `key` into `slot` through M1..M5
    ///
    /// The counter must exceed the one last accepted for the slot. The
    /// update is authorized by the master key; loading the master key for
    /// the first time authorizes with the all-zero key.
    pub async fn load_key_with_flags(
        &self,
        slot: KeySlot,
        key: &Key128,
        counter: u32,
        flags: KeyFlags,
    ) -> Result<(), KeyServiceError> {
        if !slot.is_protected() {
            return Err(KeyServiceError::InvalidSlot(slot));
        }
        if counter > COUNTER_MAX {
            return Err(KeyServiceError::CounterOverflow(counter));
        }

        // Checked again under the token: a concurrent load may have moved
        // the counter meanwhile
        self.authorizing_key(slot, counter)?;
        let _permit = self.acquire().await?;
        let auth_key = self.authorizing_key(slot, counter)?;
        let uid = self.uid_locked().await?;
        let msgs = messages::compute_m1m2m3(
            auth_key.as_bytes(),
            KeySlot::Master,
            slot,
            key.as_bytes(),
            counter,
            flags,
            &uid,
        )?;
        let response = self
            .run_locked(SheCommand::LoadKey {
                m1: msgs.m1,
                m2: msgs.m2,
                m3: msgs.m3,
            })
            .await?;

        let (m4, m5) = match response {
            SheResponse::KeyLoaded { m4, m5 } => (m4, m5),
            _ => return Err(KeyServiceError::UnexpectedResponse("LOAD_KEY")),
        };
        let expected = messages::compute_m4m5(KeySlot::Master, slot, key.as_bytes(), counter, &uid)?;
        if expected.m4 != m4 || expected.m5 != m5 {
            return Err(KeyServiceError::VerificationFailed);
        }

        let mut slots = self.slots.lock();
        check_counter(&slots, slot, counter)?;
        slots.insert(
            slot,
            SlotRecord {
                counter,
                key: Some(key.clone()),
            },
        );
        info!(%slot, counter, "Key provisioned");
        Ok(())
    }

    /// Key that authorizes loading `slot` at `counter`
    fn authorizing_key(&self, slot: KeySlot, counter: u32) -> Result<Key128, KeyServiceError> {
        let slots = self.slots.lock();
        check_counter(&slots, slot, counter)?;
        match (slots.get(&KeySlot::Master), slot) {
            (Some(master), _) => master.key.clone().ok_or(KeyServiceError::AuthKeyUnknown),
            (None, KeySlot::Master) => Ok(Key128::zero()),
            (None, _) => Err(KeyServiceError::AuthKeyUnknown),
        }
    }

    /// Set the master (authorization) key
    ///
    /// The first call bootstraps from the empty slot; later calls are
    /// authorized by the current master key with the next counter value.
    pub async fn set_auth_key(&self, key: &Key128) -> Result<u32, KeyServiceError> {
        let counter = self.slot_counter(KeySlot::Master).map_or(1, |c| c + 1);
        self.load_key(KeySlot::Master, key, counter).await?;
        Ok(counter)
    }

    /// Wipe every key on the element through the debug challenge sequence
    pub async fn erase_keys(&self) -> Result<(), KeyServiceError> {
        let master = self
            .slots
            .lock()
            .get(&KeySlot::Master)
            .and_then(|r| r.key.clone())
            .unwrap_or_else(Key128::zero);

        let _permit = self.acquire().await?;
        let uid = self.uid_locked().await?;
        let challenge = match self.run_locked(SheCommand::DebugChallenge).await? {
            SheResponse::Challenge(c) => c,
            _ => return Err(KeyServiceError::UnexpectedResponse("DEBUG_CHAL")),
        };

        let debug_key = crypto::derive_key(master.as_bytes(), &DEBUG_KEY_C);
        let mut input = Vec::with_capacity(challenge.len() + uid.len());
        input.extend_from_slice(&challenge);
        input.extend_from_slice(&uid);
        let auth = crypto::cmac(&debug_key, &input);

        match self.run_locked(SheCommand::DebugAuthorize { auth }).await? {
            SheResponse::Done => {
                self.slots.lock().clear();
                warn!("All secure element keys erased");
                Ok(())
            }
            _ => Err(KeyServiceError::UnexpectedResponse("DEBUG_AUTH")),
        }
    }
}

/// Anti-replay: a slot only accepts a strictly higher counter
fn check_counter(
    slots: &HashMap<KeySlot, SlotRecord>,
    slot: KeySlot,
    counter: u32,
) -> Result<(), KeyServiceError> {
    match slots.get(&slot) {
        Some(stored) if counter <= stored.counter => Err(KeyServiceError::CounterNotIncreasing {
            slot,
            counter,
            stored: stored.counter,
        }),
        _ => Ok(()),
    }
}
