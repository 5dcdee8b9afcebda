//! Active session table
//!
//! Maps an ECU id to the inbound queue of its running session. The table
//! enforces at most one session per ECU: a slot is claimed before the
//! session task starts and released when the [`SessionSlot`] guard drops,
//! whatever way the session ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use ecugw_core::{EcuId, GatewayError, Pdu};

#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<EcuId, mpsc::Sender<Pdu>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inbound queue for `ecu`
    ///
    /// Fails with a resource error if a session is already active.
    pub fn claim(
        self: &Arc<Self>,
        ecu: EcuId,
        inbox: mpsc::Sender<Pdu>,
    ) -> Result<SessionSlot, GatewayError> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&ecu) {
            return Err(GatewayError::Resource(format!(
                "Firmware session already active for ECU {}",
                ecu
            )));
        }
        inner.insert(ecu, inbox);
        debug!(%ecu, "Session slot claimed");
        Ok(SessionSlot {
            table: Arc::clone(self),
            ecu,
        })
    }

    /// Inbound queue of the active session for `ecu`
    pub fn sender(&self, ecu: EcuId) -> Option<mpsc::Sender<Pdu>> {
        self.inner.lock().get(&ecu).cloned()
    }

    pub fn is_active(&self, ecu: EcuId) -> bool {
        self.inner.lock().contains_key(&ecu)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Ownership of one ECU's session slot
#[derive(Debug)]
pub struct SessionSlot {
    table: Arc<SessionTable>,
    ecu: EcuId,
}

impl SessionSlot {
    pub fn ecu(&self) -> EcuId {
        self.ecu
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.table.inner.lock().remove(&self.ecu);
        debug!(ecu = %self.ecu, "Session slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_session_per_ecu() {
        let table = Arc::new(SessionTable::new());
        let (tx, _rx) = mpsc::channel(1);

        let slot = table.claim(EcuId(2), tx.clone()).unwrap();
        let err = table.claim(EcuId(2), tx.clone()).unwrap_err();
        assert_eq!(err.kind(), ecugw_core::ErrorKind::Resource);

        // Other ECUs are independent
        let _other = table.claim(EcuId(3), tx.clone()).unwrap();
        assert_eq!(table.len(), 2);

        drop(slot);
        assert!(!table.is_active(EcuId(2)));
        assert!(table.claim(EcuId(2), tx).is_ok());
    }
}
