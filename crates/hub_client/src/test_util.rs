use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    client::{HubError, HubSender},
    message::OutgoingMessage,
};

/// In-memory hub that records everything a bot sends.
///
/// Local ids are sequential (`local-1`, `local-2`, ...) so tests can predict
/// them. Clones share the same record.
#[derive(Clone, Default)]
pub struct MockHub {
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain the record.
    pub fn take_sent(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn last_sent(&self) -> Option<OutgoingMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }

    /// Make every following `enqueue` fail with `HubError::Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl HubSender for MockHub {
    fn generate_local_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("local-{n}")
    }

    fn enqueue(&self, msg: OutgoingMessage) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
        Ok(())
    }
}
