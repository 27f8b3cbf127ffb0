use async_trait::async_trait;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use crate::reconnect::{ChatHistory, CollaboratorError, ResourcePrefetcher};

/// In-process stand-in for the ride REST API and chat store.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    prefetch_calls: AtomicUsize,
    fail_prefetch: AtomicBool,
    fail_chat: AtomicBool,
    chat_syncs: StdMutex<Vec<String>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prefetch_failure(&self, fail: bool) {
        self.fail_prefetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_chat_failure(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    pub fn prefetch_calls(&self) -> usize {
        self.prefetch_calls.load(Ordering::SeqCst)
    }

    /// Ride ids passed to `sync_messages`, in call order.
    pub fn chat_syncs(&self) -> Vec<String> {
        self.chat_syncs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResourcePrefetcher for SimulatedBackend {
    async fn prefetch(&self) -> Result<(), CollaboratorError> {
        self.prefetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_prefetch.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("ride config endpoint".into()));
        }
        info!("Prefetched fares and ride configuration");
        Ok(())
    }
}

#[async_trait]
impl ChatHistory for SimulatedBackend {
    async fn sync_messages(&self, ride_id: &str) -> Result<usize, CollaboratorError> {
        self.chat_syncs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ride_id.to_string());
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Request(format!(
                "chat history for {}",
                ride_id
            )));
        }
        info!("Synced chat history for ride {}", ride_id);
        Ok(0)
    }
}
