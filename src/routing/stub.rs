//! The contract between the router and the transports.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::address::{Address, TransportKind};
use crate::message::Message;

pub use crate::utils::error::TransmitError;

/// Sends one message to one address.
///
/// The returned future resolves exactly once per call, so the router sees
/// exactly one outcome per delivery attempt.
#[async_trait]
pub trait TransportStub: Send + Sync {
    async fn transmit(&self, message: &Message, address: &Address) -> Result<(), TransmitError>;
}

/// Transport stubs by the kind of address they serve.
#[derive(Default)]
pub struct StubRegistry {
    stubs: RwLock<HashMap<TransportKind, Arc<dyn TransportStub>>>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stub` for `kind`, replacing any previous one.
    pub fn register(&self, kind: TransportKind, stub: Arc<dyn TransportStub>) {
        self.stubs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, stub);
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn TransportStub>> {
        self.stubs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn unregister(&self, kind: TransportKind) -> bool {
        self.stubs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }
}

impl std::fmt::Debug for StubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<TransportKind> = self
            .stubs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("StubRegistry").field("kinds", &kinds).finish()
    }
}
