use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::trace;

use crate::address::Address;
use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::routing::{TransmitError, TransportStub};

/// Delivers messages for local participants straight to this node's
/// dispatcher. Holds the dispatcher weakly: the dispatcher owns the router,
/// which owns this stub.
pub struct InProcessStub {
    dispatcher: Weak<Dispatcher>,
}

impl InProcessStub {
    pub fn new(dispatcher: &Arc<Dispatcher>) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
        }
    }
}

#[async_trait]
impl TransportStub for InProcessStub {
    async fn transmit(&self, message: &Message, address: &Address) -> Result<(), TransmitError> {
        if *address != Address::InProcess {
            return Err(TransmitError::NotSent(format!(
                "in-process stub can't reach {address}"
            )));
        }
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Err(TransmitError::NotSent("dispatcher is gone".to_string()));
        };
        trace!("Delivering message {} in process", message.id());
        dispatcher.message_arrived(message.clone());
        Ok(())
    }
}
