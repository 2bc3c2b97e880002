use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::utils::error::DispatchError;

/// Invoked exactly once with the reply payload or the reason there is none.
pub type ReplyCallback = Box<dyn FnOnce(Result<Vec<u8>, DispatchError>) + Send + 'static>;

pub(crate) struct ReplyCaller {
    callback: ReplyCallback,
    expiry_date_ms: i64,
}

impl ReplyCaller {
    pub(crate) fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_date_ms <= now_ms
    }

    pub(crate) fn resolve(self, result: Result<Vec<u8>, DispatchError>) {
        (self.callback)(result);
    }
}

/// Pending replies by request-reply id. Every entry leaves the table exactly
/// once, whichever path takes it.
#[derive(Default)]
pub(crate) struct ReplyCallerDirectory {
    callers: Mutex<HashMap<String, ReplyCaller>>,
}

impl ReplyCallerDirectory {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ReplyCaller>> {
        self.callers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the callback back if the id is already taken.
    pub(crate) fn add(
        &self,
        request_reply_id: &str,
        callback: ReplyCallback,
        expiry_date_ms: i64,
    ) -> Result<(), ReplyCallback> {
        match self.lock().entry(request_reply_id.to_string()) {
            Entry::Occupied(_) => Err(callback),
            Entry::Vacant(slot) => {
                slot.insert(ReplyCaller {
                    callback,
                    expiry_date_ms,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn take(&self, request_reply_id: &str) -> Option<ReplyCaller> {
        self.lock().remove(request_reply_id)
    }

    /// Removes every caller expired at `now_ms`; the caller resolves them
    /// outside the lock.
    pub(crate) fn take_expired(&self, now_ms: i64) -> Vec<ReplyCaller> {
        let mut callers = self.lock();
        let expired: Vec<String> = callers
            .iter()
            .filter(|(_, c)| c.is_expired(now_ms))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| callers.remove(id))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
