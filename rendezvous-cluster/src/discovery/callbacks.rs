//! Change-notification callbacks
//!
//! The registry is owned by the engine, not by a connection. Callbacks added
//! before the backend is attached are therefore delivered from the first
//! watch cycle on.

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::record::ChangeEvent;

/// Invoked synchronously from the watch task with each non-empty change
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<Vec<ChangeCallback>>>,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every registered callback
    pub fn set(&self, callbacks: Vec<ChangeCallback>) {
        *self.callbacks.write() = callbacks;
    }

    pub fn add(&self, callback: ChangeCallback) {
        self.callbacks.write().push(callback);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every callback in registration order.
    ///
    /// The first failure stops the round: later callbacks do not see this event.
    /// A panicking callback counts as a failure and does not unwind into the
    /// watch loop.
    pub fn dispatch(&self, event: &ChangeEvent) {
        // Snapshot so callbacks may register further callbacks without deadlocking
        let callbacks = self.callbacks.read().clone();

        for (index, callback) in callbacks.iter().enumerate() {
            let error = match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("callback panicked: {}", panic_message(&*payload)),
            };

            tracing::warn!(
                store = %event.store_kind,
                callback = index,
                skipped = callbacks.len() - index - 1,
                error = %error,
                "Change callback failed, remaining callbacks skipped for this cycle"
            );
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}
