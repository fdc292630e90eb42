use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::core::StackError;

type ErrorCallback = Box<dyn Fn(&StackError) + Send + Sync>;

/// Terminal for errors that have no caller to return to: transaction-body
/// failures and save-path failures raised on a lane. Keeps the most recent
/// error and invokes an optional callback for each one.
pub struct ErrorSink {
    last: Mutex<Option<StackError>>,
    callback: Mutex<Option<ErrorCallback>>,
}

impl ErrorSink {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    /// Routes one error through the sink. Always logged; the callback and
    /// the last-error slot see it in that order.
    pub fn record(&self, error: StackError) {
        error!(error = %error, "unhandled error routed to sink");
        if let Some(callback) = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            callback(&error);
        }
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Most recent recorded error, if any.
    pub fn last_error(&self) -> Option<StackError> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the most recent recorded error.
    pub fn take_last(&self) -> Option<StackError> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn install_callback(
        &self,
        callback: impl Fn(&StackError) + Send + Sync + 'static,
    ) {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("last", &self.last_error().map(|e| e.to_string()))
            .finish()
    }
}
