//! Cooperative run cancellation.
//!
//! The token is checked only between files and between batches. A file that
//! has started converting always runs to completion, so a cancelled run never
//! leaves a half-written output behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel this token on Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, finishing current file");
            token.cancel();
        })
    }
}
