use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{KarError, Result};

/// Cooperative cancellation shared between the caller and a running
/// create/extract/list. Checked once per visited entry.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(KarError::Cancelled)
        } else {
            Ok(())
        }
    }
}
