//! Cooperative cancellation for generation commands.
//!
//! Every generation takes a ticket when it is submitted. Cancelling raises a
//! watermark over every ticket issued so far, so queued and running
//! generations are both covered while later submissions are not.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CancelRegistry {
    issued: AtomicU64,
    cancelled_through: AtomicU64,
}

impl CancelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next ticket; tickets start at 1.
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Cancel everything issued up to now.
    pub fn cancel_all(&self) {
        let upto = self.issued.load(Ordering::SeqCst);
        self.cancelled_through.fetch_max(upto, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self, ticket: u64) -> bool {
        ticket <= self.cancelled_through.load(Ordering::SeqCst)
    }
}

/// What the generation loop polls between tokens.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    ticket: Option<(Arc<CancelRegistry>, u64)>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn issue(registry: &Arc<CancelRegistry>) -> Self {
        Self {
            ticket: Some((Arc::clone(registry), registry.issue())),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.ticket {
            Some((registry, ticket)) => registry.is_cancelled(*ticket),
            None => false,
        }
    }
}
