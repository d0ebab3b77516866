use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag used to request termination of a running pipeline
///
/// Clones share the same underlying flag, so one clone can be handed to a signal handler while
/// another one is polled by the [`Pipeline`](crate::Pipeline) while it waits for a tool to finish.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Creates a new flag that is not raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination of the pipeline observing this flag
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether termination was requested
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
