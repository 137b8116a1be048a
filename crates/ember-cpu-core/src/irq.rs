//! Interrupt-request handoff between device threads and the core.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// External interrupt controller polled by the host loop.
pub trait InterruptController {
    /// Returns the next pending external interrupt vector, if any.
    fn poll_interrupt(&mut self) -> Option<u8>;
}

#[derive(Debug, Default)]
struct Lines {
    vectors: VecDeque<u8>,
    nmi: bool,
}

/// Cloneable handle for raising interrupts from another thread.
///
/// The core drains it only at instruction boundaries.
#[derive(Debug, Clone, Default)]
pub struct IrqLines {
    inner: Arc<Mutex<Lines>>,
}

impl IrqLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, vector: u8) {
        self.lock().vectors.push_back(vector);
    }

    pub fn raise_nmi(&self) {
        self.lock().nmi = true;
    }

    /// Take every queued vector and the NMI latch.
    pub fn drain(&self) -> (Vec<u8>, bool) {
        let mut lines = self.lock();
        let vectors = lines.vectors.drain(..).collect();
        let nmi = std::mem::take(&mut lines.nmi);
        (vectors, nmi)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lines> {
        // Lines holds plain data, so a panic elsewhere cannot leave it inconsistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::IrqLines;

    #[test]
    fn raised_vectors_cross_threads_in_order() {
        let lines = IrqLines::new();
        let remote = lines.clone();
        std::thread::spawn(move || {
            remote.raise(0x20);
            remote.raise(0x21);
            remote.raise_nmi();
        })
        .join()
        .unwrap();

        assert_eq!(lines.drain(), (vec![0x20, 0x21], true));
        assert_eq!(lines.drain(), (vec![], false));
    }
}
