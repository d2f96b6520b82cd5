use tokio::sync::watch;

use crate::errors::EngineError;

/// Terminal outcome of a phase.
pub type Outcome = Result<(), EngineError>;

/// One-shot completion signal with any number of waiters.
///
/// The first `complete` wins; later calls are ignored. Waiters that arrive
/// after completion see the stored outcome immediately.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Option<Outcome>>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the signal. Returns false if it was already resolved.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let mut first = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            first = true;
            true
        });
        first
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Ok(())),
            // Unreachable while `self` holds the sender.
            Err(_) => Err(EngineError::Invocation("completion signal dropped".into())),
        }
    }
}
