use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUNNING: u8 = 0;
const GRACEFUL: u8 = 1;
const ABORT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// No stop requested.
    Running,
    /// Finish the in-flight batch or step, then stop.
    Graceful,
    /// Stop immediately, abandoning whatever has not committed yet.
    Abort,
}

/// Cooperative cancellation shared between the orchestrator and the writers.
///
/// The flag is polled between discrete units of work (one source's fetch, one
/// staging chunk commit, one warehouse step). The first stop request is
/// graceful; a second request escalates to an immediate abort. The token is
/// passed in rather than process-global so concurrent pipeline runs in one
/// process do not interfere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop, escalating on repeated calls. Returns the new state.
    pub fn request_stop(&self) -> CancelState {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(1).min(ABORT))
            })
            .unwrap_or(ABORT);
        match previous {
            RUNNING => CancelState::Graceful,
            _ => CancelState::Abort,
        }
    }

    pub fn state(&self) -> CancelState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => CancelState::Running,
            GRACEFUL => CancelState::Graceful,
            _ => CancelState::Abort,
        }
    }

    /// True once any stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= GRACEFUL
    }

    /// True once a second stop request escalated to a hard abort.
    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= ABORT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let token = CancelToken::new();
        assert_eq!(token.state(), CancelState::Running);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn first_request_is_graceful_second_aborts() {
        let token = CancelToken::new();
        assert_eq!(token.request_stop(), CancelState::Graceful);
        assert!(token.is_cancelled());
        assert!(!token.is_aborted());

        assert_eq!(token.request_stop(), CancelState::Abort);
        assert!(token.is_aborted());

        // Further requests stay aborted.
        assert_eq!(token.request_stop(), CancelState::Abort);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.request_stop();
        assert!(clone.is_cancelled());
    }
}
