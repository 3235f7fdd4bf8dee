use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Returns true if a cancellation message arrived (or the channel was
    /// dropped) before `timeout` elapsed. Blocks for at most `timeout`, so it
    /// doubles as the pacing sleep of polling loops.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        !matches!(
            self.as_ref().recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}
