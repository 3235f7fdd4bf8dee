use std::thread::{sleep, JoinHandle};
use std::time::Duration;

use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::utils::threads::spawn_named_thread;

const GRACEFUL_STOP_RETRY: u16 = 10;
const GRACEFUL_STOP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named background thread that has not been started yet. The callback
/// receives a cancellation consumer it is expected to poll between units of
/// work.
pub struct NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    thread_name: String,
    callback: F,
}

impl<F> NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    pub fn new<S: Into<String>>(thread_name: S, callback: F) -> Self {
        Self {
            thread_name: thread_name.into(),
            callback,
        }
    }

    pub fn start(self) -> StartedThreadContext {
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();
        let join_handle = spawn_named_thread(&self.thread_name, move || {
            (self.callback)(stop_consumer);
        });
        StartedThreadContext {
            thread_name: self.thread_name,
            stop_publisher,
            join_handle,
        }
    }
}

pub struct StartedThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadContextStopError {
    #[error("error sending stop signal to '{0}' thread: {1}")]
    StopSignal(String, String),

    #[error("error joining '{0}' thread")]
    Join(String),

    #[error("timeout waiting for '{0}' thread to finish")]
    StopTimeout(String),
}

impl StartedThreadContext {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Sends the stop signal and polls for the thread to finish, up to
    /// `GRACEFUL_STOP_RETRY * GRACEFUL_STOP_RETRY_INTERVAL`.
    pub fn stop(self) -> Result<(), ThreadContextStopError> {
        self.stop_publisher.publish(()).map_err(|err| {
            ThreadContextStopError::StopSignal(self.thread_name.clone(), err.to_string())
        })?;
        for _ in 0..GRACEFUL_STOP_RETRY {
            if self.join_handle.is_finished() {
                return self
                    .join_handle
                    .join()
                    .map_err(|_| ThreadContextStopError::Join(self.thread_name));
            }
            sleep(GRACEFUL_STOP_RETRY_INTERVAL);
        }
        Err(ThreadContextStopError::StopTimeout(self.thread_name))
    }

    /// Joins without signalling; for threads that end on their own.
    pub fn join(self) -> Result<(), ThreadContextStopError> {
        self.join_handle
            .join()
            .map_err(|_| ThreadContextStopError::Join(self.thread_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop() {
        let callback = |stop_consumer: EventConsumer<CancellationMessage>| loop {
            if stop_consumer.is_cancelled(Duration::from_millis(1)) {
                break;
            }
        };
        let ctx = NotStartedThreadContext::new("test-thread", callback).start();
        assert!(!ctx.is_finished());
        ctx.stop().unwrap();
    }

    #[test]
    fn join_finished_thread() {
        let ctx = NotStartedThreadContext::new("short-lived", |_| {}).start();
        ctx.join().unwrap();
    }

    #[test]
    fn stop_times_out_on_stuck_thread() {
        let ctx = NotStartedThreadContext::new("stuck", |_| {
            sleep(Duration::from_secs(3600));
        })
        .start();
        assert_eq!(
            ctx.stop().unwrap_err(),
            ThreadContextStopError::StopTimeout("stuck".to_string())
        );
    }
}
