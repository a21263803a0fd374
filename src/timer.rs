use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{trace, Instrument, Span};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TimerCallback: Send + Sync + 'static {
    /// `generation` identifies the `start()` call that armed the timer. The owner of the timer
    ///  passes it back to [Timer::take_expired] to find out whether the expiry is still current.
    async fn on_timer_expired(&self, generation: u64);
}

/// A cancellable one-shot timer backed by a spawned tokio task.
///
/// Every `start()` cancels the pending task (if any) and arms a new one with a new generation.
///  Aborting a task is not enough to make this race-free on a multi-threaded runtime: a task that
///  already woke up may be waiting for the owner's lock while the owner re-arms the timer. So the
///  owner checks the generation through `take_expired()` under its own lock before acting on an
///  expiry.
pub struct Timer {
    default_timeout: Duration,
    callback: Arc<dyn TimerCallback>,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Timer {
    pub fn new(default_timeout: Duration, callback: Arc<dyn TimerCallback>) -> Timer {
        Timer {
            default_timeout,
            callback,
            generation: 0,
            handle: None,
        }
    }

    pub fn start(&mut self, timeout: Option<Duration>) {
        self.stop();

        self.generation += 1;
        let generation = self.generation;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let callback = self.callback.clone();

        trace!("arming timer generation {} for {:?}", generation, timeout);
        self.handle = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            callback.on_timer_expired(generation).await;
        }.instrument(Span::current())));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Claims an expiry reported through [TimerCallback::on_timer_expired]: returns `true` if
    ///  `generation` is the current arming and it was not stopped since, `false` for a stale expiry.
    ///
    /// On success the timer is disarmed without aborting the task, since the caller is typically
    ///  running inside that very task and may re-arm the timer from there.
    pub fn take_expired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            trace!("ignoring stale timer generation {} (current is {})", generation, self.generation);
            return false;
        }
        self.handle = None;
        true
    }
}
