use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// one unit of work of a poll loop
/// an Err is logged and the loop keeps going, a watcher that wants
/// failures to end the loop has to turn them into `Flow::Stop` itself
#[async_trait]
pub trait Tick: Send + 'static {
    async fn tick(&mut self) -> Result<Flow, ClientError>;
}

/// Repeating timer owned by exactly one watcher.
///
/// The loop runs on its own task. Ticks never overlap: the next tick is not
/// scheduled before the previous one returned. Starting an owned loop again
/// stops the previous run first, so a watcher never has two live timers.
/// Dropping the loop stops it.
pub struct PollLoop {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
        }
    }

    /// ticks immediately, then every `interval`
    pub fn start<T: Tick>(&mut self, interval: Duration, tick: T) {
        self.start_after(Duration::ZERO, interval, tick)
    }

    /// first tick after `delay`, then every `interval`
    /// must be called from within a tokio runtime
    pub fn start_after<T: Tick>(&mut self, delay: Duration, interval: Duration, mut tick: T) {
        if self.stop() {
            debug!(poll_loop = %self.name, "restarting, previous run stopped");
        }
        // a zero period would spin
        let interval = interval.max(Duration::from_millis(1));
        let name = self.name.clone();
        info!(poll_loop = %name, ?delay, ?interval, "poll loop started");
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count: u64 = 0;
            loop {
                ticker.tick().await;
                count += 1;
                match tick.tick().await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => {
                        info!(poll_loop = %name, ticks = count, "poll loop finished");
                        break;
                    }
                    Err(err) => {
                        warn!(poll_loop = %name, tick = count, "tick failed, continuing: {}", err);
                    }
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Idempotent; no new tick starts after this returns. A tick already
    /// running on another worker thread is only cancelled at its next await
    /// point, so its callback can still fire once; owners that must stay
    /// silent after stopping guard their callbacks themselves, as the
    /// orchestrator's screen context does. On a current-thread runtime no
    /// tick is in flight while this runs.
    /// Returns whether a still running loop was stopped.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                if was_running {
                    info!(poll_loop = %self.name, "poll loop stopped");
                }
                was_running
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
