use std::time::Duration;

use async_trait::async_trait;
use rnaflow_data::Job;
use tracing::{info, warn};

use crate::{
    backend::{fetch_within, SharedBackend},
    config::PollSettings,
    error::ClientError,
    poll_loop::{Flow, PollLoop, Tick},
};

/// Polls a job until its top-level state is terminal.
///
/// The callback sees every successfully fetched snapshot, the first one
/// right at start and the terminal one last. There is no attempt budget;
/// whoever owns the poller is expected to stop it when its screen goes away.
pub struct TerminalStatePoller {
    backend: SharedBackend,
    interval: Duration,
    tick_timeout: Duration,
    poll: PollLoop,
}

struct TerminalTick<F> {
    backend: SharedBackend,
    job_id: String,
    tick_timeout: Duration,
    on_snapshot: F,
}

#[async_trait]
impl<F> Tick for TerminalTick<F>
where
    F: FnMut(&Job) + Send + 'static,
{
    async fn tick(&mut self) -> Result<Flow, ClientError> {
        let job = match fetch_within(self.backend.as_ref(), &self.job_id, self.tick_timeout).await {
            Ok(job) => job,
            // logged by the loop, the next tick tries again
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => {
                warn!(job_id = %self.job_id, "giving up on the job: {}", err);
                return Ok(Flow::Stop);
            }
        };
        (self.on_snapshot)(&job);
        if job.state.is_terminal() {
            info!(job_id = %self.job_id, state = %job.state, "job reached terminal state");
            Ok(Flow::Stop)
        } else {
            Ok(Flow::Continue)
        }
    }
}

impl TerminalStatePoller {
    pub fn new(backend: SharedBackend, settings: &PollSettings) -> Self {
        Self {
            backend,
            interval: settings.status_interval(),
            tick_timeout: settings.tick_timeout(),
            poll: PollLoop::new("job-status"),
        }
    }

    /// (re)starts watching `job_id`, stopping any previous watch first
    pub fn start<F>(&mut self, job_id: &str, on_snapshot: F)
    where
        F: FnMut(&Job) + Send + 'static,
    {
        let tick = TerminalTick {
            backend: self.backend.clone(),
            job_id: job_id.to_string(),
            tick_timeout: self.tick_timeout,
            on_snapshot,
        };
        self.poll.start(self.interval, tick);
    }

    pub fn stop(&mut self) -> bool {
        self.poll.stop()
    }

    pub fn is_active(&self) -> bool {
        self.poll.is_active()
    }
}
