//! Derived, in-place actions: fire one request, then watch the job's
//! sub-record for that action until it resolves.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rnaflow_data::{ActionRecord, ActionState, DerivedAction, Job, PathwaySelection};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{fetch_within, SharedBackend},
    config::PollSettings,
    error::ClientError,
    poll_loop::{Flow, PollLoop, Tick},
};

pub const VOLCANO_DEFAULT_TOP_N: u32 = 10;
pub const VOLCANO_MAX_TOP_N: u32 = 200;

/// parameters of one derived action, as sent to the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionRequest {
    GseaSinglePlot {
        pathway_id: String,
        pathway_description: String,
    },
    HeatmapFromGsea {
        pathway_id: String,
        pathway_description: String,
    },
    Volcano {
        top_n: u32,
        mark_genes: Vec<String>,
    },
}

impl ActionRequest {
    pub fn single_plot(pathway: &PathwaySelection) -> Self {
        ActionRequest::GseaSinglePlot {
            pathway_id: pathway.id.trim().to_string(),
            pathway_description: pathway.description.as_deref().unwrap_or("").trim().to_string(),
        }
    }

    pub fn heatmap(pathway: &PathwaySelection) -> Self {
        ActionRequest::HeatmapFromGsea {
            pathway_id: pathway.id.trim().to_string(),
            pathway_description: pathway.description.as_deref().unwrap_or("").trim().to_string(),
        }
    }

    /// `top_n` is clamped to what the backend accepts
    pub fn volcano(top_n: Option<u32>, mark_genes: Vec<String>) -> Self {
        ActionRequest::Volcano {
            top_n: top_n.unwrap_or(VOLCANO_DEFAULT_TOP_N).min(VOLCANO_MAX_TOP_N),
            mark_genes,
        }
    }

    pub fn action(&self) -> DerivedAction {
        match self {
            ActionRequest::GseaSinglePlot { .. } => DerivedAction::GseaSinglePlot,
            ActionRequest::HeatmapFromGsea { .. } => DerivedAction::HeatmapFromGsea,
            ActionRequest::Volcano { .. } => DerivedAction::Volcano,
        }
    }

    /// form body of the request; empty pathway fields are left out
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            ActionRequest::GseaSinglePlot {
                pathway_id,
                pathway_description,
            }
            | ActionRequest::HeatmapFromGsea {
                pathway_id,
                pathway_description,
            } => {
                let mut fields = Vec::new();
                if !pathway_id.is_empty() {
                    fields.push(("pathway_id", pathway_id.clone()));
                }
                if !pathway_description.is_empty() {
                    fields.push(("pathway_description", pathway_description.clone()));
                }
                fields
            }
            ActionRequest::Volcano { top_n, mark_genes } => vec![
                ("top_n", top_n.to_string()),
                ("mark_genes", mark_genes.join(",")),
            ],
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        match self {
            ActionRequest::GseaSinglePlot {
                pathway_id,
                pathway_description,
            }
            | ActionRequest::HeatmapFromGsea {
                pathway_id,
                pathway_description,
            } => {
                if pathway_id.is_empty() && pathway_description.is_empty() {
                    return Err(ClientError::MissingPathway);
                }
            }
            ActionRequest::Volcano { top_n, mark_genes } => {
                if *top_n > VOLCANO_MAX_TOP_N {
                    return Err(ClientError::InvalidRequest(format!(
                        "top_n must be at most {}",
                        VOLCANO_MAX_TOP_N
                    )));
                }
                if let Some(gene) = mark_genes.iter().find(|g| g.is_empty() || g.contains(',')) {
                    return Err(ClientError::InvalidRequest(format!(
                        "invalid gene symbol '{}'",
                        gene
                    )));
                }
            }
        }
        Ok(())
    }
}

/// splits a user supplied gene list on commas and whitespace, keeping order
/// and dropping duplicates
pub fn parse_gene_list(raw: &str) -> Vec<String> {
    let mut genes: Vec<String> = Vec::new();
    for gene in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let gene = gene.trim();
        if !gene.is_empty() && !genes.iter().any(|g| g == gene) {
            genes.push(gene.to_string());
        }
    }
    genes
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome {
    /// `output` is the produced artifact name; it may not be listed in the
    /// job's outputs yet
    Completed {
        output: Option<String>,
        record: ActionRecord,
    },
    /// reported by the backend, or a local error no retry fixes; never retried
    Failed { message: String },
    /// the action may still finish, check the job later
    TimedOut { attempts: u32 },
    /// the poll was stopped before the action resolved
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActionEvent {
    Polled {
        attempt: u32,
        record: Option<ActionRecord>,
    },
    Faulted {
        attempt: u32,
        error: String,
    },
    Finished(ActionOutcome),
}

/// Bounded-retry state machine behind the completion poll of one action.
#[derive(Debug, Clone)]
pub struct ActionTracker {
    action: DerivedAction,
    max_attempts: u32,
    attempts: u32,
}

impl ActionTracker {
    pub fn new(action: DerivedAction, max_attempts: u32) -> Self {
        Self {
            action,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// an absent record means the backend has not picked the action up yet
    pub fn observe(&mut self, job: &Job) -> Option<ActionOutcome> {
        self.attempts += 1;
        match job.action(self.action) {
            Some(record) if record.state == ActionState::Success => {
                let output = record
                    .produced_output()
                    .or_else(|| self.action.default_output())
                    .map(str::to_string);
                return Some(ActionOutcome::Completed { output, record });
            }
            Some(record) if record.state == ActionState::Error => {
                let message = record
                    .message
                    .unwrap_or_else(|| format!("{} failed", self.action));
                return Some(ActionOutcome::Failed { message });
            }
            _ => {}
        }
        self.budget_spent()
    }

    /// a failed fetch still uses up an attempt; only transport errors are retried
    pub fn observe_fault(&mut self, error: &ClientError) -> Option<ActionOutcome> {
        self.attempts += 1;
        if !error.is_transport() {
            return Some(ActionOutcome::Failed {
                message: error.to_string(),
            });
        }
        self.budget_spent()
    }

    fn budget_spent(&self) -> Option<ActionOutcome> {
        if self.attempts >= self.max_attempts {
            Some(ActionOutcome::TimedOut {
                attempts: self.attempts,
            })
        } else {
            None
        }
    }
}

/// Resolves once the action's completion poll ends.
pub struct ActionHandle {
    job_id: String,
    action: DerivedAction,
    receiver: oneshot::Receiver<ActionOutcome>,
}

impl ActionHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn action(&self) -> DerivedAction {
        self.action
    }

    pub async fn outcome(self) -> ActionOutcome {
        self.receiver.await.unwrap_or(ActionOutcome::Cancelled)
    }
}

struct CompletionTick<F> {
    backend: SharedBackend,
    job_id: String,
    tick_timeout: Duration,
    tracker: ActionTracker,
    sender: Option<oneshot::Sender<ActionOutcome>>,
    observer: F,
}

impl<F> CompletionTick<F>
where
    F: FnMut(ActionEvent) + Send + 'static,
{
    fn finish(&mut self, outcome: ActionOutcome) -> Flow {
        info!(job_id = %self.job_id, action = %self.tracker.action, attempts = self.tracker.attempts(), ?outcome, "action resolved");
        (self.observer)(ActionEvent::Finished(outcome.clone()));
        if let Some(sender) = self.sender.take() {
            // nobody waiting on the handle is fine
            let _ = sender.send(outcome);
        }
        Flow::Stop
    }
}

#[async_trait]
impl<F> Tick for CompletionTick<F>
where
    F: FnMut(ActionEvent) + Send + 'static,
{
    async fn tick(&mut self) -> Result<Flow, ClientError> {
        match fetch_within(self.backend.as_ref(), &self.job_id, self.tick_timeout).await {
            Ok(job) => {
                if let Some(outcome) = self.tracker.observe(&job) {
                    return Ok(self.finish(outcome));
                }
                let record = job.action(self.tracker.action);
                debug!(job_id = %self.job_id, attempt = self.tracker.attempts(), "action still running");
                (self.observer)(ActionEvent::Polled {
                    attempt: self.tracker.attempts(),
                    record,
                });
            }
            Err(err) => {
                warn!(job_id = %self.job_id, action = %self.tracker.action, "status fetch failed: {}", err);
                if let Some(outcome) = self.tracker.observe_fault(&err) {
                    return Ok(self.finish(outcome));
                }
                (self.observer)(ActionEvent::Faulted {
                    attempt: self.tracker.attempts(),
                    error: err.to_string(),
                });
            }
        }
        Ok(Flow::Continue)
    }
}

/// Fires derived actions and owns their completion polls, at most one per
/// job and action.
pub struct DerivedActionRunner {
    backend: SharedBackend,
    initial_delay: Duration,
    interval: Duration,
    tick_timeout: Duration,
    max_attempts: u32,
    polls: HashMap<(String, DerivedAction), PollLoop>,
}

impl DerivedActionRunner {
    pub fn new(backend: SharedBackend, settings: &PollSettings) -> Self {
        Self {
            backend,
            initial_delay: settings.action_initial_delay(),
            interval: settings.action_interval(),
            tick_timeout: settings.tick_timeout(),
            max_attempts: settings.action_max_attempts,
            polls: HashMap::new(),
        }
    }

    pub async fn trigger(
        &mut self,
        job_id: &str,
        request: ActionRequest,
    ) -> Result<ActionHandle, ClientError> {
        self.trigger_observed(job_id, request, |_| {}).await
    }

    /// Sends the request and, once the backend accepted it, starts the
    /// completion poll. A rejected request is returned as the error and
    /// leaves any running poll for the same job and action in place. An
    /// accepted one replaces that poll; its handle resolves as cancelled.
    #[instrument(skip(self, request, observer), fields(action = %request.action()))]
    pub async fn trigger_observed<F>(
        &mut self,
        job_id: &str,
        request: ActionRequest,
        observer: F,
    ) -> Result<ActionHandle, ClientError>
    where
        F: FnMut(ActionEvent) + Send + 'static,
    {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(ClientError::EmptyJobId);
        }
        request.validate()?;
        let action = request.action();
        self.backend.request_action(job_id, &request).await?;
        info!("action accepted, polling for completion");

        let key = (job_id.to_string(), action);
        if let Some(mut previous) = self.polls.remove(&key) {
            if previous.stop() {
                info!("previous completion poll stopped");
            }
        }

        let (sender, receiver) = oneshot::channel();
        let tick = CompletionTick {
            backend: self.backend.clone(),
            job_id: job_id.to_string(),
            tick_timeout: self.tick_timeout,
            tracker: ActionTracker::new(action, self.max_attempts),
            sender: Some(sender),
            observer,
        };
        let mut poll = PollLoop::new(format!("{}:{}", action.key(), job_id));
        poll.start_after(self.initial_delay, self.interval, tick);
        self.polls.insert(key, poll);

        Ok(ActionHandle {
            job_id: job_id.to_string(),
            action,
            receiver,
        })
    }

    pub fn is_polling(&self, job_id: &str, action: DerivedAction) -> bool {
        self.polls
            .get(&(job_id.to_string(), action))
            .map_or(false, PollLoop::is_active)
    }

    pub fn cancel(&mut self, job_id: &str, action: DerivedAction) -> bool {
        match self.polls.remove(&(job_id.to_string(), action)) {
            Some(mut poll) => poll.stop(),
            None => false,
        }
    }

    /// stops every completion poll, returns how many were still running
    pub fn cancel_all(&mut self) -> usize {
        self.polls
            .drain()
            .map(|(_, mut poll)| poll.stop())
            .filter(|stopped| *stopped)
            .count()
    }
}
