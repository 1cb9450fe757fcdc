//! Screen level coordination of the watchers.
//!
//! The orchestrator owns the watchers of exactly one active screen. Entering
//! a screen tears the previous one down first: its watcher and its action
//! polls are stopped and nothing more is reported for it. Everything the
//! presentation layer needs arrives as [`ScreenEvent`]s on one channel.

use std::sync::Arc;

use parking_lot::Mutex;
use rnaflow_data::{
    artifacts::{DESEQ2_RESULTS, GSEA_ARTIFACTS, GSEA_RESULTS, HEATMAP, VOLCANO_CUSTOM},
    DerivedAction, Job, JobState, OutputItem, PathwaySelection, WorkflowStep,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument};

use crate::{
    action_runner::{ActionEvent, ActionHandle, ActionOutcome, ActionRequest, DerivedActionRunner},
    backend::{fetch_within, load_core_gene_table, SharedBackend},
    config::PollSettings,
    error::ClientError,
    prerequisite::{PrerequisiteWaiter, WaitEvent, WaitOutcome},
    session::SessionStore,
    terminal::TerminalStatePoller,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Screen {
    Submit,
    Jobs,
    Gsea,
    Heatmap,
    Volcano,
}

impl Screen {
    pub const ALL: [Screen; 5] = [
        Screen::Submit,
        Screen::Jobs,
        Screen::Gsea,
        Screen::Heatmap,
        Screen::Volcano,
    ];

    pub fn route(&self) -> &'static str {
        match self {
            Screen::Submit => "/submit",
            Screen::Jobs => "/jobs",
            Screen::Gsea => "/gsea",
            Screen::Heatmap => "/heatmap",
            Screen::Volcano => "/volcano",
        }
    }

    /// accepts `/jobs`, `#/jobs` and `jobs`
    pub fn from_route(route: &str) -> Option<Screen> {
        let route = route.trim().trim_start_matches('#').trim_start_matches('/');
        Screen::ALL
            .iter()
            .copied()
            .find(|screen| &screen.route()[1..] == route)
    }

    pub fn workflow_step(&self) -> WorkflowStep {
        match self {
            Screen::Submit => WorkflowStep::Submit,
            Screen::Jobs => WorkflowStep::Waiting,
            Screen::Gsea => WorkflowStep::ExploringGsea,
            Screen::Heatmap | Screen::Volcano => WorkflowStep::Downstream,
        }
    }

    /// artifacts this screen waits for; `None` means it watches the job
    /// state instead, or nothing at all on `Submit`
    pub fn prerequisites(&self) -> Option<&'static [&'static str]> {
        match self {
            Screen::Submit | Screen::Jobs => None,
            Screen::Gsea => Some(GSEA_ARTIFACTS),
            Screen::Heatmap => Some(DerivedAction::HeatmapFromGsea.prerequisites()),
            Screen::Volcano => Some(DerivedAction::Volcano.prerequisites()),
        }
    }

    /// a plot an earlier visit may have produced, shown again on entry
    pub fn existing_artifact(&self) -> Option<&'static str> {
        match self {
            Screen::Heatmap => Some(HEATMAP),
            Screen::Volcano => Some(VOLCANO_CUSTOM),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenId(pub u64);

/// `Satisfied`, `Failed` and `TimedOut` end one watcher; `TornDown` ends the screen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScreenPhase {
    Idle,
    Watching,
    Satisfied,
    Failed,
    TimedOut,
    TornDown,
}

/// next steps offered for a job, derived from its output listing alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affordance {
    ExploreGsea,
    Heatmap,
    Volcano,
    Download,
}

pub fn affordances(job: &Job) -> Vec<Affordance> {
    let mut next = Vec::new();
    if job.has_output(GSEA_RESULTS) {
        next.push(Affordance::ExploreGsea);
    }
    if job.has_outputs(GSEA_ARTIFACTS) {
        next.push(Affordance::Heatmap);
    }
    if job.has_output(DESEQ2_RESULTS) {
        next.push(Affordance::Volcano);
    }
    if !job.outputs.is_empty() {
        next.push(Affordance::Download);
    }
    next
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScreenUpdate {
    Entered {
        screen: Screen,
        job_id: Option<String>,
    },
    Snapshot {
        job: Job,
        affordances: Vec<Affordance>,
    },
    WaitProgress {
        attempt: u32,
        missing: Vec<String>,
        error: Option<String>,
    },
    PhaseChanged(ScreenPhase),
    /// the screen's plot already exists on the job, reported once per screen
    ArtifactAvailable(OutputItem),
    PrerequisitesMet {
        job_id: String,
    },
    /// any wait outcome other than satisfied
    WatchFailed(WaitOutcome),
    ActionProgress {
        action: DerivedAction,
        event: ActionEvent,
    },
    ActionFinished {
        action: DerivedAction,
        outcome: ActionOutcome,
    },
    TornDown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScreenEvent {
    pub screen: ScreenId,
    pub update: ScreenUpdate,
}

struct ContextState {
    phase: ScreenPhase,
    snapshot: Option<Job>,
    artifact_reported: bool,
}

/// The part of a screen that watcher callbacks hold on to. Once torn down
/// it swallows every update.
pub struct ScreenContext {
    id: ScreenId,
    screen: Screen,
    sender: UnboundedSender<ScreenEvent>,
    state: Mutex<ContextState>,
}

impl ScreenContext {
    fn new(id: ScreenId, screen: Screen, sender: UnboundedSender<ScreenEvent>) -> Self {
        Self {
            id,
            screen,
            sender,
            state: Mutex::new(ContextState {
                phase: ScreenPhase::Idle,
                snapshot: None,
                artifact_reported: false,
            }),
        }
    }

    pub fn id(&self) -> ScreenId {
        self.id
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn phase(&self) -> ScreenPhase {
        self.state.lock().phase
    }

    /// false if the screen is gone and the update was dropped
    pub fn emit(&self, update: ScreenUpdate) -> bool {
        let state = self.state.lock();
        self.send_locked(&state, update)
    }

    // the lock is held while sending so teardown cannot slip in between
    fn send_locked(&self, state: &ContextState, update: ScreenUpdate) -> bool {
        if state.phase == ScreenPhase::TornDown {
            return false;
        }
        // a closed receiver means nobody is presenting anymore
        self.sender
            .send(ScreenEvent {
                screen: self.id,
                update,
            })
            .is_ok()
    }

    pub fn set_phase(&self, phase: ScreenPhase) {
        let mut state = self.state.lock();
        if state.phase == ScreenPhase::TornDown || state.phase == phase {
            return;
        }
        state.phase = phase;
        self.send_locked(&state, ScreenUpdate::PhaseChanged(phase));
    }

    /// caches `job` and reports it with its affordances, plus the screen's
    /// existing plot the first time a snapshot lists it
    pub fn record_snapshot(&self, job: &Job) {
        let mut state = self.state.lock();
        if state.phase == ScreenPhase::TornDown {
            return;
        }
        state.snapshot = Some(job.clone());
        self.send_locked(
            &state,
            ScreenUpdate::Snapshot {
                job: job.clone(),
                affordances: affordances(job),
            },
        );
        if state.artifact_reported {
            return;
        }
        if let Some(item) = self.screen.existing_artifact().and_then(|name| job.output(name)) {
            state.artifact_reported = true;
            self.send_locked(&state, ScreenUpdate::ArtifactAvailable(item.clone()));
        }
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.state.lock().snapshot.clone()
    }

    /// idempotent; `TornDown` is the last update of the screen
    pub fn tear_down(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == ScreenPhase::TornDown {
            return false;
        }
        self.send_locked(&state, ScreenUpdate::TornDown);
        state.phase = ScreenPhase::TornDown;
        state.snapshot = None;
        true
    }
}

enum Watcher {
    Terminal(TerminalStatePoller),
    Prerequisites(PrerequisiteWaiter),
}

impl Watcher {
    fn stop(&mut self) -> bool {
        match self {
            Watcher::Terminal(poller) => poller.stop(),
            Watcher::Prerequisites(waiter) => waiter.stop(),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Watcher::Terminal(poller) => poller.is_active(),
            Watcher::Prerequisites(waiter) => waiter.is_active(),
        }
    }
}

struct ActiveScreen {
    context: Arc<ScreenContext>,
    watcher: Option<Watcher>,
    runner: DerivedActionRunner,
}

pub struct WorkflowOrchestrator {
    backend: SharedBackend,
    settings: PollSettings,
    session: SessionStore,
    sender: UnboundedSender<ScreenEvent>,
    next_id: u64,
    active: Option<ActiveScreen>,
}

impl WorkflowOrchestrator {
    pub fn new(
        backend: SharedBackend,
        settings: PollSettings,
        session: SessionStore,
    ) -> (Self, UnboundedReceiver<ScreenEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::with_channel(backend, settings, session, sender), receiver)
    }

    pub fn with_channel(
        backend: SharedBackend,
        settings: PollSettings,
        session: SessionStore,
        sender: UnboundedSender<ScreenEvent>,
    ) -> Self {
        Self {
            backend,
            settings,
            session,
            sender,
            next_id: 0,
            active: None,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn current(&self) -> Option<(ScreenId, Screen)> {
        self.active
            .as_ref()
            .map(|active| (active.context.id(), active.context.screen()))
    }

    pub fn phase(&self) -> Option<ScreenPhase> {
        self.active.as_ref().map(|active| active.context.phase())
    }

    pub fn is_watching(&self) -> bool {
        self.active
            .as_ref()
            .and_then(|active| active.watcher.as_ref())
            .map_or(false, Watcher::is_active)
    }

    /// Replaces the active screen. With a remembered job id the new screen
    /// starts watching it right away.
    #[instrument(skip(self))]
    pub fn navigate(&mut self, screen: Screen) -> Result<ScreenId, ClientError> {
        self.teardown();
        self.next_id += 1;
        let id = ScreenId(self.next_id);
        let context = Arc::new(ScreenContext::new(id, screen, self.sender.clone()));
        let job_id = self.session.job_id().map(str::to_string);
        info!(screen_id = id.0, ?job_id, "entering screen");
        context.emit(ScreenUpdate::Entered {
            screen,
            job_id: job_id.clone(),
        });
        self.active = Some(ActiveScreen {
            context,
            watcher: None,
            runner: DerivedActionRunner::new(self.backend.clone(), &self.settings),
        });
        self.session.set_workflow_step(screen.workflow_step())?;
        if let Some(job_id) = job_id {
            self.start_watcher(&job_id);
        }
        Ok(id)
    }

    /// Remembers `job_id` and (re)starts the active screen's watcher on it.
    pub fn watch(&mut self, job_id: &str) -> Result<(), ClientError> {
        if self.active.is_none() {
            return Err(ClientError::InvalidRequest("no active screen".to_string()));
        }
        let job_id = self.set_job_id(job_id)?;
        self.start_watcher(&job_id);
        Ok(())
    }

    /// remembers `job_id` without watching it
    pub fn set_job_id(&mut self, job_id: &str) -> Result<String, ClientError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(ClientError::EmptyJobId);
        }
        self.session.set_job_id(job_id)?;
        Ok(job_id.to_string())
    }

    pub fn job_id(&self) -> Option<&str> {
        self.session.job_id()
    }

    /// stops the active screen's watcher but keeps the screen
    pub fn stop_watching(&mut self) -> bool {
        match self.active.as_mut() {
            Some(active) => {
                let stopped = active.watcher.take().map_or(false, |mut w| w.stop());
                if stopped {
                    active.context.set_phase(ScreenPhase::Idle);
                }
                stopped
            }
            None => false,
        }
    }

    fn start_watcher(&mut self, job_id: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(mut previous) = active.watcher.take() {
            previous.stop();
        }
        let screen = active.context.screen();
        if screen == Screen::Submit {
            return;
        }
        // before the first tick, which may already reach a terminal phase
        active.context.set_phase(ScreenPhase::Watching);
        let watcher = match screen.prerequisites() {
            Some(required) => {
                let context = Arc::clone(&active.context);
                let mut waiter = PrerequisiteWaiter::new(self.backend.clone(), &self.settings);
                waiter.start(job_id, required, move |event| on_wait_event(&context, event));
                Watcher::Prerequisites(waiter)
            }
            None => {
                let context = Arc::clone(&active.context);
                let mut poller = TerminalStatePoller::new(self.backend.clone(), &self.settings);
                poller.start(job_id, move |job| on_status_snapshot(&context, job));
                Watcher::Terminal(poller)
            }
        };
        active.watcher = Some(watcher);
    }

    /// stores `pathway` as the selection the pathway actions run on
    pub fn select_pathway(&mut self, pathway: PathwaySelection) -> Result<(), ClientError> {
        if !pathway.is_addressable() {
            return Err(ClientError::InvalidRequest(
                "the pathway has neither an ID nor a description".to_string(),
            ));
        }
        info!(pathway = %pathway.id, genes = pathway.core_genes.len(), "pathway selected");
        self.session.select_pathway(pathway)
    }

    pub fn clear_pathway(&mut self) -> Result<(), ClientError> {
        self.session.clear_pathway()
    }

    /// the core-gene table of the remembered job
    pub async fn load_pathways(&self) -> Result<Vec<PathwaySelection>, ClientError> {
        let job_id = self.remembered_job_id()?;
        let job = self.snapshot_for(&job_id).await?;
        load_core_gene_table(self.backend.as_ref(), &job_id, &job).await
    }

    /// request for a pathway action on the selected pathway
    pub fn pathway_request(&self, action: DerivedAction) -> Result<ActionRequest, ClientError> {
        if !action.needs_pathway() {
            return Err(ClientError::InvalidRequest(format!(
                "the {} is not a pathway action",
                action
            )));
        }
        let pathway = self
            .session
            .selected_pathway()
            .ok_or(ClientError::MissingPathway)?;
        let request = match action {
            DerivedAction::HeatmapFromGsea => ActionRequest::heatmap(pathway),
            _ => ActionRequest::single_plot(pathway),
        };
        request.validate()?;
        Ok(request)
    }

    /// volcano request; `import_core_genes` adds the selected pathway's core genes
    pub fn volcano_request(
        &self,
        top_n: Option<u32>,
        mut mark_genes: Vec<String>,
        import_core_genes: bool,
    ) -> Result<ActionRequest, ClientError> {
        if import_core_genes {
            let pathway = self
                .session
                .selected_pathway()
                .ok_or(ClientError::MissingPathway)?;
            for gene in &pathway.core_genes {
                if !mark_genes.contains(gene) {
                    mark_genes.push(gene.clone());
                }
            }
        }
        let request = ActionRequest::volcano(top_n, mark_genes);
        request.validate()?;
        Ok(request)
    }

    /// Checks the action's prerequisites against the latest snapshot, then
    /// fires it. Missing artifacts fail locally without calling the action
    /// endpoint. Progress and outcome are reported on the active screen.
    #[instrument(skip(self, request), fields(action = %request.action()))]
    pub async fn trigger_action(
        &mut self,
        request: ActionRequest,
    ) -> Result<ActionHandle, ClientError> {
        if self.active.is_none() {
            return Err(ClientError::InvalidRequest("no active screen".to_string()));
        }
        let job_id = self.remembered_job_id()?;
        let action = request.action();
        let job = self.snapshot_for(&job_id).await?;
        let missing = job.missing_outputs(action.prerequisites());
        if !missing.is_empty() {
            info!(?missing, "prerequisites missing, not sending the request");
            return Err(ClientError::Precondition { job_id, missing });
        }
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| ClientError::InvalidRequest("no active screen".to_string()))?;
        let context = Arc::clone(&active.context);
        active
            .runner
            .trigger_observed(&job_id, request, move |event| {
                on_action_event(&context, action, event)
            })
            .await
    }

    /// The active screen's cached snapshot when it is for `job_id`,
    /// otherwise one fetch.
    pub async fn snapshot_for(&self, job_id: &str) -> Result<Job, ClientError> {
        if let Some(active) = self.active.as_ref() {
            if let Some(job) = active.context.snapshot() {
                if job.job_id == job_id {
                    debug!(job_id, "using cached snapshot");
                    return Ok(job);
                }
            }
        }
        let job = fetch_within(self.backend.as_ref(), job_id, self.settings.tick_timeout()).await?;
        if let Some(active) = self.active.as_ref() {
            active.context.record_snapshot(&job);
        }
        Ok(job)
    }

    /// run log of the remembered job
    pub async fn job_log(&self) -> Result<String, ClientError> {
        let job_id = self.remembered_job_id()?;
        self.backend.fetch_log(&job_id).await
    }

    /// zip of everything the remembered job produced, with the file name
    /// the backend suggests for it
    pub async fn job_bundle(&self) -> Result<(String, Vec<u8>), ClientError> {
        let job_id = self.remembered_job_id()?;
        let bytes = self.backend.fetch_bundle(&job_id).await?;
        Ok((format!("{}.zip", job_id), bytes))
    }

    fn remembered_job_id(&self) -> Result<String, ClientError> {
        self.session
            .job_id()
            .map(str::to_string)
            .ok_or(ClientError::EmptyJobId)
    }

    /// Stops everything the active screen owns. Returns whether there was
    /// an active screen.
    pub fn teardown(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        if let Some(mut watcher) = active.watcher.take() {
            watcher.stop();
        }
        let cancelled = active.runner.cancel_all();
        active.context.tear_down();
        info!(
            screen_id = active.context.id().0,
            screen = ?active.context.screen(),
            cancelled_actions = cancelled,
            "screen torn down"
        );
        true
    }
}

impl Drop for WorkflowOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn on_status_snapshot(context: &ScreenContext, job: &Job) {
    context.record_snapshot(job);
    match job.state {
        JobState::Success => context.set_phase(ScreenPhase::Satisfied),
        JobState::Error => context.set_phase(ScreenPhase::Failed),
        _ => {}
    }
}

fn on_wait_event(context: &ScreenContext, event: WaitEvent) {
    match event {
        WaitEvent::Progress {
            attempt,
            missing,
            job,
        } => {
            context.record_snapshot(&job);
            context.emit(ScreenUpdate::WaitProgress {
                attempt,
                missing,
                error: None,
            });
        }
        WaitEvent::Fault { attempt, error, .. } => {
            context.emit(ScreenUpdate::WaitProgress {
                attempt,
                missing: Vec::new(),
                error: Some(error),
            });
        }
        WaitEvent::Finished(WaitOutcome::Satisfied(job)) => {
            context.record_snapshot(&job);
            context.emit(ScreenUpdate::PrerequisitesMet {
                job_id: job.job_id.clone(),
            });
            context.set_phase(ScreenPhase::Satisfied);
        }
        WaitEvent::Finished(outcome) => {
            let phase = match outcome {
                WaitOutcome::TimedOut { .. } => ScreenPhase::TimedOut,
                _ => ScreenPhase::Failed,
            };
            context.emit(ScreenUpdate::WatchFailed(outcome));
            context.set_phase(phase);
        }
    }
}

fn on_action_event(context: &ScreenContext, action: DerivedAction, event: ActionEvent) {
    match event {
        ActionEvent::Finished(outcome) => {
            context.emit(ScreenUpdate::ActionFinished { action, outcome });
        }
        event => {
            context.emit(ScreenUpdate::ActionProgress { action, event });
        }
    }
}
