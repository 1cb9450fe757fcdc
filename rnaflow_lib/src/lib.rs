//! Job lifecycle watchers and derived-action orchestration for the RNA-seq
//! analysis backend.

pub mod action_runner;
pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poll_loop;
pub mod prerequisite;
pub mod session;
pub mod terminal;

#[cfg(test)]
mod test_support;

pub use action_runner::{
    parse_gene_list, ActionEvent, ActionHandle, ActionOutcome, ActionRequest, ActionTracker,
    DerivedActionRunner,
};
pub use backend::{fetch_within, load_core_gene_table, HttpBackend, JobBackend, SharedBackend};
pub use config::{ClientConfig, PollSettings, API_URL_ENV};
pub use error::ClientError;
pub use orchestrator::{
    affordances, Affordance, Screen, ScreenContext, ScreenEvent, ScreenId, ScreenPhase,
    ScreenUpdate, WorkflowOrchestrator,
};
pub use poll_loop::{Flow, PollLoop, Tick};
pub use prerequisite::{PrerequisiteTracker, PrerequisiteWaiter, WaitEvent, WaitOutcome};
pub use session::SessionStore;
pub use terminal::TerminalStatePoller;
