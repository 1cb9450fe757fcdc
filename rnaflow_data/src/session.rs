use serde::{Deserialize, Serialize};

use crate::pathway::PathwaySelection;

/// which screen is logically current; advisory only
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum WorkflowStep {
    Submit,
    Waiting,
    ExploringGsea,
    Downstream,
}

impl Default for WorkflowStep {
    fn default() -> Self {
        WorkflowStep::Submit
    }
}

impl From<u8> for WorkflowStep {
    fn from(step: u8) -> Self {
        match step {
            0 => WorkflowStep::Submit,
            1 => WorkflowStep::Waiting,
            2 => WorkflowStep::ExploringGsea,
            _ => WorkflowStep::Downstream,
        }
    }
}

impl From<WorkflowStep> for u8 {
    fn from(step: WorkflowStep) -> Self {
        match step {
            WorkflowStep::Submit => 0,
            WorkflowStep::Waiting => 1,
            WorkflowStep::ExploringGsea => 2,
            WorkflowStep::Downstream => 3,
        }
    }
}

/// client-owned state that survives restarts
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default, alias = "jobId")]
    pub job_id: String,
    #[serde(default, alias = "selectedPathway")]
    pub selected_pathway: Option<PathwaySelection>,
    #[serde(default, alias = "workflowStep")]
    pub workflow_step: WorkflowStep,
}

impl SessionState {
    pub fn job_id(&self) -> Option<&str> {
        let trimmed = self.job_id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}
