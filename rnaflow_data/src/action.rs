use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::{DESEQ2_RESULTS, GSEA_ARTIFACTS, HEATMAP, VOLCANO_CUSTOM};

/// in-place computations that write extra artifacts into an existing job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedAction {
    GseaSinglePlot,
    HeatmapFromGsea,
    Volcano,
}

impl DerivedAction {
    pub const ALL: [DerivedAction; 3] = [
        DerivedAction::GseaSinglePlot,
        DerivedAction::HeatmapFromGsea,
        DerivedAction::Volcano,
    ];

    /// key of the action's sub-record in the job's `extra` map
    pub fn key(&self) -> &'static str {
        match self {
            DerivedAction::GseaSinglePlot => "gsea_single_plot",
            DerivedAction::HeatmapFromGsea => "heatmap_from_gsea",
            DerivedAction::Volcano => "volcano_inplace",
        }
    }

    /// last path segment of the trigger endpoint under `/api/jobs/{id}/`
    pub fn endpoint(&self) -> &'static str {
        match self {
            DerivedAction::GseaSinglePlot => "gsea_single_plot_inplace",
            DerivedAction::HeatmapFromGsea => "heatmap_from_gsea_inplace",
            DerivedAction::Volcano => "volcano_inplace",
        }
    }

    /// artifacts that must be listed on the job before the action may be requested
    pub fn prerequisites(&self) -> &'static [&'static str] {
        match self {
            DerivedAction::GseaSinglePlot | DerivedAction::HeatmapFromGsea => GSEA_ARTIFACTS,
            DerivedAction::Volcano => &[DESEQ2_RESULTS],
        }
    }

    /// artifact the backend writes when its record does not name one
    pub fn default_output(&self) -> Option<&'static str> {
        match self {
            DerivedAction::GseaSinglePlot => None,
            DerivedAction::HeatmapFromGsea => Some(HEATMAP),
            DerivedAction::Volcano => Some(VOLCANO_CUSTOM),
        }
    }

    pub fn needs_pathway(&self) -> bool {
        !matches!(self, DerivedAction::Volcano)
    }
}

impl fmt::Display for DerivedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DerivedAction::GseaSinglePlot => "single-pathway GSEA plot",
            DerivedAction::HeatmapFromGsea => "pathway heatmap",
            DerivedAction::Volcano => "enhanced volcano plot",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionState {
    Running,
    Success,
    Error,
    Other(String),
}

impl ActionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ActionState::Success | ActionState::Error)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionState::Running => "running",
            ActionState::Success => "success",
            ActionState::Error => "error",
            ActionState::Other(raw) => raw,
        }
    }
}

// a record without a state is still being worked on
impl Default for ActionState {
    fn default() -> Self {
        ActionState::Running
    }
}

impl From<String> for ActionState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "running" => ActionState::Running,
            "success" => ActionState::Success,
            "error" => ActionState::Error,
            _ => ActionState::Other(raw),
        }
    }
}

impl From<ActionState> for String {
    fn from(state: ActionState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// sub-state of one derived action, stored under `extra[action.key()]`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(default)]
    pub state: ActionState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// action specific fields, e.g. `pathway_id` or `top_n`
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

impl ActionRecord {
    pub fn with_state(state: ActionState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    /// name of the artifact this action produced, as far as the record tells
    pub fn produced_output(&self) -> Option<&str> {
        self.output
            .as_deref()
            .or_else(|| self.outputs.first().map(String::as_str))
    }
}
