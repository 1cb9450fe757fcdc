mod action;
mod job;
mod pathway;
mod session;

pub use action::{ActionRecord, ActionState, DerivedAction};
pub use job::{display_timestamp, parse_timestamp, Job, JobState, OutputItem};
pub use pathway::PathwaySelection;
pub use session::{SessionState, WorkflowStep};

/// logical names of the artifacts the workflow keys on
pub mod artifacts {
    pub const DESEQ2_RESULTS: &str = "deseq2_results.csv";
    pub const GSEA_RESULTS: &str = "gsea_results.csv";
    pub const GSEA_CORE_GENES: &str = "gsea_core_genes.json";
    pub const HEATMAP: &str = "heatmap.png";
    pub const VOLCANO_CUSTOM: &str = "volcano_custom.png";

    pub const GSEA_ARTIFACTS: &[&str] = &[GSEA_RESULTS, GSEA_CORE_GENES];
}
