use std::path::{Path, PathBuf};

use rnaflow_data::{display_timestamp, DerivedAction, Job, PathwaySelection, SessionState};
use rnaflow_lib::{
    affordances, Affordance, ActionEvent, ActionOutcome, ActionRequest, ClientError, Screen,
    ScreenEvent, ScreenPhase, ScreenUpdate, WaitOutcome, WorkflowOrchestrator,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

type Events = UnboundedReceiver<ScreenEvent>;

/// stores `job_id` in the session when one was given on the command line
pub fn remember(
    orchestrator: &mut WorkflowOrchestrator,
    job_id: Option<&str>,
) -> Result<(), ClientError> {
    if let Some(job_id) = job_id {
        orchestrator.set_job_id(job_id)?;
    }
    Ok(())
}

fn current_job(
    orchestrator: &mut WorkflowOrchestrator,
    job_id: Option<&str>,
) -> Result<String, ClientError> {
    remember(orchestrator, job_id)?;
    orchestrator
        .job_id()
        .map(str::to_string)
        .ok_or(ClientError::EmptyJobId)
}

pub async fn status(
    orchestrator: &mut WorkflowOrchestrator,
    job_id: Option<&str>,
) -> Result<String, ClientError> {
    let job_id = current_job(orchestrator, job_id)?;
    let job = orchestrator.snapshot_for(&job_id).await?;
    Ok(format_job(&job))
}

pub async fn watch(
    orchestrator: &mut WorkflowOrchestrator,
    events: &mut Events,
    job_id: Option<&str>,
) -> Result<(), ClientError> {
    current_job(orchestrator, job_id)?;
    orchestrator.navigate(Screen::Jobs)?;
    present(orchestrator, events, is_watch_end).await?;
    Ok(())
}

pub async fn gsea(
    orchestrator: &mut WorkflowOrchestrator,
    events: &mut Events,
    job_id: Option<&str>,
) -> Result<(), ClientError> {
    current_job(orchestrator, job_id)?;
    orchestrator.navigate(Screen::Gsea)?;
    let last = present(orchestrator, events, is_watch_end).await?;
    if last == Some(ScreenUpdate::PhaseChanged(ScreenPhase::Satisfied)) {
        let pathways = orchestrator.load_pathways().await?;
        println!("{}", format_pathways(&pathways));
    }
    Ok(())
}

/// picks a row of the pathway table by 1-based row number or by ID
pub async fn select(
    orchestrator: &mut WorkflowOrchestrator,
    row: &str,
) -> Result<String, ClientError> {
    let pathways = orchestrator.load_pathways().await?;
    let row = row.trim();
    let picked = match row.parse::<usize>() {
        Ok(n) if n >= 1 && n <= pathways.len() => pathways.get(n - 1),
        _ => pathways.iter().find(|p| p.id == row),
    };
    let pathway = picked
        .cloned()
        .ok_or_else(|| ClientError::InvalidRequest(format!("no pathway '{}' in the table", row)))?;
    let line = format!(
        "selected {} ({} core genes)",
        pathway.label(),
        pathway.core_genes.len()
    );
    orchestrator.select_pathway(pathway)?;
    Ok(line)
}

pub async fn run_action(
    orchestrator: &mut WorkflowOrchestrator,
    events: &mut Events,
    request: ActionRequest,
) -> Result<(), ClientError> {
    let action = request.action();
    let screen = match action {
        DerivedAction::GseaSinglePlot => Screen::Gsea,
        DerivedAction::HeatmapFromGsea => Screen::Heatmap,
        DerivedAction::Volcano => Screen::Volcano,
    };
    orchestrator.navigate(screen)?;
    let handle = orchestrator.trigger_action(request).await?;
    info!(job_id = handle.job_id(), "{} requested", action);
    present(orchestrator, events, |update| {
        matches!(update, ScreenUpdate::ActionFinished { action: finished, .. } if *finished == action)
    })
    .await?;
    Ok(())
}

pub async fn download(
    orchestrator: &mut WorkflowOrchestrator,
    name: &str,
    out: Option<PathBuf>,
) -> Result<PathBuf, ClientError> {
    let job_id = current_job(orchestrator, None)?;
    let bytes = orchestrator.backend().fetch_output(&job_id, name).await?;
    let path = out.unwrap_or_else(|| PathBuf::from(name));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// saves the zip of all outputs, as `<job id>.zip` unless `out` is given
pub async fn download_all(
    orchestrator: &mut WorkflowOrchestrator,
    out: Option<PathBuf>,
) -> Result<PathBuf, ClientError> {
    let (name, bytes) = orchestrator.job_bundle().await?;
    let path = out.unwrap_or_else(|| PathBuf::from(name));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

pub async fn log(
    orchestrator: &mut WorkflowOrchestrator,
    job_id: Option<&str>,
) -> Result<String, ClientError> {
    remember(orchestrator, job_id)?;
    orchestrator.job_log().await
}

fn is_watch_end(update: &ScreenUpdate) -> bool {
    matches!(
        update,
        ScreenUpdate::PhaseChanged(
            ScreenPhase::Satisfied | ScreenPhase::Failed | ScreenPhase::TimedOut
        )
    )
}

/// Prints screen updates until `done` accepts one, which is returned.
/// Ctrl-C tears the screen down and returns `None`.
async fn present<F>(
    orchestrator: &mut WorkflowOrchestrator,
    events: &mut Events,
    mut done: F,
) -> Result<Option<ScreenUpdate>, ClientError>
where
    F: FnMut(&ScreenUpdate) -> bool,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(None);
                };
                if let Some(line) = format_update(&event.update) {
                    println!("{}", line);
                }
                if done(&event.update) {
                    return Ok(Some(event.update));
                }
            }
            res = &mut ctrl_c => {
                res?;
                orchestrator.teardown();
                eprintln!("interrupted");
                return Ok(None);
            }
        }
    }
}

fn affordance_label(affordance: &Affordance) -> &'static str {
    match affordance {
        Affordance::ExploreGsea => "gsea",
        Affordance::Heatmap => "heatmap",
        Affordance::Volcano => "volcano",
        Affordance::Download => "download",
    }
}

fn format_next(next: &[Affordance]) -> String {
    if next.is_empty() {
        return "--".to_string();
    }
    next.iter()
        .map(affordance_label)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_job(job: &Job) -> String {
    let mut lines = vec![
        format!("job       {}", job.job_id),
        format!("state     {}", job.state),
        format!("message   {}", job.message_or("--")),
        format!("created   {}", display_timestamp(job.created_at.as_deref())),
        format!("started   {}", display_timestamp(job.started_at.as_deref())),
        format!("finished  {}", display_timestamp(job.finished_at.as_deref())),
        format!("outputs   {}", job.outputs.len()),
    ];
    for item in &job.outputs {
        lines.push(format!("  {:<40} {:>10} B", item.name, item.size_bytes));
    }
    for action in DerivedAction::ALL {
        if let Some(record) = job.action(action) {
            lines.push(format!(
                "{:<27} {} {}",
                action.to_string(),
                record.state,
                record.produced_output().unwrap_or("")
            ));
        }
    }
    lines.push(format!("next      {}", format_next(&affordances(job))));
    lines.join("\n")
}

pub fn format_update(update: &ScreenUpdate) -> Option<String> {
    let line = match update {
        ScreenUpdate::Entered { screen, job_id } => format!(
            "{} (job {})",
            screen.route(),
            job_id.as_deref().unwrap_or("--")
        ),
        ScreenUpdate::Snapshot { job, affordances } => format!(
            "[{}] {} | {} outputs | next: {}",
            job.state,
            job.message_or(""),
            job.outputs.len(),
            format_next(affordances)
        ),
        ScreenUpdate::WaitProgress {
            attempt,
            error: Some(error),
            ..
        } => format!("attempt {}: status fetch failed: {}", attempt, error),
        ScreenUpdate::WaitProgress {
            attempt, missing, ..
        } => format!("attempt {}: waiting for {}", attempt, missing.join(", ")),
        ScreenUpdate::PhaseChanged(_) => return None,
        ScreenUpdate::ArtifactAvailable(item) => format!(
            "found {} from an earlier run ({} B): {}",
            item.name, item.size_bytes, item.url
        ),
        ScreenUpdate::PrerequisitesMet { job_id } => {
            format!("all required outputs of job {} are ready", job_id)
        }
        ScreenUpdate::WatchFailed(outcome) => match outcome {
            WaitOutcome::JobFailed { message } => format!("job failed: {}", message),
            WaitOutcome::TimedOut { attempts } => format!(
                "gave up after {} checks; the job may still finish, check again later",
                attempts
            ),
            WaitOutcome::Unreachable { faults, last_error } => format!(
                "backend unreachable after {} failed requests: {}",
                faults, last_error
            ),
            WaitOutcome::Aborted { error } => format!("stopped watching: {}", error),
            WaitOutcome::Satisfied(_) => return None,
        },
        ScreenUpdate::ActionProgress { action, event } => match event {
            ActionEvent::Polled { attempt, record } => format!(
                "{}: {} (check {})",
                action,
                record
                    .as_ref()
                    .map_or("pending".to_string(), |r| r.state.to_string()),
                attempt
            ),
            ActionEvent::Faulted { attempt, error } => {
                format!("{}: check {} failed: {}", action, attempt, error)
            }
            ActionEvent::Finished(_) => return None,
        },
        ScreenUpdate::ActionFinished { action, outcome } => match outcome {
            ActionOutcome::Completed { output, record } => format!(
                "{} done: {}{}",
                action,
                output.as_deref().unwrap_or("--"),
                record
                    .message
                    .as_ref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            ),
            ActionOutcome::Failed { message } => format!("{} failed: {}", action, message),
            ActionOutcome::TimedOut { attempts } => format!(
                "{} still not done after {} checks; look at the job's outputs later",
                action, attempts
            ),
            ActionOutcome::Cancelled => format!("{} no longer followed", action),
        },
        ScreenUpdate::TornDown => return None,
    };
    Some(line)
}

pub fn format_pathways(pathways: &[PathwaySelection]) -> String {
    let mut lines = vec![format!(
        "{:>4}  {:<14} {:>8} {:>10} {:>6}  {}",
        "#", "ID", "NES", "p.adjust", "genes", "Description"
    )];
    for (i, pathway) in pathways.iter().enumerate() {
        lines.push(format!(
            "{:>4}  {:<14} {:>8} {:>10} {:>6}  {}",
            i + 1,
            pathway.id,
            pathway.nes.map_or("NA".to_string(), |v| format!("{:.3}", v)),
            pathway
                .adjusted_p_value
                .map_or("NA".to_string(), |v| format!("{:.2e}", v)),
            pathway.core_genes.len(),
            pathway.description.as_deref().unwrap_or("")
        ));
    }
    lines.join("\n")
}

pub fn format_session(state: &SessionState, path: &Path) -> String {
    let pathway = state
        .selected_pathway
        .as_ref()
        .map_or("--".to_string(), |p| {
            format!("{} ({})", p.label(), p.core_genes.join(","))
        });
    format!(
        "job       {}\npathway   {}\nstep      {:?}\nfile      {}",
        state.job_id().unwrap_or("--"),
        pathway,
        state.workflow_step,
        path.display()
    )
}
