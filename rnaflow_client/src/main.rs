use std::{path::PathBuf, sync::Arc};

use rnaflow_data::DerivedAction;
use rnaflow_lib::{
    parse_gene_list, ClientConfig, ClientError, HttpBackend, SessionStore, SharedBackend,
    WorkflowOrchestrator,
};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod operations;

/// Watch RNA-seq analysis jobs and run in-place follow-up plots
#[derive(StructOpt, Debug)]
#[structopt(name = "rnaflow")]
struct Opt {
    /// Config file, defaults to the user config directory
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Backend base URL, overrides the config file
    #[structopt(long)]
    api_url: Option<String>,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Fetch a job once
    Status(StatusOperation),
    /// Follow a job until it finishes
    Watch(JobOperation),
    /// Wait for the GSEA results and list the pathways
    Gsea(JobOperation),
    /// Select a pathway by row number or ID
    Select(SelectOperation),
    /// Plot the selected pathway
    SinglePlot(JobOperation),
    /// Heatmap of the selected pathway's core genes
    Heatmap(JobOperation),
    /// Enhanced volcano plot
    Volcano(VolcanoOperation),
    /// Print the job's run log
    Log(JobOperation),
    /// Save one output file of the job, or all of them as a zip
    Download(DownloadOperation),
    Session(SessionOperation),
}

#[derive(Debug, StructOpt)]
struct StatusOperation {
    #[structopt(name = "JOB_ID")]
    job_id: Option<String>,
}

#[derive(Debug, StructOpt)]
struct JobOperation {
    /// Defaults to the job of the current session
    #[structopt(name = "JOB_ID")]
    job_id: Option<String>,
}

#[derive(Debug, StructOpt)]
struct SelectOperation {
    #[structopt(name = "ROW")]
    row: String,
}

#[derive(Debug, StructOpt)]
struct VolcanoOperation {
    #[structopt(name = "JOB_ID")]
    job_id: Option<String>,
    /// Number of top genes to label (0-200)
    #[structopt(long)]
    top_n: Option<u32>,
    /// Gene symbols to mark, separated by commas
    #[structopt(long, default_value = "")]
    mark_genes: String,
    /// Also mark the core genes of the selected pathway
    #[structopt(long)]
    import_core_genes: bool,
}

#[derive(Debug, StructOpt)]
struct DownloadOperation {
    #[structopt(name = "NAME", required_unless = "all")]
    name: Option<String>,
    /// Zip of every output, the status and the log
    #[structopt(long, conflicts_with = "NAME")]
    all: bool,
    #[structopt(long, parse(from_os_str))]
    out: Option<PathBuf>,
}

#[derive(Debug, StructOpt)]
enum SessionOperation {
    Show,
    ClearPathway,
    Reset,
}

fn load_config(opt: &Opt) -> Result<ClientConfig, ClientError> {
    let path = opt.config.clone().unwrap_or_else(ClientConfig::default_path);
    let mut config = ClientConfig::load(&path)?;
    if let Some(api_url) = &opt.api_url {
        config.api_url = api_url.trim().to_string();
        config.validate()?;
    }
    Ok(config)
}

async fn run(opt: Opt) -> Result<(), ClientError> {
    let config = load_config(&opt)?;
    let backend: SharedBackend = Arc::new(HttpBackend::new(&config)?);
    let session = SessionStore::open(&config.session_path);

    if let Operation::Session(operation) = &opt.operation {
        let mut session = session;
        return match operation {
            SessionOperation::Show => {
                println!(
                    "{}",
                    operations::format_session(session.state(), session.path())
                );
                Ok(())
            }
            SessionOperation::ClearPathway => session.clear_pathway(),
            SessionOperation::Reset => session.reset(),
        };
    }

    let (mut orchestrator, mut events) =
        WorkflowOrchestrator::new(backend, config.poll.clone(), session);
    let orchestrator = &mut orchestrator;
    match opt.operation {
        Operation::Status(StatusOperation { job_id }) => {
            println!("{}", operations::status(orchestrator, job_id.as_deref()).await?)
        }
        Operation::Watch(JobOperation { job_id }) => {
            operations::watch(orchestrator, &mut events, job_id.as_deref()).await?
        }
        Operation::Gsea(JobOperation { job_id }) => {
            operations::gsea(orchestrator, &mut events, job_id.as_deref()).await?
        }
        Operation::Select(SelectOperation { row }) => {
            println!("{}", operations::select(orchestrator, &row).await?)
        }
        Operation::SinglePlot(JobOperation { job_id }) => {
            operations::remember(orchestrator, job_id.as_deref())?;
            let request = orchestrator.pathway_request(DerivedAction::GseaSinglePlot)?;
            operations::run_action(orchestrator, &mut events, request).await?
        }
        Operation::Heatmap(JobOperation { job_id }) => {
            operations::remember(orchestrator, job_id.as_deref())?;
            let request = orchestrator.pathway_request(DerivedAction::HeatmapFromGsea)?;
            operations::run_action(orchestrator, &mut events, request).await?
        }
        Operation::Volcano(VolcanoOperation {
            job_id,
            top_n,
            mark_genes,
            import_core_genes,
        }) => {
            operations::remember(orchestrator, job_id.as_deref())?;
            let request = orchestrator.volcano_request(
                top_n,
                parse_gene_list(&mark_genes),
                import_core_genes,
            )?;
            operations::run_action(orchestrator, &mut events, request).await?
        }
        Operation::Log(JobOperation { job_id }) => {
            print!("{}", operations::log(orchestrator, job_id.as_deref()).await?)
        }
        Operation::Download(DownloadOperation { name, all, out }) => {
            let path = match name {
                Some(name) if !all => operations::download(orchestrator, &name, out).await?,
                _ => operations::download_all(orchestrator, out).await?,
            };
            println!("saved {}", path.display());
        }
        Operation::Session(_) => {}
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();
    if let Err(err) = run(opt).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
