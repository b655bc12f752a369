//! VICE orchestrator - launch, monitor and tear down interactive analyses

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vice::assembler::ResourceAssembler;
use vice::config::ViceConfig;
use vice::job::AnalysisJob;
use vice::labels::JobLabels;
use vice::manager::{AnalysisManager, Collaborators};
use vice::monitor::EventMonitor;
use vice::server;
use vice::telemetry::{init_tracing, LogFormat};

/// VICE - lifecycle orchestration for interactive analyses on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "vice", version, about, long_about = None)]
struct Cli {
    /// Log line format
    #[arg(long, value_enum, env = "VICE_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    config: ViceConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API and watch analysis deployments
    Serve,

    /// Print the resources a job would create, as YAML, without a cluster
    Render(RenderArgs),

    /// Fill in missing labels on existing analyses once and exit
    Relabel,
}

/// Render mode arguments
#[derive(Parser, Debug)]
struct RenderArgs {
    /// Path to the job descriptor (JSON)
    job: PathBuf,

    /// User id to derive the subdomain from when the job has none
    #[arg(long)]
    user_id: Option<String>,

    /// Login IP to label the objects with
    #[arg(long)]
    login_ip: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Serve => run_serve(cli.config).await,
        Commands::Render(args) => run_render(cli.config, args).await,
        Commands::Relabel => run_relabel(cli.config).await,
    }
}

async fn run_serve(config: ViceConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;
    let collaborators = Collaborators::connect(&config, client.clone());
    let notifier = collaborators.notifier.clone();
    let addr = config.listen_addr;
    let restart_delay = config.watch_restart_delay();
    let deployments: Api<Deployment> = Api::namespaced(client, &config.namespace);
    let manager = Arc::new(AnalysisManager::new(config, collaborators));

    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(
        EventMonitor::new(deployments, notifier, restart_delay).run(shutdown.clone()),
    );

    let signal_token = shutdown.clone();
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_manager.shutdown();
        signal_token.cancel();
    });

    let served = server::serve(manager, addr, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = monitor.await {
        error!(error = %e, "Deployment monitor task failed");
    }
    served.map_err(|e| anyhow::anyhow!("{}", e))
}

async fn run_render(config: ViceConfig, args: RenderArgs) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.job)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", args.job.display(), e))?;
    let job: AnalysisJob = serde_json::from_str(&raw)?;

    let user_id = args
        .user_id
        .or_else(|| job.user_id.clone())
        .ok_or_else(|| anyhow::anyhow!("job has no user id; pass --user-id"))?;
    let labels = JobLabels::for_job(&job, &user_id, args.login_ip.as_deref(), &config.user_suffix)?;
    let graph = ResourceAssembler::new(config).assemble(&job, labels)?;

    print!("{}", graph.to_yaml()?);
    Ok(())
}

async fn run_relabel(config: ViceConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;
    let collaborators = Collaborators::connect(&config, client);
    let manager = AnalysisManager::new(config, collaborators);

    let report = manager.relabel_now().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.failures.is_empty() {
        anyhow::bail!("{} object(s) could not be relabeled", report.failures.len());
    }
    Ok(())
}
