use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_worker::config::WorkerConfig;
use fleet_worker::environment::{
    CommandUserAccounts, CurrentUserProvisioner, MultiuserProvisioner, Provisioner, UserAccounts,
};
use fleet_worker::error::WorkerError;
use fleet_worker::exit_code::ExitCode;
use fleet_worker::queue::{InMemoryQueue, StaticAuthorizer, StaticWorkerManager};
use fleet_worker::shutdown::install_signal_handlers;
use fleet_worker::worker::{Services, WorkerContext};

#[derive(Parser, Debug)]
#[command(name = "fleet-worker")]
#[command(version)]
#[command(about = "Claims queued tasks and runs each one in a fresh, isolated environment")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Claim and run tasks until an exit condition is reached
    Run(RunArgs),

    /// Check a config file and exit
    ValidateConfig {
        /// Path to the worker config file (JSON)
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the worker config file (JSON)
    #[arg(long)]
    config: PathBuf,

    /// JSON array of task definitions to seed the local queue with
    #[arg(long)]
    tasks_file: Option<PathBuf>,

    /// Override the configured capacity
    #[arg(long)]
    capacity: Option<usize>,
}

fn load_config(path: &Path) -> Result<WorkerConfig, ExitCode> {
    let config = WorkerConfig::load(path).map_err(|e| {
        tracing::error!(error = %e, "Cannot load config");
        ExitCode::CantLoadConfig
    })?;
    config.validate().map_err(|e| {
        tracing::error!(error = %e, "Invalid config");
        ExitCode::InvalidConfig
    })?;
    Ok(config)
}

async fn run_worker(args: RunArgs) -> ExitCode {
    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Invalid capacity");
            return ExitCode::InvalidConfig;
        }
    }

    let queue = match &args.tasks_file {
        Some(path) => match InMemoryQueue::load_definitions(path) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot load tasks file");
                return ExitCode::CantLoadConfig;
            }
        },
        None => InMemoryQueue::new(),
    };
    tracing::info!(pending = queue.pending_count(), "Local task queue ready");

    let services = Services {
        queue: Arc::new(queue),
        authorizer: Arc::new(StaticAuthorizer::new()),
        worker_manager: Arc::new(StaticWorkerManager),
    };

    let accounts: Option<Arc<dyn UserAccounts>> = if config.run_tasks_as_current_user {
        None
    } else {
        Some(Arc::new(CommandUserAccounts))
    };
    let provisioner: Arc<dyn Provisioner> = match &accounts {
        Some(accounts) => Arc::new(MultiuserProvisioner::new(&config, Arc::clone(accounts))),
        None => Arc::new(CurrentUserProvisioner::new(config.tasks_dir.clone())),
    };

    tracing::info!(
        task_queue_id = %config.task_queue_id(),
        capacity = config.capacity,
        tasks_dir = %config.tasks_dir.display(),
        multiuser = accounts.is_some(),
        "Starting fleet-worker"
    );

    let mut worker = WorkerContext::new(config, services, provisioner);
    if let Some(accounts) = accounts {
        worker = worker.with_user_accounts(accounts);
    }

    if let Err(e) = install_signal_handlers(worker.termination(), worker.interrupt_token()) {
        tracing::error!(error = %e, "Cannot install signal handlers");
        return ExitCode::InternalError;
    }

    match worker.init().await {
        Ok(None) => {}
        Ok(Some(code)) => return code,
        Err(WorkerError::InvalidConfig(reason)) => {
            tracing::error!(%reason, "Invalid config");
            return ExitCode::InvalidConfig;
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot initialise worker");
            return ExitCode::InternalError;
        }
    }

    let code = worker.run().await;
    if let Err(e) = worker.shutdown().await {
        tracing::error!(error = %e, "Cannot persist worker state");
    }
    tracing::info!(%code, "Worker exiting");
    code
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let code = match args.command {
        Commands::Run(run_args) => run_worker(run_args).await,
        Commands::ValidateConfig { config } => match load_config(&config) {
            Ok(_) => {
                println!("Config {} is valid", config.display());
                ExitCode::TasksComplete
            }
            Err(code) => code,
        },
    };
    code.into()
}
