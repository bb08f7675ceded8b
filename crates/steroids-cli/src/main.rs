mod incident_cmds;
mod output;
mod runner_cmds;
mod status_cmd;
mod task_cmds;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;

use steroids_core::config;
use steroids_core::import;
use steroids_db::pool;

use output::{CliError, emit_failure, emit_success};

#[derive(Parser)]
#[command(name = "steroids", about = "Automated LLM coding loop: scheduler, orchestrator, runners")]
struct Cli {
    /// Emit machine-readable JSON (one object per command)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a project: create .steroids/ and its database
    Init {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Import sections and tasks from a TOML seed file
    Import {
        /// Path to the seed file
        file: PathBuf,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Task management
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Section management
    Sections {
        #[command(subcommand)]
        command: SectionCommands,
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Show per-section task counts and active locks
    Status {
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Runner management
    Runners {
        #[command(subcommand)]
        command: RunnerCommands,
    },
    /// Discover pending work and spawn runners
    Wakeup {
        /// Report what would start without spawning
        #[arg(long)]
        dry_run: bool,
        /// Suppress per-project log lines
        #[arg(long)]
        quiet: bool,
    },
    /// Incident management
    Incidents {
        #[command(subcommand)]
        command: IncidentCommands,
    },
    /// Project registry (used by wakeup)
    Projects {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Add a task
    Add {
        /// Task title
        title: String,
        /// Section name to attach the task to
        #[arg(long)]
        section: Option<String>,
    },
    /// List tasks
    List {
        /// Filter by status (pending, in_progress, review, ...)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a task with its audit trail
    Show {
        task_id: String,
    },
    /// Promote a follow-up task for implementation
    Promote {
        task_id: String,
    },
}

#[derive(Subcommand)]
pub enum SectionCommands {
    /// Add a section
    Add {
        name: String,
        #[arg(long)]
        priority: Option<i64>,
    },
    /// List sections
    List,
}

#[derive(Subcommand)]
pub enum RunnerCommands {
    /// Start the runner loop for a project (blocks until the queue
    /// drains)
    Start {
        #[arg(long)]
        project: PathBuf,
        /// Register under a parallel session (used by wakeup)
        #[arg(long)]
        parallel: bool,
    },
    /// List registered runners
    List,
    /// Stop a runner by id
    Stop {
        runner_id: String,
    },
}

#[derive(Subcommand)]
pub enum IncidentCommands {
    /// List open incidents
    List,
    /// Resolve an incident
    Resolve {
        incident_id: String,
        /// One of: config_changed, dismissed, manual, retry, auto_restart
        #[arg(long)]
        resolution: String,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a project for wakeup discovery
    Register {
        path: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a project from the registry
    Unregister {
        path: String,
    },
    /// Re-enable a project for wakeup discovery
    Enable {
        path: String,
    },
    /// Keep a project registered but stop wakeup from spawning runners
    Disable {
        path: String,
    },
    /// List registered projects
    List,
}

/// Open a project database, mapping a missing one to NOT_INITIALIZED.
pub(crate) async fn open_project(project: &Path) -> Result<sqlx::SqlitePool, CliError> {
    pool::open_existing_project_pool(project)
        .await?
        .ok_or_else(|| CliError::NotInitialized(project.display().to_string()))
}

/// `steroids init`: create the project database and a default global
/// config if none exists yet.
async fn cmd_init(project: &Path, json_mode: bool) -> Result<(), CliError> {
    let pool = pool::open_project_pool(project).await?;
    pool.close().await;

    if !config::config_path().exists() {
        config::save_config(&config::ConfigFile::default())?;
    }

    let db_path = pool::project_db_path(project);
    emit_success(
        json_mode,
        json!({ "database": &db_path, "config": config::config_path() }),
        || {
            println!("Initialized project database at {}", db_path.display());
            println!("Config: {}", config::config_path().display());
            println!();
            println!("Next: `steroids import <seed.toml>` and `steroids runners start --project .`");
        },
    );
    Ok(())
}

/// `steroids import`: load a seed file into the project database.
async fn cmd_import(file: &Path, project: &Path, json_mode: bool) -> Result<(), CliError> {
    let seed = import::load_seed(file)?;
    let pool = open_project(project).await?;
    let source = file.to_string_lossy();
    let summary = import::import_seed(&pool, &seed, Some(&source)).await?;
    pool.close().await;

    emit_success(
        json_mode,
        json!({
            "sections": summary.sections,
            "dependencies": summary.dependencies,
            "tasks": summary.tasks,
        }),
        || {
            println!(
                "Imported {} section(s), {} dependenc(ies), {} task(s) from {}",
                summary.sections,
                summary.dependencies,
                summary.tasks,
                file.display()
            );
        },
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let json_mode = cli.json;
    match cli.command {
        Commands::Init { project } => cmd_init(&project, json_mode).await,
        Commands::Import { file, project } => cmd_import(&file, &project, json_mode).await,
        Commands::Tasks { command, project } => {
            task_cmds::run_task_command(command, &project, json_mode).await
        }
        Commands::Sections { command, project } => {
            task_cmds::run_section_command(command, &project, json_mode).await
        }
        Commands::Status { project } => status_cmd::run_status(&project, json_mode).await,
        Commands::Runners { command } => match command {
            RunnerCommands::Start { project, parallel } => {
                runner_cmds::run_start(&project, parallel, json_mode).await
            }
            RunnerCommands::List => runner_cmds::run_list(json_mode).await,
            RunnerCommands::Stop { runner_id } => {
                runner_cmds::run_stop(&runner_id, json_mode).await
            }
        },
        Commands::Wakeup { dry_run, quiet } => {
            runner_cmds::run_wakeup(dry_run, quiet, json_mode).await
        }
        Commands::Incidents { command } => match command {
            IncidentCommands::List => incident_cmds::run_incident_list(json_mode).await,
            IncidentCommands::Resolve {
                incident_id,
                resolution,
            } => incident_cmds::run_incident_resolve(&incident_id, &resolution, json_mode).await,
        },
        Commands::Projects { command } => match command {
            ProjectCommands::Register { path, name } => {
                incident_cmds::run_project_register(&path, name.as_deref(), json_mode).await
            }
            ProjectCommands::Unregister { path } => {
                incident_cmds::run_project_unregister(&path, json_mode).await
            }
            ProjectCommands::Enable { path } => {
                incident_cmds::run_project_set_enabled(&path, true, json_mode).await
            }
            ProjectCommands::Disable { path } => {
                incident_cmds::run_project_set_enabled(&path, false, json_mode).await
            }
            ProjectCommands::List => incident_cmds::run_project_list(json_mode).await,
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = cli.json;

    if let Err(error) = run(cli).await {
        std::process::exit(emit_failure(json_mode, &error));
    }
}
