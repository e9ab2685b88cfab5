//! manta CLI entry point
//!
//! Exit codes: 0 success, 2 validation failure, 3 user cancelled,
//! 4 irrecoverable engine error.

mod app;
mod cli;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "manta")]
#[command(about = "Plan execution engine driven by LLM-generated plans", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Root directory for the filesystem task store. Ignored when
    /// DATABASE_URI selects the relational backend.
    #[arg(long, global = true, default_value = ".manta")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a goal end to end
    Execute {
        /// Natural-language objective for the task
        #[arg(long)]
        goal: String,
        /// Response options as JSON, e.g. {"lang": "en"}
        #[arg(long)]
        response_format: Option<String>,
        /// Tool namespace for the task
        #[arg(long, default_value = "default")]
        namespace: String,
    },

    /// Manage tool namespaces
    #[command(subcommand)]
    Namespace(NamespaceCommands),

    /// Inspect tasks and their branches
    #[command(subcommand)]
    Task(TaskCommands),

    /// Run the HTTP API server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum NamespaceCommands {
    /// Create a namespace
    Create {
        name: String,
        /// Tools visible in this namespace
        #[arg(long = "allowed-tools", num_args = 0..)]
        allowed_tools: Vec<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Update a namespace
    Update {
        name: String,
        #[arg(long = "allowed-tools", num_args = 0..)]
        allowed_tools: Option<Vec<String>>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a namespace
    Delete { name: String },
    /// List namespaces
    List,
    /// Show one namespace
    Show { name: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show a task with its branches
    Show { task_id: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            4
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Execute { goal, response_format, namespace } => {
            let app = app::App::build(&cli.store_dir).await?;
            cli::execute::handle(&app, goal, response_format, namespace).await
        }
        Commands::Namespace(command) => {
            let app = app::App::build_store_only(&cli.store_dir).await?;
            match command {
                NamespaceCommands::Create { name, allowed_tools, description } => {
                    cli::namespace::handle_create(&app, name, allowed_tools, description).await
                }
                NamespaceCommands::Update { name, allowed_tools, description } => {
                    cli::namespace::handle_update(&app, name, allowed_tools, description).await
                }
                NamespaceCommands::Delete { name } => {
                    cli::namespace::handle_delete(&app, name).await
                }
                NamespaceCommands::List => cli::namespace::handle_list(&app).await,
                NamespaceCommands::Show { name } => cli::namespace::handle_show(&app, name).await,
            }
        }
        Commands::Task(command) => {
            let app = app::App::build_store_only(&cli.store_dir).await?;
            match command {
                TaskCommands::List { limit, offset } => {
                    cli::task::handle_list(&app, limit, offset).await
                }
                TaskCommands::Show { task_id } => cli::task::handle_show(&app, task_id).await,
            }
        }
        Commands::Serve { bind } => {
            let app = app::App::build(&cli.store_dir).await?;
            server::serve(app, &bind).await?;
            Ok(0)
        }
    }
}
