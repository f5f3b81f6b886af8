//! hoist — agent-less workload orchestrator.
//!
//! # Usage
//!
//! ```text
//! hoist --project ./cluster build
//! hoist --project ./cluster deploy --job web
//! hoist run web flush-cache
//! hoist kv put global region eu-west-1
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "hoist",
    about = "hoist — staged workload rollouts over SSH",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project directory containing hoist.toml
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate declarations, run post-build hooks and schedule allocations
    Build,
    /// Roll out pending changes level by level
    Deploy {
        /// Restrict the rollout to these jobs (repeatable)
        #[arg(short, long = "job")]
        jobs: Vec<String>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Run a job's direct command on every active allocation
    Run { job: String, command: String },
    /// Run a local script on every active allocation of a job
    Exec {
        job: String,
        #[arg(short, long)]
        script: PathBuf,
    },
    /// Show allocations and their ledger state
    Status {
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Read and write the versioned key-value store used by templates
    Kv {
        #[command(subcommand)]
        action: KvAction,
    },
}

#[derive(Subcommand)]
enum KvAction {
    Get { namespace: String, key: String },
    Put {
        namespace: String,
        key: String,
        value: String,
    },
    Delete { namespace: String, key: String },
    /// List the keys of a namespace
    Keys { namespace: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hoist=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let project = cli.project.as_path();
    match cli.command {
        Commands::Build => commands::rollout::build(project).await,
        Commands::Deploy { jobs, format } => {
            commands::rollout::deploy(project, &jobs, matches!(format, OutputFormat::Json)).await
        }
        Commands::Run { job, command } => commands::exec::run(project, &job, &command).await,
        Commands::Exec { job, script } => commands::exec::script(project, &job, &script).await,
        Commands::Status { format } => {
            commands::rollout::status(project, matches!(format, OutputFormat::Json))
        }
        Commands::Kv { action } => match action {
            KvAction::Get { namespace, key } => commands::kv::get(project, &namespace, &key),
            KvAction::Put {
                namespace,
                key,
                value,
            } => commands::kv::put(project, &namespace, &key, &value),
            KvAction::Delete { namespace, key } => commands::kv::delete(project, &namespace, &key),
            KvAction::Keys { namespace } => commands::kv::keys(project, &namespace),
        },
    }
}
