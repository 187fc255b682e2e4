//! inferlet CLI
//!
//! Deploys, restarts and stops the inference server of one deployment root.

mod commands;

use clap::{Args, Parser, Subcommand};
use inferlet_core::{DeployMode, DeployOverrides, Engine, InferletError, QuantRequest};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// inferlet - single-host deployment control plane for GPU inference servers
#[derive(Parser, Debug)]
#[command(name = "inferlet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Deployment root holding the PID file, logs, caches and snapshot
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Orchestrator configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Deploy parameters; each overrides the environment
#[derive(Args, Debug, Clone, Default)]
struct DeployArgs {
    /// Inference engine (trt, vllm)
    #[arg(long)]
    engine: Option<Engine>,

    /// What to serve (chat, tool, both)
    #[arg(long = "mode")]
    deploy_mode: Option<DeployMode>,

    /// Chat model id
    #[arg(long)]
    chat_model: Option<String>,

    /// Tool-classification model id
    #[arg(long)]
    tool_model: Option<String>,

    /// Quantization level (auto, 4bit, 8bit)
    #[arg(long)]
    quantization: Option<QuantRequest>,
}

impl From<DeployArgs> for DeployOverrides {
    fn from(args: DeployArgs) -> Self {
        DeployOverrides {
            engine: args.engine,
            deploy_mode: args.deploy_mode,
            chat_model: args.chat_model,
            tool_model: args.tool_model,
            quantization: args.quantization,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy the configured models
    Deploy(DeployArgs),

    /// Stop the server
    Stop {
        /// Also remove engine artifacts, model caches and the snapshot
        #[arg(long)]
        full_cleanup: bool,
    },

    /// Redeploy with the same parameters
    Restart {
        #[command(flatten)]
        deploy: DeployArgs,

        /// Remove model caches and artifacts before redeploying
        #[arg(long)]
        reset_models: bool,
    },

    /// Show the server PID and the last deployment
    Status,

    /// Show the detected GPU and CUDA versions
    Detect {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve the deployment and restart decision without changing anything
    Plan {
        #[command(flatten)]
        deploy: DeployArgs,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the server log
    Logs {
        /// Keep printing new output until Ctrl-C
        #[arg(short, long)]
        follow: bool,

        /// Number of trailing lines to print first
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(cli).await {
        std::process::exit(report(&err));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.root;
    let config = cli.config;

    match cli.command {
        Commands::Deploy(args) => {
            let ctx = commands::load_context(&root, config.as_deref(), args.into())?;
            commands::deploy(ctx).await?;
        }
        Commands::Stop { full_cleanup } => {
            let ctx = commands::load_context(&root, config.as_deref(), DeployOverrides::default())?;
            commands::stop(ctx, full_cleanup).await?;
        }
        Commands::Restart { deploy, reset_models } => {
            let ctx = commands::load_context(&root, config.as_deref(), deploy.into())?;
            commands::restart(ctx, reset_models).await?;
        }
        Commands::Status => {
            let ctx = commands::load_context(&root, config.as_deref(), DeployOverrides::default())?;
            commands::status(ctx)?;
        }
        Commands::Detect { json } => {
            commands::detect(&root, json)?;
        }
        Commands::Plan { deploy, json } => {
            let ctx = commands::load_context(&root, config.as_deref(), deploy.into())?;
            commands::plan(ctx, json)?;
        }
        Commands::Logs { follow, lines } => {
            commands::logs(&root, follow, lines).await?;
        }
    }

    Ok(())
}

/// Print an actionable message and pick the exit code
fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<InferletError>() {
        Some(e) => {
            eprintln!("error: {}", e);
            eprintln!("  hint: {}", e.hint());
            e.exit_code()
        }
        None => {
            eprintln!("error: {:#}", err);
            1
        }
    }
}
