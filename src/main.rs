use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use polyglot_sandbox::config::SandboxConfig;
use polyglot_sandbox::registry::EnvironmentRegistry;
use polyglot_sandbox::runtime::ExecutionRequest;
use polyglot_sandbox::runtimes::DockerRuntime;
use polyglot_sandbox::{analyzer, Sandbox};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to sandbox configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file in the sandbox and print the JSON result
    Run {
        /// Path to the source file
        #[arg(required = true)]
        file: PathBuf,

        /// Language key or alias (e.g. python, js, c++)
        #[arg(short, long)]
        language: String,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Wall-clock budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Requester id recorded with the execution
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// List supported languages
    ListSupported,

    /// Print static complexity metrics for a source file
    Analyze {
        #[arg(required = true)]
        file: PathBuf,

        #[arg(short, long)]
        language: String,
    },

    /// Check readiness; exits non-zero when unhealthy
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.json_logs);

    let config_path = cli.config.clone().unwrap_or_else(SandboxConfig::default_path);
    let config = SandboxConfig::load(&config_path)?;
    debug!("Loaded configuration from {:?}", config_path);

    match cli.command {
        Commands::Run {
            file,
            language,
            stdin,
            timeout_ms,
            memory_mb,
            user,
        } => {
            let source = read_source(&file)?;
            let mut request = ExecutionRequest::new(user, language, source);
            if let Some(stdin) = stdin {
                request = request.with_stdin(read_source(&stdin)?);
            }
            if let Some(timeout_ms) = timeout_ms {
                request = request.with_timeout_ms(timeout_ms);
            }
            if let Some(memory_mb) = memory_mb {
                request = request.with_memory_limit_mb(memory_mb);
            }

            let sandbox = connect(config)?;
            let result = sandbox.execute(request).await.map_err(|e| {
                error!("Request rejected: {}", e);
                anyhow!(e)
            })?;

            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::ListSupported => {
            let registry = EnvironmentRegistry::with_overrides(&config.languages);
            println!("Supported languages:");
            for key in registry.languages() {
                if let Some(environment) = registry.lookup(key) {
                    println!(
                        "- {} ({:?}, .{}, {})",
                        key,
                        environment.kind,
                        environment.file_extension,
                        environment.container_image
                    );
                }
            }
        }

        Commands::Analyze { file, language } => {
            let source = read_source(&file)?;
            let metrics = analyzer::analyze(&source, &language);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }

        Commands::Health => {
            let sandbox = connect(config)?;
            let report = sandbox.health_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.healthy {
                std::process::exit(1);
            }
            info!("Sandbox is healthy");
        }
    }

    Ok(())
}

fn connect(config: SandboxConfig) -> Result<Sandbox> {
    let runtime = DockerRuntime::connect().context("Failed to connect to the Docker daemon")?;
    let sandbox = Sandbox::from_config(config, Arc::new(runtime))?;
    Ok(sandbox)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read file: {:?}", path))
}

fn setup_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so stdout stays machine-readable
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
