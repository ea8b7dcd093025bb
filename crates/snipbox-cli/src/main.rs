//! Snipbox CLI
//!
//! A command-line tool for running code snippets in sandboxed containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snipbox::{
    Config, DockerRuntime, EXAMPLE_CONFIG, Engine, ExecutionRequest, FrameSink, OutputFrame,
};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(about = "A tool for running untrusted code snippets in containers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: snipbox.toml)
        #[arg(short, long, default_value = "snipbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a source file in a sandbox
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., python, javascript)
        #[arg(short, long)]
        language: String,

        /// Input file fed to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print output frames as they arrive instead of once at the end
        #[arg(short, long)]
        stream: bool,

        /// Print frames (or the response) as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,

    /// Remove sandboxes left behind by earlier runs
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            source,
            language,
            input,
            stream,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_execute(config, &source, &language, input.as_deref(), stream, json).await
        }
        Commands::Languages => {
            list_languages(&load_config(cli.config.as_deref())?);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&load_config(cli.config.as_deref())?);
            Ok(())
        }
        Commands::Prune => prune(&load_config(cli.config.as_deref())?).await,
    }
}

/// Load configuration from `path` (or the embedded defaults) plus the environment
fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        info!(?path, "loading configuration");
    } else {
        debug!("using default configuration");
    }
    Config::load(path).context("failed to load configuration")
}

fn connect(config: &Config) -> Result<DockerRuntime> {
    DockerRuntime::connect(config.docker_socket.as_deref()).context("failed to connect to docker")
}

async fn run_execute(
    config: Config,
    source: &Path,
    language_id: &str,
    input: Option<&Path>,
    stream: bool,
    json: bool,
) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;

    let mut request = ExecutionRequest::new(code, language_id);
    if let Some(input_path) = input {
        let stdin = tokio::fs::read_to_string(input_path)
            .await
            .context("failed to read input file")?;
        request = request.with_stdin(stdin);
    }
    request.validate().context("invalid request")?;

    let runtime = connect(&config)?;
    runtime.ping().await.context("docker daemon is not reachable")?;
    let engine = Engine::new(config, Arc::new(runtime));

    info!(language = %request.language, "running program");

    let exit_code = if stream {
        run_streaming(&engine, &request, json).await?
    } else {
        let response = engine.execute(&request).await;
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("failed to encode response")?
            );
        } else {
            print!("{}", response.stdout);
            eprint!("{}", response.stderr);
        }
        info!(
            exit_code = response.exit_code,
            elapsed = format_args!("{}ms", response.elapsed_ms),
            "execution result"
        );
        response.exit_code
    };

    // Exit with appropriate code
    if exit_code == 0 {
        Ok(())
    } else {
        std::process::exit(exit_code);
    }
}

async fn run_streaming(engine: &Engine, request: &ExecutionRequest, json: bool) -> Result<i32> {
    let (sink, mut rx) = FrameSink::channel(64);
    let producer = {
        let engine = engine.clone();
        let request = request.clone();
        tokio::spawn(async move { engine.execute_streaming(&request, &sink).await })
    };

    let mut exit_code = 1;
    while let Some(frame) = rx.recv().await {
        if json {
            println!(
                "{}",
                serde_json::to_string(&frame).context("failed to encode frame")?
            );
        }
        match frame {
            OutputFrame::Stdout { data } if !json => print!("{data}"),
            OutputFrame::Stderr { data } if !json => eprint!("{data}"),
            OutputFrame::Error { message } if !json => eprintln!("error: {message}"),
            OutputFrame::Exit {
                exit_code: code,
                elapsed_ms,
            } => {
                debug!(exit_code = code, elapsed_ms, "exit frame");
                exit_code = code;
            }
            _ => {}
        }
    }

    producer.await.context("execution task failed")?;
    Ok(exit_code)
}

async fn prune(config: &Config) -> Result<()> {
    let runtime = connect(config)?;
    let removed = runtime.prune().await.context("failed to prune sandboxes")?;
    println!("Removed {removed} sandbox(es)");
    Ok(())
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        println!("  {:<15} {} ({})", id, lang.name, lang.image);
    }
}

fn show_config(config: &Config) {
    let limits = &config.limits;
    println!("Sandbox limits:");
    println!("  Timeout: {}s", limits.timeout_secs);
    println!("  Memory limit: {} MiB", limits.memory_limit_mb);
    println!(
        "  CPU quota: {}/{} us",
        limits.cpu_quota, limits.cpu_period
    );
    println!("  Max processes: {}", limits.max_processes);
    println!("  Scratch size: {} MiB", limits.scratch_size_mb);
    println!("  Run as: {}", limits.run_as);
    println!("  Max output: {} bytes", limits.max_output_bytes);
    println!();
    println!(
        "Rate limit: {} requests per {}s",
        config.rate_limit.max_requests, config.rate_limit.window_secs
    );
    println!("Workers: {}", config.sessions.workers);
    match &config.docker_socket {
        Some(socket) => println!("Docker socket: {}", socket.display()),
        None => println!("Docker socket: local defaults"),
    }
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
