//! MagikMirror - container image mirror CLI
//!
//! ## Usage
//!
//! ```sh
//! magikmirror sync openjdk:8 'org/app:v1.*'
//! magikmirror sync --file images.txt
//! magikmirror resolve containers.example.org/org/app/sub:stretch
//! magikmirror gc
//! ```
//!
//! Settings come from `--config <file.json>` and are overridden by flags.
//! The exit status of `sync` is the code of the last failed image, or 0.

use clap::{Parser, Subcommand};
use magikmirror::{ImageReference, Mirror, MirrorConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "magikmirror", version, about = "Content-addressed container image mirror")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Transactional repository name.
    #[arg(long, global = true)]
    repository: Option<String>,

    /// Managed root (defaults to /cvmfs/<repository>).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Docker-compatible engine program.
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Publish attempts per image.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage and publish images.
    Sync {
        /// Image references; wildcard tags are expanded.
        images: Vec<String>,

        /// File with one reference per line.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print how a reference is resolved.
    Resolve {
        /// Image reference.
        image: String,
    },
    /// Remove staged images no tag points at.
    Gc,
}

fn load_config(cli: &Cli) -> magikmirror::Result<MirrorConfig> {
    let mut config = match &cli.config {
        Some(path) => MirrorConfig::from_file(path)?,
        None => MirrorConfig::default(),
    };

    if let Some(repository) = &cli.repository {
        let derived = MirrorConfig::for_repository(repository.clone());
        config.root = config.managed_prefix.join(repository);
        config.lock_path = derived.lock_path;
        config.repository = derived.repository;
    }
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(engine) = &cli.engine {
        config.engine = engine.clone();
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }

    config.validate()?;
    Ok(config)
}

/// Reads reference lines, ignoring blanks and `#` comments.
fn read_image_list(path: &Path) -> magikmirror::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

async fn run(cli: Cli) -> magikmirror::Result<i32> {
    match &cli.command {
        Command::Resolve { image } => {
            let config = load_config(&cli)?;
            let reference = ImageReference::resolve_with_registry(image, &config.default_registry);
            println!("registry:   {}", reference.registry);
            println!("namespace:  {}", reference.namespace);
            println!("repository: {}", reference.repository);
            println!("tag:        {}", reference.tag);
            println!("alias:      {}", config.root.join(reference.alias_relative_path()).display());
            Ok(0)
        }
        Command::Sync { images, file } => {
            let config = load_config(&cli)?;
            let mut entries = images.clone();
            if let Some(file) = file {
                entries.extend(read_image_list(file)?);
            }
            if entries.is_empty() {
                return Err(magikmirror::Error::InvalidConfig(
                    "no images given (pass references or --file)".to_string(),
                ));
            }

            let mirror = Mirror::with_defaults(config);
            let report = mirror.run_batch(&entries).await?;
            Ok(report.exit_code)
        }
        Command::Gc => {
            let config = load_config(&cli)?;
            let mirror = Mirror::with_defaults(config);
            let stats = mirror.collect_garbage().await?;
            println!("Removed {} staged images, kept {}", stats.removed_count, stats.kept_count);
            Ok(0)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "magikmirror=debug"
    } else {
        "magikmirror=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code().clamp(1, 255) as u8)
        }
    }
}
