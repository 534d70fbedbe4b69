use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use facecomp::config::{self, Config, DetectorKind, ExtractorKind, ScorerKind};
use facecomp::{factory, narrative, server, Comparator};
use facecomp_vision::loader;
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facecomp")]
#[command(
    version,
    about = "Face comparison service - similarity score plus a written analysis"
)]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to listen on, overrides [server].bind
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Compare two local image files
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, value_enum)]
        detector: Option<DetectorKind>,
        #[arg(long, value_enum)]
        extractor: Option<ExtractorKind>,
        #[arg(long, value_enum)]
        scorer: Option<ScorerKind>,
        /// Also ask the narrative provider for an analysis
        #[arg(long)]
        describe: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            serve(cfg).await
        }
        Commands::Compare {
            a,
            b,
            detector,
            extractor,
            scorer,
            describe,
        } => {
            cfg.pipeline.detector = detector.unwrap_or(cfg.pipeline.detector);
            cfg.pipeline.extractor = extractor.unwrap_or(cfg.pipeline.extractor);
            cfg.pipeline.scorer = scorer.unwrap_or(cfg.pipeline.scorer);
            if describe {
                compare_and_describe(&cfg, &a, &b).await
            } else {
                compare(&cfg, &a, &b)
            }
        }
        Commands::Config => print_config(&cfg, cli.config.as_deref()),
    }
}

/// Build a comparator from configuration. Fails before any model is loaded
/// when the provider credential is missing.
fn comparator(cfg: &Config) -> Result<Comparator> {
    let api_key = cfg
        .narrative
        .api_key()
        .context("Narrative provider credential is required")?;
    let pipeline = factory::build_pipeline(&cfg.pipeline)
        .context("Failed to initialize scoring pipeline")?;
    let narrator = narrative::build_narrator(&cfg.narrative, api_key);
    Ok(Comparator::new(Arc::new(pipeline), Arc::from(narrator)))
}

async fn serve(cfg: Config) -> Result<()> {
    let comparator = comparator(&cfg)?;
    server::serve(comparator, &cfg.server).await
}

fn compare(cfg: &Config, a: &Path, b: &Path) -> Result<()> {
    let pipeline = factory::build_pipeline(&cfg.pipeline)
        .context("Failed to initialize scoring pipeline")?;
    let image_a = loader::load_image_path(a)
        .with_context(|| format!("Failed to load {}", a.display()))?;
    let image_b = loader::load_image_path(b)
        .with_context(|| format!("Failed to load {}", b.display()))?;

    let outcome = pipeline.score_images(&image_a, &image_b)?;
    for (path, region) in [a, b].iter().zip(&outcome.regions) {
        match region {
            Some(r) => info!(
                "{}: region {}x{} at ({}, {})",
                path.display(),
                r.width,
                r.height,
                r.x,
                r.y
            ),
            None => warn!("{}: no face detected", path.display()),
        }
    }
    println!("{}", outcome.score);
    Ok(())
}

async fn compare_and_describe(cfg: &Config, a: &Path, b: &Path) -> Result<()> {
    let comparator = comparator(cfg)?;
    let read = |path: &Path| -> Result<Bytes> {
        let raw =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Bytes::from(raw))
    };

    let result = comparator.compare(read(a)?, read(b)?).await?;
    println!("Similarity score: {:.2}\n", result.similarity_score);
    println!("{}", result.analysis);
    Ok(())
}

fn print_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&config::CONFIG_PATH);
    info!("Config path: {}", path.display());
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
