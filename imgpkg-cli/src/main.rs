//! Command-line front-end for the image bundle engine: flag parsing, log
//! formatting, and dispatch into `imgpkg_core`. Everything with real
//! engineering in it lives in the library crate; this binary is a thin
//! adapter.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use imgpkg_core::{
    expand, relocate, Bundle, CopyConfig, Level, OciDistributionGateway, Reference, RegistryGateway, RootInput, Sink,
    TracingSink,
};

#[derive(Parser)]
#[command(name = "imgpkg", version, about = "Copy, relocate, and pull content-addressed image bundles")]
struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy a bundle or image to a destination repository or tar archive.
    Copy {
        /// Bundle reference(s) to copy.
        #[arg(short = 'b', long = "bundle")]
        bundles: Vec<String>,

        /// Plain image reference(s) to copy.
        #[arg(short = 'i', long = "image")]
        images: Vec<String>,

        /// Path to a `BundleLock` or `ImagesLock` file naming what to copy.
        #[arg(long = "lock")]
        lock: Option<PathBuf>,

        /// Destination repository, as `registry/repository`.
        #[arg(long = "to-repo", conflicts_with = "to_tar")]
        to_repo: Option<String>,

        /// Destination tar archive path.
        #[arg(long = "to-tar", conflicts_with = "to_repo")]
        to_tar: Option<PathBuf>,

        /// Number of images copied concurrently.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Include layers flagged non-distributable (normally excluded).
        #[arg(long)]
        include_non_distributable: bool,
    },

    /// Pull a bundle (and any nested bundles) to a local directory.
    Pull {
        /// Bundle reference to pull.
        #[arg(short = 'b', long = "bundle")]
        bundle: String,

        /// Destination directory.
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Skip pulling bundles nested inside this one.
        #[arg(long)]
        no_recursive: bool,
    },

    /// Print shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: u8) -> Level {
    let level = match verbose {
        0 => Level::Warn,
        1 => Level::Debug,
        _ => Level::Trace,
    };
    let filter = match level {
        Level::Warn => "warn",
        Level::Debug => "debug",
        Level::Trace => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .without_time()
        .init();
    level
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = init_logging(cli.verbose);
    let sink = TracingSink::new(level);

    match cli.command {
        Command::Copy {
            bundles,
            images,
            lock,
            to_repo,
            to_tar,
            concurrency,
            include_non_distributable,
        } => run_copy(bundles, images, lock, to_repo, to_tar, concurrency, include_non_distributable, &sink).await,
        Command::Pull {
            bundle,
            output,
            no_recursive,
        } => run_pull(bundle, output, !no_recursive, &sink).await,
        Command::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            let name = cmd.get_name().to_owned();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn parse_roots(bundles: &[String], images: &[String], lock: &Option<PathBuf>) -> Result<Vec<RootInput>> {
    let mut roots = Vec::new();
    for b in bundles {
        roots.push(RootInput::Bundle(Reference::parse(b).with_context(|| format!("parsing bundle reference {b:?}"))?));
    }
    for i in images {
        roots.push(RootInput::Image(Reference::parse(i).with_context(|| format!("parsing image reference {i:?}"))?));
    }
    if let Some(path) = lock {
        let bytes = std::fs::read(path).with_context(|| format!("reading lock file {}", path.display()))?;
        roots.push(RootInput::Lock(bytes));
    }
    if roots.is_empty() {
        bail!("nothing to copy: pass --bundle, --image, or --lock");
    }
    Ok(roots)
}

#[allow(clippy::too_many_arguments)]
async fn run_copy(
    bundles: Vec<String>,
    images: Vec<String>,
    lock: Option<PathBuf>,
    to_repo: Option<String>,
    to_tar: Option<PathBuf>,
    concurrency: usize,
    include_non_distributable: bool,
    sink: &TracingSink,
) -> Result<()> {
    let roots = parse_roots(&bundles, &images, &lock)?;
    let gateway: Arc<dyn RegistryGateway> = Arc::new(OciDistributionGateway::new());
    let set = expand(&gateway, concurrency, &roots).await?;
    let refs = set.into_vec();

    match (to_repo, to_tar) {
        (Some(repo), None) => {
            let (dest_registry, dest_repository) = split_repo(&repo)?;
            let config = CopyConfig {
                dest_registry: dest_registry.clone(),
                dest_repository: dest_repository.clone(),
                concurrency,
                include_non_distributable,
            };
            let processed = relocate(&gateway, &refs, &config, sink).await?;
            for bundle_ref in &bundles {
                let reference = Reference::parse(bundle_ref)?;
                let bundle = Bundle::new(reference, gateway.clone());
                bundle.note_copy(&processed, &dest_registry).await?;
            }
            sink.line(&format!("{} {} images", "Copied".green(), processed.len()));
        }
        (None, Some(path)) => {
            let file = File::create(&path).with_context(|| format!("creating tar archive {}", path.display()))?;
            imgpkg_core::export(&gateway, &refs, include_non_distributable, file, sink).await?;
            sink.line(&format!("{} {} images to {}", "Exported".green(), refs.len(), path.display()));
        }
        _ => bail!("pass exactly one of --to-repo or --to-tar"),
    }
    Ok(())
}

async fn run_pull(bundle: String, output: PathBuf, pull_nested_bundles: bool, sink: &TracingSink) -> Result<()> {
    let reference = Reference::parse(&bundle)?;
    let gateway: Arc<dyn RegistryGateway> = Arc::new(OciDistributionGateway::new());
    let bundle = Bundle::new(reference, gateway);
    let result = bundle.pull(&output, pull_nested_bundles, sink).await?;
    sink.line(&format!(
        "{} bundle to {} ({} nested bundles)",
        "Pulled".green(),
        output.display(),
        result.nested_bundles_pulled
    ));
    Ok(())
}

fn split_repo(repo: &str) -> Result<(String, String)> {
    let reference = Reference::parse(&format!("{repo}:latest"))?;
    Ok((reference.registry().to_owned(), reference.repository().to_owned()))
}
