//! fpack - Main entry point
//!
//! Loads a provisioning configuration, resolves it against the feature packs
//! of a local repository and installs the result.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fpack::artifact::LocalRepository;
use fpack::cli::{Cli, Commands};
use fpack::config_file::ProvisioningConfig;
use fpack::coordinate::ArtifactCoordinate;
use fpack::descriptor::loader::{JsonDescriptorLoader, load_transitive};
use fpack::materialize::{FsMaterializer, Materializer};
use fpack::plugin::{ConfigWriterPlugin, PluginRegistry};
use fpack::provisioner::Provisioner;

/// Initialize the logger with appropriate settings
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // RUST_LOG overrides the default level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    let result = match cli.command {
        Commands::Provision {
            config,
            dry_run,
            json,
        } => run_provision(&config, dry_run, json),
        Commands::Validate {
            repository,
            coordinates,
        } => run_validate(&repository, &coordinates),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn parse_coordinates(coordinates: &[String]) -> Result<Vec<ArtifactCoordinate>> {
    coordinates
        .iter()
        .map(|c| {
            c.parse::<ArtifactCoordinate>()
                .with_context(|| format!("Invalid feature-pack coordinate '{c}'"))
        })
        .collect()
}

/// Resolve a configuration file and install it unless `dry_run` is set
fn run_provision(config_path: &Path, dry_run: bool, json: bool) -> Result<()> {
    info!("Loading configuration from: {:?}", config_path);
    let config = ProvisioningConfig::load_from_file(config_path)?;
    config.validate()?;

    let repository = LocalRepository::new(&config.repository);
    let loader = JsonDescriptorLoader::new(repository.clone());
    let roots: Vec<ArtifactCoordinate> = config
        .request
        .feature_packs
        .iter()
        .map(|fp| fp.coordinate.clone())
        .collect();
    let registry = load_transitive(&loader, &roots, config.max_parallel_fetches)
        .context("Failed to load feature packs")?;

    let state = Provisioner::new(&registry)
        .provision(&config.request)
        .context("Provisioning failed")?;

    if json {
        let text = serde_json::to_string_pretty(&state)
            .context("Failed to serialize provisioned state")?;
        println!("{text}");
    } else {
        println!("{}", state.summary());
    }

    if dry_run {
        info!("Dry run, nothing installed");
        return Ok(());
    }

    let mut plugins = PluginRegistry::new();
    plugins.register_default(Arc::new(ConfigWriterPlugin));
    let mut materializer = FsMaterializer::new(&repository, &plugins)
        .with_encoding(config.encoding.clone())
        .with_max_parallel(config.max_parallel_fetches);
    if let Some(work_dir) = &config.work_dir {
        materializer = materializer.with_work_dir(work_dir);
    }
    materializer
        .materialize(&state, &config.target_dir)
        .with_context(|| format!("Failed to install into {:?}", config.target_dir))?;

    println!("✓ Installed into {}", config.target_dir.display());
    Ok(())
}

/// Load every listed pack with its dependencies and report what was found
fn run_validate(repository: &Path, coordinates: &[String]) -> Result<()> {
    let roots = parse_coordinates(coordinates)?;
    let loader = JsonDescriptorLoader::new(LocalRepository::new(repository));
    let registry = load_transitive(&loader, &roots, 4).context("Feature-pack validation failed")?;

    for coordinate in registry.coordinates() {
        println!("✓ {coordinate}");
    }
    info!(packs = registry.len(), "Feature packs are valid");
    Ok(())
}
