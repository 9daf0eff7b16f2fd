use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ngff_catalog::catalog::{Catalog, LoadOptions};
use ngff_catalog::config::{ConfigLoader, ResolvedConfig};
use ngff_catalog::error::CatalogError;
use ngff_catalog::output::{JsonOutput, LoadOutput, LogObserver, TermsOutput, TreeOutput};
use ngff_catalog::remote::HttpSource;
use ngff_catalog::terms::CacheEntry;

#[derive(Parser)]
#[command(name = "ngff-catalog")]
#[command(about = "Catalog OME-Zarr datasets listed in trees of CSV manifests")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load a manifest tree and resolve dataset metadata")]
    Load(LoadArgs),
    #[command(about = "Show the manifest tree and its rollups")]
    Tree(TreeArgs),
    #[command(about = "Resolve organism and imaging modality identifiers")]
    Terms(TermsArgs),
}

#[derive(Args)]
struct LoadArgs {
    manifest: Option<String>,

    #[arg(long)]
    sort: Option<String>,

    #[arg(long)]
    desc: bool,

    #[arg(long)]
    no_metadata: bool,

    #[arg(long)]
    no_provenance: bool,

    #[arg(long)]
    no_terms: bool,
}

#[derive(Args)]
struct TreeArgs {
    manifest: Option<String>,
}

#[derive(Args)]
struct TermsArgs {
    #[arg(long = "organism")]
    organisms: Vec<String>,

    #[arg(long = "modality")]
    modalities: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    match error {
        CatalogError::ManifestNotFound(_)
        | CatalogError::MissingManifest
        | CatalogError::MissingConfig(_) => 2,
        other if other.is_network() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Load(args) => run_load(args, config),
        Commands::Tree(args) => run_tree(args, config),
        Commands::Terms(args) => run_terms(args, config),
    }
}

fn build_catalog(config: ResolvedConfig) -> miette::Result<Catalog> {
    let source = HttpSource::new(config.timeout)?;
    let catalog = Catalog::new(Arc::new(source), config);
    catalog.table().subscribe(Arc::new(LogObserver));
    Ok(catalog)
}

fn manifest_url(arg: Option<String>, config: &ResolvedConfig) -> Result<String, CatalogError> {
    arg.or_else(|| config.manifest.clone())
        .ok_or(CatalogError::MissingManifest)
}

fn run_load(args: LoadArgs, config: ResolvedConfig) -> miette::Result<()> {
    let url = manifest_url(args.manifest, &config)?;
    let catalog = build_catalog(config)?;
    let options = LoadOptions {
        metadata: !args.no_metadata,
        provenance: !args.no_provenance,
        terms: !args.no_terms,
    };

    let report = catalog.load(&url, options)?;
    catalog.wait_for_terms();
    if let Some(column) = &args.sort {
        catalog.table().sort(column, !args.desc);
    }

    let hierarchy = catalog.hierarchy().lock();
    let output = LoadOutput {
        report,
        summary: hierarchy.root().map(|root| root.totals.into()),
        rows: catalog.table().snapshot(),
        manifests: hierarchy.flatten(),
        organisms: labels(catalog.organisms().snapshot()),
        modalities: labels(catalog.modalities().snapshot()),
    };
    JsonOutput::print_load(&output).into_diagnostic()
}

fn run_tree(args: TreeArgs, config: ResolvedConfig) -> miette::Result<()> {
    let url = manifest_url(args.manifest, &config)?;
    let catalog = build_catalog(config)?;
    let options = LoadOptions {
        metadata: false,
        provenance: false,
        terms: false,
    };
    catalog.load(&url, options)?;

    let hierarchy = catalog.hierarchy().lock();
    let output = TreeOutput {
        summary: hierarchy.root().map(|root| root.totals.into()),
        manifests: hierarchy.flatten(),
    };
    JsonOutput::print_tree(&output).into_diagnostic()
}

fn run_terms(args: TermsArgs, config: ResolvedConfig) -> miette::Result<()> {
    if args.organisms.is_empty() && args.modalities.is_empty() {
        return Err(miette::Report::msg(
            "nothing to resolve (pass --organism or --modality)",
        ));
    }
    let catalog = build_catalog(config)?;
    catalog.organisms().add_terms(&args.organisms).wait();
    catalog.modalities().add_terms(&args.modalities).wait();

    let output = TermsOutput {
        organisms: labels(catalog.organisms().snapshot()),
        modalities: labels(catalog.modalities().snapshot()),
    };
    JsonOutput::print_terms(&output).into_diagnostic()
}

fn labels(
    entries: std::collections::BTreeMap<String, CacheEntry>,
) -> std::collections::BTreeMap<String, String> {
    entries
        .into_iter()
        .map(|(key, entry)| (key, entry.label().to_string()))
        .collect()
}
