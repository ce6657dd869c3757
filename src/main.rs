use booster_support::io::{
    read_bootstrap_trees, read_tree, write_moved_species_tsv, write_support_tsv, write_taxa_per_branch_tsv,
};
use booster_support::support::{self, BoosterConfig, TransferReport};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Compute the support of every branch of a reference tree from a file of
/// bootstrap trees, and write one TSV line per branch.
#[derive(Parser, Debug)]
#[command(name = "booster", version, about = "Transfer and classical bootstrap supports")]
struct Args {
    /// Reference tree (Newick, optionally .gz)
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Bootstrap trees, one Newick tree per ';' (optionally .gz)
    #[arg(short = 'b', long = "bootstrap")]
    bootstrap: PathBuf,

    /// Bootstrap file is a NEXUS TREES block (with optional TRANSLATE)
    #[arg(long = "nexus", default_value_t = false)]
    nexus: bool,

    /// Output path for the per-branch TSV (.gz to compress)
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Support algorithm: tbe | classical
    #[arg(short = 'a', long = "algorithm", value_enum, default_value_t = AlgorithmArg::Tbe)]
    algorithm: AlgorithmArg,

    /// Worker threads (0: one per core)
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    threads: usize,

    /// Report raw mean transfer distances instead of normalized supports
    #[arg(long = "no-normalize", default_value_t = false)]
    no_normalize: bool,

    /// Write, per taxon, how often it moves across close branches (tbe only)
    #[arg(short = 'S', long = "moved-species")]
    moved_species: Option<PathBuf>,

    /// Normalized distance under which a branch counts as close
    #[arg(short = 'c', long = "cutoff", default_value_t = 0.3)]
    cutoff: f64,

    /// Write the taxa transferred across each branch (tbe only)
    #[arg(long = "taxa-per-branch")]
    taxa_per_branch: Option<PathBuf>,

    /// With --taxa-per-branch, keep only the most transferred taxa
    #[arg(long = "highest-only", default_value_t = false)]
    highest_only: bool,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AlgorithmArg {
    Tbe,
    Classical,
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);

    let t0 = Instant::now();
    let mut reference = match read_tree(&args.input) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to read reference tree {:?}: {e}", args.input);
            std::process::exit(2);
        }
    };
    info!(
        tips = reference.tip_count(),
        edges = reference.edge_count(),
        "Reading reference tree {:.3}s",
        t0.elapsed().as_secs_f64()
    );

    let (stream, reader) = match read_bootstrap_trees(&args.bootstrap, args.nexus) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to open bootstrap trees {:?}: {e}", args.bootstrap);
            std::process::exit(2);
        }
    };

    let t1 = Instant::now();
    let result = match args.algorithm {
        AlgorithmArg::Tbe => {
            let transfer_per_branch = match (&args.taxa_per_branch, args.highest_only) {
                (None, _) => TransferReport::None,
                (Some(_), false) => TransferReport::All,
                (Some(_), true) => TransferReport::Highest,
            };
            let config = BoosterConfig {
                moved_species: args.moved_species.is_some(),
                transfer_per_branch,
                moved_species_cutoff: args.cutoff,
                normalize_by_expected: !args.no_normalize,
            };
            support::booster(&mut reference, stream, args.threads, config)
        }
        AlgorithmArg::Classical => {
            if args.moved_species.is_some() || args.taxa_per_branch.is_some() {
                warn!("--moved-species and --taxa-per-branch only apply to tbe, ignoring");
            }
            support::classical(&mut reference, stream, args.threads)
        }
    };
    let report = match result {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to compute supports: {e}");
            std::process::exit(3);
        }
    };
    match reader.join() {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            error!("Failed to read bootstrap trees {:?}: {e}", args.bootstrap);
            std::process::exit(2);
        }
        Err(_) => {
            error!("Bootstrap reader thread panicked");
            std::process::exit(2);
        }
    }
    if report.trees_processed == 0 {
        error!("No bootstrap trees parsed from {:?}", args.bootstrap);
        std::process::exit(2);
    }
    info!(
        processed = report.trees_processed,
        skipped = report.trees_skipped,
        "Computing supports {:.3}s",
        t1.elapsed().as_secs_f64()
    );

    let t2 = Instant::now();
    if let Err(e) = write_support_tsv(&args.output, &reference) {
        error!("Failed to write output {:?}: {e}", args.output);
        std::process::exit(4);
    }
    if let (Some(path), Some(moved)) = (&args.moved_species, &report.moved_species) {
        if let Err(e) = write_moved_species_tsv(path, moved) {
            error!("Failed to write moved species {path:?}: {e}");
            std::process::exit(4);
        }
    }
    if let (Some(path), Some(branches)) = (&args.taxa_per_branch, &report.taxa_per_branch) {
        if let Err(e) = write_taxa_per_branch_tsv(path, branches) {
            error!("Failed to write taxa per branch {path:?}: {e}");
            std::process::exit(4);
        }
    }
    info!("Writing to output {:.3}s", t2.elapsed().as_secs_f64());
}
