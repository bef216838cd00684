//! peakvox command-line interface.
//!
//! Finds blobs in a raw volume, integrates them and exports the peaks.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use peakvox_algorithms::{
    find_and_integrate, AnnularFilter, BlobFinder, BoxFilter, FinderConfig, IndexConfig,
    IntegrationConfig, ResolveStrategy, Threshold,
};
use peakvox_core::{FrameSource, Progress};
use peakvox_io::{PeakRow, PeakWriter, RawVolumeReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    PeakvoxIo(#[from] peakvox_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] peakvox_core::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid argument: {0}")]
    Argument(String),
}

/// Frame pre-filter selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Filter {
    /// Threshold raw frames
    None,
    /// Local mean over a square window
    Box,
    /// Inner disk mean minus ring mean
    Annular,
}

/// Peak table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Csv,
    Json,
}

/// Blob finding and peak integration for 3D detector scans.
#[derive(Parser)]
#[command(name = "peakvox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find and integrate peaks in a raw volume
    Find(FindArgs),

    /// Show information about a raw volume
    Info {
        /// Input PVX1 volume
        input: PathBuf,
    },
}

#[derive(Args)]
struct FindArgs {
    /// Input PVX1 volume
    input: PathBuf,

    /// Output peak table (.csv or .json)
    #[arg(short, long)]
    output: PathBuf,

    /// Output format; inferred from the extension if omitted
    #[arg(long, value_enum)]
    format: Option<Format>,

    /// Absolute intensity threshold
    #[arg(long, default_value = "80.0", conflicts_with = "relative_threshold")]
    threshold: f64,

    /// Threshold as a multiple of the median intensity
    #[arg(long)]
    relative_threshold: Option<f64>,

    /// First frame to search
    #[arg(long)]
    first_frame: Option<usize>,

    /// Frame after the last frame to search
    #[arg(long)]
    last_frame: Option<usize>,

    /// Minimum blob size in voxels
    #[arg(long, default_value = "30")]
    min_components: usize,

    /// Maximum blob size in voxels
    #[arg(long, default_value = "10000")]
    max_components: usize,

    /// Confidence level of fitted ellipsoids
    #[arg(long, default_value = "0.997")]
    confidence: f64,

    /// Frame partitions per pass (0 = one per thread)
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Size of the global thread pool (0 = rayon default)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Octree depth limit
    #[arg(long, default_value = "6")]
    max_depth: usize,

    /// Shapes per octree leaf before it splits
    #[arg(long, default_value = "6")]
    max_storage: usize,

    /// Cap on collision merge rounds
    #[arg(long, default_value = "100")]
    max_merge_iterations: usize,

    /// Resolve label equivalences transitively
    #[arg(long)]
    union_find: bool,

    /// Frame pre-filter
    #[arg(long, value_enum, default_value = "none")]
    filter: Filter,

    /// Box filter radius (pixels)
    #[arg(long, default_value = "1")]
    box_radius: usize,

    /// Annular filter radii: inner disk, ring start, ring end (pixels)
    #[arg(long, num_args = 3, value_names = ["R1", "R2", "R3"], default_values_t = [1.0, 2.0, 3.0])]
    annulus: Vec<f64>,

    /// Peak region scale
    #[arg(long, default_value = "1.0")]
    peak_scale: f64,

    /// Inner background scale
    #[arg(long, default_value = "1.0")]
    bkg_begin: f64,

    /// Outer background scale
    #[arg(long, default_value = "2.0")]
    bkg_end: f64,

    /// Keep the fitted shapes instead of re-deriving them from the data
    #[arg(long)]
    no_shape_update: bool,

    /// Smallest accepted re-derived shape volume (voxels)
    #[arg(long, default_value = "1.0")]
    min_volume: f64,

    /// Largest accepted center shift of a re-derived shape
    #[arg(long, default_value = "1.0")]
    identity_tolerance: f64,
}

impl FindArgs {
    fn finder_config(&self) -> FinderConfig {
        let threshold = self
            .relative_threshold
            .map_or(Threshold::Absolute(self.threshold), Threshold::Relative);
        let mut config = FinderConfig::new()
            .with_threshold(threshold)
            .with_min_components(self.min_components)
            .with_max_components(self.max_components)
            .with_confidence(self.confidence)
            .with_workers(self.workers)
            .with_index(
                IndexConfig::default()
                    .with_max_depth(self.max_depth)
                    .with_max_storage(self.max_storage),
            )
            .with_max_merge_iterations(self.max_merge_iterations);
        if self.union_find {
            config = config.with_strategy(ResolveStrategy::UnionFind);
        }
        if self.first_frame.is_some() || self.last_frame.is_some() {
            let start = self.first_frame.unwrap_or(0);
            config = config.with_frames(start..self.last_frame.unwrap_or(usize::MAX));
        }
        config
    }

    fn integration_config(&self) -> IntegrationConfig {
        IntegrationConfig::new()
            .with_scales(self.peak_scale, self.bkg_begin, self.bkg_end)
            .with_update_shape(!self.no_shape_update)
            .with_shape_confidence(self.confidence)
            .with_min_volume(self.min_volume)
            .with_identity_tolerance(self.identity_tolerance)
            .with_workers(self.workers)
    }

    fn finder(&self) -> Result<BlobFinder> {
        let finder = BlobFinder::new(self.finder_config())?;
        Ok(match self.filter {
            Filter::None => finder,
            Filter::Box => finder.with_filter(BoxFilter {
                radius: self.box_radius,
            }),
            Filter::Annular => finder.with_filter(AnnularFilter {
                r1: self.annulus[0],
                r2: self.annulus[1],
                r3: self.annulus[2],
            }),
        })
    }

    fn format(&self) -> Result<Format> {
        if let Some(format) = self.format {
            return Ok(format);
        }
        match extension(&self.output).as_deref() {
            Some("csv") => Ok(Format::Csv),
            Some("json") => Ok(Format::Json),
            _ => Err(CliError::Argument(format!(
                "cannot infer the format of '{}', pass --format",
                self.output.display()
            ))),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
}

fn run_find(args: &FindArgs) -> Result<()> {
    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()?;
    }
    let format = args.format()?;
    let finder = args.finder()?;
    let integration = args.integration_config();

    let start = Instant::now();
    let reader = RawVolumeReader::open(&args.input)?;
    log::info!(
        "Searching {} ({} frames of {}x{})",
        args.input.display(),
        reader.n_frames(),
        reader.n_rows(),
        reader.n_cols()
    );

    let progress = Progress::new();
    let report = find_and_integrate(&reader, &finder, &integration, &progress)?;
    let rows: Vec<PeakRow> = report.peaks.iter().map(PeakRow::from).collect();

    let mut writer = PeakWriter::create(&args.output)?;
    match format {
        Format::Csv => writer.write_csv(&rows)?,
        Format::Json => writer.write_json(&rows)?,
    }

    let stats = report.statistics;
    let selected = report.peaks.iter().filter(|p| p.feature.selected).count();
    let integrated = report.peaks.iter().filter(|p| p.integrated().is_some()).count();
    println!("Threshold: {}", report.threshold);
    println!(
        "Blobs: {} primary, {} after {} merge rounds, {} within size bounds",
        stats.primary_blobs, stats.merged_blobs, stats.merge_iterations, stats.accepted_blobs
    );
    println!(
        "Peaks: {} found, {} selected, {} integrated",
        report.peaks.len(),
        selected,
        integrated
    );
    println!(
        "Wrote {} in {:.2}s",
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn run_info(input: &Path) -> Result<()> {
    let reader = RawVolumeReader::open(input)?;
    let header = reader.header();
    let voxels = reader.n_frames() * reader.n_rows() * reader.n_cols();

    println!("File: {}", input.display());
    println!(
        "Frames: {}, rows: {}, columns: {}",
        header.n_frames, header.n_rows, header.n_cols
    );
    println!("Voxels: {}", voxels);

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for index in 0..reader.n_frames() {
        let frame = reader.frame(index)?;
        for &value in &frame {
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }
    }
    if voxels > 0 {
        println!("Intensity range: {} - {}", min, max);
        println!("Mean intensity: {:.4}", sum / voxels as f64);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match &cli.command {
        Commands::Find(args) => run_find(args),
        Commands::Info { input } => run_info(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> FindArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Find(args) => args,
            Commands::Info { .. } => panic!("expected find"),
        }
    }

    #[test]
    fn test_find_defaults_match_library() {
        let args = parse(&["peakvox", "find", "scan.pvx", "-o", "peaks.csv"]);
        assert_eq!(args.finder_config(), FinderConfig::default());
        assert_eq!(args.integration_config(), IntegrationConfig::default());
        assert_eq!(args.format().unwrap(), Format::Csv);
    }

    #[test]
    fn test_find_flags_map_to_configs() {
        let args = parse(&[
            "peakvox",
            "--verbose",
            "find",
            "scan.pvx",
            "-o",
            "peaks.out",
            "--format",
            "json",
            "--relative-threshold",
            "3.5",
            "--first-frame",
            "10",
            "--last-frame",
            "40",
            "--union-find",
            "--bkg-begin",
            "1.3",
            "--bkg-end",
            "2.3",
            "--no-shape-update",
        ]);
        let finder = args.finder_config();
        assert_eq!(finder.threshold, Threshold::Relative(3.5));
        assert_eq!(finder.frames, Some(10..40));
        assert_eq!(finder.strategy, ResolveStrategy::UnionFind);

        let integration = args.integration_config();
        assert_eq!((integration.bkg_begin, integration.bkg_end), (1.3, 2.3));
        assert!(!integration.update_shape);
        assert_eq!(args.format().unwrap(), Format::Json);
    }

    #[test]
    fn test_unknown_extension_needs_format() {
        let args = parse(&["peakvox", "find", "scan.pvx", "-o", "peaks.txt"]);
        assert!(matches!(args.format(), Err(CliError::Argument(_))));
    }

    #[test]
    fn test_thresholds_conflict() {
        let result = Cli::try_parse_from([
            "peakvox",
            "find",
            "scan.pvx",
            "-o",
            "p.csv",
            "--threshold",
            "5",
            "--relative-threshold",
            "2",
        ]);
        assert!(result.is_err());
    }
}
