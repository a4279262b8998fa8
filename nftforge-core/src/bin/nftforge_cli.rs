//! NFTForge CLI
//!
//! Commands: generate, update-csv, layers
//! Progress goes to stderr, JSON summaries to stdout.
//! Exit codes: 0 success, 1 capacity/configuration/run failure,
//! 2 output directory already exists.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use nftforge_core::{
    ledger::{self, CSV_FILE_NAME},
    metadata::{DEFAULT_CONFIG_FILE, DEFAULT_EXIFTOOL, DEFAULT_WAIT_TIMEOUT},
    DisabledWriter, ExifTool, GenerateRequest, GenerationPipeline, MetadataConfig, MetadataWriter,
};

#[derive(Parser)]
#[command(name = "nftforge-cli")]
#[command(about = "NFTForge CLI - Generates NFT composite images from trait files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output at the cost of slower run time
    #[arg(short = 'V', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate composite images, metadata CSV, and run manifest
    Generate(GenerateArgs),

    /// Check for duplicates and update the metadata CSV image links
    UpdateCsv {
        /// Generated output directory
        generated_dir: PathBuf,

        /// CSV metadata image URL base
        image_url_base: String,
    },

    /// List discovered layers and traits
    Layers {
        /// Layers input directory
        layers_dir: PathBuf,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// Layers input directory
    layers_dir: PathBuf,

    /// Generated output directory to create
    generated_dir: PathBuf,

    /// CSV metadata image name prefix
    nft_name_prefix: String,

    /// CSV metadata image description prefix
    nft_description_prefix: String,

    /// Number of images to randomly generate; otherwise generate ALL in order
    #[arg(short = 'N', long = "num", default_value_t = -1, allow_negative_numbers = true)]
    num_to_generate: i64,

    /// Seed for random generation (drawn from entropy if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Give up after this many random trials without a new image
    #[arg(long)]
    max_trials: Option<u64>,

    /// Embedded metadata YAML
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    metadata_config: PathBuf,

    /// Skip embedded metadata stamping
    #[arg(long)]
    no_metadata: bool,

    /// exiftool executable
    #[arg(long, default_value = DEFAULT_EXIFTOOL)]
    exiftool: String,

    /// How long to wait for a written image to become visible
    #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_millis() as u64)]
    wait_timeout_ms: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Generate(args) => generate(args),
        Commands::UpdateCsv { generated_dir, image_url_base } => {
            let csv_path = generated_dir.join(CSV_FILE_NAME);
            match ledger::dedup(&csv_path, &image_url_base) {
                Ok(report) => {
                    print_json(&serde_json::json!({
                        "success": true,
                        "output": report.output_path,
                        "rows_read": report.rows_read,
                        "unique_rows": report.unique_rows,
                        "duplicates_skipped": report.duplicate_count(),
                        "duplicate_rows": report.duplicate_rows,
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => fail(&e.to_string(), ExitCode::FAILURE),
            }
        }
        Commands::Layers { layers_dir } => {
            match GenerationPipeline::default().inspect(&layers_dir) {
                Ok(report) => {
                    print_json(&report);
                    if report.validation.valid {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => fail(&e.to_string(), ExitCode::from(e.exit_code())),
            }
        }
    }
}

fn generate(args: GenerateArgs) -> ExitCode {
    let request = GenerateRequest {
        layers_dir: args.layers_dir,
        output_dir: args.generated_dir,
        name_prefix: args.nft_name_prefix,
        description_prefix: args.nft_description_prefix,
        requested: args.num_to_generate,
        seed: args.seed,
        max_trials: args.max_trials,
        wait_timeout_ms: args.wait_timeout_ms,
    };

    let mut writer: Box<dyn MetadataWriter> = if args.no_metadata {
        Box::new(DisabledWriter)
    } else {
        let config = match MetadataConfig::load(&args.metadata_config) {
            Ok(c) => c,
            Err(e) => return fail(&e.to_string(), ExitCode::FAILURE),
        };
        match ExifTool::start(&args.exiftool, &config) {
            Ok(tool) => Box::new(tool),
            Err(e) => return fail(&e.to_string(), ExitCode::FAILURE),
        }
    };

    let result = GenerationPipeline::default().generate(&request, writer.as_mut());
    if let Err(e) = writer.close() {
        warn!(error = %e, "metadata writer did not shut down cleanly");
    }

    match result {
        Ok(manifest) => {
            print_json(&serde_json::json!({
                "success": true,
                "manifest": manifest,
            }));
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e.to_string(), ExitCode::from(e.exit_code())),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn fail(message: &str, code: ExitCode) -> ExitCode {
    error!("{message}");
    print_json(&serde_json::json!({
        "success": false,
        "error": message,
    }));
    code
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!(r#"{{"success": false, "error": "Failed to serialize output: {}"}}"#, e),
    }
}
