//! Generation Pipeline - Single Entry Point
//!
//! Order is fixed: discover, check capacity, decode, validate, and only then
//! create the output directory. Nothing is written for a run that cannot
//! succeed.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{scan_layers, DiscoveryError, Layer, TraitCatalog, TraitImage};
use crate::composite::{CompositeError, Compositor, LayerCompositor};
use crate::engine::{
    check_capacity, CombinationEngine, EngineError, EngineReport, Emission, GenerationMode,
    SinkOutcome,
};
use crate::hashing::{compute_catalog_hash, compute_manifest_hash};
use crate::ledger::{AssetLedger, GeneratedAsset, LedgerError, CSV_FILE_NAME};
use crate::metadata::{wait_for_file, ImageStamp, MetadataError, MetadataWriter, DEFAULT_WAIT_TIMEOUT};
use crate::validation::{ValidationResult, Validator};
use crate::ENGINE_VERSION;

pub const IMAGES_SUBDIR: &str = "images";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const SEQUENCE_WIDTH: usize = 5;

/// Recoverable image failures tolerated back to back before the run aborts.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 20;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Catalog validation failed: {0}")]
    ValidationFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Generated directory already exists or other OS error encountered: {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Gave up after {count} consecutive failed images; last error: {last}")]
    TooManyFailures { count: u32, last: String },

    #[error("No images generated; all {skipped} attempted combinations failed")]
    NothingGenerated { skipped: u64 },
}

impl PipelineError {
    /// 1 for capacity/configuration/run failures, 2 for output directory
    /// collisions.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::OutputDir { .. } => 2,
            _ => 1,
        }
    }

    /// Failures confined to one image file. Anything else (a dead metadata
    /// writer, a cache miss, a ledger error) fails the same way every time.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Composite(e) => matches!(e, CompositeError::Save { .. }),
            Self::Metadata(e) => matches!(
                e,
                MetadataError::NotUpdated { .. } | MetadataError::NotVisible { .. }
            ),
            _ => false,
        }
    }
}

fn default_requested() -> i64 { -1 }
fn default_wait_timeout_ms() -> u64 { DEFAULT_WAIT_TIMEOUT.as_millis() as u64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub layers_dir: PathBuf,
    pub output_dir: PathBuf,
    pub name_prefix: String,
    pub description_prefix: String,
    /// Non-positive means every combination, in order.
    #[serde(default = "default_requested")]
    pub requested: i64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_trials: Option<u64>,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl GenerateRequest {
    pub fn mode(&self) -> GenerationMode {
        GenerationMode::from_requested(self.requested)
    }
}

/// Where a run writes its files.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub images_dir: PathBuf,
    pub csv_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl OutputLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            images_dir: root.join(IMAGES_SUBDIR),
            csv_path: root.join(CSV_FILE_NAME),
            manifest_path: root.join(MANIFEST_FILE_NAME),
        }
    }

    /// Create the root and images directory. Fails if the root exists.
    pub fn create(&self) -> Result<(), PipelineError> {
        let dir_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PipelineError::OutputDir { path, source }
        };

        if let Some(parent) = self.root.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(dir_err(parent))?;
        }
        fs::create_dir(&self.root).map_err(dir_err(&self.root))?;
        fs::create_dir(&self.images_dir).map_err(dir_err(&self.images_dir))?;
        Ok(())
    }
}

/// Per-run mutable state. Sequence numbers are consumed only by assets that
/// made it into the ledger, so successes stay contiguous.
#[derive(Debug)]
pub struct RunState {
    generated: u64,
    consecutive_failures: u32,
    layout: OutputLayout,
    name_prefix: String,
    description_prefix: String,
    wait_timeout: Duration,
}

impl RunState {
    pub fn new(request: &GenerateRequest) -> Self {
        Self {
            generated: 0,
            consecutive_failures: 0,
            layout: OutputLayout::new(&request.output_dir),
            name_prefix: request.name_prefix.clone(),
            description_prefix: request.description_prefix.clone(),
            wait_timeout: Duration::from_millis(request.wait_timeout_ms),
        }
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// The number the next successful asset will get.
    pub fn next_sequence(&self) -> u64 {
        self.generated + 1
    }

    fn commit(&mut self) -> u64 {
        self.generated += 1;
        self.consecutive_failures = 0;
        self.generated
    }

    pub fn file_name(sequence: u64) -> String {
        format!("{sequence:0width$}.png", width = SEQUENCE_WIDTH)
    }

    /// Count one recoverable failure; errors once the streak hits the cap.
    fn record_failure(&mut self, error: &PipelineError) -> Result<(), PipelineError> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            return Err(PipelineError::TooManyFailures {
                count: self.consecutive_failures,
                last: error.to_string(),
            });
        }
        Ok(())
    }

    fn asset_for(&self, sequence: u64, signature: String) -> GeneratedAsset {
        let file_name = Self::file_name(sequence);
        GeneratedAsset {
            sequence_number: sequence,
            file_path: self.layout.images_dir.join(&file_name),
            file_name,
            trait_signature: signature,
            name: format!("{}{}", self.name_prefix, sequence),
            description: format!("{}{}", self.description_prefix, sequence),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSummary {
    pub name: String,
    pub trait_type: String,
    pub images: usize,
    pub total_weight: u64,
}

impl From<&Layer> for LayerSummary {
    fn from(layer: &Layer) -> Self {
        Self {
            name: layer.name.clone(),
            trait_type: layer.trait_type.clone(),
            images: layer.len(),
            total_weight: layer.total_weight,
        }
    }
}

/// Written to `manifest.json` once a run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub layers_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: GenerationMode,
    pub max_possible: u64,
    pub generated: u64,
    pub skipped: u64,
    pub total_trials: u64,
    pub seed: Option<u64>,
    pub catalog_hash: String,
    pub layers: Vec<LayerSummary>,
    pub elapsed_ms: u64,
    pub manifest_hash: String,
}

/// Catalog listing without generating anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogReport {
    pub layers: Vec<Layer>,
    pub max_possible: u64,
    pub catalog_hash: String,
    pub validation: ValidationResult,
}

/// The generation pipeline - single entry point for a run
pub struct GenerationPipeline {
    compositor: Box<dyn Compositor>,
    validator: Validator,
}

impl GenerationPipeline {
    pub fn new(compositor: Box<dyn Compositor>) -> Self {
        Self {
            compositor,
            validator: Validator::new(),
        }
    }

    /// Discover, decode, and validate a layers directory.
    pub fn inspect(&self, layers_dir: &Path) -> Result<CatalogReport, PipelineError> {
        let catalog = TraitCatalog::load_from_dir(layers_dir)?;
        let validation = self.validator.validate(&catalog);
        Ok(CatalogReport {
            layers: catalog.layers().to_vec(),
            max_possible: catalog.max_possible(),
            catalog_hash: compute_catalog_hash(catalog.layers())?,
            validation,
        })
    }

    /// Run one generation. `metadata` stays owned by the caller, which is
    /// responsible for closing it.
    pub fn generate(
        &self,
        request: &GenerateRequest,
        metadata: &mut dyn MetadataWriter,
    ) -> Result<RunManifest, PipelineError> {
        let started = Instant::now();
        let mode = request.mode();

        let layers = scan_layers(&request.layers_dir)?;
        info!(layers = layers.len(), "layers discovered");

        let max_possible = check_capacity(&layers, mode)?;
        info!(max_possible, "max possible permutations");

        let catalog = TraitCatalog::decode(layers)?;
        let validation = self.validator.validate(&catalog);
        for w in validation.warnings() {
            warn!(rule = %w.rule, layer = %w.layer, expected = ?w.expected, actual = ?w.actual, "{}", w.message);
        }
        if !validation.valid {
            return Err(PipelineError::ValidationFailed(validation.error_summary()));
        }
        let catalog_hash = compute_catalog_hash(catalog.layers())?;

        let mut state = RunState::new(request);
        state.layout.create()?;
        let mut ledger = AssetLedger::create(&state.layout.csv_path)?;

        let seed = request.seed.unwrap_or_else(rand::random);
        let mut engine = CombinationEngine::new(catalog.layers(), mode, StdRng::seed_from_u64(seed))?
            .with_max_trials(request.max_trials);

        match mode {
            GenerationMode::Exhaustive => info!("generating ALL image permutations"),
            GenerationMode::Random { count } => info!(count, seed, "generating image permutations"),
        }

        let report: EngineReport = engine.run(|emission| {
            self.emit(&catalog, &mut state, &mut ledger, &mut *metadata, emission)
        })?;

        if state.generated() == 0 && report.skipped > 0 {
            return Err(PipelineError::NothingGenerated {
                skipped: report.skipped,
            });
        }

        let elapsed = started.elapsed();
        info!(
            generated = state.generated(),
            skipped = report.skipped,
            elapsed = ?elapsed,
            "GENERATED"
        );

        let mut manifest = RunManifest {
            id: Uuid::new_v4().to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            layers_dir: request.layers_dir.clone(),
            output_dir: request.output_dir.clone(),
            mode,
            max_possible,
            generated: state.generated(),
            skipped: report.skipped,
            total_trials: report.total_trials,
            seed: matches!(mode, GenerationMode::Random { .. }).then_some(seed),
            catalog_hash,
            layers: catalog.layers().iter().map(LayerSummary::from).collect(),
            elapsed_ms: elapsed.as_millis() as u64,
            manifest_hash: String::new(), // Computed after
        };
        manifest.manifest_hash = compute_manifest_hash(&manifest)?;

        let path = &state.layout.manifest_path;
        fs::write(path, serde_json::to_string_pretty(&manifest)?).map_err(|source| {
            PipelineError::Io {
                path: path.clone(),
                source,
            }
        })?;

        Ok(manifest)
    }

    /// Turn one combination into an asset. Recoverable image failures skip
    /// the combination until [`MAX_CONSECUTIVE_FAILURES`] in a row; every
    /// other failure ends the run.
    fn emit(
        &self,
        catalog: &TraitCatalog,
        state: &mut RunState,
        ledger: &mut AssetLedger,
        metadata: &mut dyn MetadataWriter,
        emission: Emission<'_>,
    ) -> Result<SinkOutcome, PipelineError> {
        let started = Instant::now();
        let asset = state.asset_for(state.next_sequence(), emission.signature.into_string());

        if let Err(e) = self.produce(catalog, state, emission.combination.parts(), &asset, metadata) {
            discard(&asset.file_path);
            if !e.is_recoverable() {
                return Err(e);
            }
            state.record_failure(&e)?;
            warn!(file = %asset.file_path.display(), error = %e, "skipping combination");
            return Ok(SinkOutcome::Skipped);
        }

        if let Err(e) = ledger.append(&asset) {
            discard(&asset.file_path);
            return Err(e.into());
        }
        state.commit();

        info!("[{:.03}s] {}", started.elapsed().as_secs_f64(), asset.file_path.display());
        debug!(trials = emission.trials, traits = %asset.trait_signature, "generated");

        Ok(SinkOutcome::Accepted)
    }

    fn produce(
        &self,
        catalog: &TraitCatalog,
        state: &RunState,
        parts: &[&TraitImage],
        asset: &GeneratedAsset,
        metadata: &mut dyn MetadataWriter,
    ) -> Result<(), PipelineError> {
        let sources = catalog.cache().resolve(parts)?;
        self.compositor.composite(&sources, &asset.file_path)?;

        wait_for_file(&asset.file_path, state.wait_timeout)?;
        metadata.stamp(
            &asset.file_path,
            &ImageStamp::new(&asset.description, &asset.trait_signature),
        )?;
        Ok(())
    }
}

fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(file = %path.display(), error = %e, "failed to remove partial image");
        }
    }
}

impl Default for GenerationPipeline {
    fn default() -> Self {
        Self::new(Box::new(LayerCompositor))
    }
}
