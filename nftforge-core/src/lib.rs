//! NFTForge Core - Combinatorial NFT Generator
//!
//! # Guarantees
//! 1. Capacity Is Checked First (nothing is written for an impossible request)
//! 2. Every Signature Is Unique Within A Run
//! 3. Exhaustive Order Is Deterministic
//! 4. Sequence Numbers Are Contiguous
//! 5. The Ledger Is Valid After Every Row
//! 6. Existing Output Is Never Overwritten

pub mod catalog;
pub mod composite;
pub mod engine;
pub mod ledger;
pub mod metadata;
pub mod validation;
pub mod hashing;
pub mod pipeline;

pub use catalog::{Layer, Trait, TraitCatalog, TraitImage, DiscoveryError};
pub use composite::{Compositor, ImageCache, LayerCompositor, CompositeError};
pub use engine::{CombinationEngine, Combination, GenerationMode, TraitSignature, EngineError};
pub use ledger::{AssetLedger, GeneratedAsset, DedupReport, LedgerError};
pub use metadata::{MetadataConfig, MetadataWriter, ExifTool, DisabledWriter, MetadataError};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use hashing::{compute_manifest_hash, compute_catalog_hash, canonical_json};
pub use pipeline::{GenerationPipeline, GenerateRequest, RunManifest, PipelineError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
