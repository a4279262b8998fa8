//! Trait Catalog - Layer Discovery
//!
//! Layout: `root/<NN>-<trait_type>/<trait_type>_<value>[#<weight>].<ext>`
//! Layers are ordered by directory name, trait images by file name.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::composite::{CompositeError, ImageCache};

/// Separates the ordering prefix from the trait type in a layer directory name.
pub const LAYER_SEPARATOR: char = '-';

/// Marks the optional weight suffix in a trait file name.
pub const WEIGHT_MARKER: char = '#';

pub const DEFAULT_WEIGHT: u32 = 1;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Layers directory not found: {0}")]
    NotFound(PathBuf),

    #[error("No layer directories found in {0}")]
    NoLayers(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Image(#[from] CompositeError),
}

/// A (type, value) pair with a relative generation weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trait {
    pub trait_type: String,
    pub value: String,
    pub weight: u32,
}

impl Trait {
    pub fn new(trait_type: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            trait_type: trait_type.into(),
            value: value.into(),
            weight,
        }
    }

    /// Identity ignores weight.
    pub fn same_identity(&self, other: &Trait) -> bool {
        self.trait_type == other.trait_type && self.value == other.value
    }
}

/// One discovered trait file. The decoded pixels live in the catalog's
/// [`ImageCache`] keyed by `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitImage {
    #[serde(rename = "trait")]
    pub attribute: Trait,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub name: String,
    pub path: PathBuf,
    pub trait_type: String,
    pub images: Vec<TraitImage>,
    pub total_weight: u64,
}

impl Layer {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, images: Vec<TraitImage>) -> Self {
        let name = name.into();
        let trait_type = parse_trait_type(&name).to_string();
        let total_weight = images.iter().map(|i| u64::from(i.attribute.weight)).sum();
        Self {
            name,
            path: path.into(),
            trait_type,
            images,
            total_weight,
        }
    }

    pub fn weights(&self) -> Vec<u32> {
        self.images.iter().map(|i| i.attribute.weight).collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Trait type is everything after the first separator, or the whole name.
pub fn parse_trait_type(layer_dir_name: &str) -> &str {
    match layer_dir_name.find(LAYER_SEPARATOR) {
        Some(idx) => &layer_dir_name[idx + LAYER_SEPARATOR.len_utf8()..],
        None => layer_dir_name,
    }
}

/// Parse a trait file name such as `eyes_blue#5.png`.
///
/// The value starts one character past the first occurrence of the trait
/// type (or at the start of the name when the type is absent) and ends at
/// the weight marker or the extension. A missing, zero, or unparseable
/// weight falls back to [`DEFAULT_WEIGHT`].
pub fn parse_trait(trait_type: &str, file_name: &str) -> Trait {
    let start = match file_name.find(trait_type) {
        Some(idx) => {
            let after = idx + trait_type.len();
            let skip = file_name[after..].chars().next().map_or(0, char::len_utf8);
            after + skip
        }
        None => 0,
    };

    let end = file_name[start..]
        .rfind('.')
        .map_or(file_name.len(), |idx| start + idx);

    let mut value_end = end;
    let mut weight = DEFAULT_WEIGHT;
    if let Some(idx) = file_name[start..end].rfind(WEIGHT_MARKER) {
        value_end = start + idx;
        weight = file_name[value_end + WEIGHT_MARKER.len_utf8()..end]
            .parse::<u32>()
            .ok()
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WEIGHT);
    }

    let value: String = file_name[start..value_end]
        .chars()
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .collect();

    Trait::new(trait_type, value, weight)
}

/// Discovered layers plus the decoded source images they reference.
pub struct TraitCatalog {
    layers: Vec<Layer>,
    cache: ImageCache,
}

impl TraitCatalog {
    pub fn new(layers: Vec<Layer>, cache: ImageCache) -> Self {
        Self { layers, cache }
    }

    /// Scan and eagerly decode every trait image under `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, DiscoveryError> {
        Self::decode(scan_layers(dir)?)
    }

    /// Decode every trait image referenced by already scanned `layers`.
    pub fn decode(layers: Vec<Layer>) -> Result<Self, DiscoveryError> {
        let mut cache = ImageCache::new();
        for layer in &layers {
            for image in &layer.images {
                cache.load(&image.path)?;
            }
        }
        info!(images = cache.len(), "decoded trait images");

        Ok(Self::new(layers, cache))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Product of every layer's image count, saturating at `u64::MAX`.
    pub fn max_possible(&self) -> u64 {
        max_possible(&self.layers)
    }
}

pub fn max_possible(layers: &[Layer]) -> u64 {
    layers
        .iter()
        .fold(1u64, |acc, layer| acc.saturating_mul(layer.len() as u64))
}

/// Walk `dir` and parse names only; no image decoding.
pub fn scan_layers(dir: &Path) -> Result<Vec<Layer>, DiscoveryError> {
    if !dir.is_dir() {
        return Err(DiscoveryError::NotFound(dir.to_path_buf()));
    }

    let layer_dirs = sorted_entries(dir)?
        .into_iter()
        .filter(|(_, path)| path.is_dir())
        .collect::<Vec<_>>();

    let mut layers = vec![];
    for (layer_name, layer_path) in layer_dirs {
        info!(layer = %layer_name, "finding trait images");
        let trait_type = parse_trait_type(&layer_name).to_string();

        let mut images = vec![];
        for (file_name, file_path) in sorted_entries(&layer_path)? {
            if !file_path.is_file() {
                continue;
            }
            let attribute = parse_trait(&trait_type, &file_name);
            debug!(file = %file_name, value = %attribute.value, weight = attribute.weight, "trait");
            images.push(TraitImage {
                attribute,
                name: file_name,
                path: file_path,
            });
        }

        let layer = Layer::new(layer_name, layer_path, images);
        info!(
            layer = %layer.name,
            trait_type = %layer.trait_type,
            images = layer.len(),
            total_weight = layer.total_weight,
            "layer discovered"
        );
        layers.push(layer);
    }

    if layers.is_empty() {
        return Err(DiscoveryError::NoLayers(dir.to_path_buf()));
    }

    Ok(layers)
}

/// Visible entries of `dir`, sorted by name.
fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = vec![];
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        entries.push((name, entry.path()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}
