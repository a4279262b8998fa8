//! Asset Ledger - Marketplace CSV
//!
//! One row per generated asset, flushed as it is written, so an interrupted
//! run still leaves a valid CSV. Column order matches the NiftyKit DropKit
//! import format.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CSV_FILE_NAME: &str = "assets.csv";

/// Appended to the input file name to name the dedup output.
pub const DEDUP_SUFFIX: &str = ".new.csv";

pub const CSV_FIELDNAMES: [&str; 8] = [
    "name",
    "description",
    "attributes",
    "image",
    "animation_url",
    "background_color",
    "youtube_url",
    "external_url",
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid image URL base {base}: {source}")]
    Url {
        base: String,
        #[source]
        source: url::ParseError,
    },
}

/// A composited, stamped image. Sequence numbers start at 1 and are only
/// consumed by successful assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAsset {
    pub sequence_number: u64,
    pub file_name: String,
    pub file_path: PathBuf,
    pub trait_signature: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub name: String,
    pub description: String,
    pub attributes: String,
    pub image: String,
    #[serde(default)]
    pub animation_url: String,
    #[serde(default)]
    pub background_color: String,
    #[serde(default)]
    pub youtube_url: String,
    #[serde(default)]
    pub external_url: String,
}

impl From<&GeneratedAsset> for LedgerRow {
    fn from(asset: &GeneratedAsset) -> Self {
        Self {
            name: asset.name.clone(),
            description: asset.description.clone(),
            attributes: asset.trait_signature.clone(),
            image: asset.file_name.clone(),
            ..Default::default()
        }
    }
}

/// Append-only CSV writer.
pub struct AssetLedger {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl AssetLedger {
    /// Create `path` (must not exist) and write the header row.
    pub fn create(path: &Path) -> Result<Self, LedgerError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut writer = header_writer(file)?;
        writer.flush().map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn append(&mut self, asset: &GeneratedAsset) -> Result<(), LedgerError> {
        self.writer.serialize(LedgerRow::from(asset))?;
        self.writer.flush().map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

fn header_writer(file: File) -> Result<csv::Writer<File>, LedgerError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(CSV_FIELDNAMES)?;
    Ok(writer)
}

pub fn read_rows(path: &Path) -> Result<Vec<LedgerRow>, LedgerError> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<LedgerRow>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReport {
    pub output_path: PathBuf,
    pub rows_read: u64,
    pub unique_rows: u64,
    pub duplicate_rows: Vec<LedgerRow>,
}

impl DedupReport {
    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_rows.len() as u64
    }
}

pub fn dedup_output_path(input: &Path) -> PathBuf {
    let mut name = input
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| CSV_FILE_NAME.into());
    name.push(DEDUP_SUFFIX);
    input.with_file_name(name)
}

/// Keep the first row of every attributes signature, rewriting its image
/// into `image_url_base` joined with the relative file name.
pub fn dedup(input: &Path, image_url_base: &str) -> Result<DedupReport, LedgerError> {
    let base = Url::parse(image_url_base).map_err(|source| LedgerError::Url {
        base: image_url_base.to_string(),
        source,
    })?;

    let output_path = dedup_output_path(input);
    let out = File::create(&output_path).map_err(|source| LedgerError::Io {
        path: output_path.clone(),
        source,
    })?;
    let mut writer = header_writer(out)?;

    let mut reader = csv::Reader::from_path(input)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut report = DedupReport {
        output_path: output_path.clone(),
        rows_read: 0,
        unique_rows: 0,
        duplicate_rows: vec![],
    };

    for row in reader.deserialize::<LedgerRow>() {
        let mut row = row?;
        report.rows_read += 1;

        if seen.contains(&row.attributes) {
            warn!(name = %row.name, image = %row.image, atts = %row.attributes, "duplicate row");
            report.duplicate_rows.push(row);
            continue;
        }

        seen.insert(row.attributes.clone());
        row.image = base
            .join(&row.image)
            .map_err(|source| LedgerError::Url {
                base: image_url_base.to_string(),
                source,
            })?
            .to_string();
        writer.serialize(&row)?;
        report.unique_rows += 1;
    }

    writer.flush().map_err(|source| LedgerError::Io {
        path: output_path.clone(),
        source,
    })?;

    info!(
        output = %output_path.display(),
        rows_read = report.rows_read,
        unique = report.unique_rows,
        duplicates = report.duplicate_count(),
        "updated rows and created new CSV"
    );

    Ok(report)
}
