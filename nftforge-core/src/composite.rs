//! Compositing - Decoded Source Cache and Layer Flattening
//!
//! Source images are decoded once and only ever borrowed. Each composite
//! starts from a fresh copy of the bottom layer.

use image::{imageops, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::TraitImage;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Source image not cached: {0}")]
    NotCached(PathBuf),

    #[error("Nothing to composite")]
    NoLayers,
}

/// Decoded trait images keyed by the path they were discovered at.
#[derive(Default)]
pub struct ImageCache {
    images: HashMap<PathBuf, RgbaImage>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `path` unless it is already cached.
    pub fn load(&mut self, path: &Path) -> Result<&RgbaImage, CompositeError> {
        if !self.images.contains_key(path) {
            let decoded = image::open(path)
                .map_err(|source| CompositeError::Decode {
                    path: path.to_path_buf(),
                    source,
                })?
                .into_rgba8();
            self.images.insert(path.to_path_buf(), decoded);
        }
        self.images
            .get(path)
            .ok_or_else(|| CompositeError::NotCached(path.to_path_buf()))
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, image: RgbaImage) {
        self.images.insert(path.into(), image);
    }

    pub fn get(&self, path: &Path) -> Option<&RgbaImage> {
        self.images.get(path)
    }

    /// Borrow the decoded image for each part, bottom to top.
    pub fn resolve<'a>(&'a self, parts: &[&TraitImage]) -> Result<Vec<&'a RgbaImage>, CompositeError> {
        parts
            .iter()
            .map(|part| {
                self.get(&part.path)
                    .ok_or_else(|| CompositeError::NotCached(part.path.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Flattens an ordered stack of layers into one file.
pub trait Compositor {
    fn composite(&self, layers: &[&RgbaImage], out: &Path) -> Result<(), CompositeError>;
}

/// Straight alpha-over at the origin; the canvas takes the bottom layer's size.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerCompositor;

impl LayerCompositor {
    pub fn flatten(layers: &[&RgbaImage]) -> Result<RgbaImage, CompositeError> {
        let (bottom, rest) = layers.split_first().ok_or(CompositeError::NoLayers)?;
        let mut canvas = (*bottom).clone();
        for top in rest {
            imageops::overlay(&mut canvas, *top, 0, 0);
        }
        Ok(canvas)
    }
}

impl Compositor for LayerCompositor {
    fn composite(&self, layers: &[&RgbaImage], out: &Path) -> Result<(), CompositeError> {
        let canvas = Self::flatten(layers)?;
        canvas.save(out).map_err(|source| CompositeError::Save {
            path: out.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    #[test]
    fn test_opaque_top_wins() {
        let bottom = solid(2, 2, [255, 0, 0, 255]);
        let top = solid(2, 2, [0, 0, 255, 255]);
        let out = LayerCompositor::flatten(&[&bottom, &top]).unwrap();
        assert_eq!(out.get_pixel(1, 1), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_transparent_top_keeps_bottom() {
        let bottom = solid(2, 2, [255, 0, 0, 255]);
        let top = solid(2, 2, [0, 0, 0, 0]);
        let out = LayerCompositor::flatten(&[&bottom, &top]).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_sources_untouched() {
        let bottom = solid(2, 2, [255, 0, 0, 255]);
        let top = solid(1, 1, [0, 255, 0, 255]);
        let out = LayerCompositor::flatten(&[&bottom, &top]).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
        assert_eq!(out.get_pixel(1, 1), &Rgba([255, 0, 0, 255]));
        assert_eq!(bottom.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_empty_stack_rejected() {
        assert!(matches!(
            LayerCompositor::flatten(&[]),
            Err(CompositeError::NoLayers)
        ));
    }

    #[test]
    fn test_resolve_missing_source() {
        let cache = ImageCache::new();
        let part = TraitImage {
            attribute: crate::catalog::Trait::new("eyes", "blue", 1),
            name: "eyes_blue.png".to_string(),
            path: PathBuf::from("missing.png"),
        };
        assert!(matches!(
            cache.resolve(&[&part]),
            Err(CompositeError::NotCached(_))
        ));
    }
}
