//! Catalog Validation - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy: any error blocks generation, warnings are reported.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::catalog::TraitCatalog;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub layer: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub layers: usize,
    pub max_possible: u64,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Warning)
    }

    /// `rule: message` for every error, joined.
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|v| format!("{} ({}): {}", v.rule, v.layer, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, catalog: &TraitCatalog) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

/// A layer without trait images makes the product empty.
pub struct NonEmptyLayerRule;

impl ValidationRule for NonEmptyLayerRule {
    fn name(&self) -> &'static str { "non_empty_layer" }

    fn validate(&self, catalog: &TraitCatalog) -> Vec<ValidationViolation> {
        catalog
            .layers()
            .iter()
            .filter(|layer| layer.is_empty())
            .map(|layer| ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                layer: layer.name.clone(),
                message: "Layer has no trait images".to_string(),
                expected: Some("at least 1 trait image".to_string()),
                actual: Some("0".to_string()),
                remediation: vec![format!("Add trait images to {} or remove it", layer.path.display())],
            })
            .collect()
    }
}

/// Two files mapping to one value would give distinct combinations the
/// same trait signature.
pub struct DistinctTraitRule;

impl ValidationRule for DistinctTraitRule {
    fn name(&self) -> &'static str { "distinct_trait" }

    fn validate(&self, catalog: &TraitCatalog) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        for layer in catalog.layers() {
            let mut seen = HashSet::new();
            for image in &layer.images {
                if !seen.insert(image.attribute.value.as_str()) {
                    violations.push(ValidationViolation {
                        rule: self.name().to_string(),
                        severity: ViolationSeverity::Error,
                        layer: layer.name.clone(),
                        message: format!("Trait value \"{}\" appears more than once", image.attribute.value),
                        expected: Some("unique trait values per layer".to_string()),
                        actual: Some(image.name.clone()),
                        remediation: vec!["Rename or remove the duplicate trait file".to_string()],
                    });
                }
            }
        }

        violations
    }
}

/// Trait images are overlaid at the origin, so mismatched sizes usually
/// mean misaligned art.
pub struct DimensionRule;

impl ValidationRule for DimensionRule {
    fn name(&self) -> &'static str { "dimensions" }

    fn validate(&self, catalog: &TraitCatalog) -> Vec<ValidationViolation> {
        let cache = catalog.cache();
        let mut images = catalog
            .layers()
            .iter()
            .flat_map(|layer| layer.images.iter().map(move |image| (layer, image)));

        let Some(expected) = images
            .next()
            .and_then(|(_, first)| cache.get(&first.path))
            .map(|img| img.dimensions())
        else {
            return vec![];
        };

        images
            .filter_map(|(layer, image)| {
                let actual = cache.get(&image.path)?.dimensions();
                (actual != expected).then(|| ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Warning,
                    layer: layer.name.clone(),
                    message: format!("{} differs in size", image.name),
                    expected: Some(format!("{}x{}", expected.0, expected.1)),
                    actual: Some(format!("{}x{}", actual.0, actual.1)),
                    remediation: vec!["Export every trait image at the same canvas size".to_string()],
                })
            })
            .collect()
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(NonEmptyLayerRule),
                Box::new(DistinctTraitRule),
                Box::new(DimensionRule),
            ],
        }
    }

    pub fn validate(&self, catalog: &TraitCatalog) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(catalog))
            .collect();

        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);

        ValidationResult {
            valid,
            violations,
            layers: catalog.layers().len(),
            max_possible: catalog.max_possible(),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
