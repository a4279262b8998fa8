//! Combination Engine - Exhaustive and Weighted-Random Generation
//!
//! Exhaustive mode walks the cartesian product in a fixed order: layers
//! outer-to-inner, trait images in discovery order. Random mode draws one
//! weighted trait image per layer and rejects any combination whose trait
//! signature was already accepted.
//!
//! Random mode is rejection sampling without a default trial cap. As the
//! accepted count approaches the max possible, expected trials per accepted
//! combination grow without bound.

use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::catalog::{max_possible, Layer, Trait, TraitImage};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No layers to combine")]
    NoLayers,

    #[error("Layer {0} has no trait images")]
    EmptyLayer(String),

    #[error("Cannot request more unique images [{requested}] than the max possible [{max_possible}]")]
    CapacityExceeded { requested: u64, max_possible: u64 },

    #[error("Invalid weights in layer {layer}: {source}")]
    Weights {
        layer: String,
        #[source]
        source: WeightedError,
    },

    #[error("Gave up after {trials} random trials with {accepted} images accepted")]
    TrialsExhausted { accepted: u64, trials: u64 },

    #[error("Signature error: {0}")]
    Signature(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum GenerationMode {
    Exhaustive,
    Random { count: u64 },
}

impl GenerationMode {
    /// Non-positive requests mean "generate everything".
    pub fn from_requested(requested: i64) -> Self {
        if requested > 0 {
            Self::Random {
                count: requested as u64,
            }
        } else {
            Self::Exhaustive
        }
    }

    pub fn requested(&self) -> Option<u64> {
        match self {
            Self::Exhaustive => None,
            Self::Random { count } => Some(*count),
        }
    }
}

/// Deterministic serialization of a combination's traits: a compact JSON
/// array of `{"trait_type":..,"value":..}` objects in layer order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraitSignature(String);

#[derive(Serialize)]
struct AttributeRef<'a> {
    trait_type: &'a str,
    value: &'a str,
}

impl TraitSignature {
    pub fn from_traits<'t>(traits: impl IntoIterator<Item = &'t Trait>) -> Result<Self, EngineError> {
        let attrs: Vec<_> = traits
            .into_iter()
            .map(|t| AttributeRef {
                trait_type: &t.trait_type,
                value: &t.value,
            })
            .collect();
        Ok(Self(serde_json::to_string(&attrs)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TraitSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exactly one trait image per layer, in layer order.
#[derive(Debug, Clone)]
pub struct Combination<'a> {
    parts: Vec<&'a TraitImage>,
}

impl<'a> Combination<'a> {
    pub fn new(parts: Vec<&'a TraitImage>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[&'a TraitImage] {
        &self.parts
    }

    pub fn traits(&self) -> impl Iterator<Item = &'a Trait> + '_ {
        self.parts.iter().copied().map(|p| &p.attribute)
    }

    pub fn signature(&self) -> Result<TraitSignature, EngineError> {
        TraitSignature::from_traits(self.traits())
    }
}

/// Reject catalogs that cannot satisfy `mode` before anything is written.
/// Returns the max possible combination count.
pub fn check_capacity(layers: &[Layer], mode: GenerationMode) -> Result<u64, EngineError> {
    if layers.is_empty() {
        return Err(EngineError::NoLayers);
    }
    if let Some(empty) = layers.iter().find(|l| l.is_empty()) {
        return Err(EngineError::EmptyLayer(empty.name.clone()));
    }

    let max = max_possible(layers);
    if let Some(requested) = mode.requested() {
        if requested > max {
            return Err(EngineError::CapacityExceeded {
                requested,
                max_possible: max,
            });
        }
    }
    Ok(max)
}

/// Lazy odometer over the full cartesian product; the last layer varies
/// fastest.
#[derive(Debug, Clone)]
pub struct ExhaustiveCombinations<'a> {
    layers: &'a [Layer],
    indices: Vec<usize>,
    done: bool,
}

impl<'a> ExhaustiveCombinations<'a> {
    pub fn new(layers: &'a [Layer]) -> Self {
        Self {
            layers,
            indices: vec![0; layers.len()],
            done: layers.is_empty() || layers.iter().any(|l| l.is_empty()),
        }
    }

    /// Start over from the first combination.
    pub fn restart(&mut self) {
        *self = Self::new(self.layers);
    }

    fn advance(&mut self) {
        for pos in (0..self.indices.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < self.layers[pos].len() {
                return;
            }
            self.indices[pos] = 0;
        }
        self.done = true;
    }
}

impl<'a> Iterator for ExhaustiveCombinations<'a> {
    type Item = Combination<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let parts = self
            .layers
            .iter()
            .zip(&self.indices)
            .map(|(layer, &idx)| &layer.images[idx])
            .collect();
        self.advance();
        Some(Combination::new(parts))
    }
}

/// Per-layer weighted draw with replacement.
#[derive(Debug, Clone)]
pub struct WeightedSampler<'a> {
    layers: &'a [Layer],
    dists: Vec<WeightedIndex<u32>>,
}

impl<'a> WeightedSampler<'a> {
    pub fn new(layers: &'a [Layer]) -> Result<Self, EngineError> {
        let dists = layers
            .iter()
            .map(|layer| {
                WeightedIndex::new(layer.weights()).map_err(|source| EngineError::Weights {
                    layer: layer.name.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { layers, dists })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Combination<'a> {
        let parts = self
            .layers
            .iter()
            .zip(&self.dists)
            .map(|(layer, dist)| &layer.images[dist.sample(rng)])
            .collect();
        Combination::new(parts)
    }
}

/// A combination handed to the sink, with the random trials it took.
#[derive(Debug, Clone)]
pub struct Emission<'a> {
    pub combination: Combination<'a>,
    pub signature: TraitSignature,
    pub trials: u64,
}

/// What the sink did with an emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Produced an asset; counts toward the requested total.
    Accepted,
    /// Failed for this combination only; the run continues.
    Skipped,
    /// Stop generating.
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineReport {
    pub accepted: u64,
    pub skipped: u64,
    pub total_trials: u64,
    pub stopped: bool,
}

pub struct CombinationEngine<'a, R> {
    layers: &'a [Layer],
    mode: GenerationMode,
    max_possible: u64,
    rng: R,
    max_trials: Option<u64>,
}

impl<'a, R: Rng> CombinationEngine<'a, R> {
    /// Fails with [`EngineError::CapacityExceeded`] before any generation.
    pub fn new(layers: &'a [Layer], mode: GenerationMode, rng: R) -> Result<Self, EngineError> {
        let max_possible = check_capacity(layers, mode)?;
        Ok(Self {
            layers,
            mode,
            max_possible,
            rng,
            max_trials: None,
        })
    }

    /// Cap random trials per accepted combination. Unbounded by default.
    pub fn with_max_trials(mut self, max_trials: Option<u64>) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn max_possible(&self) -> u64 {
        self.max_possible
    }

    pub fn run<F, E>(&mut self, sink: F) -> Result<EngineReport, E>
    where
        F: FnMut(Emission<'a>) -> Result<SinkOutcome, E>,
        E: From<EngineError>,
    {
        match self.mode {
            GenerationMode::Exhaustive => self.run_exhaustive(sink),
            GenerationMode::Random { count } => self.run_random(count, sink),
        }
    }

    fn run_exhaustive<F, E>(&mut self, mut sink: F) -> Result<EngineReport, E>
    where
        F: FnMut(Emission<'a>) -> Result<SinkOutcome, E>,
        E: From<EngineError>,
    {
        let mut report = EngineReport::default();
        for combination in ExhaustiveCombinations::new(self.layers) {
            let signature = combination.signature()?;
            report.total_trials += 1;
            let emission = Emission {
                combination,
                signature,
                trials: 1,
            };
            match sink(emission)? {
                SinkOutcome::Accepted => report.accepted += 1,
                SinkOutcome::Skipped => report.skipped += 1,
                SinkOutcome::Stop => {
                    report.stopped = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    fn run_random<F, E>(&mut self, count: u64, mut sink: F) -> Result<EngineReport, E>
    where
        F: FnMut(Emission<'a>) -> Result<SinkOutcome, E>,
        E: From<EngineError>,
    {
        let sampler = WeightedSampler::new(self.layers)?;
        let mut memo: HashSet<TraitSignature> = HashSet::new();
        let mut report = EngineReport::default();
        let mut trials = 0u64;

        while report.accepted < count {
            if let Some(max) = self.max_trials {
                if trials >= max {
                    return Err(EngineError::TrialsExhausted {
                        accepted: report.accepted,
                        trials,
                    }
                    .into());
                }
            }
            trials += 1;
            report.total_trials += 1;

            let combination = sampler.sample(&mut self.rng);
            let signature = combination.signature()?;
            if memo.contains(&signature) {
                continue;
            }

            let emission = Emission {
                combination,
                signature: signature.clone(),
                trials,
            };
            match sink(emission)? {
                SinkOutcome::Accepted => {
                    info!(trials, accepted = report.accepted + 1, "random trials");
                    memo.insert(signature);
                    report.accepted += 1;
                    trials = 0;
                }
                // Not memoized: the same combination may be drawn and tried again.
                SinkOutcome::Skipped => report.skipped += 1,
                SinkOutcome::Stop => {
                    report.stopped = true;
                    break;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    fn layer(name: &str, values: &[(&str, u32)]) -> Layer {
        let trait_type = crate::catalog::parse_trait_type(name).to_string();
        let images = values
            .iter()
            .map(|(v, w)| TraitImage {
                attribute: Trait::new(trait_type.clone(), *v, *w),
                name: format!("{trait_type}_{v}.png"),
                path: PathBuf::from(format!("{name}/{v}.png")),
            })
            .collect();
        Layer::new(name, name, images)
    }

    fn sample_layers() -> Vec<Layer> {
        vec![
            layer("01-background", &[("red", 1), ("blue", 3)]),
            layer("02-shape", &[("circle", 1), ("square", 1)]),
        ]
    }

    fn values(c: &Combination<'_>) -> Vec<String> {
        c.traits().map(|t| t.value.clone()).collect()
    }

    #[test]
    fn test_mode_from_requested() {
        assert_eq!(GenerationMode::from_requested(-1), GenerationMode::Exhaustive);
        assert_eq!(GenerationMode::from_requested(0), GenerationMode::Exhaustive);
        assert_eq!(
            GenerationMode::from_requested(3),
            GenerationMode::Random { count: 3 }
        );
    }

    #[test]
    fn test_signature_format() {
        let layers = sample_layers();
        let combo = Combination::new(vec![&layers[0].images[1], &layers[1].images[0]]);
        assert_eq!(
            combo.signature().unwrap().as_str(),
            r#"[{"trait_type":"background","value":"blue"},{"trait_type":"shape","value":"circle"}]"#
        );
    }

    #[test]
    fn test_exhaustive_order() {
        let layers = sample_layers();
        let all: Vec<_> = ExhaustiveCombinations::new(&layers).map(|c| values(&c)).collect();
        assert_eq!(
            all,
            vec![
                vec!["red", "circle"],
                vec!["red", "square"],
                vec!["blue", "circle"],
                vec!["blue", "square"],
            ]
        );
    }

    #[test]
    fn test_exhaustive_restart() {
        let layers = sample_layers();
        let mut iter = ExhaustiveCombinations::new(&layers);
        let first = values(&iter.next().unwrap());
        iter.by_ref().for_each(drop);
        assert!(iter.next().is_none());
        iter.restart();
        assert_eq!(values(&iter.next().unwrap()), first);
    }

    #[test]
    fn test_exhaustive_empty_layer_yields_nothing() {
        let layers = vec![layer("01-a", &[("x", 1)]), layer("02-b", &[])];
        assert_eq!(ExhaustiveCombinations::new(&layers).count(), 0);
    }

    #[test]
    fn test_capacity_exceeded() {
        let layers = sample_layers();
        let err = check_capacity(&layers, GenerationMode::Random { count: 5 }).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                requested: 5,
                max_possible: 4
            }
        ));
        assert_eq!(check_capacity(&layers, GenerationMode::Random { count: 4 }).unwrap(), 4);
    }

    #[test]
    fn test_empty_layer_rejected() {
        let layers = vec![layer("01-a", &[("x", 1)]), layer("02-b", &[])];
        assert!(matches!(
            check_capacity(&layers, GenerationMode::Exhaustive),
            Err(EngineError::EmptyLayer(name)) if name == "02-b"
        ));
        assert!(matches!(
            check_capacity(&[], GenerationMode::Exhaustive),
            Err(EngineError::NoLayers)
        ));
    }

    #[test]
    fn test_exhaustive_run_stops_on_request() {
        let layers = sample_layers();
        let rng = StdRng::seed_from_u64(1);
        let mut engine = CombinationEngine::new(&layers, GenerationMode::Exhaustive, rng).unwrap();
        let mut seen = 0;
        let report = engine
            .run(|_| -> Result<_, EngineError> {
                seen += 1;
                Ok(if seen == 2 { SinkOutcome::Stop } else { SinkOutcome::Accepted })
            })
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert!(report.stopped);
    }

    #[test]
    fn test_random_full_space_is_distinct() {
        let layers = sample_layers();
        let rng = StdRng::seed_from_u64(7);
        let mut engine =
            CombinationEngine::new(&layers, GenerationMode::Random { count: 4 }, rng).unwrap();
        let mut sigs = HashSet::new();
        let report = engine
            .run(|e| -> Result<_, EngineError> {
                assert!(e.trials >= 1);
                assert!(sigs.insert(e.signature));
                Ok(SinkOutcome::Accepted)
            })
            .unwrap();
        assert_eq!(report.accepted, 4);
        assert_eq!(sigs.len(), 4);
        assert!(report.total_trials >= 4);
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let layers = sample_layers();
        let collect = |seed| {
            let mut out = vec![];
            let mut engine = CombinationEngine::new(
                &layers,
                GenerationMode::Random { count: 3 },
                StdRng::seed_from_u64(seed),
            )
            .unwrap();
            engine
                .run(|e| -> Result<_, EngineError> {
                    out.push(e.signature.into_string());
                    Ok(SinkOutcome::Accepted)
                })
                .unwrap();
            out
        };
        assert_eq!(collect(42), collect(42));
    }

    #[test]
    fn test_weights_bias_sampling() {
        let layers = vec![layer("01-coin", &[("rare", 1), ("common", 99)])];
        let sampler = WeightedSampler::new(&layers).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let common = (0..1000)
            .filter(|_| values(&sampler.sample(&mut rng))[0] == "common")
            .count();
        assert!(common > 900, "common drawn {common} times");
    }

    #[test]
    fn test_skipped_is_retried_and_not_memoized() {
        let layers = vec![layer("01-only", &[("one", 1)])];
        let mut engine = CombinationEngine::new(
            &layers,
            GenerationMode::Random { count: 1 },
            StdRng::seed_from_u64(0),
        )
        .unwrap();
        let mut calls = 0;
        let report = engine
            .run(|_| -> Result<_, EngineError> {
                calls += 1;
                Ok(if calls < 3 { SinkOutcome::Skipped } else { SinkOutcome::Accepted })
            })
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.skipped, 2);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_random_trials_logged_at_info() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();

        let layers = sample_layers();
        tracing::subscriber::with_default(subscriber, || {
            let mut engine = CombinationEngine::new(
                &layers,
                GenerationMode::Random { count: 2 },
                StdRng::seed_from_u64(5),
            )
            .unwrap();
            engine
                .run(|_| -> Result<_, EngineError> { Ok(SinkOutcome::Accepted) })
                .unwrap();
        });

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.matches("random trials").count(), 2, "{text}");
        assert!(text.contains("accepted=2"));
    }

    #[test]
    fn test_trial_ceiling() {
        let layers = sample_layers();
        let mut engine = CombinationEngine::new(
            &layers,
            GenerationMode::Random { count: 2 },
            StdRng::seed_from_u64(9),
        )
        .unwrap()
        .with_max_trials(Some(5));
        let err = engine
            .run(|_| -> Result<_, EngineError> { Ok(SinkOutcome::Skipped) })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TrialsExhausted { accepted: 0, trials: 5 }
        ));
    }
}
