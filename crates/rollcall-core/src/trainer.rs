//! Offline training of the fingerprint verifier.
//!
//! A corpus is a flat directory of scans whose file names start with the
//! identity, e.g. `012_3_1.tif` belongs to identity `012`. Pairs are built
//! from it, the twin network is fitted on binary cross-entropy, and the
//! fitted parameters are written to the configured artifact path.

use crate::config::{FingerprintConfig, TrainingConfig};
use crate::preprocess::{load_fingerprint, ImageLoadError, NormalizedTensor};
use crate::siamese::{save_artifact, stack_tensors, Architecture, ArtifactError, SiameseNetwork};
use candle_core::{Device, Tensor};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted as fingerprint scans (compared case-insensitively).
pub const SCAN_EXTENSIONS: [&str; 6] = ["tif", "tiff", "png", "bmp", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("insufficient training data: {0}")]
    InsufficientData(String),
    #[error("cannot read corpus directory {path}: {source}")]
    Corpus {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    ImageLoad(#[from] ImageLoadError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairLabel {
    Genuine,
    Impostor,
}

impl PairLabel {
    /// Binary target used by the loss: 1 for genuine, 0 for impostor.
    pub fn target(self) -> f32 {
        match self {
            PairLabel::Genuine => 1.0,
            PairLabel::Impostor => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingPair {
    pub left: PathBuf,
    pub right: PathBuf,
    pub label: PairLabel,
}

/// Identity encoded in a scan's file name: the token before the first `_`.
pub fn identity_of(file_name: &str) -> &str {
    file_name.split('_').next().unwrap_or(file_name)
}

/// Image files directly inside `dir`, sorted by path.
pub fn scan_corpus(dir: &Path) -> Result<Vec<PathBuf>, TrainError> {
    let corpus_err = |source| TrainError::Corpus {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(corpus_err)? {
        let path = entry.map_err(corpus_err)?.path();
        if path.is_file() && has_scan_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_scan_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SCAN_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

/// Group scans by identity; each group is sorted so "first image" and
/// "adjacent images" are well defined.
pub fn group_by_identity(files: &[PathBuf]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        groups
            .entry(identity_of(name).to_string())
            .or_default()
            .push(path.clone());
    }
    for group in groups.values_mut() {
        group.sort();
    }
    groups
}

/// Build a balanced list of genuine and impostor pairs.
///
/// Genuine pairs are adjacent images of one identity (`k` images give
/// `k - 1` pairs). For each genuine pair one impostor pair is drawn: two
/// distinct identities sampled uniformly, paired by their first image.
pub fn generate_pairs<R: Rng + ?Sized>(
    files: &[PathBuf],
    rng: &mut R,
) -> Result<Vec<TrainingPair>, TrainError> {
    let groups = group_by_identity(files);
    if groups.len() < 2 {
        return Err(TrainError::InsufficientData(format!(
            "need at least 2 identities to form impostor pairs, found {}",
            groups.len()
        )));
    }

    let mut pairs: Vec<TrainingPair> = groups
        .values()
        .flat_map(|images| images.windows(2))
        .map(|w| TrainingPair {
            left: w[0].clone(),
            right: w[1].clone(),
            label: PairLabel::Genuine,
        })
        .collect();

    let genuine = pairs.len();
    if genuine == 0 {
        return Err(TrainError::InsufficientData(
            "no identity has two or more images, cannot form genuine pairs".to_string(),
        ));
    }

    let identities: Vec<&Vec<PathBuf>> = groups.values().collect();
    for _ in 0..genuine {
        let picked = rand::seq::index::sample(rng, identities.len(), 2);
        pairs.push(TrainingPair {
            left: identities[picked.index(0)][0].clone(),
            right: identities[picked.index(1)][0].clone(),
            label: PairLabel::Impostor,
        });
    }

    Ok(pairs)
}

/// Split off the tail of the pair list for validation.
///
/// The split is over pairs, not identities, so validation pairs can share
/// identities with training pairs.
pub fn split_validation(
    mut pairs: Vec<TrainingPair>,
    fraction: f32,
) -> (Vec<TrainingPair>, Vec<TrainingPair>) {
    let fraction = f64::from(fraction.clamp(0.0, 1.0));
    let held_out = (pairs.len() as f64 * fraction).round() as usize;
    let mut train_len = pairs.len().saturating_sub(held_out);
    if train_len == 0 {
        train_len = pairs.len();
    }
    let validation = pairs.split_off(train_len);
    (pairs, validation)
}

/// Loss and accuracy over one pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PassMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: PassMetrics,
    /// `None` when the validation split is empty.
    pub validation: Option<PassMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub genuine_pairs: usize,
    pub impostor_pairs: usize,
    pub train_pairs: usize,
    pub validation_pairs: usize,
    pub epochs: Vec<EpochMetrics>,
    pub artifact_path: PathBuf,
}

/// Fits the twin network on a scan corpus and persists it.
pub struct Trainer {
    fingerprint: FingerprintConfig,
    training: TrainingConfig,
    device: Device,
}

impl Trainer {
    pub fn new(fingerprint: FingerprintConfig, training: TrainingConfig) -> Self {
        Self {
            fingerprint,
            training,
            device: Device::Cpu,
        }
    }

    /// Generate pairs from `corpus_dir`, fit, and write the artifact.
    ///
    /// Corpus problems surface as [`TrainError::InsufficientData`] before any
    /// image is decoded or any gradient step is taken.
    pub fn run(&self, corpus_dir: &Path) -> Result<TrainingReport, TrainError> {
        let files = scan_corpus(corpus_dir)?;
        let mut rng = StdRng::seed_from_u64(self.training.seed);

        let mut pairs = generate_pairs(&files, &mut rng)?;
        let genuine_pairs = pairs.iter().filter(|p| p.label == PairLabel::Genuine).count();
        let impostor_pairs = pairs.len() - genuine_pairs;
        tracing::info!(
            corpus = %corpus_dir.display(),
            scans = files.len(),
            genuine = genuine_pairs,
            impostor = impostor_pairs,
            "generated training pairs"
        );

        pairs.shuffle(&mut rng);
        let (train, validation) = split_validation(pairs, self.training.validation_split);
        let cache = self.preprocess_all(train.iter().chain(validation.iter()))?;

        let architecture = Architecture {
            input_size: self.fingerprint.input_size,
            embedding_dim: self.fingerprint.embedding_dim,
        };
        let varmap = VarMap::new();
        let network = SiameseNetwork::init(architecture, &varmap, &self.device)?;
        let params = ParamsAdamW {
            lr: self.training.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

        let batch_size = self.training.batch_size.max(1);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut epochs = Vec::with_capacity(self.training.epochs);

        for epoch in 1..=self.training.epochs {
            order.shuffle(&mut rng);
            let mut acc = PassAccumulator::default();

            for chunk in order.chunks(batch_size) {
                let batch = Batch::assemble(chunk.iter().map(|&i| &train[i]), &cache, &self.device)?;
                let logits = network.logits(&batch.left, &batch.right)?;
                let batch_loss = loss::binary_cross_entropy_with_logit(&logits, &batch.targets)?;
                optimizer.backward_step(&batch_loss)?;
                acc.add(&batch_loss, &logits, &batch.labels)?;
            }

            let train_metrics = acc.finish();
            let validation_metrics = evaluate(&network, &validation, &cache, batch_size, &self.device)?;

            tracing::info!(
                epoch,
                train_loss = train_metrics.loss,
                train_accuracy = train_metrics.accuracy,
                val_loss = validation_metrics.map(|m| m.loss),
                val_accuracy = validation_metrics.map(|m| m.accuracy),
                "epoch complete"
            );
            epochs.push(EpochMetrics {
                epoch,
                train: train_metrics,
                validation: validation_metrics,
            });
        }

        save_artifact(&varmap, architecture, &self.training.artifact_path)?;

        Ok(TrainingReport {
            genuine_pairs,
            impostor_pairs,
            train_pairs: train.len(),
            validation_pairs: validation.len(),
            epochs,
            artifact_path: self.training.artifact_path.clone(),
        })
    }

    /// Decode every scan referenced by `pairs` exactly once.
    fn preprocess_all<'a>(
        &self,
        pairs: impl Iterator<Item = &'a TrainingPair>,
    ) -> Result<HashMap<PathBuf, NormalizedTensor>, TrainError> {
        let mut cache = HashMap::new();
        for pair in pairs {
            for path in [&pair.left, &pair.right] {
                if !cache.contains_key(path) {
                    let tensor = load_fingerprint(path, self.fingerprint.input_size)?;
                    cache.insert(path.clone(), tensor);
                }
            }
        }
        tracing::debug!(images = cache.len(), "preprocessed training scans");
        Ok(cache)
    }
}

/// One mini-batch of stacked pair tensors.
struct Batch {
    left: Tensor,
    right: Tensor,
    targets: Tensor,
    labels: Vec<PairLabel>,
}

impl Batch {
    fn assemble<'a>(
        pairs: impl Iterator<Item = &'a TrainingPair>,
        cache: &HashMap<PathBuf, NormalizedTensor>,
        device: &Device,
    ) -> Result<Self, TrainError> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut labels = Vec::new();
        for pair in pairs {
            left.push(cached(cache, &pair.left)?);
            right.push(cached(cache, &pair.right)?);
            labels.push(pair.label);
        }
        let targets: Vec<f32> = labels.iter().map(|l| l.target()).collect();
        Ok(Self {
            left: stack_tensors(&left, device)?,
            right: stack_tensors(&right, device)?,
            targets: Tensor::from_vec(targets, labels.len(), device)?,
            labels,
        })
    }
}

fn cached<'c>(
    cache: &'c HashMap<PathBuf, NormalizedTensor>,
    path: &Path,
) -> Result<&'c NormalizedTensor, TrainError> {
    cache.get(path).ok_or_else(|| {
        TrainError::Candle(candle_core::Error::Msg(format!(
            "scan {} was not preprocessed",
            path.display()
        )))
    })
}

#[derive(Default)]
struct PassAccumulator {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl PassAccumulator {
    fn add(&mut self, batch_loss: &Tensor, logits: &Tensor, labels: &[PairLabel]) -> Result<(), TrainError> {
        let loss = batch_loss.to_scalar::<f32>()?;
        self.loss_sum += f64::from(loss) * labels.len() as f64;
        // logit >= 0 is the same decision as score >= 0.5
        let logits = logits.to_vec1::<f32>()?;
        self.correct += logits
            .iter()
            .zip(labels)
            .filter(|(&z, &label)| (z >= 0.0) == (label == PairLabel::Genuine))
            .count();
        self.seen += labels.len();
        Ok(())
    }

    fn finish(&self) -> PassMetrics {
        let n = self.seen.max(1) as f64;
        PassMetrics {
            loss: (self.loss_sum / n) as f32,
            accuracy: (self.correct as f64 / n) as f32,
        }
    }
}

fn evaluate(
    network: &SiameseNetwork,
    pairs: &[TrainingPair],
    cache: &HashMap<PathBuf, NormalizedTensor>,
    batch_size: usize,
    device: &Device,
) -> Result<Option<PassMetrics>, TrainError> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut acc = PassAccumulator::default();
    for chunk in pairs.chunks(batch_size) {
        let batch = Batch::assemble(chunk.iter(), cache, device)?;
        let logits = network.logits(&batch.left, &batch.right)?.detach();
        let batch_loss = loss::binary_cross_entropy_with_logit(&logits, &batch.targets)?;
        acc.add(&batch_loss, &logits, &batch.labels)?;
    }
    Ok(Some(acc.finish()))
}
