//! Twin-tower fingerprint similarity network.
//!
//! One [`FingerprintEmbedder`] is owned by the network and applied to both
//! members of a pair. The towers are compared with an element-wise absolute
//! difference, so swapping the inputs cannot change the score.

use crate::preprocess::NormalizedTensor;
use candle_core::{DType, Device, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONV_CHANNELS: [usize; 3] = [32, 64, 128];
const CONV_KERNEL: usize = 3;
/// Artifact key holding `[input_size, embedding_dim]`.
const ARCHITECTURE_KEY: &str = "architecture";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("model artifact not found: {0} (run `rollcall train` to produce it)")]
    NotFound(PathBuf),
    #[error("model artifact {0} has no architecture record")]
    MissingArchitecture(PathBuf),
    #[error("variable store lock poisoned")]
    Poisoned,
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Shape parameters needed to rebuild the network from its weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    pub input_size: usize,
    pub embedding_dim: usize,
}

/// Convolutional feature extractor: conv/pool stages, global average pool, dense projection.
pub struct FingerprintEmbedder {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    proj: Linear,
}

impl FingerprintEmbedder {
    pub fn new(embedding_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig::default();
        let [c1, c2, c3] = CONV_CHANNELS;
        Ok(Self {
            conv1: conv2d(1, c1, CONV_KERNEL, cfg, vb.pp("conv1"))?,
            conv2: conv2d(c1, c2, CONV_KERNEL, cfg, vb.pp("conv2"))?,
            conv3: conv2d(c2, c3, CONV_KERNEL, cfg, vb.pp("conv3"))?,
            proj: linear(c3, embedding_dim, vb.pp("proj"))?,
        })
    }
}

impl Module for FingerprintEmbedder {
    /// `(batch, 1, H, W)` → `(batch, embedding_dim)`.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv2.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv3.forward(&xs)?.relu()?;
        // Global average pool discards spatial position.
        let xs = xs.mean((2, 3))?;
        self.proj.forward(&xs)?.relu()
    }
}

/// Shared embedder plus the logistic scoring head.
pub struct SiameseNetwork {
    embedder: FingerprintEmbedder,
    head: Linear,
    architecture: Architecture,
    device: Device,
}

impl SiameseNetwork {
    pub fn new(architecture: Architecture, vb: VarBuilder) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        Ok(Self {
            embedder: FingerprintEmbedder::new(architecture.embedding_dim, vb.pp("embedder"))?,
            head: linear(architecture.embedding_dim, 1, vb.pp("head"))?,
            architecture,
            device,
        })
    }

    /// Freshly initialized network whose variables live in `varmap`.
    pub fn init(architecture: Architecture, varmap: &VarMap, device: &Device) -> candle_core::Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::new(architecture, vb)
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Embeddings for a `(batch, 1, H, W)` input.
    pub fn embed(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.embedder.forward(xs)
    }

    /// Pre-sigmoid similarity logits, shape `(batch,)`.
    pub fn logits(&self, a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
        let ea = self.embedder.forward(a)?;
        let eb = self.embedder.forward(b)?;
        let distance = ea.sub(&eb)?.abs()?;
        self.head.forward(&distance)?.squeeze(1)
    }

    /// Similarity scores in [0, 1], shape `(batch,)`.
    pub fn scores(&self, a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::sigmoid(&self.logits(a, b)?)
    }

    /// Score a single preprocessed pair.
    pub fn score_pair(&self, a: &NormalizedTensor, b: &NormalizedTensor) -> candle_core::Result<f32> {
        let ta = stack_tensors(&[a], &self.device)?;
        let tb = stack_tensors(&[b], &self.device)?;
        let scores = self.scores(&ta, &tb)?.to_vec1::<f32>()?;
        Ok(scores.first().copied().unwrap_or(0.0))
    }
}

/// Pack preprocessed images into a `(n, 1, size, size)` tensor.
pub fn stack_tensors(items: &[&NormalizedTensor], device: &Device) -> candle_core::Result<Tensor> {
    let size = items.first().map(|t| t.size()).unwrap_or(0);
    let mut data = Vec::with_capacity(items.len() * size * size);
    for item in items {
        if item.size() != size {
            return Err(candle_core::Error::Msg(format!(
                "mixed tensor sizes in batch: {} vs {size}",
                item.size()
            )));
        }
        data.extend(item.as_array().iter().copied());
    }
    Tensor::from_vec(data, (items.len(), 1, size, size), device)
}

/// Write every variable of `varmap` plus the architecture record to one safetensors file.
pub fn save_artifact(varmap: &VarMap, architecture: Architecture, path: &Path) -> Result<(), ArtifactError> {
    let mut tensors: HashMap<String, Tensor> = {
        let vars = varmap.data().lock().map_err(|_| ArtifactError::Poisoned)?;
        vars.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };
    let arch = [architecture.input_size as u32, architecture.embedding_dim as u32];
    tensors.insert(ARCHITECTURE_KEY.to_string(), Tensor::new(&arch, &Device::Cpu)?);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    }
    candle_core::safetensors::save(&tensors, path)?;

    tracing::info!(
        path = %path.display(),
        tensors = tensors.len(),
        input_size = architecture.input_size,
        embedding_dim = architecture.embedding_dim,
        "saved fingerprint model"
    );
    Ok(())
}

/// Rebuild a network from an artifact written by [`save_artifact`].
pub fn load_artifact(path: &Path, device: &Device) -> Result<SiameseNetwork, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }

    let tensors = candle_core::safetensors::load(path, device)?;
    let arch = tensors
        .get(ARCHITECTURE_KEY)
        .ok_or_else(|| ArtifactError::MissingArchitecture(path.to_path_buf()))?
        .to_vec1::<u32>()?;
    let &[input_size, embedding_dim] = arch.as_slice() else {
        return Err(ArtifactError::MissingArchitecture(path.to_path_buf()));
    };
    let architecture = Architecture {
        input_size: input_size as usize,
        embedding_dim: embedding_dim as usize,
    };

    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    let network = SiameseNetwork::new(architecture, vb)?;

    tracing::info!(
        path = %path.display(),
        input_size = architecture.input_size,
        embedding_dim = architecture.embedding_dim,
        "loaded fingerprint model"
    );
    Ok(network)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::preprocess::normalize_image;
    use image::{DynamicImage, GrayImage, Luma};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    pub(crate) const TEST_ARCH: Architecture = Architecture {
        input_size: 32,
        embedding_dim: 16,
    };

    pub(crate) fn noise_tensor(seed: u64, size: usize) -> NormalizedTensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let img = GrayImage::from_fn(size as u32, size as u32, |_, _| Luma([rng.gen::<u8>()]));
        normalize_image(&DynamicImage::ImageLuma8(img), size)
    }

    fn network() -> (VarMap, SiameseNetwork) {
        let varmap = VarMap::new();
        let net = SiameseNetwork::init(TEST_ARCH, &varmap, &Device::Cpu).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_embedding_dim_independent_of_input_size() {
        let (_vm, net) = network();
        for size in [32, 48] {
            let x = stack_tensors(&[&noise_tensor(1, size)], &Device::Cpu).unwrap();
            let e = net.embed(&x).unwrap();
            assert_eq!(e.dims(), &[1, TEST_ARCH.embedding_dim]);
        }
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let (_vm, net) = network();
        let x = stack_tensors(&[&noise_tensor(7, 32)], &Device::Cpu).unwrap();
        let a = net.embed(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = net.embed(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_score_is_symmetric() {
        let (_vm, net) = network();
        let a = noise_tensor(1, 32);
        let b = noise_tensor(2, 32);
        let ab = net.score_pair(&a, &b).unwrap();
        let ba = net.score_pair(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert!((0.0..=1.0).contains(&ab));
    }

    #[test]
    fn test_batch_scores_have_batch_shape() {
        let (_vm, net) = network();
        let (a1, a2, b1, b2) = (noise_tensor(1, 32), noise_tensor(2, 32), noise_tensor(3, 32), noise_tensor(4, 32));
        let a = stack_tensors(&[&a1, &a2], &Device::Cpu).unwrap();
        let b = stack_tensors(&[&b1, &b2], &Device::Cpu).unwrap();
        assert_eq!(net.scores(&a, &b).unwrap().dims(), &[2]);
    }

    #[test]
    fn test_stack_rejects_mixed_sizes() {
        let a = noise_tensor(1, 32);
        let b = noise_tensor(1, 16);
        assert!(stack_tensors(&[&a, &b], &Device::Cpu).is_err());
    }

    #[test]
    fn test_artifact_round_trip_preserves_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.safetensors");
        let (varmap, net) = network();
        save_artifact(&varmap, TEST_ARCH, &path).unwrap();

        let loaded = load_artifact(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.architecture(), TEST_ARCH);

        let a = noise_tensor(11, 32);
        let b = noise_tensor(12, 32);
        let before = net.score_pair(&a, &b).unwrap();
        let after = loaded.score_pair(&a, &b).unwrap();
        assert!((before - after).abs() < 1e-6);
    }

    #[test]
    fn test_missing_artifact() {
        let err = load_artifact(Path::new("/nonexistent/model.safetensors"), &Device::Cpu);
        assert!(matches!(err, Err(ArtifactError::NotFound(_))));
    }

    #[test]
    fn test_artifact_without_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights_only.safetensors");
        let varmap = VarMap::new();
        let _net = SiameseNetwork::init(TEST_ARCH, &varmap, &Device::Cpu).unwrap();
        varmap.save(&path).unwrap();
        assert!(matches!(
            load_artifact(&path, &Device::Cpu),
            Err(ArtifactError::MissingArchitecture(_))
        ));
    }
}
