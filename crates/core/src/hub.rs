//! HuggingFace Hub access: backbone snapshots and dataset parquet shards.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;

use crate::model::VitConfig;
use crate::preprocess::ImageProcessorConfig;

/// Default pretrained backbone.
pub const DEFAULT_BACKBONE: &str = "google/vit-base-patch16-224-in21k";

/// Files of a pretrained ViT backbone.
#[derive(Debug, Clone)]
pub struct BackboneFiles {
    pub config: VitConfig,
    pub preprocessor: ImageProcessorConfig,
    pub weights: Vec<PathBuf>,
}

impl BackboneFiles {
    /// Total size of the weight files in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.weights
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

fn hub_repo(api: &Api, id: &str, kind: RepoType, revision: Option<&str>) -> ApiRepo {
    let repo = match revision {
        Some(rev) => Repo::with_revision(id.to_string(), kind, rev.to_string()),
        None => Repo::new(id.to_string(), kind),
    };
    api.repo(repo)
}

/// Downloads backbone files from HuggingFace Hub (or uses cache).
pub fn fetch_backbone(model_id: &str, revision: Option<&str>) -> anyhow::Result<BackboneFiles> {
    let api = Api::new()?;
    let repo = hub_repo(&api, model_id, RepoType::Model, revision);

    let config_path = repo.get("config.json")?;
    let config: VitConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;

    // Older checkpoints ship no preprocessor config; ViT defaults apply.
    let preprocessor = match repo.get("preprocessor_config.json") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        Err(e) => {
            tracing::warn!(model = model_id, error = %e, "no preprocessor_config.json, using defaults");
            ImageProcessorConfig::for_image_size(config.image_size)
        }
    };

    let weights = weight_shards(&repo)?;

    tracing::info!(
        model = model_id,
        layers = config.num_hidden_layers,
        hidden_size = config.hidden_size,
        shards = weights.len(),
        "backbone files ready"
    );

    Ok(BackboneFiles {
        config,
        preprocessor,
        weights,
    })
}

/// Opens a backbone from a local directory laid out like a hub snapshot.
pub fn open_local_backbone(dir: impl AsRef<Path>) -> anyhow::Result<BackboneFiles> {
    let dir = dir.as_ref();
    let config: VitConfig =
        serde_json::from_str(&std::fs::read_to_string(dir.join("config.json"))?)?;

    let preprocessor_path = dir.join("preprocessor_config.json");
    let preprocessor = if preprocessor_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&preprocessor_path)?)?
    } else {
        ImageProcessorConfig::for_image_size(config.image_size)
    };

    let single = dir.join("model.safetensors");
    let weights = if single.exists() {
        vec![single]
    } else {
        let shards: BTreeSet<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        shards.into_iter().collect()
    };

    if weights.is_empty() {
        anyhow::bail!("no safetensors weights found in {}", dir.display());
    }

    Ok(BackboneFiles {
        config,
        preprocessor,
        weights,
    })
}

/// Memory-map the weight files as a frozen `VarBuilder`.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    // SAFETY: the files are not modified while the backbone is alive.
    Ok(unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? })
}

/// `model.safetensors`, or every shard named by `model.safetensors.index.json`.
/// Shards are named `model-00001-of-00004.safetensors`; zero padding makes the
/// lexicographic order the shard order.
fn weight_shards(repo: &ApiRepo) -> anyhow::Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index: ShardIndex = serde_json::from_str(&std::fs::read_to_string(
        repo.get("model.safetensors.index.json")?,
    )?)?;
    let shards: BTreeSet<&String> = index.weight_map.values().collect();
    let mut paths = Vec::with_capacity(shards.len());
    for shard in shards {
        paths.push(repo.get(shard)?);
    }
    Ok(paths)
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Parquet shards of one split of a hub dataset repository.
pub struct HubDataset {
    repo: ApiRepo,
    shards: Vec<String>,
}

impl HubDataset {
    /// List the split's shards. Nothing is downloaded until [`HubDataset::fetch`].
    pub fn open(repo_id: &str, revision: Option<&str>, split: &str) -> anyhow::Result<Self> {
        let api = Api::new()?;
        let repo = hub_repo(&api, repo_id, RepoType::Dataset, revision);

        let files: Vec<String> = repo
            .info()?
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .collect();
        let shards = select_split_shards(&files, split);
        if shards.is_empty() {
            anyhow::bail!("no parquet shards for split '{split}' in dataset {repo_id}");
        }

        tracing::info!(dataset = repo_id, split, shards = shards.len(), "dataset shards listed");
        Ok(Self { repo, shards })
    }

    pub fn shards(&self) -> &[String] {
        &self.shards
    }

    /// Download (or reuse from cache) one shard.
    pub fn fetch(&self, shard: &str) -> anyhow::Result<PathBuf> {
        Ok(self.repo.get(shard)?)
    }
}

/// Pick the parquet files of `split`, in shard order.
///
/// Prefers the `data/{split}-*.parquet` layout written by `push_to_hub` and
/// falls back to any parquet path mentioning the split.
fn select_split_shards(files: &[String], split: &str) -> Vec<String> {
    let prefix = format!("data/{split}-");
    let mut shards: Vec<String> = files
        .iter()
        .filter(|f| f.starts_with(&prefix) && f.ends_with(".parquet"))
        .cloned()
        .collect();

    if shards.is_empty() {
        shards = files
            .iter()
            .filter(|f| f.ends_with(".parquet") && f.contains(split))
            .cloned()
            .collect();
    }

    shards.sort_unstable();
    shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_split_shards_prefers_data_layout() {
        let files: Vec<String> = [
            "README.md",
            "data/train-00010-of-00011.parquet",
            "data/train-00002-of-00011.parquet",
            "data/validation-00000-of-00003.parquet",
            "plain_text/train/0000.parquet",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            select_split_shards(&files, "train"),
            vec![
                "data/train-00002-of-00011.parquet",
                "data/train-00010-of-00011.parquet",
            ]
        );
        assert_eq!(
            select_split_shards(&files, "validation"),
            vec!["data/validation-00000-of-00003.parquet"]
        );
    }

    #[test]
    fn select_split_shards_falls_back_to_split_name() {
        let files = vec![
            "default/train/0000.parquet".to_string(),
            "default/test/0000.parquet".to_string(),
        ];
        assert_eq!(
            select_split_shards(&files, "test"),
            vec!["default/test/0000.parquet"]
        );
        assert!(select_split_shards(&files, "validation").is_empty());
    }

    #[test]
    fn open_local_backbone_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::to_string(&crate::testing::tiny_vit_config()).unwrap();
        std::fs::write(dir.path().join("config.json"), config).unwrap();
        assert!(open_local_backbone(dir.path()).is_err());
    }

    #[test]
    #[ignore = "downloads the full backbone"]
    fn fetch_vit_base_in21k() {
        let files = fetch_backbone(DEFAULT_BACKBONE, None).expect("failed to fetch backbone");
        assert_eq!(files.config.hidden_size, 768);
        assert_eq!(files.config.num_hidden_layers, 12);
        assert_eq!(files.preprocessor.crop_edge(), 224);
        assert!(files.size_bytes() > 300 * 1024 * 1024);
    }
}
