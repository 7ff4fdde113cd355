//! Inference over one shared backbone with several task adapters attached.
//!
//! The backbone is loaded once. Each attached task contributes its LoRA
//! matrices (registered on the backbone's linears under the task name) and its
//! own classifier head and label mapping. A forward pass selects the task's
//! adapter through [`LoraContext`], so tasks never share heads and never copy
//! backbone weights.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{self, ArtifactError};
use crate::labels::{LabelError, LabelMap};
use crate::lora::{LoraContext, LoraManager, LoraManagerConfig, LoraManagerError, LoraModel};
use crate::model::{ClassifierHead, ModelError, VitBackbone, VitConfig};
use crate::preprocess::{ImageProcessor, ImageProcessorConfig, PreprocessError};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("task {0} is already attached")]
    TaskExists(String),
    #[error("task {0} is not attached")]
    TaskNotFound(String),
    #[error("label mapping of task {task} differs from the one it was trained with: {source}")]
    LabelMismatch {
        task: String,
        #[source]
        source: LabelError,
    },
    #[error("head of task {task} expects hidden size {head}, backbone has {backbone}")]
    HiddenSize {
        task: String,
        head: usize,
        backbone: usize,
    },
    #[error("top-k needs k > 0")]
    InvalidTopK,
    #[error("artifact: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("adapter cache: {0}")]
    Manager(#[from] LoraManagerError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("preprocessing: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// One classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub id: u32,
    /// Softmax probability of `label`.
    pub score: f32,
}

/// Summary of an attached task.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedTask {
    pub task: String,
    pub adapter_id: u32,
    pub modules: usize,
    pub num_labels: usize,
}

struct TaskEntry {
    head: ClassifierHead,
    labels: LabelMap,
    adapter_id: u32,
    dir: PathBuf,
}

/// Shared frozen backbone plus per-task adapters, heads and label mappings.
pub struct InferenceComposer {
    backbone: VitBackbone,
    processor: ImageProcessor,
    manager: LoraManager,
    tasks: HashMap<String, TaskEntry>,
}

impl std::fmt::Debug for InferenceComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceComposer")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl InferenceComposer {
    /// Load the frozen backbone once. Images are preprocessed with the ViT
    /// defaults for `vit_config.image_size` until [`Self::with_processor`].
    pub fn new(backbone_vb: VarBuilder, vit_config: &VitConfig, device: &Device) -> Result<Self, ComposeError> {
        let backbone = VitBackbone::new(vit_config, backbone_vb)?;
        let processor = ImageProcessor::new(
            ImageProcessorConfig::for_image_size(vit_config.image_size),
            device,
            DType::F32,
        )?;
        Ok(Self {
            backbone,
            processor,
            manager: LoraManager::with_defaults(device.clone(), DType::F32),
            tasks: HashMap::new(),
        })
    }

    /// Use the backbone's own `preprocessor_config.json`.
    pub fn with_processor(mut self, config: ImageProcessorConfig) -> Result<Self, ComposeError> {
        self.processor = ImageProcessor::new(config, self.backbone.device(), DType::F32)?;
        Ok(self)
    }

    /// Replace the adapter cache settings. Must be called before attaching.
    pub fn with_manager_config(mut self, config: LoraManagerConfig) -> Self {
        let device = self.backbone.device().clone();
        self.manager = LoraManager::new(device, DType::F32, config);
        self
    }

    /// Attach the artifact in `dir` as `task`.
    ///
    /// When `expected_labels` is given it must equal the artifact's stored
    /// mapping. The stored head must fit both the mapping and the backbone.
    /// When the adapter cache is full the least recently used task is detached,
    /// but only after the new adapter has passed every check, so a failed
    /// attach leaves the attached tasks as they were.
    pub fn attach(
        &mut self,
        task: &str,
        dir: impl AsRef<Path>,
        expected_labels: Option<&LabelMap>,
    ) -> Result<AttachedTask, ComposeError> {
        let dir = dir.as_ref();
        if self.tasks.contains_key(task) {
            return Err(ComposeError::TaskExists(task.to_string()));
        }

        let labels = artifact::load_labels(dir)?;
        if let Some(expected) = expected_labels {
            expected
                .ensure_matches(&labels)
                .map_err(|source| ComposeError::LabelMismatch {
                    task: task.to_string(),
                    source,
                })?;
        }

        let lora = self.manager.load(task, dir)?;
        let head = self.validate_head(task, &lora, &labels)?;
        let modules = self.backbone.register_lora(&lora)?;

        let loaded = match self.manager.insert(lora) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.backbone.remove_lora(task);
                return Err(e.into());
            }
        };
        if let Some(evicted) = &loaded.evicted {
            self.backbone.remove_lora(&evicted.name);
            self.tasks.remove(&evicted.name);
            tracing::warn!(evicted = %evicted.name, task, "adapter cache full, detached least recently used task");
        }

        tracing::info!(
            task,
            adapter_id = loaded.id,
            modules,
            labels = labels.len(),
            dir = %dir.display(),
            "attached adapter"
        );
        let attached = AttachedTask {
            task: task.to_string(),
            adapter_id: loaded.id,
            modules,
            num_labels: labels.len(),
        };
        self.tasks.insert(
            task.to_string(),
            TaskEntry {
                head,
                labels,
                adapter_id: loaded.id,
                dir: dir.to_path_buf(),
            },
        );
        Ok(attached)
    }

    fn validate_head(
        &self,
        task: &str,
        lora: &LoraModel,
        labels: &LabelMap,
    ) -> Result<ClassifierHead, ComposeError> {
        let head = artifact::head_from_lora(lora, labels)?;
        let hidden = self.backbone.config().hidden_size;
        if head.hidden_size() != hidden {
            return Err(ComposeError::HiddenSize {
                task: task.to_string(),
                head: head.hidden_size(),
                backbone: hidden,
            });
        }
        Ok(head)
    }

    /// Detach `task`, removing its adapter from every backbone module.
    pub fn detach(&mut self, task: &str) -> Result<(), ComposeError> {
        if self.tasks.remove(task).is_none() {
            return Err(ComposeError::TaskNotFound(task.to_string()));
        }
        self.manager.unload(task);
        let modules = self.backbone.remove_lora(task);
        tracing::info!(task, modules, "detached adapter");
        Ok(())
    }

    /// The composed model for `task`.
    ///
    /// Predictions made through the returned model do not mark `task` as
    /// recently used; go through [`Self::predict`] or [`Self::predict_top_k`]
    /// when the adapter cache can evict.
    pub fn model(&self, task: &str) -> Result<ComposedModel<'_>, ComposeError> {
        let (name, entry) = self
            .tasks
            .get_key_value(task)
            .ok_or_else(|| ComposeError::TaskNotFound(task.to_string()))?;
        Ok(ComposedModel {
            task: name,
            backbone: &self.backbone,
            processor: &self.processor,
            head: &entry.head,
            labels: &entry.labels,
        })
    }

    /// Classify `image` with `task`, marking the task recently used.
    pub fn predict(&mut self, task: &str, image: &DynamicImage) -> Result<Prediction, ComposeError> {
        self.manager.touch(task);
        self.model(task)?.predict(image)
    }

    /// The `k` most likely labels of `image` under `task`, marking the task
    /// recently used.
    pub fn predict_top_k(
        &mut self,
        task: &str,
        image: &DynamicImage,
        k: usize,
    ) -> Result<Vec<Prediction>, ComposeError> {
        self.manager.touch(task);
        self.model(task)?.predict_top_k(image, k)
    }

    /// Adapter cache capacity; attaching beyond it detaches the least
    /// recently used task.
    pub fn max_adapters(&self) -> usize {
        self.manager.max_adapters()
    }

    /// Attached task names, sorted.
    pub fn tasks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_attached(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }

    pub fn labels(&self, task: &str) -> Option<&LabelMap> {
        self.tasks.get(task).map(|e| &e.labels)
    }

    pub fn adapter_id(&self, task: &str) -> Option<u32> {
        self.tasks.get(task).map(|e| e.adapter_id)
    }

    pub fn artifact_dir(&self, task: &str) -> Option<&Path> {
        self.tasks.get(task).map(|e| e.dir.as_path())
    }

    pub fn backbone(&self) -> &VitBackbone {
        &self.backbone
    }

    pub fn processor(&self) -> &ImageProcessor {
        &self.processor
    }
}

/// The shared backbone seen through one task's adapter and head.
#[derive(Clone, Copy)]
pub struct ComposedModel<'a> {
    task: &'a str,
    backbone: &'a VitBackbone,
    processor: &'a ImageProcessor,
    head: &'a ClassifierHead,
    labels: &'a LabelMap,
}

impl<'a> ComposedModel<'a> {
    pub fn task(&self) -> &'a str {
        self.task
    }

    pub fn labels(&self) -> &'a LabelMap {
        self.labels
    }

    /// Eval-mode logits `[B, num_labels]` for preprocessed pixels.
    pub fn logits(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let features = self
            .backbone
            .cls_features(pixel_values, &LoraContext::with_adapter(self.task))?;
        self.head.forward(&features)
    }

    /// Class probabilities for one image.
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>, ComposeError> {
        let pixels = self.processor.preprocess(image)?.unsqueeze(0)?;
        let logits = self.logits(&pixels)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.squeeze(0)?;
        Ok(probs.to_vec1::<f32>()?)
    }

    /// Most likely label of `image`.
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction, ComposeError> {
        let mut top = self.predict_top_k(image, 1)?;
        top.pop().ok_or(ComposeError::InvalidTopK)
    }

    /// The `k` most likely labels, best first. Ties go to the lower id.
    pub fn predict_top_k(&self, image: &DynamicImage, k: usize) -> Result<Vec<Prediction>, ComposeError> {
        if k == 0 {
            return Err(ComposeError::InvalidTopK);
        }
        let probs = self.probabilities(image)?;
        let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(id, score)| Prediction {
                label: self
                    .labels
                    .name(id as u32)
                    .map(str::to_string)
                    .unwrap_or_else(|| id.to_string()),
                id: id as u32,
                score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::LABELS_FILE;
    use crate::lora::LoraConfig;
    use crate::model::{AdapterModelBuilder, ParameterCount};
    use crate::testing::{color_image, tiny_backbone_varbuilder, tiny_vit_config};
    use crate::train::{EvalReport, TrainOutcome, TrainingReport};

    fn report(task: &str) -> TrainingReport {
        let eval = EvalReport {
            accuracy: 0.5,
            loss: 0.7,
            samples: 2,
        };
        TrainingReport::new(
            task,
            ParameterCount {
                trainable: 1,
                total: 2,
            },
            2,
            TrainOutcome {
                epochs: Vec::new(),
                best_epoch: None,
                global_steps: 0,
                final_eval: eval,
                runtime_secs: 0.0,
            },
        )
    }

    /// Save an untrained adapter whose LoRA B is non-zero so it changes outputs.
    fn write_artifact(dir: &Path, task: &str, labels: &LabelMap) -> PathBuf {
        let cfg = tiny_vit_config();
        let lora = LoraConfig {
            r: 2,
            ..Default::default()
        };
        let model = AdapterModelBuilder::new(lora)
            .build(tiny_backbone_varbuilder(&cfg, DType::F32), &cfg, labels, task)
            .unwrap();
        for var in model.trainable_vars() {
            let noise = var.as_tensor().randn_like(0.0, 0.1).unwrap();
            var.set(&noise).unwrap();
        }
        artifact::save(&model, dir.join(task), &report(task)).unwrap()
    }

    fn composer() -> InferenceComposer {
        let cfg = tiny_vit_config();
        InferenceComposer::new(tiny_backbone_varbuilder(&cfg, DType::F32), &cfg, &Device::Cpu).unwrap()
    }

    fn food() -> LabelMap {
        LabelMap::from_names(["apple_pie", "chicken_curry", "sushi"]).unwrap()
    }

    fn pets() -> LabelMap {
        LabelMap::from_names(["cat", "dog"]).unwrap()
    }

    #[test]
    fn tasks_share_backbone_but_keep_their_labels() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let pets_dir = write_artifact(dir.path(), "model2", &pets());

        let mut composer = composer();
        let a = composer.attach("model1", &food_dir, Some(&food())).unwrap();
        let b = composer.attach("model2", &pets_dir, Some(&pets())).unwrap();
        assert_eq!(a.modules, 4);
        assert_ne!(a.adapter_id, b.adapter_id);
        assert_eq!(composer.tasks(), vec!["model1", "model2"]);

        let image = DynamicImage::ImageRgb8(color_image([200, 120, 40], 48, 40, 0));
        let food_pred = composer.model("model1").unwrap().predict(&image).unwrap();
        assert!(food().contains(&food_pred.label));
        assert!(!pets().contains(&food_pred.label));
        assert!((0.0..=1.0).contains(&food_pred.score));

        let pet_pred = composer.predict("model2", &image).unwrap();
        assert!(pets().contains(&pet_pred.label));
    }

    #[test]
    fn repeated_prediction_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let mut composer = composer();
        composer.attach("model1", &food_dir, None).unwrap();

        let image = DynamicImage::ImageRgb8(color_image([10, 200, 30], 32, 64, 3));
        let model = composer.model("model1").unwrap();
        let first = model.predict_top_k(&image, 3).unwrap();
        for _ in 0..3 {
            assert_eq!(model.predict_top_k(&image, 3).unwrap(), first);
        }
        assert_eq!(first.len(), 3);
        assert!(first[0].score >= first[1].score && first[1].score >= first[2].score);
        let total: f32 = first.iter().map(|p| p.score).sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(matches!(model.predict_top_k(&image, 0), Err(ComposeError::InvalidTopK)));
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let mut composer = composer();

        let reordered = LabelMap::from_names(["chicken_curry", "apple_pie", "sushi"]).unwrap();
        let err = composer.attach("model1", &food_dir, Some(&reordered)).unwrap_err();
        assert!(matches!(err, ComposeError::LabelMismatch { .. }));
        assert!(!composer.is_attached("model1"));
        assert!(!composer.backbone().has_lora("model1"));

        // Head and labels.json disagreeing in size is caught too.
        pets().save(food_dir.join(LABELS_FILE)).unwrap();
        let err = composer.attach("model1", &food_dir, None).unwrap_err();
        assert!(matches!(
            err,
            ComposeError::Artifact(ArtifactError::HeadLabelMismatch { head: 3, labels: 2 })
        ));
        assert!(!composer.backbone().has_lora("model1"));
    }

    #[test]
    fn detach_removes_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let mut composer = composer();
        composer.attach("model1", &food_dir, None).unwrap();
        assert!(matches!(
            composer.attach("model1", &food_dir, None),
            Err(ComposeError::TaskExists(_))
        ));

        composer.detach("model1").unwrap();
        assert!(!composer.backbone().has_lora("model1"));
        assert!(matches!(composer.model("model1"), Err(ComposeError::TaskNotFound(_))));
        assert!(matches!(composer.detach("model1"), Err(ComposeError::TaskNotFound(_))));

        // The name is free again.
        composer.attach("model1", &food_dir, None).unwrap();
    }

    #[test]
    fn full_cache_detaches_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let pets_dir = write_artifact(dir.path(), "model2", &pets());

        let mut composer = composer().with_manager_config(LoraManagerConfig {
            max_adapters: 1,
            optimize_on_load: true,
        });
        composer.attach("model1", &food_dir, None).unwrap();
        composer.attach("model2", &pets_dir, None).unwrap();

        assert_eq!(composer.tasks(), vec!["model2"]);
        assert!(!composer.backbone().has_lora("model1"));
        assert!(composer.backbone().has_lora("model2"));
    }

    #[test]
    fn failed_attach_on_full_cache_keeps_attached_task() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let pets_dir = write_artifact(dir.path(), "model2", &pets());
        // labels.json now disagrees with the stored two-class head.
        food().save(pets_dir.join(LABELS_FILE)).unwrap();

        let mut composer = composer().with_manager_config(LoraManagerConfig {
            max_adapters: 1,
            optimize_on_load: true,
        });
        composer.attach("model1", &food_dir, None).unwrap();
        let err = composer.attach("model2", &pets_dir, None).unwrap_err();
        assert!(matches!(
            err,
            ComposeError::Artifact(ArtifactError::HeadLabelMismatch { head: 2, labels: 3 })
        ));

        assert_eq!(composer.tasks(), vec!["model1"]);
        assert!(composer.backbone().has_lora("model1"));
        assert!(!composer.backbone().has_lora("model2"));
        let image = DynamicImage::ImageRgb8(color_image([200, 120, 40], 32, 32, 0));
        assert!(food().contains(&composer.predict("model1", &image).unwrap().label));
    }

    #[test]
    fn composer_predictions_drive_eviction_order() {
        let dir = tempfile::tempdir().unwrap();
        let food_dir = write_artifact(dir.path(), "model1", &food());
        let pets_dir = write_artifact(dir.path(), "model2", &pets());
        let third_dir = write_artifact(dir.path(), "model3", &pets());

        let mut composer = composer().with_manager_config(LoraManagerConfig {
            max_adapters: 2,
            optimize_on_load: true,
        });
        assert_eq!(composer.max_adapters(), 2);
        composer.attach("model1", &food_dir, None).unwrap();
        composer.attach("model2", &pets_dir, None).unwrap();

        // Reading through model() leaves model1 the eviction candidate...
        let image = DynamicImage::ImageRgb8(color_image([10, 200, 30], 32, 32, 1));
        composer.model("model1").unwrap().predict(&image).unwrap();
        // ...until the composer itself serves it.
        let top = composer.predict_top_k("model1", &image, 2).unwrap();
        assert_eq!(top.len(), 2);

        composer.attach("model3", &third_dir, None).unwrap();
        assert_eq!(composer.tasks(), vec!["model1", "model3"]);
        assert!(!composer.backbone().has_lora("model2"));
    }
}
