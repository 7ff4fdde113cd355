//! End-to-end flow: load, split, build, train, save, compose.
//!
//! Every step is a function that takes what it needs and returns a new value;
//! nothing is stored back into the task configuration.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::compose::InferenceComposer;
use crate::dataset::DatasetSplits;
use crate::hub::{self, BackboneFiles, DEFAULT_BACKBONE};
use crate::labels::LabelMap;
use crate::lora::LoraConfig;
use crate::model::{AdapterModelBuilder, Precision, VitConfig};
use crate::preprocess::ImageProcessor;
use crate::task::TaskConfig;
use crate::train::{Trainer, TrainingArgs, TrainingReport};

/// Which pretrained backbone to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneSpec {
    /// Hub model id.
    pub model_id: String,
    pub revision: Option<String>,
    /// Pre-downloaded snapshot directory; takes precedence over `model_id`.
    pub local_dir: Option<PathBuf>,
}

impl Default for BackboneSpec {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_BACKBONE.to_string(),
            revision: None,
            local_dir: None,
        }
    }
}

/// Resolved backbone files plus the device and dtype its weights load with.
#[derive(Debug, Clone)]
pub struct Backbone {
    name: String,
    files: BackboneFiles,
    device: Device,
    dtype: DType,
}

impl Backbone {
    /// Fetch (or open locally) the backbone described by `spec`.
    pub fn load(spec: &BackboneSpec, device: &Device, precision: Precision) -> anyhow::Result<Self> {
        let (name, files) = match &spec.local_dir {
            Some(dir) => (
                dir.display().to_string(),
                hub::open_local_backbone(dir)
                    .with_context(|| format!("opening backbone in {}", dir.display()))?,
            ),
            None => (
                spec.model_id.clone(),
                hub::fetch_backbone(&spec.model_id, spec.revision.as_deref())
                    .with_context(|| format!("fetching backbone {}", spec.model_id))?,
            ),
        };
        Ok(Self::from_files(name, files, device, precision.resolve(device)))
    }

    pub fn from_files(name: impl Into<String>, files: BackboneFiles, device: &Device, dtype: DType) -> Self {
        Self {
            name: name.into(),
            files,
            device: device.clone(),
            dtype,
        }
    }

    /// Fresh mmaped view of the frozen weights.
    pub fn varbuilder(&self) -> anyhow::Result<VarBuilder<'static>> {
        hub::load_weights(&self.files.weights, self.dtype, &self.device)
    }

    /// Image processor from the backbone's `preprocessor_config.json`.
    pub fn processor(&self) -> anyhow::Result<ImageProcessor> {
        Ok(ImageProcessor::new(
            self.files.preprocessor.clone(),
            &self.device,
            DType::F32,
        )?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &VitConfig {
        &self.files.config
    }

    pub fn files(&self) -> &BackboneFiles {
        &self.files
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.size_bytes()
    }
}

/// A task with its dataset loaded and split.
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub config: TaskConfig,
    pub splits: DatasetSplits,
}

impl PreparedTask {
    pub fn labels(&self) -> &LabelMap {
        self.splits.train.labels()
    }
}

/// Result of training one task.
#[derive(Debug, Clone)]
pub struct TrainedTask {
    pub name: String,
    pub artifact_dir: PathBuf,
    /// The mapping the head was trained with.
    pub labels: LabelMap,
    pub report: TrainingReport,
    pub artifact_bytes: u64,
}

/// Everything [`run_all`] needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub backbone: BackboneSpec,
    pub lora: LoraConfig,
    pub training: TrainingArgs,
    pub tasks: Vec<TaskConfig>,
    pub device: Device,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backbone: BackboneSpec::default(),
            lora: LoraConfig::default(),
            training: TrainingArgs::default(),
            tasks: TaskConfig::presets(),
            device: Device::Cpu,
        }
    }
}

/// Load the task's dataset and split it into train and held-out parts.
///
/// `processor` is only used to check that a sample of the data decodes and
/// transforms before any training starts.
pub fn prepare_task(task: &TaskConfig, processor: &ImageProcessor) -> anyhow::Result<PreparedTask> {
    let dataset = task
        .dataset
        .load()
        .with_context(|| format!("loading dataset for task {}", task.name))?;
    let splits = dataset
        .train_test_split(task.dataset.test_fraction, task.dataset.seed)
        .with_context(|| format!("splitting dataset for task {}", task.name))?;

    if let Some(first) = splits.train.get(0) {
        let image = first
            .decode()
            .with_context(|| format!("decoding first record of task {}", task.name))?;
        processor.preprocess(&image)?;
    }

    tracing::info!(
        task = %task.name,
        train = splits.train.len(),
        test = splits.test.len(),
        labels = splits.train.labels().len(),
        "task prepared"
    );
    Ok(PreparedTask {
        config: task.clone(),
        splits,
    })
}

/// Build the adapter model, train it and save the artifact.
pub fn train_task(
    backbone: &Backbone,
    prepared: &PreparedTask,
    lora: &LoraConfig,
    args: &TrainingArgs,
    processor: &ImageProcessor,
) -> anyhow::Result<TrainedTask> {
    let task = &prepared.config;
    let mut lora = lora.clone();
    if lora.base_model_name_or_path.is_none() {
        lora.base_model_name_or_path = Some(backbone.name().to_string());
    }

    let mut model = AdapterModelBuilder::new(lora).build(
        backbone.varbuilder()?,
        backbone.config(),
        prepared.labels(),
        &task.name,
    )?;

    let trainer = Trainer::new(args.clone())?;
    let outcome = trainer
        .train(&mut model, &prepared.splits, processor, task.epochs)
        .with_context(|| format!("training task {}", task.name))?;

    let report = TrainingReport::new(
        &task.name,
        model.parameter_count(),
        prepared.splits.train.len(),
        outcome,
    );
    let artifact_dir = artifact::save(&model, &task.output_dir, &report)
        .with_context(|| format!("saving adapter to {}", task.output_dir.display()))?;
    let artifact_bytes = artifact::dir_size_bytes(&artifact_dir)?;

    let backbone_bytes = backbone.size_bytes();
    if artifact_bytes >= backbone_bytes {
        tracing::warn!(
            task = %task.name,
            artifact_bytes,
            backbone_bytes,
            "adapter artifact is not smaller than the backbone"
        );
    }
    tracing::info!(
        task = %task.name,
        accuracy = report.accuracy(),
        artifact_bytes,
        backbone_bytes,
        "task trained"
    );

    Ok(TrainedTask {
        name: task.name.clone(),
        artifact_dir,
        labels: prepared.labels().clone(),
        report,
        artifact_bytes,
    })
}

/// Train every configured task in order against one backbone.
pub fn run_all(settings: &PipelineSettings) -> anyhow::Result<Vec<TrainedTask>> {
    let backbone = Backbone::load(&settings.backbone, &settings.device, settings.training.precision)?;
    let processor = backbone.processor()?;
    tracing::info!(
        backbone = backbone.name(),
        dtype = ?backbone.dtype(),
        tasks = settings.tasks.len(),
        "starting pipeline"
    );

    let mut trained = Vec::with_capacity(settings.tasks.len());
    for task in &settings.tasks {
        let prepared = prepare_task(task, &processor)?;
        trained.push(train_task(
            &backbone,
            &prepared,
            &settings.lora,
            &settings.training,
            &processor,
        )?);
    }
    Ok(trained)
}

/// One composer over `backbone` with every trained adapter attached. Each
/// adapter must still carry the label mapping it was trained with.
pub fn compose_tasks(backbone: &Backbone, trained: &[TrainedTask]) -> anyhow::Result<InferenceComposer> {
    let mut composer = InferenceComposer::new(backbone.varbuilder()?, backbone.config(), backbone.device())?
        .with_processor(backbone.files().preprocessor.clone())?;
    if trained.len() > composer.max_adapters() {
        anyhow::bail!(
            "cannot compose {} tasks: the adapter cache holds at most {}",
            trained.len(),
            composer.max_adapters()
        );
    }
    for task in trained {
        composer
            .attach(&task.name, &task.artifact_dir, Some(&task.labels))
            .with_context(|| format!("attaching adapter {}", task.name))?;
    }
    Ok(composer)
}
