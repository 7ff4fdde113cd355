//! Subcommand implementations. `main.rs` only parses arguments and prints.

use std::path::{Path, PathBuf};

use anyhow::Context;
use vitlora_core::compose::{InferenceComposer, Prediction};
use vitlora_core::fetch::{self, SAMPLE_CAT_IMAGE, SAMPLE_FOOD_IMAGE};
use vitlora_core::model::Precision;
use vitlora_core::pipeline::{self, Backbone, TrainedTask};
use vitlora_core::task::TaskConfig;

use crate::config::PipelineConfig;

/// Resolve `--task` selections against the configured tasks, falling back
/// to the built-in presets. An empty selection means every configured task.
pub fn select_tasks(
    config: &PipelineConfig,
    names: &[String],
    epochs: Option<usize>,
) -> anyhow::Result<Vec<TaskConfig>> {
    let configured = config.tasks();
    let mut selected = if names.is_empty() {
        configured
    } else {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let task = match configured.iter().find(|t| &t.name == name) {
                Some(task) => task.clone(),
                None => {
                    let preset = TaskConfig::preset(name)
                        .with_context(|| format!("unknown task {name:?}"))?;
                    match &config.output_root {
                        Some(root) => preset.with_output_root(root),
                        None => preset,
                    }
                }
            };
            if out.iter().any(|t: &TaskConfig| t.name == task.name) {
                anyhow::bail!("task {} selected twice", task.name);
            }
            out.push(task);
        }
        out
    };

    if let Some(epochs) = epochs {
        selected = selected.into_iter().map(|t| t.with_epochs(epochs)).collect();
    }
    Ok(selected)
}

/// Train the selected tasks and save one artifact per task.
pub fn train(config: &PipelineConfig, tasks: Vec<TaskConfig>) -> anyhow::Result<Vec<TrainedTask>> {
    let mut settings = config.settings(config.device()?);
    settings.tasks = tasks;
    pipeline::run_all(&settings)
}

/// Attach the artifact in `adapter_dir` as `task` and classify one image.
pub fn predict(
    config: &PipelineConfig,
    task: &str,
    adapter_dir: &Path,
    image: &str,
    top_k: usize,
) -> anyhow::Result<Vec<Prediction>> {
    let backbone = load_backbone(config)?;
    let mut composer = InferenceComposer::new(backbone.varbuilder()?, backbone.config(), backbone.device())?
        .with_processor(backbone.files().preprocessor.clone())?;
    composer
        .attach(task, adapter_dir, None)
        .with_context(|| format!("attaching {}", adapter_dir.display()))?;

    let image = fetch::load_image(image)?;
    Ok(composer.predict_top_k(task, &image, top_k)?)
}

/// One cell of the demo grid.
#[derive(Debug, Clone)]
pub struct DemoResult {
    pub image: String,
    pub task: String,
    pub prediction: Prediction,
}

/// Train every configured task, compose them over one backbone and classify
/// both sample images with each task.
pub fn demo(config: &PipelineConfig, epochs: Option<usize>) -> anyhow::Result<Vec<DemoResult>> {
    let tasks = select_tasks(config, &[], epochs)?;
    let trained = train(config, tasks)?;

    let backbone = load_backbone(config)?;
    let mut composer = pipeline::compose_tasks(&backbone, &trained)?;

    let images = [
        config.food_image.as_deref().unwrap_or(SAMPLE_FOOD_IMAGE),
        config.cat_image.as_deref().unwrap_or(SAMPLE_CAT_IMAGE),
    ];
    let mut results = Vec::new();
    for source in images {
        let image = fetch::load_image(source).with_context(|| format!("loading {source}"))?;
        for task in &trained {
            let prediction = composer.predict(&task.name, &image)?;
            tracing::info!(
                image = source,
                task = %task.name,
                label = %prediction.label,
                score = prediction.score,
                "demo prediction"
            );
            results.push(DemoResult {
                image: source.to_string(),
                task: task.name.clone(),
                prediction,
            });
        }
    }
    Ok(results)
}

/// Write a config file with every default spelled out.
pub fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => PipelineConfig::default_path().context("no config directory on this platform")?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    PipelineConfig::with_defaults().save_to(&path)?;
    Ok(path)
}

fn load_backbone(config: &PipelineConfig) -> anyhow::Result<Backbone> {
    let precision = config
        .training
        .as_ref()
        .map(|t| t.precision)
        .unwrap_or(Precision::Auto);
    Backbone::load(&config.backbone(), &config.device()?, precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitlora_core::dataset::DatasetSpec;
    use vitlora_core::testing::{color_image, write_color_image_folder, write_tiny_backbone};
    use vitlora_core::train::TrainingArgs;

    fn tiny_config(root: &Path) -> PipelineConfig {
        write_tiny_backbone(root.join("backbone")).unwrap();
        write_color_image_folder(
            root.join("colors"),
            &[("red", [220, 30, 30]), ("blue", [30, 30, 220])],
            6,
        )
        .unwrap();
        PipelineConfig {
            model_dir: Some(root.join("backbone")),
            output_root: Some(root.join("out")),
            training: Some(TrainingArgs {
                batch_size: 4,
                gradient_accumulation_steps: 1,
                learning_rate: 1e-2,
                ..Default::default()
            }),
            tasks: Some(vec![TaskConfig::new(
                "colors",
                DatasetSpec::image_folder(root.join("colors")),
                2,
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_tasks() {
        let config = PipelineConfig {
            output_root: Some(PathBuf::from("/out")),
            ..Default::default()
        };

        let all = select_tasks(&config, &[], Some(1)).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|t| t.epochs == 1));

        let pets = select_tasks(&config, &["cats_vs_dogs".to_string()], None).unwrap();
        assert_eq!(pets.len(), 1);
        assert_eq!(pets[0].name, "model2");
        assert_eq!(pets[0].epochs, 2);
        assert_eq!(pets[0].output_dir, PathBuf::from("/out/model2"));

        assert!(select_tasks(&config, &["imagenet".to_string()], None).is_err());
        assert!(select_tasks(&config, &["model1".to_string(), "food101".to_string()], None).is_err());
    }

    #[test]
    fn test_train_then_predict() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());

        let tasks = select_tasks(&config, &[], None).unwrap();
        let trained = train(&config, tasks).unwrap();
        assert_eq!(trained.len(), 1);
        assert_eq!(trained[0].artifact_dir, dir.path().join("out").join("colors"));

        let query = dir.path().join("query.png");
        color_image([220, 30, 30], 32, 32, 1).save(&query).unwrap();
        let predictions = predict(
            &config,
            "colors",
            &trained[0].artifact_dir,
            query.to_str().unwrap(),
            2,
        )
        .unwrap();
        assert_eq!(predictions.len(), 2);
        assert!(predictions[0].score >= predictions[1].score);
        assert!(["red", "blue"].contains(&predictions[0].label.as_str()));
    }

    #[test]
    fn test_demo_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        let food = dir.path().join("food.png");
        let cat = dir.path().join("cat.png");
        color_image([200, 120, 40], 24, 24, 0).save(&food).unwrap();
        color_image([90, 90, 90], 24, 24, 0).save(&cat).unwrap();
        config.food_image = Some(food.display().to_string());
        config.cat_image = Some(cat.display().to_string());

        let results = demo(&config, Some(1)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.task == "colors"));
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.prediction.score)));
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vitlora.toml");

        assert_eq!(init_config(Some(path.clone()), false).unwrap(), path);
        assert!(init_config(Some(path.clone()), false).is_err());
        init_config(Some(path.clone()), true).unwrap();

        let loaded = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.tasks.unwrap().len(), 2);
    }
}
