use std::collections::HashMap;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::loss;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::args::{LinearSchedule, TrainingArgs};
use super::metrics::{evaluate, EpochMetrics, TrainOutcome};
use super::TrainError;
use crate::dataset::DatasetSplits;
use crate::model::LoraImageClassifier;
use crate::preprocess::{ImageProcessor, TransformedSplit};

/// Gradient accumulation, AdamW and the linear schedule around a
/// [`LoraImageClassifier`]. Only the model's `VarMap` is updated.
#[derive(Debug, Clone)]
pub struct Trainer {
    args: TrainingArgs,
}

impl Trainer {
    pub fn new(args: TrainingArgs) -> Result<Self, TrainError> {
        args.validate()?;
        Ok(Self { args })
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    /// Fine-tune `model` on `splits.train` for `epochs` epochs.
    ///
    /// Every epoch reshuffles the training records with a seed derived from
    /// `args.seed`, so a run is reproducible. With `eval_every_epoch` the
    /// held-out split is scored after each epoch; with `load_best_model_at_end`
    /// the trainable weights of the most accurate epoch are restored before the
    /// final evaluation.
    pub fn train(
        &self,
        model: &mut LoraImageClassifier,
        splits: &DatasetSplits,
        processor: &ImageProcessor,
        epochs: usize,
    ) -> Result<TrainOutcome, TrainError> {
        if epochs == 0 {
            return Err(TrainError::InvalidArgs("epochs must be > 0".into()));
        }
        if splits.train.is_empty() {
            return Err(TrainError::EmptySplit("train"));
        }
        if splits.test.is_empty() {
            return Err(TrainError::EmptySplit("eval"));
        }
        let num_labels = model.labels().len();
        if splits.train.labels().len() != num_labels {
            return Err(TrainError::LabelCount {
                model: num_labels,
                dataset: splits.train.labels().len(),
            });
        }

        let args = &self.args;
        let vars = model.trainable_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: args.learning_rate,
                weight_decay: args.weight_decay,
                ..Default::default()
            },
        )?;
        let steps_per_epoch = args.steps_per_epoch(splits.train.len());
        let schedule = LinearSchedule::new(args.learning_rate, steps_per_epoch * epochs);

        tracing::info!(
            adapter = model.adapter_name(),
            train_samples = splits.train.len(),
            eval_samples = splits.test.len(),
            epochs,
            batch_size = args.batch_size,
            effective_batch_size = args.effective_batch_size(),
            total_steps = schedule.total_steps(),
            "starting training"
        );

        let train = TransformedSplit::new(&splits.train, processor);
        let mut rng = StdRng::seed_from_u64(args.seed);
        let started = Instant::now();
        let mut global_step = 0usize;
        let mut history = Vec::with_capacity(epochs);
        let mut best: Option<(usize, f64, HashMap<String, Tensor>)> = None;

        for epoch in 1..=epochs {
            let epoch_started = Instant::now();
            let mut order = train.sequential_order();
            order.shuffle(&mut rng);

            let mut accumulated: Option<GradStore> = None;
            let mut pending = 0usize;
            let mut epoch_loss = 0f64;
            let mut micro_batches = 0usize;
            let mut window_loss = 0f64;
            let mut window_batches = 0usize;

            for batch in train.batches(&order, args.batch_size) {
                let batch = batch?;
                let logits = model.forward(&batch.pixel_values, true)?;
                let loss = loss::cross_entropy(&logits, &batch.labels)?;
                let loss_value = loss.to_scalar::<f32>()? as f64;
                if !loss_value.is_finite() {
                    return Err(TrainError::NonFiniteLoss { epoch, step: global_step });
                }
                epoch_loss += loss_value;
                window_loss += loss_value;
                micro_batches += 1;
                window_batches += 1;

                let scaled = (loss / args.gradient_accumulation_steps as f64)?;
                let grads = scaled.backward()?;
                accumulated = Some(match accumulated.take() {
                    None => grads,
                    Some(acc) => accumulate(acc, &grads, &vars)?,
                });
                pending += 1;

                if pending == args.gradient_accumulation_steps {
                    if let Some(grads) = accumulated.take() {
                        optimizer_step(&mut optimizer, &schedule, global_step, &grads)?;
                    }
                    pending = 0;
                    global_step += 1;

                    if args.logging_steps > 0 && global_step % args.logging_steps == 0 {
                        tracing::info!(
                            epoch,
                            step = global_step,
                            loss = window_loss / window_batches as f64,
                            lr = optimizer.learning_rate(),
                            "training"
                        );
                        window_loss = 0.0;
                        window_batches = 0;
                    }
                }
            }

            // Flush a partial accumulation at the end of the epoch.
            if let Some(grads) = accumulated.take() {
                optimizer_step(&mut optimizer, &schedule, global_step, &grads)?;
                global_step += 1;
            }

            let eval = if args.eval_every_epoch {
                Some(evaluate(model, &splits.test, processor, args.batch_size)?)
            } else {
                None
            };

            if let (Some(report), true) = (eval, args.load_best_model_at_end) {
                let improved = best
                    .as_ref()
                    .map_or(true, |(_, accuracy, _)| report.accuracy > *accuracy);
                if improved {
                    best = Some((epoch, report.accuracy, model.trainable_tensors()?));
                }
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss: epoch_loss / micro_batches.max(1) as f64,
                learning_rate: schedule.lr_at(global_step),
                global_step,
                eval,
                elapsed_secs: epoch_started.elapsed().as_secs_f64(),
            };
            tracing::info!(
                adapter = model.adapter_name(),
                epoch,
                train_loss = metrics.train_loss,
                accuracy = eval.map(|e| e.accuracy),
                eval_loss = eval.map(|e| e.loss),
                "epoch finished"
            );
            history.push(metrics);
        }

        let best_epoch = match best {
            Some((epoch, accuracy, snapshot)) => {
                if epoch != epochs {
                    tracing::info!(epoch, accuracy, "restoring best epoch");
                }
                model.restore(&snapshot)?;
                Some(epoch)
            }
            None => None,
        };

        let final_eval = evaluate(model, &splits.test, processor, args.batch_size)?;
        let runtime_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            adapter = model.adapter_name(),
            accuracy = final_eval.accuracy,
            eval_loss = final_eval.loss,
            steps = global_step,
            runtime_secs,
            "training finished"
        );

        Ok(TrainOutcome {
            epochs: history,
            best_epoch,
            global_steps: global_step,
            final_eval,
            runtime_secs,
        })
    }
}

fn optimizer_step(
    optimizer: &mut AdamW,
    schedule: &LinearSchedule,
    step: usize,
    grads: &GradStore,
) -> candle_core::Result<()> {
    optimizer.set_learning_rate(schedule.lr_at(step));
    optimizer.step(grads)
}

/// Add the trainable-variable gradients of `grads` into `acc`.
fn accumulate(mut acc: GradStore, grads: &GradStore, vars: &[Var]) -> candle_core::Result<GradStore> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let sum = match acc.get(var.as_tensor()) {
            Some(prev) => (prev + grad)?,
            None => grad.clone(),
        };
        acc.insert(var.as_tensor(), sum);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageDataset;
    use crate::labels::LabelMap;
    use crate::lora::LoraConfig;
    use crate::model::AdapterModelBuilder;
    use crate::testing::{
        tiny_backbone_varbuilder, tiny_processor_config, tiny_vit_config, write_color_image_folder,
    };
    use crate::dataset::DatasetSpec;
    use candle_core::{DType, Device};

    fn small_args() -> TrainingArgs {
        TrainingArgs {
            batch_size: 4,
            gradient_accumulation_steps: 2,
            learning_rate: 1e-2,
            logging_steps: 1,
            ..Default::default()
        }
    }

    fn setup(dir: &std::path::Path) -> (LoraImageClassifier, DatasetSplits, ImageProcessor) {
        write_color_image_folder(dir, &[("red", [220, 20, 20]), ("blue", [20, 20, 220])], 6).unwrap();
        let dataset = DatasetSpec::image_folder(dir).load().unwrap();
        let splits = dataset.train_test_split(0.25, 42).unwrap();

        let cfg = tiny_vit_config();
        let lora = LoraConfig {
            r: 4,
            lora_alpha: 4.0,
            ..Default::default()
        };
        let model = AdapterModelBuilder::new(lora)
            .build(tiny_backbone_varbuilder(&cfg, DType::F32), &cfg, dataset.labels(), "colors")
            .unwrap();
        let processor = ImageProcessor::new(tiny_processor_config(), &Device::Cpu, DType::F32).unwrap();
        (model, splits, processor)
    }

    #[test]
    fn training_updates_adapter_and_reports_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut model, splits, processor) = setup(dir.path());
        let before = model.trainable_tensors().unwrap();

        let trainer = Trainer::new(small_args()).unwrap();
        let outcome = trainer.train(&mut model, &splits, &processor, 2).unwrap();

        assert_eq!(outcome.epochs.len(), 2);
        // 9 train samples -> 3 micro-batches -> 2 optimizer steps per epoch
        assert_eq!(outcome.global_steps, 4);
        assert!(outcome.best_epoch.is_some());
        assert!((0.0..=1.0).contains(&outcome.final_eval.accuracy));
        assert_eq!(outcome.final_eval.samples, splits.test.len());
        for epoch in &outcome.epochs {
            assert!(epoch.train_loss.is_finite());
            assert!(epoch.eval.is_some());
        }

        let after = model.trainable_tensors().unwrap();
        let key = "vit.encoder.layer.0.attention.attention.query.lora_B.weight";
        let moved = (&after[key] - &before[key])
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(moved > 0.0, "LoRA B should leave zero after training");
    }

    #[test]
    fn best_epoch_weights_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut model, splits, processor) = setup(dir.path());

        let trainer = Trainer::new(small_args()).unwrap();
        let outcome = trainer.train(&mut model, &splits, &processor, 3).unwrap();

        let best = outcome.best_epoch.unwrap();
        let best_accuracy = outcome.epochs[best - 1].eval.unwrap().accuracy;
        assert!(outcome
            .epochs
            .iter()
            .all(|e| e.eval.unwrap().accuracy <= best_accuracy));
        assert!((outcome.final_eval.accuracy - best_accuracy).abs() < 1e-12);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut model, splits, processor) = setup(dir.path());
        let trainer = Trainer::new(small_args()).unwrap();

        assert!(matches!(
            trainer.train(&mut model, &splits, &processor, 0),
            Err(TrainError::InvalidArgs(_))
        ));

        let three = LabelMap::from_names(["a", "b", "c"]).unwrap();
        let mismatched = DatasetSplits {
            train: ImageDataset::new(splits.train.records().to_vec(), three.clone()).unwrap(),
            test: ImageDataset::new(splits.test.records().to_vec(), three).unwrap(),
        };
        assert!(matches!(
            trainer.train(&mut model, &mismatched, &processor, 1),
            Err(TrainError::LabelCount { model: 2, dataset: 3 })
        ));

        assert!(Trainer::new(TrainingArgs {
            gradient_accumulation_steps: 0,
            ..Default::default()
        })
        .is_err());
    }
}
