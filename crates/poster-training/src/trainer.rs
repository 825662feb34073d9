use crate::annotations::{compute_dataset_id, AnnotationTable};
use crate::artifacts::{
    make_artifact, write_json, ArtifactKind, EpochRecord, MetricsLog, TrainingManifest, TrainingMetrics,
};
use crate::augment::get_transforms;
use crate::callbacks::{CallbackAction, CallbackContext, EarlyStopping, LearningRateMonitor, ModelCheckpoint, TrainerCallback};
use crate::config::Config;
use crate::dataset::{DataLoader, PosterDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingJob, TrainingJobId};
use crate::layout::{DataLayout, ExperimentLayout};
use crate::losses::{CompositeLoss, LossAccumulator};
use crate::metrics::{sigmoid, MultilabelMetrics};
use crate::prepare::{missing_images, split_and_save_datasets};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::Registries;
use crate::scheduler::LrSchedule;
use crate::splitter::Subset;
use async_trait::async_trait;
use poster_abstraction::{Classifier, SampleSource};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Preparing,
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn prepare(&self, job: &TrainingJob) -> TrainingResult<()>;

    async fn run(&self, job: &TrainingJob, progress: &dyn ProgressSink) -> TrainingResult<TrainingManifest>;

    async fn status(&self, job_id: &TrainingJobId) -> TrainingResult<TrainerStatus>;

    async fn cancel(&self, job_id: &TrainingJobId) -> TrainingResult<()>;
}

/// Fits a registry-built classifier on the persisted split, then tests the best checkpoint.
#[derive(Clone)]
pub struct PosterTrainer {
    registries: Arc<Registries>,
    statuses: Arc<Mutex<HashMap<String, TrainerStatus>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl Default for PosterTrainer {
    fn default() -> Self {
        Self::new(Registries::builtin())
    }
}

struct Datasets {
    train: PosterDataset,
    valid: PosterDataset,
    test: PosterDataset,
}

/// Everything resolved from the config before the first epoch.
struct Session<'a> {
    job: &'a TrainingJob,
    progress: &'a dyn ProgressSink,
    model: Box<dyn Classifier>,
    loss: CompositeLoss,
    schedule: LrSchedule,
    loader: DataLoader,
    eval_loader: DataLoader,
    optimizer_key: &'static str,
}

impl PosterTrainer {
    #[must_use]
    pub fn new(registries: Registries) -> Self {
        Self {
            registries: Arc::new(registries),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn set_status(&self, job_id: &TrainingJobId, status: TrainerStatus) {
        if let Ok(mut s) = self.statuses.lock() {
            s.insert(job_id.0.clone(), status);
        }
    }

    fn check_cancelled(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        let cancelled = self.cancelled.lock().map(|c| c.contains(&job_id.0)).unwrap_or(false);
        if cancelled { Err(TrainingError::Cancelled) } else { Ok(()) }
    }

    fn split(config: &Config) -> TrainingResult<DataLayout> {
        let layout = DataLayout::new(config.data_config.data_path.clone());
        split_and_save_datasets(&layout, config.data_config.train_size, config.seed)?;
        Ok(layout)
    }

    fn load_datasets(config: &Config, layout: &DataLayout) -> TrainingResult<Datasets> {
        let data = &config.data_config;
        let train_transforms = get_transforms(data.width, data.height, true, true, true).with_seed(config.seed);
        let eval_transforms = get_transforms(data.width, data.height, true, false, true);
        info!(train = %train_transforms.describe(), eval = %eval_transforms.describe(), "image transforms");

        let datasets = Datasets {
            train: PosterDataset::from_layout(layout, Subset::Train, train_transforms)?,
            valid: PosterDataset::from_layout(layout, Subset::Valid, eval_transforms.clone())?,
            test: PosterDataset::from_layout(layout, Subset::Test, eval_transforms)?,
        };

        for dataset in [&datasets.train, &datasets.valid, &datasets.test] {
            let missing = missing_images(layout, dataset.table())?;
            if let Some(first) = missing.first() {
                return Err(TrainingError::Dataset(format!(
                    "{} annotated images have no file in {} (first: {first}.jpg)",
                    missing.len(),
                    layout.image_dir().display()
                )));
            }
            if dataset.tags().len() != config.num_classes {
                return Err(TrainingError::InvalidConfig(format!(
                    "num_classes is {} but the annotations have {} tags",
                    config.num_classes,
                    dataset.tags().len()
                )));
            }
        }
        if datasets.train.is_empty() || datasets.valid.is_empty() {
            return Err(TrainingError::Dataset("train and valid subsets must not be empty".to_string()));
        }
        Ok(datasets)
    }

    fn session<'a>(&self, job: &'a TrainingJob, progress: &'a dyn ProgressSink) -> TrainingResult<Session<'a>> {
        let config = &job.config;
        let optimizer_key = self.registries.optimizers.canonical(&config.optimizer)?;
        let optimizer = self.registries.optimizers.build(&config.optimizer, &config.optimizer_kwargs)?;
        let scheduler = self.registries.schedulers.build(&config.scheduler, &config.scheduler_kwargs)?;
        let model_settings = self.registries.models.build(config.model_name()?, &config.model_kwargs)?;

        let schedule = LrSchedule::new(scheduler, optimizer.lr());
        let model = model_settings.build(config.num_classes, optimizer);
        let loss = CompositeLoss::from_config(&config.losses, &self.registries.losses)?;
        let batch_size = config.data_config.batch_size;
        let workers = config.data_config.n_workers;

        Ok(Session {
            job,
            progress,
            model,
            loss,
            schedule,
            loader: DataLoader::new(batch_size).shuffled(config.seed).workers(workers),
            eval_loader: DataLoader::new(batch_size).workers(workers),
            optimizer_key,
        })
    }

    /// One optimisation pass; returns mean `train_*` losses and the updated step count.
    fn train_epoch(
        &self,
        session: &mut Session<'_>,
        dataset: &PosterDataset,
        epoch: usize,
        mut global_step: u64,
    ) -> TrainingResult<(BTreeMap<String, f64>, u64)> {
        let job_id = &session.job.job_id;
        let log_every = session.job.config.log_every_n_steps as u64;
        let batches = session.loader.batches(dataset.len(), epoch);
        let total = batches.len() as u64;
        let lr = session.schedule.lr();
        let mut losses = LossAccumulator::default();

        for indices in &batches {
            self.check_cancelled(job_id)?;
            let batch = session.loader.load(dataset, indices, epoch)?;
            let logits = session.model.forward(&batch.images)?;
            let report = session.loss.evaluate(&logits, &batch.labels)?;
            session.model.backward(&batch.images, &report.grads, lr)?;
            losses.update(&report, "train_", batch.len());

            global_step += 1;
            if global_step % log_every == 0 {
                session.progress.on_event(ProgressEvent::Step {
                    job_id: job_id.clone(),
                    epoch,
                    step: global_step,
                    total: Some(total * session.job.config.n_epochs as u64),
                    loss: report.total,
                });
            }
        }
        Ok((losses.compute(), global_step))
    }

    /// Forward-only pass logging `{prefix}*` losses (when `with_losses`) and metrics.
    fn evaluate(
        &self,
        session: &Session<'_>,
        dataset: &PosterDataset,
        prefix: &str,
        with_losses: bool,
    ) -> TrainingResult<BTreeMap<String, f64>> {
        let mut metrics = MultilabelMetrics::new(session.job.config.num_classes);
        let mut losses = LossAccumulator::default();

        for indices in session.eval_loader.batches(dataset.len(), 0) {
            self.check_cancelled(&session.job.job_id)?;
            let batch = session.eval_loader.load(dataset, &indices, 0)?;
            let logits = session.model.forward(&batch.images)?;
            if with_losses {
                let report = session.loss.evaluate(&logits, &batch.labels)?;
                losses.update(&report, prefix, batch.len());
            }
            let probs: Vec<Vec<f32>> = logits.iter().map(|row| row.iter().map(|&z| sigmoid(z)).collect()).collect();
            metrics.update(&probs, &batch.labels)?;
        }

        let mut out = losses.compute();
        out.extend(metrics.compute(prefix));
        Ok(out)
    }

    fn fit(&self, job: &TrainingJob, progress: &dyn ProgressSink) -> TrainingResult<TrainingManifest> {
        let config = &job.config;
        let job_id = &job.job_id;
        job.validate(&self.registries)?;
        if !config.accelerator.eq_ignore_ascii_case("cpu") {
            warn!(accelerator = %config.accelerator, "only the cpu accelerator is available; falling back to cpu");
        }

        let data_layout = Self::split(config)?;
        let datasets = Self::load_datasets(config, &data_layout)?;
        progress.on_event(ProgressEvent::Message {
            job_id: job_id.clone(),
            message: format!(
                "train={} valid={} test={}",
                datasets.train.len(),
                datasets.valid.len(),
                datasets.test.len()
            ),
        });

        let experiment = ExperimentLayout::new(&config.experiments_dir, &config.experiment_name);
        experiment.ensure_dirs()?;
        write_json(&experiment.config_snapshot_path(), config)?;
        let mut metrics_log = MetricsLog::create(experiment.metrics_log_path())?;

        let mut session = self.session(job, progress)?;
        let mut checkpoint = ModelCheckpoint::new(experiment.clone(), &config.monitor_metric, config.monitor_mode);
        let mut early_stopping = EarlyStopping::new(&config.monitor_metric, config.monitor_mode, config.patience);
        let mut lr_monitor = LearningRateMonitor::new(session.optimizer_key);

        self.set_status(job_id, TrainerStatus::Running);
        let mut global_step = 0_u64;
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 0..config.n_epochs {
            let lr = session.schedule.lr();
            let (train_losses, step) = self.train_epoch(&mut session, &datasets.train, epoch, global_step)?;
            global_step = step;
            epochs_run = epoch + 1;

            let mut epoch_metrics = train_losses;
            epoch_metrics.extend(self.evaluate(&session, &datasets.valid, "val_", true)?);

            let mut stop = false;
            {
                let mut ctx = CallbackContext {
                    epoch,
                    max_epochs: config.n_epochs,
                    global_step: usize::try_from(global_step).unwrap_or(usize::MAX),
                    lr,
                    metrics: &mut epoch_metrics,
                    model: session.model.as_ref(),
                };
                let callbacks: [&mut dyn TrainerCallback; 3] = [&mut lr_monitor, &mut checkpoint, &mut early_stopping];
                for callback in callbacks {
                    if callback.on_epoch_end(&mut ctx)? == CallbackAction::Stop {
                        info!(callback = callback.name(), epoch, "stop requested");
                        stop = true;
                    }
                }
            }

            metrics_log.append(&EpochRecord { epoch, step: global_step, metrics: epoch_metrics.clone() })?;
            let monitored = epoch_metrics.get(&config.monitor_metric).copied();
            progress.on_event(ProgressEvent::Epoch { job_id: job_id.clone(), epoch, metrics: epoch_metrics });
            session.schedule.step(monitored)?;

            if stop {
                stopped_early = epoch + 1 < config.n_epochs;
                break;
            }
        }

        let best_path = checkpoint.best_model_path().map(std::path::Path::to_path_buf);
        match &best_path {
            Some(path) => {
                session.model.load(path)?;
                info!(path = %path.display(), "testing best checkpoint");
            }
            None => warn!("no checkpoint was saved; testing the final weights"),
        }
        let test_metrics = if datasets.test.is_empty() {
            warn!("test subset is empty; skipping test pass");
            BTreeMap::new()
        } else {
            self.evaluate(&session, &datasets.test, "test_", false)?
        };
        progress.on_event(ProgressEvent::Message {
            job_id: job_id.clone(),
            message: test_metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" "),
        });

        let mut artifacts = Vec::new();
        if let Some(path) = best_path {
            artifacts.push(make_artifact(ArtifactKind::Checkpoint, path)?);
        }
        artifacts.push(make_artifact(ArtifactKind::Config, experiment.config_snapshot_path())?);
        artifacts.push(make_artifact(ArtifactKind::Metrics, metrics_log.path().to_path_buf())?);
        for subset in Subset::ALL {
            artifacts.push(make_artifact(ArtifactKind::SplitTable, data_layout.subset_path(subset))?);
        }

        let manifest = TrainingManifest {
            job_id: job_id.clone(),
            created_at: chrono::Utc::now(),
            project_name: config.project_name.clone(),
            experiment_name: config.experiment_name.clone(),
            model_name: config.model_name()?.to_string(),
            dataset_id: compute_dataset_id(&combined_table(&datasets)?),
            metrics: TrainingMetrics {
                monitor: config.monitor_metric.clone(),
                best_score: checkpoint.best_score(),
                epochs_run,
                steps: global_step,
                stopped_early,
                test: test_metrics,
            },
            artifacts,
        };
        write_json(&experiment.manifest_path(), &manifest)?;
        Ok(manifest)
    }
}

fn combined_table(datasets: &Datasets) -> TrainingResult<AnnotationTable> {
    let records = [&datasets.train, &datasets.valid, &datasets.test]
        .iter()
        .flat_map(|d| d.table().records().iter().cloned())
        .collect();
    AnnotationTable::new(datasets.train.tags().to_vec(), records)
}

#[async_trait]
impl Trainer for PosterTrainer {
    fn id(&self) -> &'static str {
        "poster"
    }

    async fn prepare(&self, job: &TrainingJob) -> TrainingResult<()> {
        self.set_status(&job.job_id, TrainerStatus::Preparing);
        job.validate(&self.registries)?;
        Self::split(&job.config)?;
        ExperimentLayout::new(&job.config.experiments_dir, &job.config.experiment_name).ensure_dirs()?;
        Ok(())
    }

    async fn run(&self, job: &TrainingJob, progress: &dyn ProgressSink) -> TrainingResult<TrainingManifest> {
        let job_id = job.job_id.clone();
        self.check_cancelled(&job_id)?;
        progress.on_event(ProgressEvent::Started { job_id: job_id.clone() });
        self.set_status(&job_id, TrainerStatus::Preparing);

        match self.fit(job, progress) {
            Ok(manifest) => {
                self.set_status(&job_id, TrainerStatus::Finished);
                progress.on_event(ProgressEvent::Finished { job_id });
                Ok(manifest)
            }
            Err(TrainingError::Cancelled) => {
                self.set_status(&job_id, TrainerStatus::Cancelled);
                Err(TrainingError::Cancelled)
            }
            Err(e) => {
                self.set_status(&job_id, TrainerStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn status(&self, job_id: &TrainingJobId) -> TrainingResult<TrainerStatus> {
        Ok(self.statuses.lock().ok().and_then(|s| s.get(&job_id.0).cloned()).unwrap_or(TrainerStatus::Idle))
    }

    async fn cancel(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        if let Ok(mut c) = self.cancelled.lock() {
            c.insert(job_id.0.clone());
        }
        self.set_status(job_id, TrainerStatus::Cancelled);
        Ok(())
    }
}
